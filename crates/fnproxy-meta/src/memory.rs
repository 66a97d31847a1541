//! An in-memory [`MetaStore`] for tests and single-node operation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{KvEntry, MetaStore, MetaStoreError, Result, TxnOp, WatchEvent, WatchEventKind, WatchStream};

struct Watcher {
    prefix: Vec<u8>,
    sender: mpsc::Sender<WatchEvent>,
}

struct Inner {
    data: BTreeMap<Vec<u8>, (Vec<u8>, i64)>,
    revision: i64,
    history: Vec<WatchEvent>,
    watchers: Vec<Watcher>,
}

/// An in-memory, single-process [`MetaStore`].
///
/// Keeps a bounded history of recent events so a `watch` call with
/// `start_revision = Some(rev)` can replay everything since `rev` instead of
/// only seeing events emitted after the call.
pub struct InMemoryMetaStore {
    inner: Mutex<Inner>,
    history_limit: usize,
}

impl Default for InMemoryMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMetaStore {
    /// Construct an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                data: BTreeMap::new(),
                revision: 0,
                history: Vec::new(),
                watchers: Vec::new(),
            }),
            history_limit: 4096,
        }
    }

    fn emit(inner: &mut Inner, event: WatchEvent, history_limit: usize) {
        inner.watchers.retain(|w| {
            if !event.key.starts_with(&w.prefix) {
                return true;
            }
            !matches!(
                w.sender.try_send(event.clone()),
                Err(mpsc::error::TrySendError::Closed(_))
            )
        });
        inner.history.push(event);
        if inner.history.len() > history_limit {
            let overflow = inner.history.len() - history_limit;
            inner.history.drain(0..overflow);
        }
    }
}

#[async_trait]
impl MetaStore for InMemoryMetaStore {
    async fn get(&self, key: &[u8]) -> Result<Option<KvEntry>> {
        let inner = self.inner.lock();
        Ok(inner.data.get(key).map(|(value, revision)| KvEntry {
            key: key.to_vec(),
            value: value.clone(),
            revision: *revision,
        }))
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<i64> {
        let mut inner = self.inner.lock();
        inner.revision += 1;
        let revision = inner.revision;
        inner.data.insert(key.to_vec(), (value.to_vec(), revision));
        Self::emit(
            &mut inner,
            WatchEvent {
                kind: WatchEventKind::Put,
                key: key.to_vec(),
                value: value.to_vec(),
                revision,
            },
            self.history_limit,
        );
        Ok(revision)
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.data.remove(key).is_some() {
            inner.revision += 1;
            let revision = inner.revision;
            Self::emit(
                &mut inner,
                WatchEvent {
                    kind: WatchEventKind::Delete,
                    key: key.to_vec(),
                    value: Vec::new(),
                    revision,
                },
                self.history_limit,
            );
        }
        Ok(())
    }

    async fn txn(&self, ops: Vec<TxnOp>) -> Result<i64> {
        let mut inner = self.inner.lock();
        inner.revision += 1;
        let revision = inner.revision;
        let mut events = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                TxnOp::Put { key, value } => {
                    inner.data.insert(key.clone(), (value.clone(), revision));
                    events.push(WatchEvent {
                        kind: WatchEventKind::Put,
                        key,
                        value,
                        revision,
                    });
                }
                TxnOp::Delete { key } => {
                    inner.data.remove(&key);
                    events.push(WatchEvent {
                        kind: WatchEventKind::Delete,
                        key,
                        value: Vec::new(),
                        revision,
                    });
                }
            }
        }
        for event in events {
            Self::emit(&mut inner, event, self.history_limit);
        }
        Ok(revision)
    }

    async fn watch(&self, prefix: &[u8], start_revision: Option<i64>) -> Result<WatchStream> {
        let (tx, rx) = mpsc::channel(256);
        let mut inner = self.inner.lock();

        if let Some(start) = start_revision {
            let oldest_buffered = inner.history.first().map(|e| e.revision);
            if let Some(oldest) = oldest_buffered {
                if start < oldest - 1 {
                    return Err(MetaStoreError::RevisionCompacted(start));
                }
            }
            for event in inner.history.iter().filter(|e| e.revision > start && e.key.starts_with(prefix)) {
                // Best-effort replay; a full channel means the caller is already behind
                // live events too, so dropping here is acceptable.
                let _ = tx.try_send(event.clone());
            }
        }

        inner.watchers.push(Watcher {
            prefix: prefix.to_vec(),
            sender: tx,
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let store = InMemoryMetaStore::new();
        store.put(b"/yr/agentInfo/n1", b"{}").await.unwrap();
        let entry = store.get(b"/yr/agentInfo/n1").await.unwrap().unwrap();
        assert_eq!(entry.value, b"{}");
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let store = InMemoryMetaStore::new();
        store.put(b"k", b"v").await.unwrap();
        store.delete(b"k").await.unwrap();
        assert!(store.get(b"k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn watch_sees_subsequent_puts_under_prefix() {
        let store = InMemoryMetaStore::new();
        let mut stream = store.watch(b"/yr/agentInfo/", None).await.unwrap();
        store.put(b"/yr/agentInfo/n1", b"a").await.unwrap();
        store.put(b"/yr/bundles/n1", b"b").await.unwrap();

        let event = stream.recv().await.unwrap();
        assert_eq!(event.key, b"/yr/agentInfo/n1");
        assert_eq!(event.kind, WatchEventKind::Put);
    }

    #[tokio::test]
    async fn watch_resumes_from_revision() {
        let store = InMemoryMetaStore::new();
        let r1 = store.put(b"/yr/agentInfo/n1", b"a").await.unwrap();
        store.put(b"/yr/agentInfo/n1", b"b").await.unwrap();

        let mut stream = store.watch(b"/yr/agentInfo/", Some(r1)).await.unwrap();
        let replayed = stream.recv().await.unwrap();
        assert_eq!(replayed.value, b"b");
    }

    #[tokio::test]
    async fn txn_applies_all_ops_atomically() {
        let store = InMemoryMetaStore::new();
        store
            .txn(vec![
                TxnOp::Put { key: b"a".to_vec(), value: b"1".to_vec() },
                TxnOp::Put { key: b"b".to_vec(), value: b"2".to_vec() },
            ])
            .await
            .unwrap();
        assert_eq!(store.get(b"a").await.unwrap().unwrap().value, b"1");
        assert_eq!(store.get(b"b").await.unwrap().unwrap().value, b"2");
    }
}
