//! [`MetaStore`] backed by a real etcd cluster, via `etcd-client`.
//!
//! This is the production implementation: the source system sits directly on
//! etcd for its metastore, and `etcd-client` is the maintained Rust client for
//! it, so it is used here rather than hand-rolling a gRPC wire client.

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, EventType, GetOptions, PutOptions, Txn, TxnOp as EtcdTxnOp, WatchOptions};
use tokio::sync::mpsc;
use tracing::warn;

use crate::{KvEntry, MetaStore, MetaStoreError, Result, TxnOp, WatchEvent, WatchEventKind, WatchStream};

/// A [`MetaStore`] implementation backed by etcd.
pub struct EtcdMetaStore {
    client: Client,
}

impl EtcdMetaStore {
    /// Connect to the given etcd endpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial connection cannot be established.
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| MetaStoreError::Get(format!("etcd connect failed: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MetaStore for EtcdMetaStore {
    async fn get(&self, key: &[u8]) -> Result<Option<KvEntry>> {
        let mut client = self.client.clone();
        let resp = client
            .get(key, None::<GetOptions>)
            .await
            .map_err(|e| MetaStoreError::Get(e.to_string()))?;
        let revision = resp.header().map_or(0, |h| h.revision());
        Ok(resp.kvs().first().map(|kv| KvEntry {
            key: kv.key().to_vec(),
            value: kv.value().to_vec(),
            revision,
        }))
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<i64> {
        let mut client = self.client.clone();
        let resp = client
            .put(key, value, None::<PutOptions>)
            .await
            .map_err(|e| MetaStoreError::Put(e.to_string()))?;
        Ok(resp.header().map_or(0, |h| h.revision()))
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        let mut client = self.client.clone();
        client
            .delete(key, None)
            .await
            .map_err(|e| MetaStoreError::Delete(e.to_string()))?;
        Ok(())
    }

    async fn txn(&self, ops: Vec<TxnOp>) -> Result<i64> {
        let mut client = self.client.clone();
        let mut etcd_ops = Vec::with_capacity(ops.len());
        for op in ops {
            etcd_ops.push(match op {
                TxnOp::Put { key, value } => EtcdTxnOp::put(key, value, None),
                TxnOp::Delete { key } => EtcdTxnOp::delete(key, None),
            });
        }
        // Unconditional txn: every op always applies. A conditional compare is
        // included only to keep the request shape explicit about "no guard".
        let txn = Txn::new()
            .when(vec![Compare::version(Vec::<u8>::new(), CompareOp::Greater, -1)])
            .and_then(etcd_ops);
        let resp = client.txn(txn).await.map_err(|e| MetaStoreError::Txn(e.to_string()))?;
        Ok(resp.header().map_or(0, |h| h.revision()))
    }

    async fn watch(&self, prefix: &[u8], start_revision: Option<i64>) -> Result<WatchStream> {
        let mut client = self.client.clone();
        let mut options = WatchOptions::new().with_prefix();
        if let Some(rev) = start_revision {
            // etcd resumes from rev + 1; callers pass the last revision they observed.
            options = options.with_start_revision(rev + 1);
        }
        let (_watcher, mut stream) = client
            .watch(prefix, Some(options))
            .await
            .map_err(|e| MetaStoreError::Get(format!("etcd watch failed: {e}")))?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            break;
                        }
                        for event in resp.events() {
                            let Some(kv) = event.kv() else { continue };
                            let kind = match event.event_type() {
                                EventType::Put => WatchEventKind::Put,
                                EventType::Delete => WatchEventKind::Delete,
                            };
                            let watch_event = WatchEvent {
                                kind,
                                key: kv.key().to_vec(),
                                value: kv.value().to_vec(),
                                revision: kv.mod_revision(),
                            };
                            if tx.send(watch_event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "etcd watch stream ended with an error");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }
}
