//! Opaque identifiers used throughout the local scheduler.
//!
//! All identifiers are 32-byte values, hex-encoded at the serde boundary and
//! compared byte-exact, mirroring the "opaque strings, byte-exact equality"
//! data model. A single macro generates the newtype boilerplate (constructor,
//! hex codec, `Debug`/`Display`, serde `try_from`/`into` `String`) so each ID
//! kind stays a one-line declaration instead of duplicated 80-line structs.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while parsing an identifier.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    /// The input was not valid hex.
    #[error("invalid hex encoding")]
    InvalidHex,

    /// The decoded byte length did not match the expected width.
    #[error("invalid id length: expected {expected}, got {got}")]
    InvalidLength {
        /// Expected byte length.
        expected: usize,
        /// Bytes actually decoded.
        got: usize,
    },
}

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name([u8; 32]);

        impl $name {
            /// Construct from raw bytes.
            #[must_use]
            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Return the underlying bytes.
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Parse from a hex-encoded string.
            ///
            /// # Errors
            ///
            /// Returns [`IdError`] if `s` is not valid hex or not 32 bytes.
            pub fn from_hex(s: &str) -> Result<Self, IdError> {
                let bytes = hex::decode(s).map_err(|_| IdError::InvalidHex)?;
                let len = bytes.len();
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| IdError::InvalidLength { expected: 32, got: len })?;
                Ok(Self(arr))
            }

            /// Return the hex-encoded string representation.
            #[must_use]
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Generate a new id from the given seed bytes via blake3.
            #[must_use]
            pub fn from_seed(parts: &[&[u8]]) -> Self {
                let mut hasher = blake3::Hasher::new();
                for part in parts {
                    hasher.update(part);
                }
                Self(*hasher.finalize().as_bytes())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::from_hex(&value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.to_hex()
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

opaque_id!(
    /// Identity of this proxy. Stable for the process lifetime.
    NodeId
);
opaque_id!(
    /// Identity of one function agent, unique per proxy.
    AgentId
);
opaque_id!(
    /// Identity of one function instance.
    InstanceId
);
opaque_id!(
    /// Correlates a request with its eventual response across retries.
    RequestId
);
opaque_id!(
    /// Identity of one reserved/bound resource bundle.
    BundleId
);
opaque_id!(
    /// Random id that must remain stable across an agent's lifetime, identifying its
    /// runtime manager instance.
    RuntimeMgrId
);

impl NodeId {
    /// Generate a random `NodeId` for a fresh process.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_seed(&[uuid::Uuid::new_v4().as_bytes()])
    }
}

impl AgentId {
    /// Generate a deterministic `AgentId` from an address and runtime-manager id, so
    /// repeated registrations of the same agent resolve to the same identity.
    #[must_use]
    pub fn generate(address: &str, runtime_mgr_id: &RuntimeMgrId) -> Self {
        Self::from_seed(&[address.as_bytes(), runtime_mgr_id.as_bytes()])
    }
}

impl RuntimeMgrId {
    /// Generate a random runtime-manager id.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_seed(&[uuid::Uuid::new_v4().as_bytes()])
    }
}

impl InstanceId {
    /// Generate a random `InstanceId`.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_seed(&[uuid::Uuid::new_v4().as_bytes()])
    }
}

impl RequestId {
    /// Generate a random `RequestId`.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_seed(&[uuid::Uuid::new_v4().as_bytes()])
    }
}

impl BundleId {
    /// Generate a deterministic `BundleId` from a resource-group name and index, matching
    /// the data model's "one bundle per (group, index)" rule.
    #[must_use]
    pub fn generate(resource_group_name: &str, bundle_index: u32) -> Self {
        Self::from_seed(&[resource_group_name.as_bytes(), &bundle_index.to_le_bytes()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let id = AgentId::from_bytes([7u8; 32]);
        let hex = id.to_hex();
        let parsed = AgentId::from_hex(&hex).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn invalid_hex_rejected() {
        assert_eq!(AgentId::from_hex("not-hex").unwrap_err(), IdError::InvalidHex);
    }

    #[test]
    fn invalid_length_rejected() {
        assert!(matches!(
            AgentId::from_hex("aabb"),
            Err(IdError::InvalidLength { expected: 32, got: 2 })
        ));
    }

    #[test]
    fn agent_id_is_deterministic_for_same_address_and_runtime_mgr() {
        let rm = RuntimeMgrId::from_bytes([1u8; 32]);
        let a = AgentId::generate("127.0.0.1:5001", &rm);
        let b = AgentId::generate("127.0.0.1:5001", &rm);
        assert_eq!(a, b);
    }

    #[test]
    fn bundle_id_distinguishes_index() {
        let a = BundleId::generate("group-a", 0);
        let b = BundleId::generate("group-a", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn serde_roundtrip_via_string() {
        let id = InstanceId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let back: InstanceId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
