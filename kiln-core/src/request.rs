//! External requests and their canonical fingerprints.

use crate::Value;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A request to the external request/response provider, e.g. an
/// `eth_call` against the chain node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalRequest {
    pub method: String,
    pub params: Vec<Value>,
}

impl ExternalRequest {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// Canonical fingerprint used for response-cache keying and for
    /// de-duplicating predicted against issued requests.
    ///
    /// Two requests share a fingerprint iff method and every parameter
    /// (including its type tag) are equal.
    pub fn fingerprint(&self) -> RequestFingerprint {
        let mut hasher = Sha256::new();
        hasher.update(self.method.as_bytes());
        hasher.update([0u8]);
        for param in &self.params {
            // Serializing a Value cannot fail: it has no maps with
            // non-string keys and no custom serializers.
            let encoded = serde_json::to_vec(param).unwrap_or_default();
            hasher.update((encoded.len() as u64).to_be_bytes());
            hasher.update(&encoded);
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&hasher.finalize());
        RequestFingerprint(hash)
    }

    pub fn estimated_size(&self) -> usize {
        self.method.len() + self.params.iter().map(Value::estimated_size).sum::<usize>()
    }
}

/// SHA-256 over the canonical encoding of an [`ExternalRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestFingerprint([u8; 32]);

impl RequestFingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}
