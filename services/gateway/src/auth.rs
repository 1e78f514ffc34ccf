use std::sync::Arc;

use async_trait::async_trait;
use gateway_core::collab::TokenValidator;
use gateway_core::error::Result;
use gateway_core::kv::KvStore;
use sha2::{Digest, Sha256};

/// Verifies bearer tokens minted by the auth tier against a shared KV
/// lookup (`authtoken:<sha256 hex>` -> user id), the same hash-then-look-up
/// shape the REST tier uses against its token table, just reachable
/// without the gateway depending on Postgres directly.
pub struct KvTokenValidator {
    kv: Arc<dyn KvStore>,
}

impl KvTokenValidator {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(raw_token: &str) -> String {
        let hash = Sha256::digest(raw_token.as_bytes());
        format!("authtoken:{}", hex::encode(hash))
    }
}

#[async_trait]
impl TokenValidator for KvTokenValidator {
    async fn validate(&self, token: &str) -> Result<Option<String>> {
        let Some(bytes) = self.kv.get(&Self::key(token)).await? else {
            return Ok(None);
        };
        Ok(String::from_utf8(bytes).ok())
    }
}
