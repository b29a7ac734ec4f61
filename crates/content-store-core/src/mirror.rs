use async_trait::async_trait;
use serde_json::Value;

use crate::entity::{ContentType, EntityKey};
use crate::error::StoreError;

/// Secondary store that receives a copy of every saved or deleted entity.
///
/// The mirror is never authoritative: the content store logs its errors and
/// carries on. Records are keyed by the same content type and key as the files.
///
/// Implementations:
/// - `NoopMirror`: mirroring disabled
/// - `KvMirror` (content-store-local, `cloud` feature): HTTP key-value API
#[async_trait]
pub trait MirrorBackend: Send + Sync {
    /// Returns the backend identifier (e.g., "none", "kv").
    fn backend_name(&self) -> &'static str;

    /// Create or replace the record for `key` in a single call.
    async fn upsert(
        &self,
        content_type: ContentType,
        key: &EntityKey,
        document: &Value,
    ) -> Result<(), StoreError>;

    /// Remove the record for `key`. Returns whether it existed.
    async fn remove(&self, content_type: ContentType, key: &EntityKey) -> Result<bool, StoreError>;
}

/// Mirror that accepts everything and stores nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMirror;

#[async_trait]
impl MirrorBackend for NoopMirror {
    fn backend_name(&self) -> &'static str {
        "none"
    }

    async fn upsert(
        &self,
        _content_type: ContentType,
        _key: &EntityKey,
        _document: &Value,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn remove(&self, _content_type: ContentType, _key: &EntityKey) -> Result<bool, StoreError> {
        Ok(false)
    }
}

/// Record name used by key-value style mirrors, e.g. `upgrades:tap-power`.
pub fn mirror_record_key(content_type: ContentType, key: &EntityKey) -> String {
    format!("{}:{}", content_type, key)
}
