use async_trait::async_trait;
use content_store_core::{mirror_record_key, ContentType, EntityKey, MirrorBackend, StoreError};
use reqwest::Client as HttpClient;
use serde_json::Value;
use tracing::{debug, instrument};

/// Mirror into a key-value REST API (Cloudflare KV v4 layout).
///
/// Records are stored under `{content_type}:{key}`. `PUT` on the value URL
/// creates or replaces the record, so an upsert is one round trip.
pub struct KvMirror {
    http_client: HttpClient,
    base_url: String,
    api_token: String,
}

impl std::fmt::Debug for KvMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvMirror")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl KvMirror {
    /// Create a mirror for a namespace URL such as
    /// `https://api.cloudflare.com/client/v4/accounts/{account}/storage/kv/namespaces/{ns}`.
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            http_client: HttpClient::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token: api_token.into(),
        }
    }

    /// Create a mirror for a Cloudflare KV namespace.
    pub fn cloudflare(account_id: &str, namespace_id: &str, api_token: impl Into<String>) -> Self {
        Self::new(
            format!(
                "https://api.cloudflare.com/client/v4/accounts/{}/storage/kv/namespaces/{}",
                account_id, namespace_id
            ),
            api_token,
        )
    }

    fn value_url(&self, content_type: ContentType, key: &EntityKey) -> String {
        format!(
            "{}/values/{}",
            self.base_url,
            urlencoding::encode(&mirror_record_key(content_type, key))
        )
    }
}

#[async_trait]
impl MirrorBackend for KvMirror {
    fn backend_name(&self) -> &'static str {
        "kv"
    }

    #[instrument(skip(self, document), level = "debug")]
    async fn upsert(
        &self,
        content_type: ContentType,
        key: &EntityKey,
        document: &Value,
    ) -> Result<(), StoreError> {
        let body = serde_json::to_string(document).map_err(|e| {
            StoreError::Serialization(format!("Failed to serialize mirror record: {}", e))
        })?;

        let response = self
            .http_client
            .put(self.value_url(content_type, key))
            .header("Authorization", format!("Bearer {}", self.api_token))
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| StoreError::Mirror(format!("KV PUT request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StoreError::Mirror(format!(
                "KV PUT failed with status {}: {}",
                status, text
            )));
        }

        debug!("KV PUT {}:{}", content_type, key);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn remove(&self, content_type: ContentType, key: &EntityKey) -> Result<bool, StoreError> {
        let response = self
            .http_client
            .delete(self.value_url(content_type, key))
            .header("Authorization", format!("Bearer {}", self.api_token))
            .send()
            .await
            .map_err(|e| StoreError::Mirror(format!("KV DELETE request failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StoreError::Mirror(format!(
                "KV DELETE failed with status {}: {}",
                status, text
            )));
        }

        debug!("KV DELETE {}:{}", content_type, key);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_url_encodes_record_key() {
        let mirror = KvMirror::cloudflare("acct", "ns", "token");
        assert_eq!(
            mirror.value_url(ContentType::Upgrades, &EntityKey::Id("tap power".into())),
            "https://api.cloudflare.com/client/v4/accounts/acct/storage/kv/namespaces/ns/values/upgrades%3Atap%20power"
        );

        let mirror = KvMirror::new("http://localhost:8787/kv/", "token");
        assert_eq!(
            mirror.value_url(ContentType::Levels, &EntityKey::Level(2)),
            "http://localhost:8787/kv/values/levels%3A2"
        );
    }
}
