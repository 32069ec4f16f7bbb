use crate::config::Config;
use crate::errors::AppError;
use crate::models::UsageEvent;
use async_trait::async_trait;
use moka::future::Cache;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Third-party capabilities the gateway can broker.
///
/// One variant per vendor call shape; routing is an exhaustive match, so a
/// new vendor cannot be wired in without deciding its auth and endpoint
/// shape here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VendorApi {
    /// Geo/maps place search. Key travels in the `X-API-KEY` header.
    MapsSearch,
    /// Organic web search. Key travels in the `X-API-KEY` header.
    WebSearch,
    /// Generative text completion. Key travels as a query parameter.
    TextGen,
}

impl VendorApi {
    /// Stable name used for cache keys, usage events, and the per-tenant
    /// key store.
    pub fn name(self) -> &'static str {
        match self {
            VendorApi::MapsSearch => "maps_search",
            VendorApi::WebSearch => "web_search",
            VendorApi::TextGen => "text_gen",
        }
    }
}

/// Per-call knobs.
#[derive(Debug, Clone, Copy)]
pub struct CallOptions {
    /// Serve from / populate the response cache.
    pub use_cache: bool,
    /// Retries after the first attempt; total attempts = retries + 1.
    pub retries: u32,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            retries: 3,
        }
    }
}

/// Source of tenant-scoped vendor API keys.
///
/// Keys are stored separately from public branding data; the gateway only
/// ever sees them through this seam, which also keeps tests free of the
/// database.
#[async_trait]
pub trait ApiKeySource: Send + Sync {
    async fn api_key(&self, tenant_id: Uuid, api: VendorApi) -> Result<Option<String>, AppError>;
}

/// Fixed in-memory key set. Used by tests and single-tenant deployments.
#[derive(Default)]
pub struct StaticKeySource {
    keys: HashMap<(Uuid, &'static str), String>,
}

impl StaticKeySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, tenant_id: Uuid, api: VendorApi, key: impl Into<String>) -> Self {
        self.keys.insert((tenant_id, api.name()), key.into());
        self
    }
}

#[async_trait]
impl ApiKeySource for StaticKeySource {
    async fn api_key(&self, tenant_id: Uuid, api: VendorApi) -> Result<Option<String>, AppError> {
        Ok(self.keys.get(&(tenant_id, api.name())).cloned())
    }
}

/// Sink for per-tenant usage events.
///
/// Implementations must be fire-and-forget: recording happens off the
/// request path and a sink failure never reaches the gateway caller.
pub trait UsageSink: Send + Sync {
    fn record(&self, event: UsageEvent);
}

/// Discards usage events. Used by tests.
pub struct NoopUsageSink;

impl UsageSink for NoopUsageSink {
    fn record(&self, _event: UsageEvent) {}
}

/// Single choke point for outbound third-party HTTP calls.
///
/// Owns the response cache, the retry/backoff policy, vendor routing, and
/// usage metering. Constructed once at startup and shared behind an `Arc`.
pub struct ApiGateway {
    client: reqwest::Client,
    cache: Cache<String, Value>,
    keys: Arc<dyn ApiKeySource>,
    usage: Arc<dyn UsageSink>,
    places_base_url: String,
    search_base_url: String,
    textgen_base_url: String,
    backoff_base: Duration,
}

impl ApiGateway {
    /// Creates a gateway from the service configuration.
    ///
    /// Response cache: 1 hour TTL, 10k entries. Client timeout: 30 s per
    /// attempt.
    pub fn new(
        config: &Config,
        keys: Arc<dyn ApiKeySource>,
        usage: Arc<dyn UsageSink>,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create gateway client: {}", e))
            })?;

        Ok(Self {
            client,
            cache: Cache::builder()
                .time_to_live(Duration::from_secs(3600))
                .max_capacity(10_000)
                .build(),
            keys,
            usage,
            places_base_url: config.places_base_url.clone(),
            search_base_url: config.search_base_url.clone(),
            textgen_base_url: config.textgen_base_url.clone(),
            backoff_base: Duration::from_secs(1),
        })
    }

    /// Overrides the backoff base unit. Tests compress time with this.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Brokers one vendor call.
    ///
    /// Serves from cache when permitted, otherwise resolves the tenant's
    /// key (failing fast with [`AppError::MissingApiKey`]), dispatches with
    /// retry + exponential backoff, caches the response, and records a
    /// usage event for every completed call, hit or miss.
    pub async fn call(
        &self,
        tenant_id: Uuid,
        api: VendorApi,
        endpoint: &str,
        payload: Value,
        opts: CallOptions,
    ) -> Result<Value, AppError> {
        let cache_key = cache_key(api, endpoint, &payload);

        if opts.use_cache {
            if let Some(cached) = self.cache.get(&cache_key).await {
                tracing::debug!("Gateway cache hit: {} {}", api.name(), endpoint);
                self.record_usage(tenant_id, api, endpoint, "hit");
                return Ok(cached);
            }
        }

        let key = self
            .keys
            .api_key(tenant_id, api)
            .await?
            .ok_or_else(|| AppError::MissingApiKey(api.name().to_string()))?;

        let mut attempt: u32 = 0;
        let result = loop {
            match self.dispatch(api, endpoint, &payload, &key).await {
                Ok(value) => break Ok(value),
                Err(e) => {
                    if attempt >= opts.retries {
                        tracing::error!(
                            "Gateway call {} {} exhausted after {} attempt(s): {}",
                            api.name(),
                            endpoint,
                            attempt + 1,
                            e
                        );
                        break Err(e);
                    }
                    let delay = backoff_delay(attempt, self.backoff_base);
                    tracing::warn!(
                        "Gateway call {} {} failed (attempt {}), retrying in {:?}: {}",
                        api.name(),
                        endpoint,
                        attempt + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        };

        match &result {
            Ok(value) => {
                if opts.use_cache {
                    self.cache.insert(cache_key, value.clone()).await;
                }
                self.record_usage(tenant_id, api, endpoint, "ok");
            }
            Err(_) => self.record_usage(tenant_id, api, endpoint, "error"),
        }

        result
    }

    /// Vendor-specific call shapes. Exhaustive over [`VendorApi`].
    async fn dispatch(
        &self,
        api: VendorApi,
        endpoint: &str,
        payload: &Value,
        key: &str,
    ) -> Result<Value, AppError> {
        let request = match api {
            VendorApi::MapsSearch => self
                .client
                .post(format!("{}/{}", self.places_base_url, endpoint))
                .header("X-API-KEY", key)
                .json(payload),
            VendorApi::WebSearch => self
                .client
                .post(format!("{}/{}", self.search_base_url, endpoint))
                .header("X-API-KEY", key)
                .json(payload),
            VendorApi::TextGen => self
                .client
                .post(&self.textgen_base_url)
                .query(&[("key", key)])
                .json(payload),
        };

        let response = request.send().await.map_err(|e| {
            AppError::ExternalApiError(format!("{} request failed: {}", api.name(), e))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::ExternalApiError(format!(
                "{} returned {}: {}",
                api.name(),
                status,
                error_text
            )));
        }

        let data = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse {} response: {}", api.name(), e))
        })?;

        Ok(data)
    }

    fn record_usage(&self, tenant_id: Uuid, api: VendorApi, endpoint: &str, status: &str) {
        self.usage.record(UsageEvent {
            tenant_id,
            api_name: api.name().to_string(),
            endpoint: endpoint.to_string(),
            status: status.to_string(),
        });
    }
}

/// Delay before retry attempt `attempt + 1`: `2^attempt * base` plus a
/// random jitter of at most one base unit, which keeps the sequence
/// non-decreasing in the attempt index.
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let exponential = base.saturating_mul(1u32 << attempt.min(16));
    let jitter_ms = fastrand::u64(0..=base.as_millis().min(u64::MAX as u128) as u64);
    exponential + Duration::from_millis(jitter_ms)
}

/// Deterministic cache key for one `(api, endpoint, payload)` tuple.
pub fn cache_key(api: VendorApi, endpoint: &str, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api.name().as_bytes());
    hasher.update(b"\n");
    hasher.update(endpoint.as_bytes());
    hasher.update(b"\n");
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Pulls the generated text out of a text-completion response.
pub fn extract_generated_text(response: &Value) -> Option<String> {
    response
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .get(0)?
        .get("text")?
        .as_str()
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cache_key_is_deterministic_and_payload_sensitive() {
        let a = cache_key(VendorApi::WebSearch, "search", &json!({"q": "academias"}));
        let b = cache_key(VendorApi::WebSearch, "search", &json!({"q": "academias"}));
        let c = cache_key(VendorApi::WebSearch, "search", &json!({"q": "padarias"}));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(
            cache_key(VendorApi::MapsSearch, "search", &json!({"q": "academias"})),
            a
        );
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_secs(1);
        for attempt in 0..4u32 {
            let d = backoff_delay(attempt, base);
            let floor = base * (1 << attempt);
            assert!(d >= floor);
            assert!(d <= floor + base);
        }
    }

    #[test]
    fn generated_text_extraction() {
        let response = json!({
            "candidates": [{"content": {"parts": [{"text": "hello"}]}}]
        });
        assert_eq!(extract_generated_text(&response).as_deref(), Some("hello"));
        assert_eq!(extract_generated_text(&json!({})), None);
    }
}
