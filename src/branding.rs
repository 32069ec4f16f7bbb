use crate::db_storage::Storage;
use crate::models::BrandingConfig;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Upper bound on the branding lookup. The dashboard shell blocks on this
/// at session start, so a slow store must not hold the whole UI hostage.
const LOAD_TIMEOUT: Duration = Duration::from_secs(3);

/// Resolves per-tenant branding, hostname first, then tenant id.
///
/// Lookup failures and timeouts fall back to the built-in default config;
/// resolution never errors. Results are cached for the session's lifetime
/// scale; a manual refresh invalidates one hostname.
pub struct BrandingResolver {
    storage: Arc<Storage>,
    cache: Cache<String, BrandingConfig>,
}

impl BrandingResolver {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            cache: Cache::builder()
                .time_to_live(Duration::from_secs(86400))
                .max_capacity(10_000)
                .build(),
        }
    }

    pub async fn resolve(&self, host: Option<&str>, tenant_id: Option<Uuid>) -> BrandingConfig {
        let cache_key = host
            .map(str::to_string)
            .or_else(|| tenant_id.map(|t| t.to_string()));

        if let Some(key) = &cache_key {
            if let Some(cached) = self.cache.get(key).await {
                return cached;
            }
        }

        let lookup = self.lookup(host, tenant_id);
        let resolved = match tokio::time::timeout(LOAD_TIMEOUT, lookup).await {
            Ok(Some(config)) => {
                if let Some(key) = cache_key {
                    self.cache.insert(key, config.clone()).await;
                }
                config
            }
            Ok(None) => {
                tracing::debug!(
                    "No branding row for host {:?} / tenant {:?}, using default",
                    host,
                    tenant_id
                );
                BrandingConfig::default()
            }
            Err(_) => {
                tracing::warn!("Branding lookup timed out, using default config");
                BrandingConfig::default()
            }
        };

        resolved
    }

    async fn lookup(&self, host: Option<&str>, tenant_id: Option<Uuid>) -> Option<BrandingConfig> {
        if let Some(host) = host {
            match self.storage.branding_by_host(host).await {
                Ok(Some(config)) => return Some(config),
                Ok(None) => {}
                Err(e) => tracing::warn!("Branding lookup by host failed: {}", e),
            }
        }

        if let Some(tenant_id) = tenant_id {
            match self.storage.branding_by_tenant(tenant_id).await {
                Ok(Some(config)) => return Some(config),
                Ok(None) => {}
                Err(e) => tracing::warn!("Branding lookup by tenant failed: {}", e),
            }
        }

        None
    }

    /// Drops the cached entry for one hostname so the next resolve re-reads
    /// the store. Admin saves call this.
    pub async fn refresh(&self, host: &str) {
        self.cache.invalidate(host).await;
        tracing::info!("Branding cache invalidated for {}", host);
    }
}
