use crate::errors::AppError;
use crate::gateway::{ApiKeySource, UsageSink, VendorApi};
use crate::models::{BrandingConfig, Lead, LeadDetails, LeadRow, LeadStatus, Tenant, UsageEvent};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use moka::future::Cache;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Tenant-scoped persistence. Every query filters by `tenant_id`; the store
/// enforces row-level isolation and this layer never crosses it.
pub struct Storage {
    pool: PgPool,
}

impl Storage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn tenant(&self, tenant_id: Uuid) -> Result<Tenant, AppError> {
        sqlx::query_as::<_, Tenant>(
            "SELECT id, name, credit_balance, webhook_url, webhook_secret, created_at
             FROM tenants WHERE id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Tenant {} not found", tenant_id)))
    }

    /// Inserts or replaces a lead. The caller owns merge semantics; this
    /// writes whatever state it is handed.
    pub async fn upsert_lead(&self, tenant_id: Uuid, lead: &Lead) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO leads
                 (id, tenant_id, name, website, phone, category, location,
                  status, details, social_links, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (tenant_id, id) DO UPDATE SET
                 name = EXCLUDED.name,
                 website = EXCLUDED.website,
                 phone = EXCLUDED.phone,
                 category = EXCLUDED.category,
                 location = EXCLUDED.location,
                 status = EXCLUDED.status,
                 details = EXCLUDED.details,
                 social_links = EXCLUDED.social_links,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(&lead.id)
        .bind(tenant_id)
        .bind(&lead.name)
        .bind(&lead.website)
        .bind(&lead.phone)
        .bind(&lead.category)
        .bind(&lead.location)
        .bind(lead.status.as_str())
        .bind(serde_json::to_value(&lead.details).unwrap_or_default())
        .bind(serde_json::to_value(&lead.social_links).unwrap_or_default())
        .bind(lead.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Persists a scan's results. New ids are inserted; re-discovered leads
    /// keep their existing status and details (discovery never downgrades
    /// what enrichment or the operator already did).
    pub async fn save_discovered(
        &self,
        tenant_id: Uuid,
        leads: &[Lead],
    ) -> Result<usize, AppError> {
        let mut inserted = 0;
        for lead in leads {
            let result = sqlx::query(
                "INSERT INTO leads
                     (id, tenant_id, name, website, phone, category, location,
                      status, details, social_links, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (tenant_id, id) DO NOTHING",
            )
            .bind(&lead.id)
            .bind(tenant_id)
            .bind(&lead.name)
            .bind(&lead.website)
            .bind(&lead.phone)
            .bind(&lead.category)
            .bind(&lead.location)
            .bind(lead.status.as_str())
            .bind(serde_json::to_value(&lead.details).unwrap_or_default())
            .bind(serde_json::to_value(&lead.social_links).unwrap_or_default())
            .bind(lead.updated_at)
            .execute(&self.pool)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        Ok(inserted)
    }

    pub async fn load_lead(&self, tenant_id: Uuid, id: &str) -> Result<Lead, AppError> {
        let row = sqlx::query_as::<_, LeadRow>(
            "SELECT id, tenant_id, name, website, phone, category, location,
                    status, details, social_links, updated_at
             FROM leads WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", id)))?;

        Ok(row_to_lead(row))
    }

    pub async fn set_lead_status(
        &self,
        tenant_id: Uuid,
        id: &str,
        status: LeadStatus,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE leads SET status = $1, updated_at = NOW()
             WHERE tenant_id = $2 AND id = $3",
        )
        .bind(status.as_str())
        .bind(tenant_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Lead {} not found", id)));
        }
        Ok(())
    }

    /// Branding row for a custom domain, if any tenant claimed it.
    pub async fn branding_by_host(&self, host: &str) -> Result<Option<BrandingConfig>, AppError> {
        let row = sqlx::query(
            "SELECT platform_name, logo_url, primary_color, secondary_color,
                    accent_color, custom_domain
             FROM tenant_branding WHERE custom_domain = $1",
        )
        .bind(host)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(branding_from_row))
    }

    pub async fn branding_by_tenant(
        &self,
        tenant_id: Uuid,
    ) -> Result<Option<BrandingConfig>, AppError> {
        let row = sqlx::query(
            "SELECT platform_name, logo_url, primary_color, secondary_color,
                    accent_color, custom_domain
             FROM tenant_branding WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(branding_from_row))
    }

    /// Current price for a sellable product. Prices live server-side only;
    /// checkout never trusts a client-supplied amount.
    pub async fn product_price(
        &self,
        product_id: &str,
    ) -> Result<Option<(String, BigDecimal)>, AppError> {
        let row = sqlx::query("SELECT name, price FROM products WHERE id = $1 AND active = true")
            .bind(product_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| (r.get::<String, _>("name"), r.get::<BigDecimal, _>("price"))))
    }
}

fn row_to_lead(row: LeadRow) -> Lead {
    Lead {
        id: row.id,
        name: row.name,
        website: row.website,
        phone: row.phone,
        category: row.category,
        location: row.location,
        status: LeadStatus::parse(&row.status).unwrap_or(LeadStatus::New),
        details: serde_json::from_value::<LeadDetails>(row.details).unwrap_or_default(),
        social_links: serde_json::from_value::<BTreeMap<String, String>>(row.social_links)
            .unwrap_or_default(),
        updated_at: row.updated_at,
    }
}

fn branding_from_row(row: sqlx::postgres::PgRow) -> BrandingConfig {
    BrandingConfig {
        platform_name: row.get("platform_name"),
        logo_url: row.get("logo_url"),
        primary_color: row.get("primary_color"),
        secondary_color: row.get("secondary_color"),
        accent_color: row.get("accent_color"),
        custom_domain: row.get("custom_domain"),
    }
}

/// Database-backed key source with a short-lived cache in front, so a scan
/// fanning out dozens of gateway calls hits the store once per vendor.
pub struct DbApiKeySource {
    pool: PgPool,
    cache: Cache<String, Option<String>>,
}

impl DbApiKeySource {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: Cache::builder()
                .time_to_live(Duration::from_secs(300))
                .max_capacity(10_000)
                .build(),
        }
    }
}

#[async_trait]
impl ApiKeySource for DbApiKeySource {
    async fn api_key(&self, tenant_id: Uuid, api: VendorApi) -> Result<Option<String>, AppError> {
        let cache_key = format!("{}:{}", tenant_id, api.name());

        if let Some(cached) = self.cache.get(&cache_key).await {
            return Ok(cached);
        }

        let key: Option<String> = sqlx::query_scalar(
            "SELECT api_key FROM tenant_api_keys WHERE tenant_id = $1 AND api_name = $2",
        )
        .bind(tenant_id)
        .bind(api.name())
        .fetch_optional(&self.pool)
        .await?;

        self.cache.insert(cache_key, key.clone()).await;
        Ok(key)
    }
}

/// Writes usage events to the store off the request path.
///
/// Observability must never affect primary-path correctness: the insert runs
/// in a spawned task and failures are logged and dropped.
pub struct DbUsageSink {
    pool: PgPool,
}

impl DbUsageSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl UsageSink for DbUsageSink {
    fn record(&self, event: UsageEvent) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let result = sqlx::query(
                "INSERT INTO usage_logs (tenant_id, api_name, endpoint, status)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(event.tenant_id)
            .bind(&event.api_name)
            .bind(&event.endpoint)
            .bind(&event.status)
            .execute(&pool)
            .await;

            if let Err(e) = result {
                tracing::warn!("Failed to record usage event: {}", e);
            }
        });
    }
}
