use crate::branding::BrandingResolver;
use crate::config::Config;
use crate::credits::{
    COMPETITOR_SCAN_COST, GEO_SCAN_COST, INTENT_SCAN_COST, REGISTRY_SCAN_COST,
};
use crate::db_storage::Storage;
use crate::discovery::{DiscoveryService, ScanSupervisor};
use crate::enrichment::EnrichmentService;
use crate::errors::AppError;
use crate::models::*;
use crate::payments::CheckoutService;
use crate::registry::MunicipalityDirectory;
use crate::webhooks::WebhookDispatcher;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

/// Shared application state injected into handlers.
pub struct AppState {
    /// Database connection pool.
    pub db: PgPool,
    /// Application configuration.
    pub config: Config,
    /// Tenant-scoped persistence.
    pub storage: Arc<Storage>,
    /// Lead sourcing strategies.
    pub discovery: Arc<DiscoveryService>,
    /// Per-lead deep dive.
    pub enrichment: Arc<EnrichmentService>,
    /// White-label branding resolution.
    pub branding: Arc<BrandingResolver>,
    /// Outbound notifications.
    pub webhooks: Arc<WebhookDispatcher>,
    /// Hosted checkout sessions.
    pub checkout: Arc<CheckoutService>,
    /// Continuous-scan lifecycle per tenant.
    pub scans: Arc<ScanSupervisor>,
    /// Municipality names for the location picker.
    pub municipalities: Arc<MunicipalityDirectory>,
}

/// Reads the tenant id from the `X-Tenant-Id` header.
///
/// Authentication proper lives in front of this service; the header is the
/// row-level isolation key every tenant-scoped query hangs off.
fn tenant_id(headers: &HeaderMap) -> Result<Uuid, AppError> {
    let raw = headers
        .get("X-Tenant-Id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing X-Tenant-Id header".to_string()))?;

    Uuid::parse_str(raw)
        .map_err(|_| AppError::Unauthorized(format!("Invalid tenant id '{}'", raw)))
}

/// Health check endpoint.
///
/// # Returns
///
/// * `(StatusCode, Json<serde_json::Value>)` - HTTP 200 OK with health status JSON.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "prospecta-api",
            "version": "0.1.0"
        })),
    )
}

/// POST /api/v1/scans/geo
///
/// Runs one page of the geo business search and persists the results.
pub async fn scan_geo(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<GeoScanRequest>,
) -> Result<Json<ScanResponse>, AppError> {
    let tenant = tenant_id(&headers)?;
    tracing::info!(
        "POST /scans/geo tenant={} keyword='{}' location='{}' page={}",
        tenant,
        request.keyword,
        request.location,
        request.page
    );

    if request.keyword.trim().is_empty() || request.location.trim().is_empty() {
        return Err(AppError::BadRequest(
            "keyword and location are required".to_string(),
        ));
    }

    let leads = state.discovery.geo_scan(tenant, &request).await?;
    state.storage.save_discovered(tenant, &leads).await?;

    Ok(Json(ScanResponse {
        leads,
        credits_charged: GEO_SCAN_COST,
    }))
}

/// POST /api/v1/scans/registry
pub async fn scan_registry(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<RegistryScanRequest>,
) -> Result<Json<ScanResponse>, AppError> {
    let tenant = tenant_id(&headers)?;
    tracing::info!(
        "POST /scans/registry tenant={} keyword='{}'",
        tenant,
        request.keyword
    );

    if request.keyword.trim().is_empty() {
        return Err(AppError::BadRequest("keyword is required".to_string()));
    }

    let leads = state.discovery.registry_scan(tenant, &request).await?;
    state.storage.save_discovered(tenant, &leads).await?;

    Ok(Json(ScanResponse {
        leads,
        credits_charged: REGISTRY_SCAN_COST,
    }))
}

/// POST /api/v1/scans/competitor
pub async fn scan_competitor(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CompetitorScanRequest>,
) -> Result<Json<ScanResponse>, AppError> {
    let tenant = tenant_id(&headers)?;
    tracing::info!(
        "POST /scans/competitor tenant={} competitor='{}' page={}",
        tenant,
        request.competitor,
        request.page
    );

    let leads = state.discovery.competitor_scan(tenant, &request).await?;
    state.storage.save_discovered(tenant, &leads).await?;

    Ok(Json(ScanResponse {
        leads,
        credits_charged: COMPETITOR_SCAN_COST,
    }))
}

/// POST /api/v1/scans/intent
pub async fn scan_intent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<IntentScanRequest>,
) -> Result<Json<ScanResponse>, AppError> {
    let tenant = tenant_id(&headers)?;
    tracing::info!(
        "POST /scans/intent tenant={} niche='{}' page={}",
        tenant,
        request.niche,
        request.page
    );

    let leads = state.discovery.intent_scan(tenant, &request).await?;
    state.storage.save_discovered(tenant, &leads).await?;

    Ok(Json(ScanResponse {
        leads,
        credits_charged: INTENT_SCAN_COST,
    }))
}

/// POST /api/v1/scans/continuous/start
pub async fn start_continuous_scan(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ContinuousScanRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let tenant = tenant_id(&headers)?;

    if request.keyword.trim().is_empty() || request.location.trim().is_empty() {
        return Err(AppError::BadRequest(
            "keyword and location are required".to_string(),
        ));
    }

    state
        .scans
        .start(
            tenant,
            request.keyword.clone(),
            request.location.clone(),
            state.discovery.clone(),
            state.storage.clone(),
        )
        .await?;

    tracing::info!(
        "Continuous scan started for tenant {} ('{}' in '{}')",
        tenant,
        request.keyword,
        request.location
    );
    Ok(Json(json!({"status": "started"})))
}

/// POST /api/v1/scans/continuous/stop
pub async fn stop_continuous_scan(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let tenant = tenant_id(&headers)?;
    let was_running = state.scans.stop(tenant).await;

    Ok(Json(json!({
        "status": if was_running { "stopping" } else { "not_running" }
    })))
}

/// POST /api/v1/leads/:id/enrich
///
/// Runs the enrichment workflow for one stored lead. The `Enriching` state
/// is persisted before the external calls begin so a dashboard refresh
/// shows progress; hard failures revert it.
pub async fn enrich_lead(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(lead_id): Path<String>,
) -> Result<Json<Lead>, AppError> {
    let tenant = tenant_id(&headers)?;
    tracing::info!("POST /leads/{}/enrich tenant={}", lead_id, tenant);

    let mut lead = state.storage.load_lead(tenant, &lead_id).await?;
    let previous_status = lead.status;

    if !lead.status.can_transition_to(LeadStatus::Enriching) {
        return Err(AppError::BadRequest(format!(
            "Lead {} cannot be enriched from state '{}'",
            lead_id,
            lead.status.as_str()
        )));
    }

    state
        .storage
        .set_lead_status(tenant, &lead_id, LeadStatus::Enriching)
        .await?;

    match state.enrichment.enrich(tenant, &mut lead).await {
        Ok(()) => {
            state.storage.upsert_lead(tenant, &lead).await?;

            // Notify the tenant's endpoint off the request path
            match state.storage.tenant(tenant).await {
                Ok(tenant_row) => state.webhooks.lead_enriched(&tenant_row, &lead),
                Err(e) => tracing::warn!("Webhook dispatch skipped: {}", e),
            }

            Ok(Json(lead))
        }
        Err(e) => {
            // Put the lead back so it does not hang in Enriching forever
            if let Err(revert) = state
                .storage
                .set_lead_status(tenant, &lead_id, previous_status)
                .await
            {
                tracing::warn!("Failed to revert lead {} status: {}", lead_id, revert);
            }
            Err(e)
        }
    }
}

/// PATCH /api/v1/leads/:id/status
///
/// Operator-driven transitions: park, discard, resume.
pub async fn update_lead_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(lead_id): Path<String>,
    Json(request): Json<StatusUpdateRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let tenant = tenant_id(&headers)?;

    let lead = state.storage.load_lead(tenant, &lead_id).await?;
    if !lead.status.can_transition_to(request.status) {
        return Err(AppError::BadRequest(format!(
            "Illegal transition {} -> {}",
            lead.status.as_str(),
            request.status.as_str()
        )));
    }

    state
        .storage
        .set_lead_status(tenant, &lead_id, request.status)
        .await?;

    Ok(Json(json!({
        "id": lead_id,
        "status": request.status.as_str(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct BrandingQuery {
    pub host: Option<String>,
}

/// GET /api/v1/branding
///
/// Public: the dashboard shell loads this before any authentication, so it
/// must always answer, falling back to the default identity.
pub async fn get_branding(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<BrandingQuery>,
) -> Json<BrandingConfig> {
    let tenant = tenant_id(&headers).ok();
    let config = state
        .branding
        .resolve(query.host.as_deref(), tenant)
        .await;
    Json(config)
}

#[derive(Debug, Deserialize)]
pub struct BrandingRefreshRequest {
    pub host: String,
}

/// POST /api/v1/branding/refresh
pub async fn refresh_branding(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<BrandingRefreshRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    tenant_id(&headers)?;
    state.branding.refresh(&request.host).await;
    Ok(Json(json!({"status": "refreshed"})))
}

/// GET /api/v1/locations/:uf
///
/// Municipality names for the location picker. Public data; no tenant
/// required.
pub async fn list_municipalities(
    State(state): State<Arc<AppState>>,
    Path(uf): Path<String>,
) -> Result<Json<Vec<String>>, AppError> {
    let names = state.municipalities.list(&uf).await?;
    Ok(Json(names))
}

/// POST /api/v1/checkout
pub async fn create_checkout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<CheckoutSession>, AppError> {
    let tenant = tenant_id(&headers)?;
    tracing::info!(
        "POST /checkout tenant={} product={}",
        tenant,
        request.product_id
    );

    let session = state
        .checkout
        .create_session(tenant, &request.product_id)
        .await?;
    Ok(Json(session))
}
