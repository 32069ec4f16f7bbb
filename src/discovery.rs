use crate::credits::{CreditGate, GEO_SCAN_COST, REGISTRY_SCAN_COST};
use crate::db_storage::Storage;
use crate::errors::AppError;
use crate::gateway::{ApiGateway, CallOptions, VendorApi};
use crate::models::{DetailSource, GeoScanRequest, Lead, RegistryRecord, RegistryScanRequest};
use crate::rate_limit::RateLimiter;
use crate::registry::{extract_cnpj_candidates, normalize_cnpj, RegistryResolver};
use phonenumber::country::Id as CountryId;
use phonenumber::Mode;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Candidate cap for one registry mass scan. Each candidate costs a
/// registry lookup, so the tail of a noisy search page is not worth it.
const MAX_REGISTRY_CANDIDATES: usize = 30;

/// Inter-request delay between registry lookups. The public endpoints
/// rate-limit aggressively.
const REGISTRY_LOOKUP_INTERVAL: Duration = Duration::from_millis(150);

/// Pause between continuous-scan pages.
const CONTINUOUS_PAGE_DELAY: Duration = Duration::from_secs(2);

/// Known registry-aggregator sites whose pages embed CNPJ numbers.
const REGISTRY_AGGREGATOR_DOMAINS: [&str; 4] = [
    "cnpj.biz",
    "casadosdados.com.br",
    "cnpja.com",
    "consultacnpj.com",
];

/// Synthesizes the deterministic WhatsApp deep link for a raw phone string.
///
/// Strips everything but digits and prefixes the country code `55` unless
/// already present. Numbers too short to be dialable produce no link.
pub fn whatsapp_deep_link(raw_phone: &str) -> Option<String> {
    let digits: String = raw_phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 8 {
        return None;
    }
    if digits.starts_with("55") {
        Some(format!("https://wa.me/{}", digits))
    } else {
        Some(format!("https://wa.me/55{}", digits))
    }
}

/// Normalizes a Brazilian phone number to E.164 (`+5541...`) when it parses
/// as a valid BR number. Vendor payloads carry every formatting style there
/// is; the display phone should not.
pub fn normalize_br_phone(raw: &str) -> Option<String> {
    if raw.trim().is_empty() || raw.len() < 8 {
        return None;
    }
    match phonenumber::parse(Some(CountryId::BR), raw) {
        Ok(number) if phonenumber::is_valid(&number) => {
            Some(number.format().mode(Mode::E164).to_string())
        }
        Ok(_) => {
            tracing::debug!("Not a valid BR phone: {}", raw);
            None
        }
        Err(e) => {
            tracing::debug!("Failed to parse phone '{}': {:?}", raw, e);
            None
        }
    }
}

/// Lead sourcing: the scan strategies plus the continuous-scan loop.
///
/// Every strategy is credit-gated before its first metered vendor call and
/// independent of the others.
pub struct DiscoveryService {
    pub(crate) gateway: Arc<ApiGateway>,
    resolver: Arc<RegistryResolver>,
    pub(crate) credits: Arc<dyn CreditGate>,
    registry_pacer: RateLimiter,
}

impl DiscoveryService {
    pub fn new(
        gateway: Arc<ApiGateway>,
        resolver: Arc<RegistryResolver>,
        credits: Arc<dyn CreditGate>,
    ) -> Self {
        Self {
            gateway,
            resolver,
            credits,
            registry_pacer: RateLimiter::new(REGISTRY_LOOKUP_INTERVAL),
        }
    }

    /// Geo business search: keyword + location, paginated.
    pub async fn geo_scan(
        &self,
        tenant_id: Uuid,
        request: &GeoScanRequest,
    ) -> Result<Vec<Lead>, AppError> {
        self.credits
            .use_credits(
                tenant_id,
                GEO_SCAN_COST,
                "geo_scan",
                &format!("{} em {}", request.keyword, request.location),
            )
            .await?;

        let payload = json!({
            "q": format!("{} em {}", request.keyword, request.location),
            "page": request.page,
            "gl": "br",
            "hl": "pt-br",
        });

        let response = self
            .gateway
            .call(
                tenant_id,
                VendorApi::MapsSearch,
                "places",
                payload,
                CallOptions::default(),
            )
            .await?;

        let leads = normalize_places(&response, &request.location);
        tracing::info!(
            "Geo scan '{}' in '{}' page {} yielded {} lead(s)",
            request.keyword,
            request.location,
            request.page,
            leads.len()
        );
        Ok(leads)
    }

    /// Registry mass scan.
    ///
    /// A keyword that is itself a registry number becomes a direct lookup.
    /// Otherwise a domain-restricted dork across the aggregator sites is
    /// mined for CNPJ patterns, which are resolved sequentially under the
    /// 150 ms pacer. Zero candidates from the restricted query triggers one
    /// broader fallback query.
    pub async fn registry_scan(
        &self,
        tenant_id: Uuid,
        request: &RegistryScanRequest,
    ) -> Result<Vec<Lead>, AppError> {
        self.credits
            .use_credits(
                tenant_id,
                REGISTRY_SCAN_COST,
                "registry_scan",
                &request.keyword,
            )
            .await?;

        if let Some(cnpj) = normalize_cnpj(&request.keyword) {
            tracing::info!("Registry scan: direct lookup for {}", cnpj);
            return Ok(self
                .resolver
                .resolve(&cnpj)
                .await
                .map(lead_from_registry)
                .into_iter()
                .collect());
        }

        let subject = match &request.location {
            Some(location) => format!("{} {}", request.keyword, location),
            None => request.keyword.clone(),
        };

        let restricted = format!(
            "{} ({})",
            subject,
            REGISTRY_AGGREGATOR_DOMAINS
                .iter()
                .map(|d| format!("site:{}", d))
                .collect::<Vec<_>>()
                .join(" OR ")
        );

        let mut candidates = self.search_for_candidates(tenant_id, &restricted).await?;

        if candidates.is_empty() {
            // The aggregator sites miss small towns and niches; retry untargeted.
            let broad = format!("{} CNPJ", subject);
            tracing::info!("Registry scan: no candidates from restricted query, broadening");
            candidates = self.search_for_candidates(tenant_id, &broad).await?;
        }

        candidates.truncate(MAX_REGISTRY_CANDIDATES);
        tracing::info!("Registry scan: resolving {} candidate(s)", candidates.len());

        let mut leads = Vec::new();
        for cnpj in candidates {
            self.registry_pacer.wait().await;
            if let Some(record) = self.resolver.resolve(&cnpj).await {
                leads.push(lead_from_registry(record));
            }
        }

        Ok(leads)
    }

    async fn search_for_candidates(
        &self,
        tenant_id: Uuid,
        query: &str,
    ) -> Result<Vec<String>, AppError> {
        let payload = json!({"q": query, "num": 30, "gl": "br", "hl": "pt-br"});
        let response = self
            .gateway
            .call(
                tenant_id,
                VendorApi::WebSearch,
                "search",
                payload,
                CallOptions::default(),
            )
            .await?;

        Ok(collect_cnpj_candidates(&response))
    }

    /// Enrichment needs the same resolver; expose it instead of wiring a
    /// second one.
    pub fn resolver(&self) -> Arc<RegistryResolver> {
        self.resolver.clone()
    }
}

/// Pulls CNPJ candidates from every organic result's title, snippet, and
/// URL, deduplicated across the whole result page in first-seen order.
pub fn collect_cnpj_candidates(response: &Value) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();
    let organic = response
        .get("organic")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for result in &organic {
        for field in ["title", "snippet", "link"] {
            if let Some(text) = result.get(field).and_then(Value::as_str) {
                for cnpj in extract_cnpj_candidates(text) {
                    if !candidates.contains(&cnpj) {
                        candidates.push(cnpj);
                    }
                }
            }
        }
    }

    candidates
}

/// Maps one places-vendor response into canonical leads.
pub fn normalize_places(response: &Value, location: &str) -> Vec<Lead> {
    let places = response
        .get("places")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut leads = Vec::new();
    for place in &places {
        let Some(name) = place
            .get("title")
            .and_then(Value::as_str)
            .filter(|t| !t.trim().is_empty())
        else {
            continue;
        };

        let id = place
            .get("cid")
            .and_then(Value::as_str)
            .map(|cid| format!("place_{}", cid))
            .unwrap_or_else(|| format!("lead_{}", Uuid::new_v4().simple()));

        let mut lead = Lead::new(id, name.to_string());
        lead.website = place
            .get("website")
            .and_then(Value::as_str)
            .map(String::from);
        lead.category = place
            .get("category")
            .and_then(Value::as_str)
            .map(String::from);
        lead.location = place
            .get("address")
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| Some(location.to_string()));

        if let Some(raw_phone) = place.get("phoneNumber").and_then(Value::as_str) {
            lead.phone = normalize_br_phone(raw_phone).or_else(|| Some(raw_phone.to_string()));
            if let Some(link) = whatsapp_deep_link(raw_phone) {
                lead.social_links.insert("whatsapp".to_string(), link);
            }
        }

        if let Some(cid) = place.get("cid").and_then(Value::as_str) {
            lead.social_links.insert(
                "maps".to_string(),
                format!("https://maps.google.com/?cid={}", cid),
            );
        }

        let mut extras = BTreeMap::new();
        if let Some(rating) = place.get("rating").and_then(Value::as_f64) {
            extras.insert("rating".to_string(), json!(rating));
        }
        if let Some(count) = place.get("ratingCount").and_then(Value::as_i64) {
            extras.insert("rating_count".to_string(), json!(count));
        }
        if let Some(thumbnail) = place.get("thumbnailUrl").and_then(Value::as_str) {
            extras.insert("image_url".to_string(), json!(thumbnail));
        }
        if !extras.is_empty() {
            lead.details.overlay(DetailSource::Computed, extras);
        }

        leads.push(lead);
    }

    leads
}

/// Builds a lead out of a resolved registry record.
pub fn lead_from_registry(record: RegistryRecord) -> Lead {
    let name = record
        .trade_name
        .clone()
        .or_else(|| record.legal_name.clone())
        .unwrap_or_else(|| record.cnpj.clone());

    // Deterministic id so re-discovering the same company dedupes.
    let mut lead = Lead::new(format!("cnpj_{}", record.cnpj), name);
    lead.category = record.main_activity.clone();
    lead.location = match (&record.city, &record.state) {
        (Some(city), Some(state)) => Some(format!("{}, {}", city, state)),
        (Some(city), None) => Some(city.clone()),
        _ => None,
    };
    lead.phone = record
        .phone
        .as_deref()
        .and_then(normalize_br_phone)
        .or_else(|| record.phone.clone());

    lead.social_links
        .insert("registry".to_string(), record.cnpj.clone());
    if let Some(raw_phone) = &record.phone {
        if let Some(link) = whatsapp_deep_link(raw_phone) {
            lead.social_links.insert("whatsapp".to_string(), link);
        }
    }

    lead.details
        .overlay(DetailSource::Registry, record.to_detail_values());
    lead
}

/// Owns the continuous geo scans, one per tenant.
///
/// Cancellation is an explicit token checked at every suspension point of
/// the loop; stopping is bounded by the shortest paced delay, not by a full
/// scan iteration.
pub struct ScanSupervisor {
    active: Arc<Mutex<std::collections::HashMap<Uuid, CancellationToken>>>,
}

impl ScanSupervisor {
    pub fn new() -> Self {
        Self {
            active: Arc::new(Mutex::new(std::collections::HashMap::new())),
        }
    }

    /// Starts a continuous scan for the tenant. Errors if one is running.
    pub async fn start(
        &self,
        tenant_id: Uuid,
        keyword: String,
        location: String,
        discovery: Arc<DiscoveryService>,
        storage: Arc<Storage>,
    ) -> Result<(), AppError> {
        let token = CancellationToken::new();

        {
            let mut active = self.active.lock().await;
            if active.contains_key(&tenant_id) {
                return Err(AppError::BadRequest(
                    "A continuous scan is already running for this tenant".to_string(),
                ));
            }
            active.insert(tenant_id, token.clone());
        }

        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            scan_loop(tenant_id, keyword, location, discovery, storage, token).await;
            active.lock().await.remove(&tenant_id);
            tracing::info!("Continuous scan for tenant {} terminated", tenant_id);
        });

        Ok(())
    }

    /// Requests cancellation. Returns whether a scan was running.
    pub async fn stop(&self, tenant_id: Uuid) -> bool {
        let active = self.active.lock().await;
        match active.get(&tenant_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

impl Default for ScanSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// The cooperative loop behind [`ScanSupervisor::start`].
async fn scan_loop(
    tenant_id: Uuid,
    keyword: String,
    location: String,
    discovery: Arc<DiscoveryService>,
    storage: Arc<Storage>,
    token: CancellationToken,
) {
    let mut page: u32 = 1;

    loop {
        if token.is_cancelled() {
            break;
        }

        let request = GeoScanRequest {
            keyword: keyword.clone(),
            location: location.clone(),
            page,
        };

        match discovery.geo_scan(tenant_id, &request).await {
            Ok(leads) if leads.is_empty() => {
                // Exhausted the result pages; wrap around for fresh listings.
                page = 1;
            }
            Ok(leads) => {
                match storage.save_discovered(tenant_id, &leads).await {
                    Ok(saved) => tracing::info!(
                        "Continuous scan page {} for tenant {}: {} new lead(s)",
                        page,
                        tenant_id,
                        saved
                    ),
                    Err(e) => tracing::warn!("Continuous scan persist failed: {}", e),
                }
                page += 1;
            }
            Err(e) if e.is_hard_failure() => {
                // Missing key or exhausted credits will not fix themselves;
                // stop instead of draining the vendor quota on errors.
                tracing::error!(
                    "Continuous scan for tenant {} halted: {}",
                    tenant_id,
                    e
                );
                break;
            }
            Err(e) => {
                tracing::warn!("Continuous scan page {} failed, continuing: {}", page, e);
            }
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(CONTINUOUS_PAGE_DELAY) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whatsapp_link_prefixes_country_code() {
        assert_eq!(
            whatsapp_deep_link("4133334444").as_deref(),
            Some("https://wa.me/554133334444")
        );
        assert_eq!(
            whatsapp_deep_link("(41) 3333-4444").as_deref(),
            Some("https://wa.me/554133334444")
        );
    }

    #[test]
    fn whatsapp_link_keeps_existing_country_code() {
        assert_eq!(
            whatsapp_deep_link("554133334444").as_deref(),
            Some("https://wa.me/554133334444")
        );
        assert_eq!(
            whatsapp_deep_link("+55 41 99888-7766").as_deref(),
            Some("https://wa.me/5541998887766")
        );
    }

    #[test]
    fn whatsapp_link_rejects_short_numbers() {
        assert_eq!(whatsapp_deep_link("3333"), None);
        assert_eq!(whatsapp_deep_link(""), None);
        assert_eq!(whatsapp_deep_link("no digits here"), None);
    }

    #[test]
    fn br_phone_normalizes_to_e164() {
        assert_eq!(
            normalize_br_phone("(41) 3333-4444").as_deref(),
            Some("+554133334444")
        );
        assert_eq!(
            normalize_br_phone("11987654321").as_deref(),
            Some("+5511987654321")
        );
        assert_eq!(normalize_br_phone("1234"), None);
        assert_eq!(normalize_br_phone(""), None);
    }

    #[test]
    fn places_normalization_builds_canonical_leads() {
        let response = serde_json::json!({
            "places": [
                {
                    "title": "Power Gym",
                    "phoneNumber": "4133334444",
                    "address": "Rua XV de Novembro, Curitiba - PR",
                    "category": "Academia",
                    "cid": "123456",
                    "rating": 4.7,
                    "ratingCount": 210
                },
                {"title": "   "}
            ]
        });

        let leads = normalize_places(&response, "Curitiba, PR");
        assert_eq!(leads.len(), 1);

        let lead = &leads[0];
        assert_eq!(lead.name, "Power Gym");
        assert_eq!(lead.status, crate::models::LeadStatus::New);
        assert_eq!(
            lead.social_links.get("whatsapp").map(String::as_str),
            Some("https://wa.me/554133334444")
        );
        assert_eq!(lead.id, "place_123456");
        assert_eq!(lead.details.get("rating").and_then(|v| v.as_f64()), Some(4.7));
    }

    #[test]
    fn candidates_collected_across_fields_without_duplicates() {
        let response = serde_json::json!({
            "organic": [
                {
                    "title": "Empresa 11.222.333/0001-81 - consulta",
                    "snippet": "CNPJ 11.222.333/0001-81 ativa",
                    "link": "https://cnpj.biz/11222333000181"
                },
                {
                    "title": "Outra empresa",
                    "snippet": "CNPJ: 99.888.777/0001-00",
                    "link": "https://cnpj.biz/99888777000100"
                }
            ]
        });

        let candidates = collect_cnpj_candidates(&response);
        assert_eq!(candidates, vec!["11222333000181", "99888777000100"]);
    }
}
