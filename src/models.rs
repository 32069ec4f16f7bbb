use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

// ============ Lead lifecycle ============

/// Lifecycle state of a lead.
///
/// Only `New -> Enriching -> Enriched` happens automatically (around an
/// enrichment run). `Parked` and `Discarded` are user decisions; no state
/// ever reverts on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Enriching,
    Enriched,
    Parked,
    Discarded,
}

impl LeadStatus {
    /// Stable string form used in the store.
    pub fn as_str(self) -> &'static str {
        match self {
            LeadStatus::New => "new",
            LeadStatus::Enriching => "enriching",
            LeadStatus::Enriched => "enriched",
            LeadStatus::Parked => "parked",
            LeadStatus::Discarded => "discarded",
        }
    }

    /// Inverse of [`Self::as_str`]; unknown strings map to `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(LeadStatus::New),
            "enriching" => Some(LeadStatus::Enriching),
            "enriched" => Some(LeadStatus::Enriched),
            "parked" => Some(LeadStatus::Parked),
            "discarded" => Some(LeadStatus::Discarded),
            _ => None,
        }
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// Forward toward `Enriched`, sideways to `Parked`/`Discarded`, and
    /// user-triggered re-enrichment of enriched or parked leads. A
    /// discarded lead is terminal and nothing ever reverts to `New`.
    pub fn can_transition_to(self, next: LeadStatus) -> bool {
        use LeadStatus::*;
        match (self, next) {
            (a, b) if a == b => false,
            (New, Enriching) | (Enriching, Enriched) => true,
            (New, Parked) | (New, Discarded) => true,
            (Enriched, Parked) | (Enriched, Discarded) | (Enriched, Enriching) => true,
            (Parked, Discarded) | (Parked, Enriching) => true,
            _ => false,
        }
    }
}

/// Where a detail value came from. Overlay order is the declaration order:
/// later sources win on key collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailSource {
    Registry,
    Social,
    Ai,
    Computed,
}

/// A single detail value with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailValue {
    pub value: Value,
    pub source: DetailSource,
}

/// Open-ended attribute bag attached to a lead.
///
/// Merge semantics are additive: overlays add or overwrite keys, never
/// remove them, so repeated application of identical overlays is idempotent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeadDetails(pub BTreeMap<String, DetailValue>);

impl LeadDetails {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one source's key/value pairs on top of the existing bag.
    /// Later calls win on key collision; nothing is ever deleted.
    pub fn overlay(&mut self, source: DetailSource, values: BTreeMap<String, Value>) {
        for (key, value) in values {
            self.0.insert(key, DetailValue { value, source });
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).map(|d| &d.value)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A prospective business or person record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    /// Opaque unique identifier: vendor-supplied id, or a generated fallback
    /// token when the vendor provides none. Immutable once assigned.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Website, when known.
    pub website: Option<String>,
    /// Display phone, E.164-normalized when it validates as a BR number.
    pub phone: Option<String>,
    /// Industry/category label from the discovering vendor.
    pub category: Option<String>,
    /// Free-text location.
    pub location: Option<String>,
    /// Lifecycle state.
    pub status: LeadStatus,
    /// Attribute bag with per-key provenance.
    #[serde(default)]
    pub details: LeadDetails,
    /// Named external links (maps, whatsapp, registry, instagram, facebook).
    #[serde(default)]
    pub social_links: BTreeMap<String, String>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    /// Creates a fresh lead in the `New` state.
    pub fn new(id: String, name: String) -> Self {
        Self {
            id,
            name,
            website: None,
            phone: None,
            category: None,
            location: None,
            status: LeadStatus::New,
            details: LeadDetails::new(),
            social_links: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Registry number attached to this lead, if any was discovered.
    pub fn registry_number(&self) -> Option<&str> {
        self.social_links
            .get("registry")
            .map(String::as_str)
            .or_else(|| self.details.get_str("cnpj"))
    }
}

/// Database row for a persisted lead. The attribute bag and links are stored
/// as JSONB.
#[derive(Debug, Clone, FromRow)]
pub struct LeadRow {
    pub id: String,
    pub tenant_id: Uuid,
    pub name: String,
    pub website: Option<String>,
    pub phone: Option<String>,
    pub category: Option<String>,
    pub location: Option<String>,
    pub status: String,
    pub details: Value,
    pub social_links: Value,
    pub updated_at: DateTime<Utc>,
}

// ============ Tenancy ============

/// An isolated reseller whose data, branding, and credit balance are
/// segregated from all others.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    /// Remaining metered-call credits.
    pub credit_balance: i64,
    /// Endpoint notified when a lead reaches `Enriched`.
    pub webhook_url: Option<String>,
    /// Shared secret sent in `X-Webhook-Token` on dispatch.
    pub webhook_secret: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-tenant visual/identity configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrandingConfig {
    pub platform_name: String,
    pub logo_url: Option<String>,
    pub primary_color: String,
    pub secondary_color: String,
    pub accent_color: String,
    pub custom_domain: Option<String>,
}

impl Default for BrandingConfig {
    /// Hardcoded fallback used when the lookup fails or times out.
    fn default() -> Self {
        Self {
            platform_name: "Prospecta".to_string(),
            logo_url: None,
            primary_color: "#1a1a2e".to_string(),
            secondary_color: "#16213e".to_string(),
            accent_color: "#0f96c4".to_string(),
            custom_domain: None,
        }
    }
}

// ============ Registry data ============

/// Canonical shape of a company-registry record, normalized from the
/// divergent field names of the public CNPJ endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub cnpj: String,
    pub legal_name: Option<String>,
    pub trade_name: Option<String>,
    pub legal_nature: Option<String>,
    pub main_activity: Option<String>,
    pub opening_date: Option<String>,
    pub registration_status: Option<String>,
    pub capital: Option<String>,
    pub street: Option<String>,
    pub number: Option<String>,
    pub neighborhood: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl RegistryRecord {
    /// Flattens the record into detail-bag entries, skipping empty fields.
    pub fn to_detail_values(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        out.insert("cnpj".to_string(), Value::String(self.cnpj.clone()));
        let fields = [
            ("legal_name", &self.legal_name),
            ("trade_name", &self.trade_name),
            ("legal_nature", &self.legal_nature),
            ("main_activity", &self.main_activity),
            ("opening_date", &self.opening_date),
            ("registration_status", &self.registration_status),
            ("capital", &self.capital),
            ("street", &self.street),
            ("number", &self.number),
            ("neighborhood", &self.neighborhood),
            ("city", &self.city),
            ("state", &self.state),
            ("zip", &self.zip),
            ("registry_phone", &self.phone),
            ("registry_email", &self.email),
        ];
        for (key, value) in fields {
            if let Some(v) = value {
                if !v.is_empty() {
                    out.insert(key.to_string(), Value::String(v.clone()));
                }
            }
        }
        out
    }
}

// ============ AI-derived insight ============

/// Social presence extracted by the "digital detective" step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SocialPresence {
    /// Instagram profile URL, empty when not found.
    #[serde(default, deserialize_with = "null_to_empty")]
    pub instagram: String,
    /// Facebook page URL, empty when not found.
    #[serde(default, deserialize_with = "null_to_empty")]
    pub facebook: String,
    /// Verified contact email, empty when not found.
    #[serde(default, rename = "realEmail", deserialize_with = "null_to_empty")]
    pub real_email: String,
}

/// The model is told to answer `null` for absent fields; collapse that to an
/// empty string so downstream merging stays string-typed.
fn null_to_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt = Option::<String>::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

/// Structured commercial diagnostic for one lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommercialDiagnostic {
    /// Free-text strategic insight.
    pub insight: String,
    /// 0-100 commercial score (the model answers 1-10; normalized x10).
    pub commercial_score: u8,
    /// Probability-like purchase score in [0, 1].
    pub purchase_score: f64,
}

// ============ Usage metering ============

/// One completed gateway call, recorded per tenant for observability.
#[derive(Debug, Clone, Serialize)]
pub struct UsageEvent {
    pub tenant_id: Uuid,
    pub api_name: String,
    pub endpoint: String,
    /// "hit", "ok", or "error".
    pub status: String,
}

// ============ API request/response models ============

/// Request body for the geo scan.
#[derive(Debug, Clone, Deserialize)]
pub struct GeoScanRequest {
    pub keyword: String,
    pub location: String,
    #[serde(default = "default_page")]
    pub page: u32,
}

/// Request body for the registry mass scan.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryScanRequest {
    /// Free keyword, or a registry number for a direct lookup.
    pub keyword: String,
    pub location: Option<String>,
}

/// Request body for the competitor-mention scan.
#[derive(Debug, Clone, Deserialize)]
pub struct CompetitorScanRequest {
    /// Competitor URL, @handle, or plain name.
    pub competitor: String,
    #[serde(default = "default_page")]
    pub page: u32,
}

/// Request body for the buyer-intent scan.
#[derive(Debug, Clone, Deserialize)]
pub struct IntentScanRequest {
    /// Product/niche the buyer would be asking about.
    pub niche: String,
    #[serde(default = "default_page")]
    pub page: u32,
}

fn default_page() -> u32 {
    1
}

/// Common scan response envelope.
#[derive(Debug, Serialize)]
pub struct ScanResponse {
    pub leads: Vec<Lead>,
    pub credits_charged: i64,
}

/// Request body for a lead status update.
#[derive(Debug, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: LeadStatus,
}

/// Request body for starting a continuous scan.
#[derive(Debug, Clone, Deserialize)]
pub struct ContinuousScanRequest {
    pub keyword: String,
    pub location: String,
}

/// Request body for checkout session creation.
#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub product_id: String,
}

/// Hosted checkout session handle returned to the client.
#[derive(Debug, Serialize)]
pub struct CheckoutSession {
    pub session_id: String,
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overlay_later_source_wins_and_nothing_is_removed() {
        let mut details = LeadDetails::new();
        let mut registry = BTreeMap::new();
        registry.insert("city".to_string(), json!("Curitiba"));
        registry.insert("cnpj".to_string(), json!("11222333000181"));
        details.overlay(DetailSource::Registry, registry);

        let mut ai = BTreeMap::new();
        ai.insert("city".to_string(), json!("Curitiba, PR"));
        details.overlay(DetailSource::Ai, ai);

        assert_eq!(details.get_str("city"), Some("Curitiba, PR"));
        assert_eq!(details.0["city"].source, DetailSource::Ai);
        // Registry-only key survives the overlay.
        assert_eq!(details.get_str("cnpj"), Some("11222333000181"));
    }

    #[test]
    fn overlay_is_idempotent_for_identical_inputs() {
        let mut values = BTreeMap::new();
        values.insert("score".to_string(), json!(80));
        values.insert("insight".to_string(), json!("solid presence"));

        let mut once = LeadDetails::new();
        once.overlay(DetailSource::Ai, values.clone());

        let mut twice = once.clone();
        twice.overlay(DetailSource::Ai, values);

        assert_eq!(once, twice);
    }

    #[test]
    fn status_transitions_never_revert() {
        use LeadStatus::*;
        assert!(New.can_transition_to(Enriching));
        assert!(Enriching.can_transition_to(Enriched));
        assert!(Enriched.can_transition_to(Discarded));
        assert!(Enriched.can_transition_to(Enriching));
        assert!(!Enriched.can_transition_to(New));
        assert!(!Discarded.can_transition_to(New));
        assert!(!Discarded.can_transition_to(Enriching));
        assert!(!New.can_transition_to(New));
    }

    #[test]
    fn social_presence_parses_null_fields_to_empty() {
        let parsed: SocialPresence = serde_json::from_str(
            r#"{"instagram":"https://instagram.com/x","facebook":null,"realEmail":null}"#,
        )
        .unwrap();
        assert_eq!(parsed.instagram, "https://instagram.com/x");
        assert_eq!(parsed.facebook, "");
        assert_eq!(parsed.real_email, "");
    }
}
