/// Per-lead enrichment workflow:
/// 1. Resolve full registry data when the lead carries a registry number
/// 2. Discover social/web presence via targeted searches + AI extraction
/// 3. Request a structured commercial diagnostic from the AI endpoint
/// 4. Merge everything into the lead's detail bag, later sources winning
///
/// Ordinary vendor failures degrade to heuristic defaults; only gateway
/// hard failures (missing key, insufficient credits) propagate.
use crate::errors::AppError;
use crate::gateway::{extract_generated_text, ApiGateway, CallOptions, VendorApi};
use crate::models::{
    CommercialDiagnostic, DetailSource, Lead, LeadStatus, SocialPresence,
};
use crate::registry::RegistryResolver;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

/// Substituted when the diagnostic call fails. Intentional fixed heuristic,
/// not a placeholder.
pub const FALLBACK_COMMERCIAL_SCORE: u8 = 75;

const FALLBACK_INSIGHT: &str = "Empresa com presenca digital em construcao. \
Oportunidade de abordagem consultiva: apresente casos de clientes do mesmo \
segmento e proponha um diagnostico gratuito.";

/// Domains that never count as a business's own website.
const SOCIAL_PLATFORM_DOMAINS: [&str; 10] = [
    "instagram.com",
    "facebook.com",
    "linkedin.com",
    "youtube.com",
    "twitter.com",
    "x.com",
    "tiktok.com",
    "reclameaqui.com.br",
    "ifood.com.br",
    "tripadvisor.com",
];

/// Validate email address
///
/// Checks for:
/// - Basic email format (contains @ and .)
/// - Fake/placeholder patterns (repeated digits like 9999, 1111)
/// - Minimum length requirements
pub fn is_valid_email(email: &str) -> bool {
    if email.len() < 5 || !email.contains('@') || !email.contains('.') {
        return false;
    }

    // Scraped pages are full of digit-run placeholders posing as emails
    let fake_patterns = ["999999", "111111", "000000", "123456789"];
    for pattern in &fake_patterns {
        if email.contains(pattern) {
            tracing::debug!("Rejecting fake-pattern email: {}", email);
            return false;
        }
    }

    static RE: OnceLock<Regex> = OnceLock::new();
    let email_regex = RE.get_or_init(|| {
        // RFC 5322 simplified
        Regex::new(
            r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
        )
        .unwrap()
    });

    email_regex.is_match(email)
}

/// Removes a Markdown code fence around a model reply, including the info
/// string (` ```json `). Models add fences no matter how the prompt forbids
/// them.
pub fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let rest = rest.split_once('\n').map(|(_, r)| r).unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim().to_string()
}

/// Parses the digital-detective reply into a [`SocialPresence`].
/// `None` when the reply is not the demanded JSON object.
pub fn parse_detective_reply(raw: &str) -> Option<SocialPresence> {
    serde_json::from_str(&strip_code_fences(raw)).ok()
}

/// Parses the diagnostic reply. The model answers a 1-10 commercial score;
/// it is normalized x10 onto the 0-100 scale here.
pub fn parse_diagnostic_reply(raw: &str) -> Option<CommercialDiagnostic> {
    let value: Value = serde_json::from_str(&strip_code_fences(raw)).ok()?;
    let insight = value.get("insight")?.as_str()?.to_string();
    let raw_score = value.get("commercialScore")?.as_f64()?;
    let purchase_score = value
        .get("purchaseScore")
        .and_then(Value::as_f64)
        .unwrap_or(0.5)
        .clamp(0.0, 1.0);

    Some(CommercialDiagnostic {
        insight,
        commercial_score: (raw_score.clamp(1.0, 10.0) * 10.0).round() as u8,
        purchase_score,
    })
}

fn email_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").unwrap())
}

/// Per-lead deep dive. One instance serves all tenants; tenant scoping
/// rides on every gateway call.
pub struct EnrichmentService {
    gateway: Arc<ApiGateway>,
    resolver: Arc<RegistryResolver>,
}

impl EnrichmentService {
    pub fn new(gateway: Arc<ApiGateway>, resolver: Arc<RegistryResolver>) -> Self {
        Self { gateway, resolver }
    }

    /// Runs the full enrichment workflow, mutating the lead in place.
    ///
    /// The lead leaves as `Enriched` unless a hard failure aborts the run,
    /// in which case the error propagates and the lead keeps the
    /// `Enriching` state it was given for the caller to persist or revert.
    pub async fn enrich(&self, tenant_id: Uuid, lead: &mut Lead) -> Result<(), AppError> {
        tracing::info!("Enriching lead {} ({})", lead.id, lead.name);
        lead.status = LeadStatus::Enriching;

        // Step 1: registry data
        if let Some(cnpj) = lead.registry_number().map(str::to_string) {
            if let Some(record) = self.resolver.resolve(&cnpj).await {
                if lead.phone.is_none() {
                    lead.phone = record.phone.clone();
                }
                lead.social_links
                    .entry("registry".to_string())
                    .or_insert_with(|| record.cnpj.clone());
                lead.details
                    .overlay(DetailSource::Registry, record.to_detail_values());
            }
        }

        // Step 2: social/web presence
        let social = self.discover_social(tenant_id, lead).await?;
        let mut social_values = BTreeMap::new();
        if !social.instagram.is_empty() {
            social_values.insert("instagram".to_string(), json!(&social.instagram));
            lead.social_links
                .insert("instagram".to_string(), social.instagram.clone());
        }
        if !social.facebook.is_empty() {
            social_values.insert("facebook".to_string(), json!(&social.facebook));
            lead.social_links
                .insert("facebook".to_string(), social.facebook.clone());
        }
        if !social.real_email.is_empty() {
            social_values.insert("email".to_string(), json!(&social.real_email));
        }
        if !social_values.is_empty() {
            lead.details.overlay(DetailSource::Social, social_values);
        }

        // Step 3: commercial diagnostic
        let diagnostic = self.commercial_diagnostic(tenant_id, lead).await?;
        let mut ai_values = BTreeMap::new();
        ai_values.insert("insight".to_string(), json!(diagnostic.insight));
        ai_values.insert("purchase_score".to_string(), json!(diagnostic.purchase_score));
        lead.details.overlay(DetailSource::Ai, ai_values);

        // Computed fields land last and win any collision
        let mut computed = BTreeMap::new();
        computed.insert(
            "commercial_score".to_string(),
            json!(diagnostic.commercial_score),
        );
        lead.details.overlay(DetailSource::Computed, computed);

        lead.status = LeadStatus::Enriched;
        lead.updated_at = chrono::Utc::now();
        tracing::info!(
            "Lead {} enriched: {} detail field(s)",
            lead.id,
            lead.details.len()
        );
        Ok(())
    }

    /// Discovers the lead's website, Instagram, Facebook, and email.
    async fn discover_social(
        &self,
        tenant_id: Uuid,
        lead: &mut Lead,
    ) -> Result<SocialPresence, AppError> {
        // An unknown website gets one "official site" search first
        if lead.website.is_none() {
            match self.find_official_site(tenant_id, lead).await {
                Ok(site) => lead.website = site,
                Err(e) if e.is_hard_failure() => return Err(e),
                Err(e) => tracing::warn!("Official-site search failed for {}: {}", lead.id, e),
            }
        }

        // Scope the targeted searches to the domain when we have one
        let scope = lead
            .website
            .as_deref()
            .and_then(domain_of)
            .unwrap_or_else(|| {
                format!(
                    "{} {}",
                    lead.name,
                    lead.location.as_deref().unwrap_or_default()
                )
                .trim()
                .to_string()
            });

        // The one intentionally parallel fan-out in the pipeline
        let instagram_query = format!("site:instagram.com {}", scope);
        let facebook_query = format!("site:facebook.com {}", scope);
        let email_query = format!("\"{}\" email contato", scope);
        let (instagram_result, facebook_result, email_result) = tokio::join!(
            self.search(tenant_id, &instagram_query),
            self.search(tenant_id, &facebook_query),
            self.search(tenant_id, &email_query),
        );

        let mut raw_results = Vec::new();
        for result in [instagram_result, facebook_result, email_result] {
            match result {
                Ok(value) => raw_results.push(value),
                Err(e) if e.is_hard_failure() => return Err(e),
                Err(e) => {
                    tracing::warn!("Social search failed for {}: {}", lead.id, e);
                    raw_results.push(Value::Null);
                }
            }
        }

        let snippets = concat_snippets(&raw_results);
        if snippets.is_empty() {
            return Ok(SocialPresence::default());
        }

        let prompt = format!(
            "Voce e um detetive digital. Analise os resultados de busca abaixo \
             sobre a empresa \"{}\" ({}). Ignore perfis de empresas homonimas de \
             outras cidades. Responda APENAS um objeto JSON com exatamente os \
             campos: instagram (URL ou null), facebook (URL ou null), realEmail \
             (email ou null).\n\nResultados:\n{}",
            lead.name,
            lead.location.as_deref().unwrap_or("localizacao desconhecida"),
            snippets
        );

        match self.generate(tenant_id, &prompt).await {
            Ok(reply) => {
                if let Some(mut presence) = parse_detective_reply(&reply) {
                    if !presence.real_email.is_empty() && !is_valid_email(&presence.real_email) {
                        presence.real_email = String::new();
                    }
                    return Ok(presence);
                }
                tracing::warn!(
                    "Detective reply for {} was not valid JSON, falling back",
                    lead.id
                );
                Ok(naive_presence_extraction(&raw_results, &snippets))
            }
            Err(e) if e.is_hard_failure() => Err(e),
            Err(e) => {
                tracing::warn!("Detective call failed for {}: {}", lead.id, e);
                Ok(naive_presence_extraction(&raw_results, &snippets))
            }
        }
    }

    async fn find_official_site(
        &self,
        tenant_id: Uuid,
        lead: &Lead,
    ) -> Result<Option<String>, AppError> {
        let query = format!(
            "{} {} site oficial",
            lead.name,
            lead.location.as_deref().unwrap_or_default()
        );
        let response = self.search(tenant_id, query.trim()).await?;

        let organic = response
            .get("organic")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for result in &organic {
            if let Some(link) = result.get("link").and_then(Value::as_str) {
                let Some(domain) = domain_of(link) else {
                    continue;
                };
                if !SOCIAL_PLATFORM_DOMAINS.iter().any(|d| domain.ends_with(d)) {
                    return Ok(Some(link.to_string()));
                }
            }
        }

        Ok(None)
    }

    /// Requests the structured diagnostic; degrades to the canned insight
    /// and fixed score on any soft failure.
    async fn commercial_diagnostic(
        &self,
        tenant_id: Uuid,
        lead: &Lead,
    ) -> Result<CommercialDiagnostic, AppError> {
        let summary = lead_summary(lead);
        let prompt = format!(
            "Voce e um consultor comercial. Com base nos dados abaixo, responda \
             APENAS um objeto JSON com os campos: insight (diagnostico \
             estrategico em ate 3 frases), commercialScore (nota de 1 a 10 do \
             potencial comercial), purchaseScore (probabilidade de compra entre \
             0 e 1).\n\nDados do lead:\n{}",
            summary
        );

        match self.generate(tenant_id, &prompt).await {
            Ok(reply) => {
                if let Some(diagnostic) = parse_diagnostic_reply(&reply) {
                    return Ok(diagnostic);
                }
                tracing::warn!(
                    "Diagnostic reply for {} was not valid JSON, using fallback",
                    lead.id
                );
                Ok(fallback_diagnostic())
            }
            Err(e) if e.is_hard_failure() => Err(e),
            Err(e) => {
                tracing::warn!("Diagnostic call failed for {}: {}", lead.id, e);
                Ok(fallback_diagnostic())
            }
        }
    }

    async fn search(&self, tenant_id: Uuid, query: &str) -> Result<Value, AppError> {
        self.gateway
            .call(
                tenant_id,
                VendorApi::WebSearch,
                "search",
                json!({"q": query, "gl": "br", "hl": "pt-br"}),
                CallOptions::default(),
            )
            .await
    }

    async fn generate(&self, tenant_id: Uuid, prompt: &str) -> Result<String, AppError> {
        let payload = json!({
            "contents": [{"parts": [{"text": prompt}]}]
        });
        let response = self
            .gateway
            .call(
                tenant_id,
                VendorApi::TextGen,
                "generate",
                payload,
                CallOptions::default(),
            )
            .await?;

        extract_generated_text(&response).ok_or_else(|| {
            AppError::ExternalApiError("Text generation response had no candidates".to_string())
        })
    }
}

fn fallback_diagnostic() -> CommercialDiagnostic {
    CommercialDiagnostic {
        insight: FALLBACK_INSIGHT.to_string(),
        commercial_score: FALLBACK_COMMERCIAL_SCORE,
        purchase_score: 0.5,
    }
}

fn lead_summary(lead: &Lead) -> String {
    let mut lines = vec![format!("Nome: {}", lead.name)];
    if let Some(category) = &lead.category {
        lines.push(format!("Segmento: {}", category));
    }
    if let Some(location) = &lead.location {
        lines.push(format!("Localizacao: {}", location));
    }
    if let Some(website) = &lead.website {
        lines.push(format!("Site: {}", website));
    }
    for key in ["legal_name", "main_activity", "opening_date", "capital"] {
        if let Some(value) = lead.details.get_str(key) {
            lines.push(format!("{}: {}", key, value));
        }
    }
    lines.join("\n")
}

/// Registered domain of a URL, without the `www.` prefix.
fn domain_of(link: &str) -> Option<String> {
    let candidate = if link.contains("://") {
        link.to_string()
    } else {
        format!("https://{}", link)
    };
    let parsed = url::Url::parse(&candidate).ok()?;
    let host = parsed.host_str()?;
    Some(host.strip_prefix("www.").unwrap_or(host).to_string())
}

fn concat_snippets(results: &[Value]) -> String {
    let mut parts = Vec::new();
    for response in results {
        let organic = response
            .get("organic")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for result in organic.iter().take(5) {
            let title = result.get("title").and_then(Value::as_str).unwrap_or_default();
            let link = result.get("link").and_then(Value::as_str).unwrap_or_default();
            let snippet = result
                .get("snippet")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !title.is_empty() || !snippet.is_empty() {
                parts.push(format!("- {} | {} | {}", title, link, snippet));
            }
        }
    }
    parts.join("\n")
}

/// First-match extraction used when the AI reply is unusable: first
/// Instagram link, first Facebook link, first valid email in the snippets.
fn naive_presence_extraction(results: &[Value], snippets: &str) -> SocialPresence {
    let mut presence = SocialPresence::default();

    'outer: for response in results {
        let organic = response
            .get("organic")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for result in &organic {
            let Some(link) = result.get("link").and_then(Value::as_str) else {
                continue;
            };
            if presence.instagram.is_empty() && link.contains("instagram.com") {
                presence.instagram = link.to_string();
            } else if presence.facebook.is_empty() && link.contains("facebook.com") {
                presence.facebook = link.to_string();
            }
            if !presence.instagram.is_empty() && !presence.facebook.is_empty() {
                break 'outer;
            }
        }
    }

    for m in email_pattern().find_iter(snippets) {
        if is_valid_email(m.as_str()) {
            presence.real_email = m.as_str().to_string();
            break;
        }
    }

    presence
}
