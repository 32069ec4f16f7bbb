use crate::credits::{COMPETITOR_SCAN_COST, INTENT_SCAN_COST};
use crate::discovery::DiscoveryService;
use crate::errors::AppError;
use crate::gateway::{CallOptions, VendorApi};
use crate::models::{CompetitorScanRequest, DetailSource, IntentScanRequest, Lead};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Fixed intent score attached to buyer-intent results. There is no model
/// behind it; forum posts asking where to buy are treated as uniformly hot.
pub const INTENT_SCORE: f64 = 0.85;

/// Dork templates for the competitor-mention scan, rotated per page.
/// `{}` receives the canonical competitor name.
const COMPETITOR_DORKS: [&str; 5] = [
    "site:reclameaqui.com.br \"{}\"",
    "site:instagram.com \"{}\" comentarios",
    "site:facebook.com \"{}\" atendimento",
    "\"{}\" reclamacao forum",
    "site:twitter.com \"{}\"",
];

/// Dork templates for the buyer-intent scan, targeting forum/Q&A phrasing.
const INTENT_DORKS: [&str; 4] = [
    "site:reddit.com \"{}\" \"onde comprar\"",
    "site:pt.quora.com \"{}\" recomendam",
    "\"procurando {}\" forum",
    "\"alguem indica\" \"{}\"",
];

/// Derives a canonical, lowercased competitor name from a URL, an @handle,
/// or a plain name.
pub fn canonical_competitor_name(input: &str) -> String {
    let trimmed = input.trim();

    if let Some(handle) = trimmed.strip_prefix('@') {
        return handle.to_lowercase();
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else if trimmed.starts_with("www.") {
        format!("https://{}", trimmed)
    } else {
        return trimmed.to_lowercase();
    };

    match url::Url::parse(&candidate) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or_default();
            let host = host.strip_prefix("www.").unwrap_or(host);
            // First DNS label is the brand: "powergym.com.br" -> "powergym".
            host.split('.').next().unwrap_or(host).to_lowercase()
        }
        Err(_) => trimmed.to_lowercase(),
    }
}

/// Rotates through the dork templates by page number.
pub fn select_dork(templates: &[&str], page: u32, name: &str) -> String {
    let index = (page.saturating_sub(1) as usize) % templates.len();
    templates[index].replace("{}", name)
}

/// Source-specific author/name extraction from an organic search result.
///
/// Each source titles its pages differently; the useful name is buried in a
/// different place for each.
pub fn extract_result_name(link: &str, title: &str) -> Option<String> {
    let host = url::Url::parse(link)
        .ok()
        .and_then(|u| u.host_str().map(String::from))
        .unwrap_or_default();

    let name = if host.contains("instagram.com") {
        // "Maria Souza (@mariasouza) • Instagram photos and videos"
        title
            .split(['(', '•', '|'])
            .next()
            .unwrap_or(title)
            .to_string()
    } else if host.contains("facebook.com") {
        // "Joao Pereira | Facebook" / "Joao Pereira - Home | Facebook"
        title
            .split(" | ")
            .next()
            .unwrap_or(title)
            .split(" - ")
            .next()
            .unwrap_or(title)
            .to_string()
    } else if host.contains("reclameaqui.com.br") {
        // "Problema com entrega - Reclame Aqui"
        title
            .split(" - Reclame Aqui")
            .next()
            .unwrap_or(title)
            .to_string()
    } else {
        title
            .split(" - ")
            .next()
            .unwrap_or(title)
            .split(" | ")
            .next()
            .unwrap_or(title)
            .to_string()
    };

    let name = name.trim().to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

impl DiscoveryService {
    /// Competitor-mention scan: finds people publicly interacting with or
    /// complaining about a competitor.
    pub async fn competitor_scan(
        &self,
        tenant_id: Uuid,
        request: &CompetitorScanRequest,
    ) -> Result<Vec<Lead>, AppError> {
        let competitor = canonical_competitor_name(&request.competitor);
        if competitor.is_empty() {
            return Err(AppError::BadRequest(
                "Competitor name could not be derived from the input".to_string(),
            ));
        }

        self.credits
            .use_credits(tenant_id, COMPETITOR_SCAN_COST, "competitor_scan", &competitor)
            .await?;

        let query = select_dork(&COMPETITOR_DORKS, request.page, &competitor);
        let response = self.dork_search(tenant_id, &query).await?;

        let mut leads = Vec::new();
        for result in organic_results(&response) {
            let link = result.get("link").and_then(Value::as_str).unwrap_or_default();
            let title = result.get("title").and_then(Value::as_str).unwrap_or_default();
            let snippet = result
                .get("snippet")
                .and_then(Value::as_str)
                .unwrap_or_default();

            let Some(name) = extract_result_name(link, title) else {
                continue;
            };
            // The competitor's own pages dominate these queries; suppress them.
            if name.to_lowercase().contains(&competitor) {
                continue;
            }

            let mut lead = Lead::new(
                format!("lead_{}", Uuid::new_v4().simple()),
                name,
            );
            let mut extras = BTreeMap::new();
            extras.insert("origin".to_string(), json!("competitor_scan"));
            extras.insert("competitor".to_string(), json!(&competitor));
            if !snippet.is_empty() {
                extras.insert("mention".to_string(), json!(snippet));
            }
            lead.details.overlay(DetailSource::Computed, extras);
            if !link.is_empty() {
                lead.social_links
                    .insert("profile".to_string(), link.to_string());
            }
            leads.push(lead);
        }

        tracing::info!(
            "Competitor scan for '{}' page {} yielded {} lead(s)",
            competitor,
            request.page,
            leads.len()
        );
        Ok(leads)
    }

    /// Buyer-intent scan: forum/Q&A posts with purchase-intent phrasing
    /// around a niche.
    pub async fn intent_scan(
        &self,
        tenant_id: Uuid,
        request: &IntentScanRequest,
    ) -> Result<Vec<Lead>, AppError> {
        let niche = request.niche.trim().to_lowercase();
        if niche.is_empty() {
            return Err(AppError::BadRequest("Niche must not be empty".to_string()));
        }

        self.credits
            .use_credits(tenant_id, INTENT_SCAN_COST, "intent_scan", &niche)
            .await?;

        let query = select_dork(&INTENT_DORKS, request.page, &niche);
        let response = self.dork_search(tenant_id, &query).await?;

        let mut leads = Vec::new();
        for result in organic_results(&response) {
            let link = result.get("link").and_then(Value::as_str).unwrap_or_default();
            let title = result.get("title").and_then(Value::as_str).unwrap_or_default();
            let snippet = result
                .get("snippet")
                .and_then(Value::as_str)
                .unwrap_or_default();

            let Some(name) = extract_result_name(link, title) else {
                continue;
            };

            let mut lead = Lead::new(
                format!("lead_{}", Uuid::new_v4().simple()),
                name,
            );
            let mut extras = BTreeMap::new();
            extras.insert("origin".to_string(), json!("intent_scan"));
            extras.insert("niche".to_string(), json!(&niche));
            extras.insert("intent_score".to_string(), json!(INTENT_SCORE));
            if !snippet.is_empty() {
                extras.insert("intent_signal".to_string(), json!(snippet));
            }
            lead.details.overlay(DetailSource::Computed, extras);
            if !link.is_empty() {
                lead.social_links
                    .insert("profile".to_string(), link.to_string());
            }
            leads.push(lead);
        }

        tracing::info!(
            "Intent scan for '{}' page {} yielded {} lead(s)",
            niche,
            request.page,
            leads.len()
        );
        Ok(leads)
    }

    async fn dork_search(&self, tenant_id: Uuid, query: &str) -> Result<Value, AppError> {
        let payload = json!({"q": query, "gl": "br", "hl": "pt-br"});
        self.gateway
            .call(
                tenant_id,
                VendorApi::WebSearch,
                "search",
                payload,
                CallOptions::default(),
            )
            .await
    }
}

fn organic_results(response: &Value) -> Vec<Value> {
    response
        .get("organic")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_name_from_url_handle_and_plain() {
        assert_eq!(
            canonical_competitor_name("https://www.powergym.com.br/planos"),
            "powergym"
        );
        assert_eq!(canonical_competitor_name("www.powergym.com.br"), "powergym");
        assert_eq!(canonical_competitor_name("@PowerGym"), "powergym");
        assert_eq!(canonical_competitor_name("Power Gym"), "power gym");
    }

    #[test]
    fn dork_rotation_wraps_by_page() {
        let first = select_dork(&COMPETITOR_DORKS, 1, "powergym");
        let wrapped = select_dork(&COMPETITOR_DORKS, 1 + COMPETITOR_DORKS.len() as u32, "powergym");
        assert_eq!(first, wrapped);
        assert!(first.contains("powergym"));

        let second = select_dork(&COMPETITOR_DORKS, 2, "powergym");
        assert_ne!(first, second);
    }

    #[test]
    fn instagram_titles_lose_handle_suffix() {
        let name = extract_result_name(
            "https://www.instagram.com/p/abc/",
            "Maria Souza (@mariasouza) • Instagram photos and videos",
        );
        assert_eq!(name.as_deref(), Some("Maria Souza"));
    }

    #[test]
    fn facebook_titles_lose_platform_suffix() {
        let name = extract_result_name(
            "https://www.facebook.com/joao.pereira",
            "Joao Pereira | Facebook",
        );
        assert_eq!(name.as_deref(), Some("Joao Pereira"));
    }

    #[test]
    fn empty_titles_are_dropped() {
        assert_eq!(extract_result_name("https://example.com", "   "), None);
    }
}
