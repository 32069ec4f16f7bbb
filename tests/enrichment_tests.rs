/// Enrichment workflow against mocked vendors: registry + social + AI
/// merge, fence-stripped parsing, and graceful degradation.
use prospecta_api::config::Config;
use prospecta_api::enrichment::{EnrichmentService, FALLBACK_COMMERCIAL_SCORE};
use prospecta_api::gateway::{ApiGateway, NoopUsageSink, StaticKeySource, VendorApi};
use prospecta_api::models::{Lead, LeadStatus};
use prospecta_api::registry::{RegistryProvider, RegistryResolver};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(base_url: &str) -> Config {
    Config {
        database_url: "postgresql://test".to_string(),
        port: 8080,
        places_base_url: base_url.to_string(),
        search_base_url: base_url.to_string(),
        textgen_base_url: format!("{}/generate", base_url),
        checkout_base_url: base_url.to_string(),
        checkout_secret_key: None,
    }
}

fn test_service(server_uri: &str, tenant: Uuid) -> EnrichmentService {
    let keys = StaticKeySource::new()
        .with_key(tenant, VendorApi::WebSearch, "search-key")
        .with_key(tenant, VendorApi::TextGen, "gen-key");

    let gateway = Arc::new(
        ApiGateway::new(
            &test_config(server_uri),
            Arc::new(keys),
            Arc::new(NoopUsageSink),
        )
        .unwrap()
        .with_backoff_base(Duration::from_millis(1)),
    );

    let resolver = Arc::new(
        RegistryResolver::with_endpoints(vec![(
            RegistryProvider::BrasilApi,
            format!("{}/brasilapi", server_uri),
        )])
        .unwrap(),
    );

    EnrichmentService::new(gateway, resolver)
}

fn fenced(body: serde_json::Value) -> serde_json::Value {
    json!({
        "candidates": [{"content": {"parts": [{"text": format!("```json\n{}\n```", body)}]}}]
    })
}

async fn mount_search(mock_server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "organic": [
                {
                    "title": "Power Gym Curitiba",
                    "link": "https://powergym.com.br",
                    "snippet": "Academia em Curitiba. contato@powergym.com.br"
                },
                {
                    "title": "Power Gym (@powergymcwb) • Instagram",
                    "link": "https://www.instagram.com/powergymcwb",
                    "snippet": "treinos e planos"
                }
            ]
        })))
        .mount(mock_server)
        .await;
}

fn test_lead() -> Lead {
    let mut lead = Lead::new("place_123".to_string(), "Power Gym".to_string());
    lead.location = Some("Curitiba, PR".to_string());
    lead
}

#[tokio::test]
async fn full_enrichment_merges_all_sources() {
    let mock_server = MockServer::start().await;
    mount_search(&mock_server).await;

    // Digital detective and diagnostic are told apart by their prompts
    Mock::given(method("POST"))
        .and(path("/generate"))
        .and(body_string_contains("detetive digital"))
        .respond_with(ResponseTemplate::new(200).set_body_json(fenced(json!({
            "instagram": "https://www.instagram.com/powergymcwb",
            "facebook": null,
            "realEmail": "contato@powergym.com.br"
        }))))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .and(body_string_contains("consultor comercial"))
        .respond_with(ResponseTemplate::new(200).set_body_json(fenced(json!({
            "insight": "Academia consolidada com forte presenca local.",
            "commercialScore": 8,
            "purchaseScore": 0.7
        }))))
        .mount(&mock_server)
        .await;

    let tenant = Uuid::new_v4();
    let service = test_service(&mock_server.uri(), tenant);
    let mut lead = test_lead();

    service.enrich(tenant, &mut lead).await.unwrap();

    assert_eq!(lead.status, LeadStatus::Enriched);
    assert_eq!(lead.website.as_deref(), Some("https://powergym.com.br"));
    assert_eq!(
        lead.social_links.get("instagram").map(String::as_str),
        Some("https://www.instagram.com/powergymcwb")
    );
    assert_eq!(lead.details.get_str("email"), Some("contato@powergym.com.br"));
    assert_eq!(
        lead.details.get("commercial_score").and_then(|v| v.as_i64()),
        Some(80)
    );
    assert_eq!(
        lead.details.get_str("insight"),
        Some("Academia consolidada com forte presenca local.")
    );
}

#[tokio::test]
async fn enrichment_is_idempotent_for_identical_responses() {
    let mock_server = MockServer::start().await;
    mount_search(&mock_server).await;

    Mock::given(method("POST"))
        .and(path("/generate"))
        .and(body_string_contains("detetive digital"))
        .respond_with(ResponseTemplate::new(200).set_body_json(fenced(json!({
            "instagram": null,
            "facebook": null,
            "realEmail": "contato@powergym.com.br"
        }))))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .and(body_string_contains("consultor comercial"))
        .respond_with(ResponseTemplate::new(200).set_body_json(fenced(json!({
            "insight": "ok",
            "commercialScore": 6,
            "purchaseScore": 0.4
        }))))
        .mount(&mock_server)
        .await;

    let tenant = Uuid::new_v4();
    let service = test_service(&mock_server.uri(), tenant);

    let mut once = test_lead();
    service.enrich(tenant, &mut once).await.unwrap();

    // Second pass sees identical (cached) vendor responses
    let mut twice = once.clone();
    service.enrich(tenant, &mut twice).await.unwrap();

    assert_eq!(once.details, twice.details);
    assert_eq!(once.social_links, twice.social_links);
}

#[tokio::test]
async fn failed_diagnostic_degrades_to_fixed_score() {
    let mock_server = MockServer::start().await;
    mount_search(&mock_server).await;

    Mock::given(method("POST"))
        .and(path("/generate"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let tenant = Uuid::new_v4();
    let service = test_service(&mock_server.uri(), tenant);
    let mut lead = test_lead();

    service.enrich(tenant, &mut lead).await.unwrap();

    assert_eq!(lead.status, LeadStatus::Enriched);
    assert_eq!(
        lead.details.get("commercial_score").and_then(|v| v.as_i64()),
        Some(FALLBACK_COMMERCIAL_SCORE as i64)
    );
    // Detective down too: naive extraction still found the Instagram link
    assert_eq!(
        lead.social_links.get("instagram").map(String::as_str),
        Some("https://www.instagram.com/powergymcwb")
    );
}

#[tokio::test]
async fn malformed_detective_reply_falls_back_to_naive_extraction() {
    let mock_server = MockServer::start().await;
    mount_search(&mock_server).await;

    Mock::given(method("POST"))
        .and(path("/generate"))
        .and(body_string_contains("detetive digital"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{"content": {"parts": [{"text": "desculpe, nao posso responder em JSON"}]}}]
        })))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .and(body_string_contains("consultor comercial"))
        .respond_with(ResponseTemplate::new(200).set_body_json(fenced(json!({
            "insight": "ok",
            "commercialScore": 5,
            "purchaseScore": 0.3
        }))))
        .mount(&mock_server)
        .await;

    let tenant = Uuid::new_v4();
    let service = test_service(&mock_server.uri(), tenant);
    let mut lead = test_lead();

    service.enrich(tenant, &mut lead).await.unwrap();

    assert_eq!(
        lead.social_links.get("instagram").map(String::as_str),
        Some("https://www.instagram.com/powergymcwb")
    );
    assert_eq!(lead.details.get_str("email"), Some("contato@powergym.com.br"));
}

#[tokio::test]
async fn missing_textgen_key_propagates_as_hard_failure() {
    let mock_server = MockServer::start().await;
    mount_search(&mock_server).await;

    let tenant = Uuid::new_v4();
    // Only the search key is configured
    let keys = StaticKeySource::new().with_key(tenant, VendorApi::WebSearch, "search-key");
    let gateway = Arc::new(
        ApiGateway::new(
            &test_config(&mock_server.uri()),
            Arc::new(keys),
            Arc::new(NoopUsageSink),
        )
        .unwrap()
        .with_backoff_base(Duration::from_millis(1)),
    );
    let resolver = Arc::new(
        RegistryResolver::with_endpoints(vec![(
            RegistryProvider::BrasilApi,
            format!("{}/brasilapi", mock_server.uri()),
        )])
        .unwrap(),
    );
    let service = EnrichmentService::new(gateway, resolver);

    let mut lead = test_lead();
    let result = service.enrich(tenant, &mut lead).await;

    assert!(matches!(
        result,
        Err(prospecta_api::errors::AppError::MissingApiKey(_))
    ));
    // The lead never reached Enriched
    assert_eq!(lead.status, LeadStatus::Enriching);
}

#[tokio::test]
async fn registry_number_pulls_official_record() {
    let mock_server = MockServer::start().await;
    mount_search(&mock_server).await;

    Mock::given(method("GET"))
        .and(path("/brasilapi/11222333000181"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "razao_social": "POWER GYM LTDA",
            "nome_fantasia": "Power Gym",
            "cnae_fiscal_descricao": "Atividades de condicionamento fisico",
            "municipio": "CURITIBA",
            "uf": "PR"
        })))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(fenced(json!({
            "insight": "ok",
            "commercialScore": 7,
            "purchaseScore": 0.5,
            "instagram": null,
            "facebook": null,
            "realEmail": null
        }))))
        .mount(&mock_server)
        .await;

    let tenant = Uuid::new_v4();
    let service = test_service(&mock_server.uri(), tenant);

    let mut lead = test_lead();
    lead.social_links
        .insert("registry".to_string(), "11222333000181".to_string());

    service.enrich(tenant, &mut lead).await.unwrap();

    assert_eq!(lead.details.get_str("legal_name"), Some("POWER GYM LTDA"));
    assert_eq!(
        lead.details.get_str("main_activity"),
        Some("Atividades de condicionamento fisico")
    );
}
