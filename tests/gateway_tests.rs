/// Gateway behavior against mocked vendors: caching, retry bounds, missing
/// credentials, and usage-side-channel isolation.
use prospecta_api::config::Config;
use prospecta_api::errors::AppError;
use prospecta_api::gateway::{
    ApiGateway, CallOptions, NoopUsageSink, StaticKeySource, VendorApi,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{header, method, path};
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

fn test_gateway(server_uri: &str, tenant: Uuid) -> ApiGateway {
    let keys = StaticKeySource::new()
        .with_key(tenant, VendorApi::MapsSearch, "maps-key")
        .with_key(tenant, VendorApi::WebSearch, "search-key")
        .with_key(tenant, VendorApi::TextGen, "gen-key");

    ApiGateway::new(
        &test_config(server_uri),
        Arc::new(keys),
        Arc::new(NoopUsageSink),
    )
    .unwrap()
    .with_backoff_base(Duration::from_millis(1))
}

#[tokio::test]
async fn identical_cached_call_does_not_hit_the_vendor_again() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"organic": []})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let tenant = Uuid::new_v4();
    let gateway = test_gateway(&mock_server.uri(), tenant);
    let payload = json!({"q": "academias em curitiba"});

    let first = gateway
        .call(
            tenant,
            VendorApi::WebSearch,
            "search",
            payload.clone(),
            CallOptions::default(),
        )
        .await
        .unwrap();
    let second = gateway
        .call(
            tenant,
            VendorApi::WebSearch,
            "search",
            payload,
            CallOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(first, second);
    // expect(1) verified on drop
}

#[tokio::test]
async fn no_cache_flag_always_reaches_the_vendor() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"organic": []})))
        .expect(2)
        .mount(&mock_server)
        .await;

    let tenant = Uuid::new_v4();
    let gateway = test_gateway(&mock_server.uri(), tenant);
    let opts = CallOptions {
        use_cache: false,
        retries: 0,
    };

    for _ in 0..2 {
        gateway
            .call(
                tenant,
                VendorApi::WebSearch,
                "search",
                json!({"q": "padarias"}),
                opts,
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn attempts_are_bounded_by_retries_plus_one() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&mock_server)
        .await;

    let tenant = Uuid::new_v4();
    let gateway = test_gateway(&mock_server.uri(), tenant);

    let result = gateway
        .call(
            tenant,
            VendorApi::WebSearch,
            "search",
            json!({"q": "x"}),
            CallOptions {
                use_cache: false,
                retries: 2,
            },
        )
        .await;

    assert!(matches!(result, Err(AppError::ExternalApiError(_))));
}

#[tokio::test]
async fn retry_recovers_from_transient_failures() {
    let mock_server = MockServer::start().await;

    // Two failures, then success
    Mock::given(method("POST"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"organic": [{"title": "ok"}]})))
        .mount(&mock_server)
        .await;

    let tenant = Uuid::new_v4();
    let gateway = test_gateway(&mock_server.uri(), tenant);

    let result = gateway
        .call(
            tenant,
            VendorApi::WebSearch,
            "search",
            json!({"q": "x"}),
            CallOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result["organic"][0]["title"], "ok");
}

#[tokio::test]
async fn missing_key_fails_fast_without_network() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&mock_server)
        .await;

    let tenant = Uuid::new_v4();
    // No keys configured at all
    let gateway = ApiGateway::new(
        &test_config(&mock_server.uri()),
        Arc::new(StaticKeySource::new()),
        Arc::new(NoopUsageSink),
    )
    .unwrap();

    let result = gateway
        .call(
            tenant,
            VendorApi::MapsSearch,
            "places",
            json!({"q": "x"}),
            CallOptions::default(),
        )
        .await;

    match result {
        Err(AppError::MissingApiKey(api)) => assert_eq!(api, "maps_search"),
        other => panic!("expected MissingApiKey, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn vendor_key_travels_in_the_expected_header() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/places"))
        .and(header("X-API-KEY", "maps-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"places": []})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let tenant = Uuid::new_v4();
    let gateway = test_gateway(&mock_server.uri(), tenant);

    gateway
        .call(
            tenant,
            VendorApi::MapsSearch,
            "places",
            json!({"q": "academias"}),
            CallOptions::default(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn tenants_with_different_payloads_do_not_share_cache_entries() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"organic": []})))
        .expect(2)
        .mount(&mock_server)
        .await;

    let tenant = Uuid::new_v4();
    let gateway = test_gateway(&mock_server.uri(), tenant);

    gateway
        .call(
            tenant,
            VendorApi::WebSearch,
            "search",
            json!({"q": "academias"}),
            CallOptions::default(),
        )
        .await
        .unwrap();
    gateway
        .call(
            tenant,
            VendorApi::WebSearch,
            "search",
            json!({"q": "padarias"}),
            CallOptions::default(),
        )
        .await
        .unwrap();
}
