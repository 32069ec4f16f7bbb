use axum::{
    routing::{get, patch, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use prospecta_api::branding::BrandingResolver;
use prospecta_api::config::Config;
use prospecta_api::credits::CreditLedger;
use prospecta_api::db::Database;
use prospecta_api::db_storage::{DbApiKeySource, DbUsageSink, Storage};
use prospecta_api::discovery::{DiscoveryService, ScanSupervisor};
use prospecta_api::enrichment::EnrichmentService;
use prospecta_api::gateway::ApiGateway;
use prospecta_api::handlers::{self, AppState};
use prospecta_api::payments::CheckoutService;
use prospecta_api::registry::{MunicipalityDirectory, RegistryResolver};
use prospecta_api::webhooks::WebhookDispatcher;

/// Main entry point for the application.
///
/// This function initializes the application, including:
/// - Logging and tracing.
/// - Configuration loading.
/// - Database connection.
/// - The vendor gateway and its collaborators.
/// - HTTP routes and middleware (CORS, Rate Limiting).
///
/// It then starts the Axum server.
///
/// # Returns
///
/// * `anyhow::Result<()>` - Ok if the server runs successfully, or an error if initialization fails.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prospecta_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize database connection pool
    let db = Database::new(&config.database_url).await?;
    tracing::info!("Database connection pool established");

    let storage = Arc::new(Storage::new(db.pool.clone()));

    // Gateway: per-tenant keys and usage metering come from the store
    let gateway = Arc::new(
        ApiGateway::new(
            &config,
            Arc::new(DbApiKeySource::new(db.pool.clone())),
            Arc::new(DbUsageSink::new(db.pool.clone())),
        )
        .map_err(|e| anyhow::anyhow!("Failed to initialize gateway: {}", e))?,
    );
    tracing::info!("Vendor gateway initialized");

    let resolver = Arc::new(
        RegistryResolver::new()
            .map_err(|e| anyhow::anyhow!("Failed to initialize registry resolver: {}", e))?,
    );
    let credits: Arc<dyn prospecta_api::credits::CreditGate> =
        Arc::new(CreditLedger::new(db.pool.clone()));
    let discovery = Arc::new(DiscoveryService::new(
        gateway.clone(),
        resolver.clone(),
        credits,
    ));
    let enrichment = Arc::new(EnrichmentService::new(gateway.clone(), resolver.clone()));
    let branding = Arc::new(BrandingResolver::new(storage.clone()));
    let webhooks = Arc::new(WebhookDispatcher::new());
    let checkout = Arc::new(
        CheckoutService::new(&config, storage.clone())
            .map_err(|e| anyhow::anyhow!("Failed to initialize checkout service: {}", e))?,
    );
    let scans = Arc::new(ScanSupervisor::new());
    let municipalities = Arc::new(
        MunicipalityDirectory::new()
            .map_err(|e| anyhow::anyhow!("Failed to initialize municipality directory: {}", e))?,
    );

    // Build application state
    let app_state = Arc::new(AppState {
        db: db.pool.clone(),
        config: config.clone(),
        storage,
        discovery,
        enrichment,
        branding,
        webhooks,
        checkout,
        scans,
        municipalities,
    });

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .unwrap(),
    );

    // Build protected routes with security layers
    let protected_routes = Router::new()
        // Discovery
        .route("/api/v1/scans/geo", post(handlers::scan_geo))
        .route("/api/v1/scans/registry", post(handlers::scan_registry))
        .route("/api/v1/scans/competitor", post(handlers::scan_competitor))
        .route("/api/v1/scans/intent", post(handlers::scan_intent))
        .route(
            "/api/v1/scans/continuous/start",
            post(handlers::start_continuous_scan),
        )
        .route(
            "/api/v1/scans/continuous/stop",
            post(handlers::stop_continuous_scan),
        )
        // Lead lifecycle
        .route("/api/v1/leads/:id/enrich", post(handlers::enrich_lead))
        .route(
            "/api/v1/leads/:id/status",
            patch(handlers::update_lead_status),
        )
        // Location picker data
        .route(
            "/api/v1/locations/:uf",
            get(handlers::list_municipalities),
        )
        // White-label branding
        .route("/api/v1/branding", get(handlers::get_branding))
        .route("/api/v1/branding/refresh", post(handlers::refresh_branding))
        // Billing
        .route("/api/v1/checkout", post(handlers::create_checkout))
        .layer(
            ServiceBuilder::new()
                // Request size limit: 5MB max payload (prevents memory exhaustion)
                .layer(RequestBodyLimitLayer::new(5 * 1024 * 1024))
                // Rate limiting: 10 req/sec per IP, burst of 20
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Build final app with health check (bypasses rate limiting)
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
