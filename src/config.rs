use serde::Deserialize;

/// Default vendor endpoints, overridable per deployment (and pointed at mock
/// servers in tests).
const DEFAULT_PLACES_BASE_URL: &str = "https://google.serper.dev";
const DEFAULT_SEARCH_BASE_URL: &str = "https://google.serper.dev";
const DEFAULT_TEXTGEN_BASE_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-flash:generateContent";
const DEFAULT_CHECKOUT_BASE_URL: &str = "https://api.stripe.com/v1";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Places/maps search vendor base URL.
    pub places_base_url: String,
    /// Organic web search vendor base URL.
    pub search_base_url: String,
    /// Generative text endpoint (key passed as query parameter).
    pub textgen_base_url: String,
    /// Hosted checkout provider base URL.
    pub checkout_base_url: String,
    /// Secret key for the checkout provider.
    pub checkout_secret_key: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DB_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("DB_URL or DATABASE_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DB_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DB_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            places_base_url: url_var("PLACES_BASE_URL", DEFAULT_PLACES_BASE_URL)?,
            search_base_url: url_var("SEARCH_BASE_URL", DEFAULT_SEARCH_BASE_URL)?,
            textgen_base_url: url_var("TEXTGEN_BASE_URL", DEFAULT_TEXTGEN_BASE_URL)?,
            checkout_base_url: url_var("CHECKOUT_BASE_URL", DEFAULT_CHECKOUT_BASE_URL)?,
            checkout_secret_key: std::env::var("CHECKOUT_SECRET_KEY")
                .ok()
                .filter(|s| !s.trim().is_empty()),
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database URL: {}...",
            &config.database_url[..20.min(config.database_url.len())]
        );
        tracing::debug!("Places vendor: {}", config.places_base_url);
        tracing::debug!("Search vendor: {}", config.search_base_url);
        tracing::debug!("Text generation vendor: {}", config.textgen_base_url);
        if config.checkout_secret_key.is_none() {
            tracing::warn!("CHECKOUT_SECRET_KEY not set; checkout sessions will be rejected");
        }
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }
}

/// Reads an optional URL variable, validating the scheme when present.
fn url_var(name: &str, default: &str) -> anyhow::Result<String> {
    match std::env::var(name) {
        Ok(url) => {
            if url.trim().is_empty() {
                anyhow::bail!("{} cannot be empty", name);
            }
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("{} must start with http:// or https://", name);
            }
            Ok(url)
        }
        Err(_) => Ok(default.to_string()),
    }
}
