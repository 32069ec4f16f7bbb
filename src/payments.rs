use crate::config::Config;
use crate::db_storage::Storage;
use crate::errors::AppError;
use crate::models::CheckoutSession;
use bigdecimal::{BigDecimal, ToPrimitive};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Opens hosted checkout sessions against the payment provider.
///
/// The product id is resolved to its current server-side price first; the
/// client never supplies an amount.
pub struct CheckoutService {
    client: reqwest::Client,
    base_url: String,
    secret_key: Option<String>,
    storage: Arc<Storage>,
}

impl CheckoutService {
    pub fn new(config: &Config, storage: Arc<Storage>) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create checkout client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: config.checkout_base_url.clone(),
            secret_key: config.checkout_secret_key.clone(),
            storage,
        })
    }

    /// Creates a hosted checkout session for one product.
    pub async fn create_session(
        &self,
        tenant_id: Uuid,
        product_id: &str,
    ) -> Result<CheckoutSession, AppError> {
        let secret = self.secret_key.as_ref().ok_or_else(|| {
            AppError::InternalError("Checkout provider is not configured".to_string())
        })?;

        let (name, price) = self
            .storage
            .product_price(product_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Product {} not found", product_id)))?;

        let cents = to_cents(&price).ok_or_else(|| {
            AppError::InternalError(format!("Product {} has an unusable price", product_id))
        })?;

        tracing::info!(
            "Opening checkout session for tenant {}: {} ({} cents)",
            tenant_id,
            name,
            cents
        );

        let params = [
            ("mode", "payment".to_string()),
            ("client_reference_id", tenant_id.to_string()),
            ("line_items[0][quantity]", "1".to_string()),
            ("line_items[0][price_data][currency]", "brl".to_string()),
            ("line_items[0][price_data][product_data][name]", name),
            (
                "line_items[0][price_data][unit_amount]",
                cents.to_string(),
            ),
        ];

        let response = self
            .client
            .post(format!("{}/checkout/sessions", self.base_url))
            .bearer_auth(secret)
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                AppError::ExternalApiError(format!("Checkout session request failed: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::ExternalApiError(format!(
                "Checkout provider returned {}: {}",
                status, error_text
            )));
        }

        let data: Value = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse checkout response: {}", e))
        })?;

        let session_id = data
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AppError::ExternalApiError("Checkout response missing 'id' field".to_string())
            })?
            .to_string();
        let url = data
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AppError::ExternalApiError("Checkout response missing 'url' field".to_string())
            })?
            .to_string();

        Ok(CheckoutSession { session_id, url })
    }
}

/// Converts a decimal price in BRL to integer cents.
fn to_cents(price: &BigDecimal) -> Option<i64> {
    (price * BigDecimal::from(100)).to_i64().filter(|c| *c > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn price_converts_to_cents() {
        assert_eq!(to_cents(&BigDecimal::from_str("199.90").unwrap()), Some(19990));
        assert_eq!(to_cents(&BigDecimal::from_str("0").unwrap()), None);
        assert_eq!(to_cents(&BigDecimal::from_str("-5").unwrap()), None);
    }
}
