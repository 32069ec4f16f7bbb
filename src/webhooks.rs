use crate::models::{Lead, Tenant};
use serde_json::json;
use std::time::Duration;

/// Fire-and-forget outbound notifications.
///
/// When a lead reaches `Enriched`, tenants with a configured endpoint get a
/// POST with the tenant's shared secret in `X-Webhook-Token` so the
/// receiver can verify origin. No retries, no delivery guarantee; failures
/// are logged and dropped.
pub struct WebhookDispatcher {
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Dispatches the `lead.enriched` event, if the tenant subscribed.
    /// Returns immediately; the POST runs in a spawned task.
    pub fn lead_enriched(&self, tenant: &Tenant, lead: &Lead) {
        let Some(url) = tenant.webhook_url.clone() else {
            return;
        };

        let envelope = json!({
            "event": "lead.enriched",
            "tenant_id": tenant.id,
            "data": {
                "name": lead.name,
                "email": lead.details.get_str("email"),
                "phone": lead.phone,
                "insights": lead.details.get_str("insight"),
            }
        });

        let client = self.client.clone();
        let secret = tenant.webhook_secret.clone();
        let lead_id = lead.id.clone();

        tokio::spawn(async move {
            let mut request = client.post(&url).json(&envelope);
            if let Some(secret) = &secret {
                request = request.header("X-Webhook-Token", secret);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::info!("Webhook delivered for lead {} to {}", lead_id, url);
                }
                Ok(response) => {
                    tracing::warn!(
                        "Webhook for lead {} returned {}",
                        lead_id,
                        response.status()
                    );
                }
                Err(e) => {
                    tracing::warn!("Webhook for lead {} failed: {}", lead_id, e);
                }
            }
        });
    }
}

impl Default for WebhookDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
