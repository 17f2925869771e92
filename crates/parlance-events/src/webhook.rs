use std::sync::Arc;
use std::time::Duration;

use parlance_domain::WebhookPayload;
use parlance_store::Store;
use tracing::warn;

use crate::deliverer::parse_headers;
use crate::error::EventsError;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Best-effort parallel POST of a payload to every registered webhook.
///
/// Predates the subscription pipeline and stays for its consumers; new
/// integrations should subscribe instead. Send failures are logged, never
/// propagated.
pub struct WebhookFanout {
    store: Arc<dyn Store>,
    client: reqwest::Client,
}

impl WebhookFanout {
    pub fn new(store: Arc<dyn Store>) -> Result<Self, EventsError> {
        let client = reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        Ok(WebhookFanout { store, client })
    }

    /// POST `payload` to all non-deleted webhooks, each on a detached task.
    /// Only the webhook fetch itself can fail the call.
    pub async fn send_to_all(&self, payload: &WebhookPayload) -> Result<(), EventsError> {
        let webhooks = self.store.webhooks().await?;
        for webhook in webhooks {
            let client = self.client.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                let headers = parse_headers(&webhook.headers, webhook.id);
                let result = client
                    .post(&webhook.url)
                    .headers(headers)
                    .json(&payload)
                    .send()
                    .await;
                match result {
                    Ok(response) if response.status().is_success() => {}
                    Ok(response) => warn!(
                        webhook_id = %webhook.id,
                        status = %response.status(),
                        "webhook delivery rejected"
                    ),
                    Err(err) => warn!(
                        webhook_id = %webhook.id,
                        error = %err,
                        "webhook delivery failed"
                    ),
                }
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parlance_domain::{ResourceType, StateChangeEvent, Webhook};
    use parlance_store::InMemoryStore;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fans_out_to_all_live_webhooks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "Type": "cluster",
                "ID": "cluster-1",
                "NewState": "created",
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        store
            .create_webhook(&Webhook::new("owner-a", server.uri(), now))
            .await
            .unwrap();
        store
            .create_webhook(&Webhook::new("owner-b", server.uri(), now))
            .await
            .unwrap();
        let mut dead = Webhook::new("owner-c", server.uri(), now);
        dead.deleted_at = Some(now);
        store.create_webhook(&dead).await.unwrap();

        let event = StateChangeEvent::new(
            ResourceType::Cluster,
            "cluster-1",
            "creating",
            "created",
            BTreeMap::new(),
            now,
        );
        let fanout = WebhookFanout::new(store).expect("client");
        fanout.send_to_all(&WebhookPayload::from(&event)).await.unwrap();

        // Detached sends; give them a beat to land before the mock verifies.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
