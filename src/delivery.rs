use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, WebhookError};
use crate::metric_inc;
use crate::queue::{Job, JobHandler};
use crate::store::RegistrationStore;
use crate::types::{
    DeliveryLogInput, PayloadMetadata, RegistrationPatch, TrackInfo, WebhookId, WebhookPayload,
};

/// Deadline for one callback POST, including connect and body read.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Attempts per delivery job, matching the delivery queue policy.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 4;

const USER_AGENT: &str = "delivery-tracker-webhook/1.0";
const RESPONSE_BODY_LIMIT: usize = 1000;
const ERROR_MESSAGE_LIMIT: usize = 200;
const LAST_ERROR_LIMIT: usize = 2048;

/// Job payload for the `webhook-delivery` queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryJobData {
    pub webhook_registration_id: String,
    pub callback_url: String,
    /// `TrackInfo` as JSON text, captured at enqueue time.
    pub track_info: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_checksum: Option<String>,
    pub current_checksum: String,
}

/// What one POST attempt produced.
struct AttemptResult {
    status: Option<u16>,
    response_body: Option<String>,
    error: Option<String>,
}

/// Decision derived from one attempt.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Success,
    /// Raise so the queue schedules the next attempt with back-off.
    Retry(String),
    /// Deactivate the registration; do not raise.
    Terminal(String),
}

/// Classify an attempt.
///
/// 2xx succeeds. 5xx, network errors, timeouts, and anything above 599
/// retry until the attempt budget runs out. 400/401/403/404 never
/// retry; the remaining 4xx codes retry exactly once.
fn classify(
    status: Option<u16>,
    error: Option<&str>,
    attempt_number: u32,
    max_attempts: u32,
) -> Outcome {
    let (message, retryable) = match status {
        Some(code) if (200..300).contains(&code) => return Outcome::Success,
        Some(code) => {
            let retryable = match code {
                500..=599 => true,
                400 | 401 | 403 | 404 => false,
                401..=499 => attempt_number < 2,
                _ => true,
            };
            (format!("HTTP {code}"), retryable)
        }
        None => (
            error.unwrap_or("request failed").to_string(),
            true,
        ),
    };

    if retryable && attempt_number < max_attempts {
        Outcome::Retry(message)
    } else {
        Outcome::Terminal(message)
    }
}

/// Posts callback notifications and applies the retry/deactivation
/// state machine.
pub struct DeliveryWorker {
    store: Arc<dyn RegistrationStore>,
    client: reqwest::Client,
    max_attempts: u32,
}

impl DeliveryWorker {
    pub fn new(store: Arc<dyn RegistrationStore>) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
            max_attempts: MAX_DELIVERY_ATTEMPTS,
        }
    }

    async fn post_callback(
        &self,
        url: &str,
        webhook_id: &WebhookId,
        attempt_number: u32,
        body: &str,
    ) -> AttemptResult {
        let request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("User-Agent", USER_AGENT)
            .header("X-Webhook-Id", webhook_id.0.as_str())
            .header("X-Webhook-Attempt", attempt_number.to_string())
            .timeout(DELIVERY_TIMEOUT)
            .body(body.to_string());

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                // Best-effort read; a failure here never reclassifies
                // the outcome.
                let response_body = response.text().await.ok();
                AttemptResult {
                    status: Some(status),
                    response_body,
                    error: None,
                }
            }
            Err(err) => {
                let message = if err.is_timeout() {
                    "request timed out".to_string()
                } else {
                    format!("network error: {err}")
                };
                AttemptResult {
                    status: None,
                    response_body: None,
                    error: Some(message),
                }
            }
        }
    }
}

#[async_trait]
impl JobHandler for DeliveryWorker {
    async fn handle(&self, job: &Job) -> Result<()> {
        let data: DeliveryJobData =
            serde_json::from_value(job.payload.clone()).map_err(WebhookError::internal)?;
        let id = WebhookId(data.webhook_registration_id.clone());
        let attempt_number = job.attempts_made + 1;

        match self.store.increment_delivery_attempts(&id).await {
            Ok(_) => {}
            Err(WebhookError::NotFound(_)) => {
                warn!(component = "delivery", webhook_id = %id, "registration gone, dropping job");
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        let tracking_data: TrackInfo =
            serde_json::from_str(&data.track_info).map_err(WebhookError::internal)?;
        let payload = WebhookPayload {
            webhook_id: id.0.clone(),
            tracking_data,
            metadata: PayloadMetadata {
                previous_checksum: data.previous_checksum.clone(),
                current_checksum: data.current_checksum.clone(),
                delivered_at: Utc::now(),
            },
        };
        let request_body = serde_json::to_string(&payload).map_err(WebhookError::internal)?;

        let attempt = self
            .post_callback(&data.callback_url, &id, attempt_number, &request_body)
            .await;
        let outcome = classify(
            attempt.status,
            attempt.error.as_deref(),
            attempt_number,
            self.max_attempts,
        );

        // Log and registration bookkeeping run on every path, success
        // and terminal failure alike.
        let error_message = match &outcome {
            Outcome::Success => None,
            Outcome::Retry(message) | Outcome::Terminal(message) => Some(message.clone()),
        };
        self.store
            .log_delivery(DeliveryLogInput {
                webhook_registration_id: id.clone(),
                attempt_number,
                status_code: attempt.status,
                success: matches!(outcome, Outcome::Success),
                error_message: error_message
                    .as_deref()
                    .map(|m| truncate_bytes(m, ERROR_MESSAGE_LIMIT)),
                request_body,
                response_body: attempt
                    .response_body
                    .as_deref()
                    .map(|b| truncate_bytes(b, RESPONSE_BODY_LIMIT)),
            })
            .await?;

        match outcome {
            Outcome::Success => {
                info!(component = "delivery", webhook_id = %id, attempt = attempt_number,
                      status = attempt.status, "callback delivered");
                metric_inc("webhook.delivery.success");
                self.store
                    .update(
                        &id,
                        RegistrationPatch {
                            last_error: Some(None),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(())
            }
            Outcome::Retry(message) => {
                warn!(component = "delivery", webhook_id = %id, attempt = attempt_number,
                      status = attempt.status, error = %message, "callback failed, will retry");
                metric_inc("webhook.delivery.retry");
                let last_error =
                    format!("Delivery attempt {attempt_number} failed: {message}");
                self.store
                    .update(
                        &id,
                        RegistrationPatch {
                            last_error: Some(Some(truncate_bytes(&last_error, LAST_ERROR_LIMIT))),
                            ..Default::default()
                        },
                    )
                    .await?;
                Err(WebhookError::DeliveryTransient {
                    attempt: attempt_number,
                    message,
                })
            }
            Outcome::Terminal(message) => {
                warn!(component = "delivery", webhook_id = %id, attempt = attempt_number,
                      status = attempt.status, error = %message,
                      "callback failed permanently, deactivating");
                metric_inc("webhook.delivery.failed");
                let last_error =
                    format!("Delivery failed after {attempt_number} attempts: {message}");
                self.store
                    .update(
                        &id,
                        RegistrationPatch {
                            active: Some(false),
                            last_error: Some(Some(truncate_bytes(&last_error, LAST_ERROR_LIMIT))),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(())
            }
        }
    }
}

fn truncate_bytes(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
