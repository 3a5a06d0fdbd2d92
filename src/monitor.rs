use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::TrackingCache;
use crate::carrier::CarrierRegistry;
use crate::checksum::events_checksum;
use crate::delivery::DeliveryJobData;
use crate::error::{Result, WebhookError};
use crate::metric_inc;
use crate::queue::{Job, JobHandler, JobQueue, QueueName};
use crate::store::RegistrationStore;
use crate::types::{RegistrationPatch, WebhookId};

/// Job payload for the `tracking-monitor` queue.
///
/// The job id equals the registration id, which keeps at most one
/// scheduled instance per registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorJobData {
    pub webhook_registration_id: String,
    pub carrier_id: String,
    pub tracking_number: String,
}

/// Polls a carrier (through the cache) and turns timeline changes into
/// delivery jobs.
///
/// Never performs HTTP delivery inline; enqueueing keeps the delivery
/// retry budget independent of polling.
pub struct MonitorWorker {
    store: Arc<dyn RegistrationStore>,
    cache: Arc<TrackingCache>,
    carriers: Arc<CarrierRegistry>,
    queue: Arc<dyn JobQueue>,
}

impl MonitorWorker {
    pub fn new(
        store: Arc<dyn RegistrationStore>,
        cache: Arc<TrackingCache>,
        carriers: Arc<CarrierRegistry>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            store,
            cache,
            carriers,
            queue,
        }
    }

    async fn drop_schedule(&self, id: &WebhookId) -> Result<()> {
        self.queue
            .remove_scheduled(QueueName::TrackingMonitor, &id.0)
            .await
    }
}

#[async_trait]
impl JobHandler for MonitorWorker {
    async fn handle(&self, job: &Job) -> Result<()> {
        let data: MonitorJobData =
            serde_json::from_value(job.payload.clone()).map_err(WebhookError::internal)?;
        let id = WebhookId(data.webhook_registration_id.clone());
        metric_inc("webhook.monitor.tick");

        let Some(registration) = self.store.find_by_id(&id).await? else {
            debug!(component = "monitor", webhook_id = %id, "registration gone, dropping schedule");
            self.drop_schedule(&id).await?;
            return Ok(());
        };
        if !registration.active {
            debug!(component = "monitor", webhook_id = %id, "registration inactive, dropping schedule");
            self.drop_schedule(&id).await?;
            return Ok(());
        }

        let now = Utc::now();
        if now >= registration.expiration_time {
            info!(component = "monitor", webhook_id = %id, "registration expired, deactivating");
            self.store.deactivate(&id).await?;
            self.drop_schedule(&id).await?;
            return Ok(());
        }

        let carrier_id = registration.carrier_id.clone();
        let Some(carrier) = self.carriers.get(&carrier_id).await else {
            // A job-level retry cannot make an unknown carrier known.
            warn!(component = "monitor", webhook_id = %id, carrier = %carrier_id, "carrier not found");
            self.store
                .update(
                    &id,
                    RegistrationPatch {
                        last_error: Some(Some(format!("Carrier not found: {carrier_id}"))),
                        last_checked_at: Some(now),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        };

        let info = match self
            .cache
            .get(&carrier_id, &registration.tracking_number)
            .await
        {
            Some(info) => {
                metric_inc("webhook.monitor.cache_hit");
                info
            }
            None => {
                metric_inc("webhook.monitor.cache_miss");
                match carrier.track(&registration.tracking_number).await {
                    Ok(info) => {
                        self.cache
                            .set(&carrier_id, &registration.tracking_number, info.clone())
                            .await;
                        info
                    }
                    Err(err) => {
                        // Upstream outage: absorb into last_error; the
                        // next periodic tick is the retry.
                        let message = match err {
                            WebhookError::CarrierFailure(msg) => msg,
                            other => other.to_string(),
                        };
                        warn!(component = "monitor", webhook_id = %id, carrier = %carrier_id,
                              error = %message, "tracking fetch failed");
                        metric_inc("webhook.monitor.carrier_error");
                        self.store
                            .update(
                                &id,
                                RegistrationPatch {
                                    last_error: Some(Some(format!(
                                        "Tracking API error: {message}"
                                    ))),
                                    last_checked_at: Some(now),
                                    ..Default::default()
                                },
                            )
                            .await?;
                        return Ok(());
                    }
                }
            }
        };

        let current_checksum = events_checksum(&info.events)?;

        match registration.last_checksum.as_deref() {
            Some(last) if last == current_checksum => {
                self.store
                    .update(
                        &id,
                        RegistrationPatch {
                            last_checked_at: Some(now),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(())
            }
            None => {
                // First observation establishes the baseline without a
                // delivery; only checksum transitions notify.
                self.store
                    .update(
                        &id,
                        RegistrationPatch {
                            last_checksum: Some(Some(current_checksum)),
                            last_checked_at: Some(now),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(())
            }
            Some(_) => {
                let delivery = DeliveryJobData {
                    webhook_registration_id: id.0.clone(),
                    callback_url: registration.callback_url.clone(),
                    track_info: serde_json::to_string(&info).map_err(WebhookError::internal)?,
                    previous_checksum: registration.last_checksum.clone(),
                    current_checksum: current_checksum.clone(),
                };
                let payload = serde_json::to_value(&delivery).map_err(WebhookError::internal)?;

                // Enqueue before writing the checksum: losing the write
                // only re-sends this transition; losing the enqueue
                // would silently skip it.
                self.queue
                    .enqueue(
                        QueueName::WebhookDelivery,
                        &Uuid::new_v4().to_string(),
                        payload,
                    )
                    .await?;
                info!(component = "monitor", webhook_id = %id, "timeline changed, delivery enqueued");
                metric_inc("webhook.monitor.change_detected");

                self.store
                    .update(
                        &id,
                        RegistrationPatch {
                            last_checksum: Some(Some(current_checksum)),
                            last_checked_at: Some(now),
                            last_error: Some(None),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(())
            }
        }
    }
}
