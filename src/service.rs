use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::info;
use url::Url;

use crate::cache::{CacheStats, TrackingCache};
use crate::carrier::CarrierRegistry;
use crate::cleanup::CleanupWorker;
use crate::config::WebhookConfig;
use crate::delivery::DeliveryWorker;
use crate::error::{Result, WebhookError};
use crate::metric_inc;
use crate::monitor::{MonitorJobData, MonitorWorker};
use crate::queue::{InMemoryQueue, JobQueue, QueueCounts, QueueName, RepeatSchedule};
use crate::store::{InMemoryStore, RegistrationStore};
use crate::types::{
    CarrierId, DeliveryLog, NewRegistration, RegistrationInput, WebhookId, WebhookRegistration,
};

/// Registrations may not live longer than this.
const MAX_LIFETIME_DAYS: i64 = 30;

/// Fixed job id for the hourly sweep; coalesces to one scheduled run.
const CLEANUP_JOB_ID: &str = "expiration-cleanup";

/// Occupancy of all three queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub monitor: QueueCounts,
    pub delivery: QueueCounts,
    pub cleanup: QueueCounts,
}

/// Public entry point: wires the store, cache, carrier registry, and
/// queues together and exposes the registration operations.
pub struct WebhookService {
    store: Arc<dyn RegistrationStore>,
    queue: Arc<dyn JobQueue>,
    cache: Arc<TrackingCache>,
    carriers: Arc<CarrierRegistry>,
    config: WebhookConfig,
}

impl WebhookService {
    /// In-memory store and queue; suitable for tests and single-process
    /// embedding.
    pub fn new(config: WebhookConfig, carriers: Arc<CarrierRegistry>) -> Self {
        let store: Arc<dyn RegistrationStore> = Arc::new(InMemoryStore::new());
        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryQueue::new());
        Self::with_backends(config, carriers, store, queue)
    }

    /// Wire explicit store and queue backends.
    pub fn with_backends(
        config: WebhookConfig,
        carriers: Arc<CarrierRegistry>,
        store: Arc<dyn RegistrationStore>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        let cache = Arc::new(TrackingCache::new(config.cache_ttl, config.cache_max_size));
        Self {
            store,
            queue,
            cache,
            carriers,
            config,
        }
    }

    /// Attach the three workers to their queues and schedule the
    /// cleanup cron. Call once at startup.
    pub async fn init(&self) -> Result<()> {
        let monitor = Arc::new(MonitorWorker::new(
            self.store.clone(),
            self.cache.clone(),
            self.carriers.clone(),
            self.queue.clone(),
        ));
        self.queue
            .process(QueueName::TrackingMonitor, monitor)
            .await?;

        let delivery = Arc::new(DeliveryWorker::new(self.store.clone()));
        self.queue
            .process(QueueName::WebhookDelivery, delivery)
            .await?;

        let cleanup = Arc::new(CleanupWorker::new(self.store.clone(), self.cache.clone()));
        self.queue
            .process(QueueName::ExpirationCleanup, cleanup)
            .await?;

        self.queue
            .add_repeating(
                QueueName::ExpirationCleanup,
                CLEANUP_JOB_ID,
                serde_json::json!({}),
                RepeatSchedule::Hourly,
            )
            .await?;

        info!(component = "service", "webhook service started");
        Ok(())
    }

    /// Validate and persist a registration, then schedule its
    /// repeating monitor job. Returns the new id.
    pub async fn register(&self, input: RegistrationInput) -> Result<WebhookId> {
        self.validate(&input).await?;

        let record = self
            .store
            .create(NewRegistration {
                carrier_id: CarrierId(input.carrier_id.clone()),
                tracking_number: input.tracking_number.clone(),
                callback_url: input.callback_url.clone(),
                expiration_time: input.expiration_time,
            })
            .await?;

        let data = MonitorJobData {
            webhook_registration_id: record.id.0.clone(),
            carrier_id: input.carrier_id,
            tracking_number: input.tracking_number,
        };
        self.queue
            .add_repeating(
                QueueName::TrackingMonitor,
                &record.id.0,
                serde_json::to_value(&data).map_err(WebhookError::internal)?,
                RepeatSchedule::Every(self.config.monitor_interval),
            )
            .await?;

        info!(component = "service", webhook_id = %record.id,
              carrier = %record.carrier_id, "webhook registered");
        metric_inc("webhook.registered");
        Ok(record.id)
    }

    async fn validate(&self, input: &RegistrationInput) -> Result<()> {
        if input.carrier_id.is_empty() {
            return Err(WebhookError::BadRequest(
                "carrierId must not be empty".to_string(),
            ));
        }
        if input.tracking_number.is_empty() {
            return Err(WebhookError::BadRequest(
                "trackingNumber must not be empty".to_string(),
            ));
        }

        let url = Url::parse(&input.callback_url).map_err(|_| {
            WebhookError::BadRequest("callbackUrl must be an absolute URL".to_string())
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(WebhookError::BadRequest(
                "callbackUrl scheme must be http or https".to_string(),
            ));
        }
        let Some(host) = url.host_str() else {
            return Err(WebhookError::BadRequest(
                "callbackUrl must have a host".to_string(),
            ));
        };
        if self.config.production && is_private_host(host) {
            return Err(WebhookError::BadRequest(format!(
                "callbackUrl host is not allowed: {host}"
            )));
        }

        let now = Utc::now();
        if input.expiration_time <= now {
            return Err(WebhookError::BadRequest(
                "expirationTime must be in the future".to_string(),
            ));
        }
        if input.expiration_time > now + ChronoDuration::days(MAX_LIFETIME_DAYS) {
            return Err(WebhookError::BadRequest(format!(
                "expirationTime must be within {MAX_LIFETIME_DAYS} days"
            )));
        }

        let carrier_id = CarrierId(input.carrier_id.clone());
        if !self.carriers.contains(&carrier_id).await {
            return Err(WebhookError::BadRequest(format!(
                "Unknown carrier: {carrier_id}"
            )));
        }
        Ok(())
    }

    /// Deactivate a registration and drop its monitor schedule.
    /// Idempotent.
    pub async fn deactivate(&self, id: &WebhookId) -> Result<()> {
        self.store.deactivate(id).await?;
        self.queue
            .remove_scheduled(QueueName::TrackingMonitor, &id.0)
            .await?;
        info!(component = "service", webhook_id = %id, "webhook deactivated");
        metric_inc("webhook.deactivated");
        Ok(())
    }

    pub async fn get_webhook(&self, id: &WebhookId) -> Result<Option<WebhookRegistration>> {
        self.store.find_by_id(id).await
    }

    pub async fn get_delivery_logs(
        &self,
        id: &WebhookId,
        limit: usize,
    ) -> Result<Vec<DeliveryLog>> {
        self.store.get_delivery_logs(id, limit).await
    }

    /// Active registrations overdue for a check. Lets an operator spot
    /// registrations whose repeating job went missing.
    pub async fn find_due(&self, limit: usize) -> Result<Vec<WebhookRegistration>> {
        self.store.find_due_for_check(limit).await
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            monitor: self.queue.counts(QueueName::TrackingMonitor).await?,
            delivery: self.queue.counts(QueueName::WebhookDelivery).await?,
            cleanup: self.queue.counts(QueueName::ExpirationCleanup).await?,
        })
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
    }

    /// Stop the queue consumers. In-flight jobs are surrendered to the
    /// backend for redelivery after restart.
    pub async fn close(&self) -> Result<()> {
        self.queue.close().await?;
        info!(component = "service", "webhook service stopped");
        Ok(())
    }
}

// TODO: tighten to real RFC-1918 matching; the `172.` prefix also
// rejects public 172.x.x.x addresses.
fn is_private_host(host: &str) -> bool {
    host == "localhost"
        || host == "127.0.0.1"
        || host.starts_with("10.")
        || host.starts_with("172.")
        || host.starts_with("192.168.")
}
