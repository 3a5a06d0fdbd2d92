//! Package-tracking webhook subsystem.
//!
//! This crate watches carrier tracking state on behalf of external
//! subscribers and POSTs the new timeline to a callback URL whenever
//! the observed event sequence changes.
//!
//! ## Guarantees
//! - At-least-once delivery per checksum transition
//! - Bounded polling pressure (shared tracking cache per shipment)
//! - Durable registrations and append-only delivery logs
//! - Independent retry budgets for polling and delivery
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Ordering across different registrations
//! - Distributed coordination beyond a shared queue backend
//!
//! A registration names a carrier, a tracking number, a callback URL,
//! and an expiration. From registration until expiration the monitor
//! queue polls the carrier, a SHA-256 over the canonical event timeline
//! detects changes, and the delivery queue posts each transition with
//! exponential back-off. A third queue sweeps expired registrations
//! hourly.

mod cache;
mod carrier;
mod checksum;
mod cleanup;
mod config;
mod delivery;
mod error;
mod monitor;
mod queue;
mod service;
mod store;
mod types;

#[cfg(feature = "redis")]
mod queue_redis;

#[cfg(feature = "sqlite")]
mod store_sqlite;

pub use cache::{CacheStats, TrackingCache};
pub use carrier::{Carrier, CarrierRegistry};
pub use checksum::{canonical_json, events_checksum};
pub use cleanup::CleanupWorker;
pub use config::{RedisConfig, WebhookConfig};
pub use delivery::{DeliveryJobData, DeliveryWorker, DELIVERY_TIMEOUT, MAX_DELIVERY_ATTEMPTS};
pub use error::{Result, WebhookError};
pub use monitor::{MonitorJobData, MonitorWorker};
pub use queue::{
    Backoff, InMemoryQueue, Job, JobHandler, JobQueue, QueueCounts, QueueName, QueuePolicies,
    QueuePolicy, RepeatSchedule, COMPLETED_RETENTION, FAILED_RETENTION,
};
pub use service::{QueueStats, WebhookService};
pub use store::{InMemoryStore, RegistrationStore, DUE_CHECK_AGE_MINUTES};
pub use types::{
    CarrierId, DeliveryLog, DeliveryLogInput, NewRegistration, PayloadMetadata, RegistrationInput,
    RegistrationPatch, TrackContact, TrackEvent, TrackEventStatus, TrackEventStatusCode, TrackInfo,
    WebhookId, WebhookPayload, WebhookRegistration,
};

#[cfg(feature = "redis")]
pub use queue_redis::RedisQueue;

#[cfg(feature = "sqlite")]
pub use store_sqlite::SqliteStore;

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}
