use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::cache::TrackingCache;
use crate::error::Result;
use crate::metric_inc;
use crate::queue::{Job, JobHandler};
use crate::store::RegistrationStore;

/// Hourly sweep: deactivates expired registrations and evicts stale
/// cache entries.
///
/// The monitor worker already checks expiration on entry; this bounds
/// the window for registrations whose repeating job was lost.
pub struct CleanupWorker {
    store: Arc<dyn RegistrationStore>,
    cache: Arc<TrackingCache>,
}

impl CleanupWorker {
    pub fn new(store: Arc<dyn RegistrationStore>, cache: Arc<TrackingCache>) -> Self {
        Self { store, cache }
    }
}

#[async_trait]
impl JobHandler for CleanupWorker {
    async fn handle(&self, _job: &Job) -> Result<()> {
        // A store failure propagates so the queue retries the sweep.
        let deactivated = self.store.deactivate_expired().await?;
        let evicted = self.cache.cleanup().await;
        info!(
            component = "cleanup",
            deactivated, evicted, "sweep finished"
        );
        metric_inc("webhook.cleanup.sweep");
        Ok(())
    }
}
