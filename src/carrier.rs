use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::types::{CarrierId, TrackInfo};

/// Handle to one carrier's tracking API.
///
/// The only capability this subsystem needs from a carrier is
/// resolving a tracking number to its current timeline. Timeouts are
/// the implementation's responsibility.
#[async_trait]
pub trait Carrier: Send + Sync {
    async fn track(&self, tracking_number: &str) -> Result<TrackInfo>;
}

/// Registry of carrier handles keyed by carrier id.
///
/// Carriers must be registered before any webhook referencing them is
/// accepted.
#[derive(Default)]
pub struct CarrierRegistry {
    carriers: RwLock<HashMap<CarrierId, Arc<dyn Carrier>>>,
}

impl CarrierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: impl Into<String>, carrier: Arc<dyn Carrier>) {
        let mut guard = self.carriers.write().await;
        guard.insert(CarrierId(id.into()), carrier);
    }

    pub async fn get(&self, id: &CarrierId) -> Option<Arc<dyn Carrier>> {
        let guard = self.carriers.read().await;
        guard.get(id).cloned()
    }

    pub async fn contains(&self, id: &CarrierId) -> bool {
        let guard = self.carriers.read().await;
        guard.contains_key(id)
    }
}
