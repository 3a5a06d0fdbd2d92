use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;

use crate::error::{Result, WebhookError};
use crate::types::{
    DeliveryLog, DeliveryLogInput, NewRegistration, RegistrationPatch, WebhookId,
    WebhookRegistration,
};

/// A registration is due for a fresh check once its last check is at
/// least this old (or it has never been checked).
pub const DUE_CHECK_AGE_MINUTES: i64 = 5;

/// Durable persistence for webhook registrations and delivery logs.
///
/// Every method is atomic with respect to other operations on the same
/// row. Backend failures surface as [`WebhookError::Internal`]; the
/// caller decides whether the driving job retries.
#[async_trait]
pub trait RegistrationStore: Send + Sync {
    /// Insert a new registration with `active = true` and a generated id.
    async fn create(&self, input: NewRegistration) -> Result<WebhookRegistration>;

    async fn find_by_id(&self, id: &WebhookId) -> Result<Option<WebhookRegistration>>;

    /// All active registrations, least-recently-checked first.
    async fn find_active(&self) -> Result<Vec<WebhookRegistration>>;

    /// Active registrations never checked, or not checked within the
    /// due window, least-recently-checked first.
    async fn find_due_for_check(&self, limit: usize) -> Result<Vec<WebhookRegistration>>;

    /// Partial update. Fails with `NotFound` when the id is absent.
    async fn update(
        &self,
        id: &WebhookId,
        patch: RegistrationPatch,
    ) -> Result<WebhookRegistration>;

    /// Set `active = false`. Idempotent; absent ids are a no-op.
    async fn deactivate(&self, id: &WebhookId) -> Result<()>;

    /// Deactivate every active registration past its expiration.
    /// Returns how many rows changed.
    async fn deactivate_expired(&self) -> Result<u64>;

    /// Append a delivery log entry. Entries are never updated.
    async fn log_delivery(&self, input: DeliveryLogInput) -> Result<DeliveryLog>;

    /// Atomically bump `delivery_attempts` and stamp `last_delivery_at`.
    async fn increment_delivery_attempts(&self, id: &WebhookId) -> Result<WebhookRegistration>;

    /// Delivery logs for one registration, most recent first.
    async fn get_delivery_logs(&self, id: &WebhookId, limit: usize) -> Result<Vec<DeliveryLog>>;
}

/// In-memory store for tests and lightweight deployments.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<InMemoryInner>,
}

#[derive(Default)]
struct InMemoryInner {
    registrations: HashMap<WebhookId, WebhookRegistration>,
    logs: Vec<DeliveryLog>,
    next_log_id: i64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_patch(record: &mut WebhookRegistration, patch: RegistrationPatch) {
    if let Some(active) = patch.active {
        record.active = active;
    }
    if let Some(checksum) = patch.last_checksum {
        record.last_checksum = checksum;
    }
    if let Some(checked_at) = patch.last_checked_at {
        record.last_checked_at = Some(checked_at);
    }
    if let Some(error) = patch.last_error {
        record.last_error = error;
    }
}

#[async_trait]
impl RegistrationStore for InMemoryStore {
    async fn create(&self, input: NewRegistration) -> Result<WebhookRegistration> {
        let record = WebhookRegistration {
            id: WebhookId::generate(),
            carrier_id: input.carrier_id,
            tracking_number: input.tracking_number,
            callback_url: input.callback_url,
            expiration_time: input.expiration_time,
            created_at: Utc::now(),
            active: true,
            last_checksum: None,
            last_checked_at: None,
            delivery_attempts: 0,
            last_delivery_at: None,
            last_error: None,
        };

        let mut guard = self.inner.lock().await;
        guard
            .registrations
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn find_by_id(&self, id: &WebhookId) -> Result<Option<WebhookRegistration>> {
        let guard = self.inner.lock().await;
        Ok(guard.registrations.get(id).cloned())
    }

    async fn find_active(&self) -> Result<Vec<WebhookRegistration>> {
        let guard = self.inner.lock().await;
        let mut records: Vec<_> = guard
            .registrations
            .values()
            .filter(|r| r.active)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.last_checked_at);
        Ok(records)
    }

    async fn find_due_for_check(&self, limit: usize) -> Result<Vec<WebhookRegistration>> {
        let cutoff = Utc::now() - ChronoDuration::minutes(DUE_CHECK_AGE_MINUTES);
        let guard = self.inner.lock().await;
        let mut records: Vec<_> = guard
            .registrations
            .values()
            .filter(|r| r.active && r.last_checked_at.map_or(true, |t| t < cutoff))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.last_checked_at);
        records.truncate(limit);
        Ok(records)
    }

    async fn update(
        &self,
        id: &WebhookId,
        patch: RegistrationPatch,
    ) -> Result<WebhookRegistration> {
        let mut guard = self.inner.lock().await;
        let record = guard
            .registrations
            .get_mut(id)
            .ok_or_else(|| WebhookError::NotFound(format!("webhook {id}")))?;
        apply_patch(record, patch);
        Ok(record.clone())
    }

    async fn deactivate(&self, id: &WebhookId) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(record) = guard.registrations.get_mut(id) {
            record.active = false;
        }
        Ok(())
    }

    async fn deactivate_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut guard = self.inner.lock().await;
        let mut count = 0;
        for record in guard.registrations.values_mut() {
            if record.active && record.expiration_time < now {
                record.active = false;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn log_delivery(&self, input: DeliveryLogInput) -> Result<DeliveryLog> {
        let mut guard = self.inner.lock().await;
        guard.next_log_id += 1;
        let log = DeliveryLog {
            id: guard.next_log_id,
            webhook_registration_id: input.webhook_registration_id,
            attempt_number: input.attempt_number,
            status_code: input.status_code,
            success: input.success,
            error_message: input.error_message,
            request_body: input.request_body,
            response_body: input.response_body,
            delivered_at: Utc::now(),
        };
        guard.logs.push(log.clone());
        Ok(log)
    }

    async fn increment_delivery_attempts(&self, id: &WebhookId) -> Result<WebhookRegistration> {
        let mut guard = self.inner.lock().await;
        let record = guard
            .registrations
            .get_mut(id)
            .ok_or_else(|| WebhookError::NotFound(format!("webhook {id}")))?;
        record.delivery_attempts += 1;
        record.last_delivery_at = Some(Utc::now());
        Ok(record.clone())
    }

    async fn get_delivery_logs(&self, id: &WebhookId, limit: usize) -> Result<Vec<DeliveryLog>> {
        let guard = self.inner.lock().await;
        let mut logs: Vec<_> = guard
            .logs
            .iter()
            .filter(|log| &log.webhook_registration_id == id)
            .cloned()
            .collect();
        // Insertion order breaks ties within one timestamp.
        logs.sort_by(|a, b| b.delivered_at.cmp(&a.delivered_at).then(b.id.cmp(&a.id)));
        logs.truncate(limit);
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::types::CarrierId;

    fn new_registration(tracking: &str) -> NewRegistration {
        NewRegistration {
            carrier_id: CarrierId("kr.cjlogistics".to_string()),
            tracking_number: tracking.to_string(),
            callback_url: "https://hook.test/cb".to_string(),
            expiration_time: Utc::now() + ChronoDuration::hours(1),
        }
    }

    #[tokio::test]
    async fn create_then_find() {
        let store = InMemoryStore::new();
        let created = store.create(new_registration("100000001")).await.unwrap();
        assert!(created.active);
        assert_eq!(created.delivery_attempts, 0);

        let found = store.find_by_id(&created.id).await.unwrap().unwrap();
        assert_eq!(found.tracking_number, "100000001");
    }

    #[tokio::test]
    async fn update_patches_and_clears_fields() {
        let store = InMemoryStore::new();
        let created = store.create(new_registration("t")).await.unwrap();

        let updated = store
            .update(
                &created.id,
                RegistrationPatch {
                    last_checksum: Some(Some("abc".to_string())),
                    last_error: Some(Some("boom".to_string())),
                    last_checked_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.last_checksum.as_deref(), Some("abc"));
        assert_eq!(updated.last_error.as_deref(), Some("boom"));

        let cleared = store
            .update(
                &created.id,
                RegistrationPatch {
                    last_error: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(cleared.last_error, None);
        // Untouched fields survive a partial update.
        assert_eq!(cleared.last_checksum.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn update_missing_id_is_not_found() {
        let store = InMemoryStore::new();
        let err = store
            .update(&WebhookId::generate(), RegistrationPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::NotFound(_)));
    }

    #[tokio::test]
    async fn due_for_check_filters_recent() {
        let store = InMemoryStore::new();
        let never = store.create(new_registration("never")).await.unwrap();
        let fresh = store.create(new_registration("fresh")).await.unwrap();
        store
            .update(
                &fresh.id,
                RegistrationPatch {
                    last_checked_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let due = store.find_due_for_check(10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, never.id);
    }

    #[tokio::test]
    async fn deactivate_is_idempotent() {
        let store = InMemoryStore::new();
        let created = store.create(new_registration("t")).await.unwrap();

        store.deactivate(&created.id).await.unwrap();
        store.deactivate(&created.id).await.unwrap();
        store.deactivate(&WebhookId::generate()).await.unwrap();

        let found = store.find_by_id(&created.id).await.unwrap().unwrap();
        assert!(!found.active);
    }

    #[tokio::test]
    async fn deactivate_expired_counts_rows() {
        let store = InMemoryStore::new();
        let mut expired = new_registration("old");
        expired.expiration_time = Utc::now() - ChronoDuration::seconds(1);
        store.create(expired).await.unwrap();
        store.create(new_registration("live")).await.unwrap();

        assert_eq!(store.deactivate_expired().await.unwrap(), 1);
        assert_eq!(store.deactivate_expired().await.unwrap(), 0);
        assert_eq!(store.find_active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn increment_attempts_is_race_free() {
        let store = Arc::new(InMemoryStore::new());
        let created = store.create(new_registration("t")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            let id = created.id.clone();
            handles.push(tokio::spawn(async move {
                store.increment_delivery_attempts(&id).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let found = store.find_by_id(&created.id).await.unwrap().unwrap();
        assert_eq!(found.delivery_attempts, 20);
        assert!(found.last_delivery_at.is_some());
    }

    #[tokio::test]
    async fn delivery_logs_most_recent_first() {
        let store = InMemoryStore::new();
        let created = store.create(new_registration("t")).await.unwrap();

        for attempt in 1..=3 {
            store
                .log_delivery(DeliveryLogInput {
                    webhook_registration_id: created.id.clone(),
                    attempt_number: attempt,
                    status_code: Some(500),
                    success: false,
                    error_message: Some("HTTP 500".to_string()),
                    request_body: "{}".to_string(),
                    response_body: None,
                })
                .await
                .unwrap();
        }

        let logs = store.get_delivery_logs(&created.id, 2).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].attempt_number, 3);
        assert_eq!(logs[1].attempt_number, 2);
    }
}
