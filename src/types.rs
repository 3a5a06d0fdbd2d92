use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a webhook registration.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of registration ids with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WebhookId(pub String);

impl WebhookId {
    /// Generate a fresh id. Ids are never reused.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for WebhookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a carrier known to the [`CarrierRegistry`](crate::CarrierRegistry).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CarrierId(pub String);

impl fmt::Display for CarrierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A persistent subscription: who to notify (callback URL), about what
/// (carrier + tracking number), until when (expiration).
///
/// Registrations are owned by the registration store; workers hold
/// transient copies only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRegistration {
    pub id: WebhookId,

    pub carrier_id: CarrierId,

    /// Opaque to this subsystem; interpreted only by the carrier.
    pub tracking_number: String,

    /// Absolute http(s) URL the timeline is POSTed to.
    pub callback_url: String,

    /// Monitoring stops no later than one cleanup period after this.
    pub expiration_time: DateTime<Utc>,

    pub created_at: DateTime<Utc>,

    /// `false` is terminal: no further monitoring or delivery runs.
    pub active: bool,

    /// Checksum of the event timeline at the last delivery trigger.
    /// Written only after the delivery job is enqueued.
    pub last_checksum: Option<String>,

    pub last_checked_at: Option<DateTime<Utc>>,

    /// Monotonically non-decreasing while the registration is active.
    pub delivery_attempts: u32,

    pub last_delivery_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,
}

/// Raw registration request, as received from the API layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationInput {
    pub carrier_id: String,
    pub tracking_number: String,
    pub callback_url: String,
    pub expiration_time: DateTime<Utc>,
}

/// Validated registration data handed to the store.
///
/// Produced by the facade after input validation; the store fills in
/// the id, timestamps, and lifecycle fields.
#[derive(Debug, Clone)]
pub struct NewRegistration {
    pub carrier_id: CarrierId,
    pub tracking_number: String,
    pub callback_url: String,
    pub expiration_time: DateTime<Utc>,
}

/// Partial update applied to a registration.
///
/// `None` leaves a field untouched; the double-`Option` fields use
/// `Some(None)` to clear the stored value.
#[derive(Debug, Clone, Default)]
pub struct RegistrationPatch {
    pub active: Option<bool>,
    pub last_checksum: Option<Option<String>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<Option<String>>,
}

/// One HTTP POST of one timeline transition to one callback URL.
///
/// Append-only; never mutated after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryLog {
    pub id: i64,
    pub webhook_registration_id: WebhookId,
    /// 1-based within the delivery job's attempt sequence.
    pub attempt_number: u32,
    pub status_code: Option<u16>,
    pub success: bool,
    pub error_message: Option<String>,
    /// Verbatim JSON sent to the callback.
    pub request_body: String,
    /// Truncated to 1000 bytes before persisting.
    pub response_body: Option<String>,
    pub delivered_at: DateTime<Utc>,
}

/// Input for appending a delivery log entry.
#[derive(Debug, Clone)]
pub struct DeliveryLogInput {
    pub webhook_registration_id: WebhookId,
    pub attempt_number: u32,
    pub status_code: Option<u16>,
    pub success: bool,
    pub error_message: Option<String>,
    pub request_body: String,
    pub response_body: Option<String>,
}

/// Tracking timeline returned by a carrier.
///
/// Only `events` participates in change detection; sender/recipient
/// data rarely changes and would produce spurious deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub events: Vec<TrackEvent>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<TrackContact>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<TrackContact>,

    /// Carrier-proprietary key/value pairs, passed through untouched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub carrier_specific_data: BTreeMap<String, String>,
}

impl TrackInfo {
    pub fn new(events: Vec<TrackEvent>) -> Self {
        Self {
            events,
            sender: None,
            recipient: None,
            carrier_specific_data: BTreeMap::new(),
        }
    }
}

/// A single entry in the tracking timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackEvent {
    pub status: TrackEventStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TrackEvent {
    pub fn new(code: TrackEventStatusCode) -> Self {
        Self {
            status: TrackEventStatus { code, name: None },
            time: None,
            location: None,
            description: None,
        }
    }
}

/// Status of a tracking event: a normalized code plus the carrier's
/// own wording when available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackEventStatus {
    pub code: TrackEventStatusCode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Normalized tracking event status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackEventStatusCode {
    InformationReceived,
    AtPickup,
    InTransit,
    OutForDelivery,
    AttemptFail,
    Delivered,
    AvailableForPickup,
    Exception,
    Unknown,
}

/// Sender or recipient details attached to a timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackContact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

/// Body POSTed to the callback URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub webhook_id: String,
    pub tracking_data: TrackInfo,
    pub metadata: PayloadMetadata,
}

/// Delivery metadata included in every callback body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_checksum: Option<String>,
    pub current_checksum: String,
    pub delivered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_use_screaming_snake_case() {
        let json = serde_json::to_string(&TrackEventStatusCode::OutForDelivery).unwrap();
        assert_eq!(json, "\"OUT_FOR_DELIVERY\"");
    }

    #[test]
    fn payload_omits_absent_previous_checksum() {
        let payload = WebhookPayload {
            webhook_id: "w1".to_string(),
            tracking_data: TrackInfo::new(vec![]),
            metadata: PayloadMetadata {
                previous_checksum: None,
                current_checksum: "abc".to_string(),
                delivered_at: Utc::now(),
            },
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json["metadata"].get("previousChecksum").is_none());
        assert_eq!(json["metadata"]["currentChecksum"], "abc");
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(WebhookId::generate(), WebhookId::generate());
    }
}
