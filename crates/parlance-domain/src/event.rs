use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Lease, ResourceType};

// ── Events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    ResourceStateChange,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::ResourceStateChange => write!(f, "resource-state-change"),
        }
    }
}

/// The durable, immutable record of one state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub resource_id: String,
    pub resource_type: ResourceType,
    pub old_state: String,
    pub new_state: String,
    pub extra_data: BTreeMap<String, String>,
}

impl StateChangeEvent {
    pub fn new(
        resource_type: ResourceType,
        resource_id: impl Into<String>,
        old_state: impl Into<String>,
        new_state: impl Into<String>,
        extra_data: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        StateChangeEvent {
            id: Uuid::new_v4(),
            event_type: EventType::ResourceStateChange,
            timestamp: now,
            resource_id: resource_id.into(),
            resource_type,
            old_state: old_state.into(),
            new_state: new_state.into(),
            extra_data,
        }
    }
}

// ── Subscriptions ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionDeliveryStatus {
    None,
    Succeeded,
    Failed,
}

/// An external consumer of state-change events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub url: String,
    /// Extra headers sent with every delivery. Unparseable names or values
    /// are skipped at send time, never fatal.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub event_type: EventType,
    pub owner_id: String,
    pub last_delivery_status: SubscriptionDeliveryStatus,
    pub last_delivery_attempt_at: Option<DateTime<Utc>>,
    /// How long past an event's timestamp delivery keeps being retried.
    pub failure_threshold_ms: i64,
    #[serde(default)]
    pub lease: Lease,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(
        url: impl Into<String>,
        event_type: EventType,
        owner_id: impl Into<String>,
        failure_threshold: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Subscription {
            id: Uuid::new_v4(),
            url: url.into(),
            headers: BTreeMap::new(),
            event_type,
            owner_id: owner_id.into(),
            last_delivery_status: SubscriptionDeliveryStatus::None,
            last_delivery_attempt_at: None,
            failure_threshold_ms: failure_threshold.num_milliseconds(),
            lease: Lease::default(),
            created_at: now,
        }
    }

    pub fn failure_threshold(&self) -> Duration {
        Duration::milliseconds(self.failure_threshold_ms)
    }
}

// ── Deliveries ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryStatus {
    NotAttempted,
    Delivered,
    Retrying,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::NotAttempted => "not-attempted",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Retrying => "retrying",
            DeliveryStatus::Failed => "failed",
        }
    }

    /// Whether this delivery still needs an attempt.
    pub fn pending(&self) -> bool {
        matches!(self, DeliveryStatus::NotAttempted | DeliveryStatus::Retrying)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One (event, subscription) delivery attempt record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDelivery {
    pub id: Uuid,
    pub event_id: Uuid,
    pub subscription_id: Uuid,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
}

impl EventDelivery {
    pub fn new(event_id: Uuid, subscription_id: Uuid) -> Self {
        EventDelivery {
            id: Uuid::new_v4(),
            event_id,
            subscription_id,
            status: DeliveryStatus::NotAttempted,
            attempts: 0,
            last_attempt: None,
        }
    }
}

/// A pending delivery joined with its event, as handed to the deliverer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDeliveryData {
    pub event: StateChangeEvent,
    pub delivery: EventDelivery,
}

// ── Webhooks ──────────────────────────────────────────────────────────────────

/// A legacy webhook receiver. Fired best-effort on every state change,
/// in parallel with (not instead of) the subscription pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: Uuid,
    pub owner_id: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Webhook {
    pub fn new(owner_id: impl Into<String>, url: impl Into<String>, now: DateTime<Utc>) -> Self {
        Webhook {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            url: url.into(),
            headers: BTreeMap::new(),
            created_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

// ── Wire payloads ─────────────────────────────────────────────────────────────

/// Body of an event POST to a subscription. Timestamps are epoch
/// milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(rename = "EventID")]
    pub event_id: Uuid,
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
    #[serde(rename = "ResourceID")]
    pub resource_id: String,
    #[serde(rename = "ResourceType")]
    pub resource_type: ResourceType,
    #[serde(rename = "OldState")]
    pub old_state: String,
    #[serde(rename = "NewState")]
    pub new_state: String,
    #[serde(rename = "ExtraData")]
    pub extra_data: BTreeMap<String, String>,
}

impl From<&StateChangeEvent> for EventPayload {
    fn from(event: &StateChangeEvent) -> Self {
        EventPayload {
            event_id: event.id,
            timestamp: event.timestamp.timestamp_millis(),
            resource_id: event.resource_id.clone(),
            resource_type: event.resource_type,
            old_state: event.old_state.clone(),
            new_state: event.new_state.clone(),
            extra_data: event.extra_data.clone(),
        }
    }
}

/// Body of a legacy webhook POST. The nanosecond timestamp predates the
/// subscription pipeline; existing consumers parse it, so it stays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(rename = "Type")]
    pub resource_type: ResourceType,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "NewState")]
    pub new_state: String,
    #[serde(rename = "OldState")]
    pub old_state: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
    #[serde(rename = "ExtraData")]
    pub extra_data: BTreeMap<String, String>,
}

impl From<&StateChangeEvent> for WebhookPayload {
    fn from(event: &StateChangeEvent) -> Self {
        WebhookPayload {
            resource_type: event.resource_type,
            id: event.resource_id.clone(),
            new_state: event.new_state.clone(),
            old_state: event.old_state.clone(),
            timestamp: event.timestamp.timestamp_nanos_opt().unwrap_or_default(),
            extra_data: event.extra_data.clone(),
        }
    }
}
