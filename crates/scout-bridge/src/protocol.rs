//! # Wire Protocol
//!
//! Message types for the pub/sub session and the shadow request/response
//! protocol layered on it.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Session Frames                                   │
//! │                                                                         │
//! │  SESSION SETUP                                                         │
//! │  ─────────────                                                         │
//! │  BROKER ───► ConnAck { session_present }                               │
//! │  AGENT  ───► Subscribe { topic, qos }                                  │
//! │  BROKER ───► SubAck { topic, granted }                                 │
//! │                                                                         │
//! │  STEADY STATE                                                          │
//! │  ────────────                                                          │
//! │  AGENT  ───► Publish { topic, payload, qos }                           │
//! │  BROKER ───► Delivery { topic, payload }                               │
//! │  Both   ◄──► Ping / Pong                                               │
//! │                                                                         │
//! │  SHADOW PROTOCOL (payloads inside Publish/Delivery)                    │
//! │  ──────────────────────────────────────────────────                    │
//! │  <ns>/get                   { clientToken }                            │
//! │  <ns>/get/accepted          { clientToken, state, version }            │
//! │  <ns>/get/rejected          { clientToken, code, message }             │
//! │  <ns>/update                { clientToken, state: {reported,desired} } │
//! │  <ns>/update/accepted       { clientToken, state, version }            │
//! │  <ns>/update/rejected       { clientToken, code, message }             │
//! │  <ns>/update/delta          { clientToken?, state: {prop: v|null} }    │
//! │                                                                         │
//! │  EVENT BATCHES                                                         │
//! │  ─────────────                                                         │
//! │  <event-ns>/<source-id>     one JSON object per observation            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! Frames are serialized as tagged JSON using serde's adjacently tagged enum:
//! ```json
//! { "type": "Publish", "payload": { "topic": "...", ... } }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// =============================================================================
// Delivery Guarantee
// =============================================================================

/// Delivery guarantee requested for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryGuarantee {
    /// Fire and forget; the broker may drop the message.
    AtMostOnce,

    /// The broker may redeliver; consumers must tolerate duplicates.
    #[default]
    AtLeastOnce,
}

// =============================================================================
// Session Frames (Tagged Union)
// =============================================================================

/// All session-level wire frames.
///
/// Uses serde's adjacently tagged enum for clean JSON serialization:
/// `{ "type": "Publish", "payload": { ... } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WireMessage {
    /// Session acknowledgement sent by the broker after connect.
    ConnAck(ConnAck),

    /// Subscription request for a topic.
    Subscribe(Subscribe),

    /// Subscription acknowledgement.
    SubAck(SubAck),

    /// Outbound application message.
    Publish(Publish),

    /// Inbound application message for a subscribed topic.
    Delivery(Delivery),

    /// Keepalive ping.
    Ping { timestamp: String },

    /// Keepalive pong.
    Pong { timestamp: String },

    /// Broker-side error notification.
    Error { code: String, message: String },
}

/// Session acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnAck {
    /// Whether the broker restored the previous session, including its
    /// subscriptions. When false, every subscription must be re-issued.
    pub session_present: bool,
}

/// Subscription request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscribe {
    /// Topic to subscribe to.
    pub topic: String,

    /// Requested delivery guarantee.
    #[serde(default)]
    pub qos: DeliveryGuarantee,
}

/// Subscription acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAck {
    /// Topic the acknowledgement is for.
    pub topic: String,

    /// Whether the broker granted the subscription.
    pub granted: bool,
}

/// Outbound application message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Publish {
    /// Destination topic.
    pub topic: String,

    /// JSON payload.
    pub payload: Value,

    /// Requested delivery guarantee.
    #[serde(default)]
    pub qos: DeliveryGuarantee,
}

/// Inbound application message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    /// Topic the message was published to.
    pub topic: String,

    /// JSON payload.
    pub payload: Value,
}

impl WireMessage {
    /// Returns the frame type name as a string (for logging).
    pub fn type_name(&self) -> &'static str {
        match self {
            WireMessage::ConnAck(_) => "ConnAck",
            WireMessage::Subscribe(_) => "Subscribe",
            WireMessage::SubAck(_) => "SubAck",
            WireMessage::Publish(_) => "Publish",
            WireMessage::Delivery(_) => "Delivery",
            WireMessage::Ping { .. } => "Ping",
            WireMessage::Pong { .. } => "Pong",
            WireMessage::Error { .. } => "Error",
        }
    }

    /// Creates a Subscribe frame.
    pub fn subscribe(topic: &str, qos: DeliveryGuarantee) -> Self {
        WireMessage::Subscribe(Subscribe {
            topic: topic.to_string(),
            qos,
        })
    }

    /// Creates a Publish frame.
    pub fn publish(topic: &str, payload: Value, qos: DeliveryGuarantee) -> Self {
        WireMessage::Publish(Publish {
            topic: topic.to_string(),
            payload,
            qos,
        })
    }

    /// Serializes to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// =============================================================================
// Request Kind
// =============================================================================

/// The kind of an outstanding shadow request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// A shadow Get request.
    Get,

    /// A shadow Update request.
    Update,
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestKind::Get => write!(f, "get"),
            RequestKind::Update => write!(f, "update"),
        }
    }
}

// =============================================================================
// Shadow Payloads
// =============================================================================

/// Shadow Get request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRequest {
    /// Correlation token for matching the accepted/rejected response.
    pub client_token: Uuid,
}

/// The state section of a shadow document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShadowState {
    /// Last state the agent reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported: Option<Value>,

    /// State the remote side wants the agent to be in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<Value>,

    /// Remote-computed difference between desired and reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<Value>,
}

/// Shadow Get accepted response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAccepted {
    /// Correlation token of the originating request.
    pub client_token: Uuid,

    /// Current shadow document state.
    #[serde(default)]
    pub state: ShadowState,

    /// Document version assigned by the remote store.
    #[serde(default)]
    pub version: Option<u64>,
}

/// Shadow Get/Update rejected response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Correlation token of the originating request, if the broker echoes it.
    #[serde(default)]
    pub client_token: Option<Uuid>,

    /// Rejection code. 404 means "no shadow document".
    pub code: u16,

    /// Human-readable rejection reason.
    #[serde(default)]
    pub message: String,
}

/// The state section of an Update request.
///
/// Unlike [`ShadowState`], absent fields serialize as explicit `null` so a
/// clear request can delete `reported` and `desired` on the remote store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateState {
    /// Reported value object, or `null` to delete.
    pub reported: Option<Value>,

    /// Desired value object, or `null` to delete.
    pub desired: Option<Value>,
}

/// Shadow Update request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    /// Correlation token for matching the accepted/rejected response.
    pub client_token: Uuid,

    /// Requested state change.
    pub state: UpdateState,
}

impl UpdateRequest {
    /// Builds an update that sets the tracked property to `value` in both
    /// `reported` and `desired`.
    pub fn set_property(client_token: Uuid, property: &str, value: &Value) -> Self {
        let object = serde_json::json!({ property: value });
        UpdateRequest {
            client_token,
            state: UpdateState {
                reported: Some(object.clone()),
                desired: Some(object),
            },
        }
    }

    /// Builds a clear request: both `reported` and `desired` are sent as
    /// explicit nulls, deleting the shadow document contents.
    pub fn clear(client_token: Uuid) -> Self {
        UpdateRequest {
            client_token,
            state: UpdateState {
                reported: None,
                desired: None,
            },
        }
    }
}

/// Shadow Update accepted response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAccepted {
    /// Correlation token of the originating request.
    pub client_token: Uuid,

    /// State the remote store recorded.
    #[serde(default)]
    pub state: ShadowState,

    /// Document version assigned by the remote store.
    #[serde(default)]
    pub version: Option<u64>,
}

/// Shadow delta notification payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaEvent {
    /// Token of the update that produced this delta, if the broker echoes it.
    #[serde(default)]
    pub client_token: Option<Uuid>,

    /// Property-to-value map of diverging state. A `null` value means the
    /// property was deleted from `desired`.
    #[serde(default)]
    pub state: serde_json::Map<String, Value>,
}

// =============================================================================
// Topics
// =============================================================================

/// The full set of topics for one shadow namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowTopics {
    /// Get request topic.
    pub get: String,
    /// Get accepted response topic.
    pub get_accepted: String,
    /// Get rejected response topic.
    pub get_rejected: String,
    /// Update request topic.
    pub update: String,
    /// Update accepted response topic.
    pub update_accepted: String,
    /// Update rejected response topic.
    pub update_rejected: String,
    /// Delta notification topic.
    pub update_delta: String,
}

/// Classification of an inbound delivery against a shadow namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowTopicKind {
    GetAccepted,
    GetRejected,
    UpdateAccepted,
    UpdateRejected,
    Delta,
}

impl ShadowTopics {
    /// Builds the topic set for a shadow namespace, e.g. `shadow/local-tester`.
    pub fn new(namespace: &str) -> Self {
        ShadowTopics {
            get: format!("{namespace}/get"),
            get_accepted: format!("{namespace}/get/accepted"),
            get_rejected: format!("{namespace}/get/rejected"),
            update: format!("{namespace}/update"),
            update_accepted: format!("{namespace}/update/accepted"),
            update_rejected: format!("{namespace}/update/rejected"),
            update_delta: format!("{namespace}/update/delta"),
        }
    }

    /// Classifies an inbound delivery topic, if it belongs to this namespace.
    pub fn classify(&self, topic: &str) -> Option<ShadowTopicKind> {
        if topic == self.get_accepted {
            Some(ShadowTopicKind::GetAccepted)
        } else if topic == self.get_rejected {
            Some(ShadowTopicKind::GetRejected)
        } else if topic == self.update_accepted {
            Some(ShadowTopicKind::UpdateAccepted)
        } else if topic == self.update_rejected {
            Some(ShadowTopicKind::UpdateRejected)
        } else if topic == self.update_delta {
            Some(ShadowTopicKind::Delta)
        } else {
            None
        }
    }

    /// The five response/notification topics the agent must be subscribed to
    /// before issuing any request.
    pub fn response_topics(&self) -> [&str; 5] {
        [
            &self.update_accepted,
            &self.update_rejected,
            &self.get_accepted,
            &self.get_rejected,
            &self.update_delta,
        ]
    }
}

/// Builds the publish topic for an event source,
/// e.g. `dt/bt_scan_log_v1/scanner-1`.
pub fn event_topic(namespace: &str, source_id: &str) -> String {
    format!("{namespace}/{source_id}")
}

// =============================================================================
// Tests
// =============================================================================
