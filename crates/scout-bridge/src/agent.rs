//! # Bridge Agent
//!
//! Top-level orchestrator wiring the transport session, the shadow
//! reconciler, and the batch publish pipeline together.
//!
//! ## Component Wiring
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          BridgeAgent                                    │
//! │                                                                         │
//! │   Transport ──session events──► router task                             │
//! │       ▲                             │ shadow deliveries                 │
//! │       │ publishes                   ▼                                   │
//! │       │                     ShadowReconciler ◄── ShadowHandle           │
//! │       │                             │ fatal errors                      │
//! │       │                             ▼                                   │
//! │       │                      fatal channel ──► wait()                   │
//! │       │                                                                 │
//! │   BatchPublisher ◄── PeriodicTrigger tick                               │
//! │       ▲                                                                 │
//! │   EventQueue ◄── EventSink (producers)                                  │
//! │                                                                         │
//! │  STARTUP ORDER: the shadow response subscriptions are established      │
//! │  before the reconciler (and its initial Get) is started, so no          │
//! │  response can be published before its topic is granted.                 │
//! │                                                                         │
//! │  FATAL ERRORS: a shadow rejection or a failed resubscription is         │
//! │  reported on the fatal channel; the process decides what to do.         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{event_topic, ShadowTopicKind, ShadowTopics};
use crate::publisher::BatchPublisher;
use crate::queue::{EventQueue, EventSink};
use crate::shadow::{ShadowEvent, ShadowHandle, ShadowReconciler, ShadowSubscriptions};
use crate::transport::{SessionEvent, Transport, TransportHandle};
use crate::trigger::{PeriodicTrigger, TriggerHandle};

/// The running bridge.
pub struct BridgeAgent {
    transport: TransportHandle,
    shadow: ShadowHandle,
    event_sink: EventSink,
    trigger: TriggerHandle,
    fatal_rx: mpsc::Receiver<BridgeError>,
}

impl BridgeAgent {
    /// Starts every component and returns the running agent.
    ///
    /// Blocks until the first connection is up and all shadow response
    /// subscriptions are granted.
    pub async fn start(config: BridgeConfig) -> BridgeResult<Self> {
        info!(
            thing_name = %config.device.thing_name,
            source_id = %config.device.source_id,
            "Starting bridge agent"
        );

        let (transport, mut session_rx) = Transport::spawn(config.transport_config());

        // Shadow response topics first, then the reconciler and its Get.
        let topics = ShadowTopics::new(&config.shadow_namespace());
        let subscriptions = ShadowSubscriptions::establish(&transport, &topics).await?;

        let (reconciler, shadow, shadow_events_tx) = ShadowReconciler::new(
            transport.clone(),
            topics.clone(),
            config.shadow.property.clone(),
            config.shadow.default_value.clone(),
            subscriptions,
        );

        let (fatal_tx, fatal_rx) = mpsc::channel::<BridgeError>(4);

        // Reconciler task: a returned error is fatal for the bridge.
        let reconciler_fatal = fatal_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = reconciler.run().await {
                error!(?e, "Shadow reconciler failed");
                let _ = reconciler_fatal.send(e).await;
            }
        });

        // Router task: session events to shadow events.
        let router_topics = topics.clone();
        let router_fatal = fatal_tx;
        tokio::spawn(async move {
            while let Some(event) = session_rx.recv().await {
                match event {
                    SessionEvent::Delivery { topic, payload } => {
                        match route_delivery(&router_topics, &topic, payload) {
                            Some(shadow_event) => {
                                if shadow_events_tx.send(shadow_event).await.is_err() {
                                    debug!("Shadow reconciler is gone, router stopping");
                                    break;
                                }
                            }
                            None => {
                                debug!(topic = %topic, "Delivery on unrouted topic");
                            }
                        }
                    }
                    SessionEvent::Interrupted { reason } => {
                        warn!(reason = %reason, "Session interrupted, reconnecting");
                    }
                    SessionEvent::Resumed { session_present } => {
                        info!(session_present, "Session resumed");
                    }
                    SessionEvent::ResubscribeFailed { topic } => {
                        error!(topic = %topic, "Resubscription failed, bridge cannot continue");
                        let _ = router_fatal
                            .send(BridgeError::ResubscribeFailed { topic })
                            .await;
                        break;
                    }
                }
            }
        });

        // Batch publish pipeline.
        let (event_sink, queue) = EventQueue::new();
        let publish_topic = event_topic(&config.events.namespace, &config.device.source_id);
        let publisher = Arc::new(BatchPublisher::new(
            queue,
            transport.clone(),
            publish_topic,
        ));
        let trigger = PeriodicTrigger::spawn(config.flush_interval(), move || {
            let publisher = publisher.clone();
            async move { publisher.flush().await }
        });
        trigger.start();

        Ok(BridgeAgent {
            transport,
            shadow,
            event_sink,
            trigger,
            fatal_rx,
        })
    }

    /// Producer handle for enqueueing observation events.
    pub fn event_sink(&self) -> EventSink {
        self.event_sink.clone()
    }

    /// Handle for reading and changing the shadow value.
    pub fn shadow(&self) -> ShadowHandle {
        self.shadow.clone()
    }

    /// Handle for pausing and resuming the batch flush cadence.
    pub fn trigger(&self) -> &TriggerHandle {
        &self.trigger
    }

    /// Waits for a fatal error. Returns `None` if every component shut
    /// down cleanly instead.
    pub async fn wait(&mut self) -> Option<BridgeError> {
        self.fatal_rx.recv().await
    }

    /// Shuts the bridge down gracefully.
    pub async fn shutdown(&self) -> BridgeResult<()> {
        info!("Shutting down bridge agent");
        self.trigger.shutdown();
        self.transport.shutdown().await
    }
}

/// Classifies an inbound delivery and parses it into a shadow event.
///
/// Unparseable payloads on a shadow topic are logged and dropped rather
/// than crashing the router.
fn route_delivery(topics: &ShadowTopics, topic: &str, payload: Value) -> Option<ShadowEvent> {
    let kind = topics.classify(topic)?;

    fn parse<T: serde::de::DeserializeOwned>(topic: &str, payload: Value) -> Option<T> {
        match serde_json::from_value(payload) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(topic = %topic, ?e, "Failed to parse shadow delivery");
                None
            }
        }
    }

    match kind {
        ShadowTopicKind::GetAccepted => parse(topic, payload).map(ShadowEvent::GetAccepted),
        ShadowTopicKind::GetRejected => parse(topic, payload).map(ShadowEvent::GetRejected),
        ShadowTopicKind::UpdateAccepted => parse(topic, payload).map(ShadowEvent::UpdateAccepted),
        ShadowTopicKind::UpdateRejected => parse(topic, payload).map(ShadowEvent::UpdateRejected),
        ShadowTopicKind::Delta => parse(topic, payload).map(ShadowEvent::Delta),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn topics() -> ShadowTopics {
        ShadowTopics::new("shadow/local-tester")
    }

    #[test]
    fn test_route_get_accepted() {
        let token = Uuid::new_v4();
        let payload = json!({
            "clientToken": token,
            "state": { "reported": { "scan_period_s": 10 } },
            "version": 3
        });

        let event = route_delivery(&topics(), "shadow/local-tester/get/accepted", payload);
        match event {
            Some(ShadowEvent::GetAccepted(accepted)) => {
                assert_eq!(accepted.client_token, token);
                assert_eq!(accepted.version, Some(3));
            }
            other => panic!("expected GetAccepted, got {other:?}"),
        }
    }

    #[test]
    fn test_route_delta() {
        let payload = json!({ "state": { "scan_period_s": 5 } });
        let event = route_delivery(&topics(), "shadow/local-tester/update/delta", payload);
        match event {
            Some(ShadowEvent::Delta(delta)) => {
                assert_eq!(delta.state["scan_period_s"], json!(5));
                assert_eq!(delta.client_token, None);
            }
            other => panic!("expected Delta, got {other:?}"),
        }
    }

    #[test]
    fn test_route_rejection() {
        let payload = json!({ "code": 404, "message": "No shadow exists" });
        let event = route_delivery(&topics(), "shadow/local-tester/get/rejected", payload);
        assert!(matches!(event, Some(ShadowEvent::GetRejected(r)) if r.code == 404));
    }

    #[test]
    fn test_route_unknown_topic() {
        let event = route_delivery(&topics(), "dt/bt_scan_log_v1/scanner-1", json!({}));
        assert!(event.is_none());

        // Same shape, different namespace.
        let event = route_delivery(&topics(), "shadow/other-thing/get/accepted", json!({}));
        assert!(event.is_none());
    }

    #[test]
    fn test_route_unparseable_payload_is_dropped() {
        let event = route_delivery(
            &topics(),
            "shadow/local-tester/get/accepted",
            json!({ "clientToken": "not-a-uuid" }),
        );
        assert!(event.is_none());
    }
}
