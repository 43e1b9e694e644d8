//! # Batch Publisher
//!
//! Drains the event queue on each trigger tick and publishes every drained
//! event to the event topic.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Batch Publish Flow                               │
//! │                                                                         │
//! │  trigger tick ──► connected? ──no──► skip (events stay queued)          │
//! │                       │yes                                              │
//! │                       ▼                                                 │
//! │                  drain_all() ──empty──► no-op                           │
//! │                       │                                                 │
//! │                       ▼                                                 │
//! │            publish each event, in order, to <event-ns>/<source-id>      │
//! │                                                                         │
//! │  FAILURE POLICY: a publish failure is logged and the remaining events   │
//! │  of the batch are dropped with it. Drained events are never re-queued.  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use tracing::{debug, warn};

use crate::error::BridgeResult;
use crate::protocol::DeliveryGuarantee;
use crate::queue::EventQueue;
use crate::transport::TransportHandle;

/// Drains the event queue and publishes each drained event.
pub struct BatchPublisher {
    queue: EventQueue,
    transport: TransportHandle,

    /// Full topic events are published to.
    topic: String,
}

impl BatchPublisher {
    pub fn new(queue: EventQueue, transport: TransportHandle, topic: String) -> Self {
        BatchPublisher {
            queue,
            transport,
            topic,
        }
    }

    /// Runs one batch cycle. Intended as a periodic trigger callback.
    ///
    /// While disconnected the queue is left untouched, so events accumulate
    /// until the session resumes.
    pub async fn flush(&self) -> BridgeResult<()> {
        if !self.transport.is_connected().await {
            debug!(
                queued = self.queue.len(),
                "Not connected. Leaving events queued"
            );
            return Ok(());
        }

        let batch = self.queue.drain_all();
        if batch.is_empty() {
            return Ok(());
        }

        debug!(count = batch.len(), topic = %self.topic, "Publishing batch");

        let total = batch.len();
        for (sent, event) in batch.into_iter().enumerate() {
            if let Err(e) = self
                .transport
                .publish(&self.topic, event.into_payload(), DeliveryGuarantee::AtLeastOnce)
                .await
            {
                warn!(
                    ?e,
                    sent,
                    dropped = total - sent,
                    topic = %self.topic,
                    "Batch publish failed. Dropping remainder of batch"
                );
                return Err(e);
            }
        }

        debug!(count = total, "Batch published");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Event, EventQueue};
    use crate::transport::{ConnectionState, TransportCommand};
    use serde_json::json;

    fn publisher_with_events(
        events: &[u64],
    ) -> (BatchPublisher, tokio::sync::mpsc::Receiver<TransportCommand>) {
        let (sink, queue) = EventQueue::new();
        for n in events {
            sink.push(Event::from(json!({ "seq": n })));
        }
        let (transport, cmd_rx) = TransportHandle::detached();
        let publisher = BatchPublisher::new(queue, transport, "dt/bt_scan_log_v1/scanner-1".into());
        (publisher, cmd_rx)
    }

    #[tokio::test]
    async fn test_flush_publishes_all_in_order() {
        let (publisher, mut cmd_rx) = publisher_with_events(&[1, 2, 3]);

        publisher.flush().await.unwrap();

        for expected in 1..=3u64 {
            match cmd_rx.try_recv().unwrap() {
                TransportCommand::Publish { topic, payload, .. } => {
                    assert_eq!(topic, "dt/bt_scan_log_v1/scanner-1");
                    assert_eq!(payload["seq"], expected);
                }
                other => panic!("expected publish, got {other:?}"),
            }
        }
        assert!(cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_queue_is_a_noop() {
        let (publisher, mut cmd_rx) = publisher_with_events(&[]);
        publisher.flush().await.unwrap();
        assert!(cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnected_leaves_events_queued() {
        let (publisher, mut cmd_rx) = publisher_with_events(&[1, 2]);
        publisher.transport.set_state(ConnectionState::Backoff).await;

        publisher.flush().await.unwrap();

        assert!(cmd_rx.try_recv().is_err());
        assert_eq!(publisher.queue.len(), 2);

        // Once connected again, the queued events go out.
        publisher
            .transport
            .set_state(ConnectionState::Connected)
            .await;
        publisher.flush().await.unwrap();
        assert!(cmd_rx.try_recv().is_ok());
        assert!(publisher.queue.is_empty());
    }
}
