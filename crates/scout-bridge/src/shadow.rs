//! # Shadow Reconciler
//!
//! Keeps one tracked property of the device shadow in sync with the remote
//! store.
//!
//! ## Reconciliation Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Shadow Reconciliation                              │
//! │                                                                         │
//! │  agent router ──┐                                                       │
//! │  (deliveries)   ├──► ShadowEvent mpsc ──► reconciler loop              │
//! │  ShadowHandle ──┘                          (single writer)              │
//! │  (set/clear)                                    │                       │
//! │                                                 ▼                       │
//! │                                     local value + token registry        │
//! │                                                 │                       │
//! │                                                 ▼                       │
//! │                                     watch channel (observers)           │
//! │                                                                         │
//! │  SINGLE WRITER: every mutation of the local value flows through the     │
//! │  one event loop, so no lock guards the value and no interleaving of     │
//! │  a delta against a local change can corrupt it.                         │
//! │                                                                         │
//! │  STARTUP: one Get request is issued after the response subscriptions    │
//! │  are granted. Until its response arrives the local value is unset.      │
//! │                                                                         │
//! │  PRECEDENCE: in the initial Get response, a pending delta wins over     │
//! │  the previously reported value.                                         │
//! │                                                                         │
//! │  TOKENS: every request carries a fresh correlation token; a response    │
//! │  whose token is not in flight is a stale echo and is discarded.         │
//! │                                                                         │
//! │  FATAL: an Update rejection, or a Get rejection other than 404, ends    │
//! │  the reconciler with an error.                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{
    DeliveryGuarantee, DeltaEvent, ErrorResponse, GetAccepted, GetRequest, RequestKind,
    ShadowTopics, UpdateAccepted, UpdateRequest,
};
use crate::transport::{SubscriptionGrant, TransportHandle};

// =============================================================================
// Request Token Registry
// =============================================================================

/// One request awaiting its accepted/rejected response.
#[derive(Debug)]
struct InFlightRequest {
    kind: RequestKind,
    issued_at: Instant,
}

/// Tracks correlation tokens of requests in flight.
///
/// A token is issued when the request is published and resolved exactly once
/// by the matching response. Responses with unknown tokens are stale.
#[derive(Debug, Default)]
pub struct RequestTokenRegistry {
    in_flight: HashMap<Uuid, InFlightRequest>,
}

impl RequestTokenRegistry {
    /// Issues a fresh token for a request of the given kind.
    pub fn issue(&mut self, kind: RequestKind) -> Uuid {
        let token = Uuid::new_v4();
        self.in_flight.insert(
            token,
            InFlightRequest {
                kind,
                issued_at: Instant::now(),
            },
        );
        token
    }

    /// Resolves a token only if it was issued for a request of `kind`.
    ///
    /// A token issued for a different kind stays in flight: a misrouted
    /// frame must not consume the token its real response still needs.
    pub fn resolve_if(&mut self, token: &Uuid, kind: RequestKind) -> bool {
        match self.in_flight.get(token) {
            Some(request) if request.kind == kind => {
                self.resolve(token);
                true
            }
            _ => false,
        }
    }

    /// Resolves a token, returning the kind of the request it was issued
    /// for, or `None` if the token is unknown (stale response).
    pub fn resolve(&mut self, token: &Uuid) -> Option<RequestKind> {
        self.in_flight.remove(token).map(|request| {
            debug!(
                %token,
                kind = %request.kind,
                elapsed_ms = request.issued_at.elapsed().as_millis() as u64,
                "Request resolved"
            );
            request.kind
        })
    }

    /// Number of requests currently in flight.
    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns true if no requests are in flight.
    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}

// =============================================================================
// Change Requests + Events
// =============================================================================

/// A locally initiated shadow change.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeRequest {
    /// Set the tracked property to a new value.
    Set(Value),

    /// Delete the shadow document contents on the remote store.
    Clear,
}

/// One input to the reconciler loop, from the wire or from a local caller.
#[derive(Debug)]
pub enum ShadowEvent {
    /// `get/accepted` delivery.
    GetAccepted(GetAccepted),

    /// `get/rejected` delivery.
    GetRejected(ErrorResponse),

    /// `update/accepted` delivery.
    UpdateAccepted(UpdateAccepted),

    /// `update/rejected` delivery.
    UpdateRejected(ErrorResponse),

    /// `update/delta` delivery.
    Delta(DeltaEvent),

    /// Local change from a [`ShadowHandle`].
    Change(ChangeRequest),
}

// =============================================================================
// Shadow Handle
// =============================================================================

/// Handle for reading and changing the tracked shadow value.
#[derive(Debug, Clone)]
pub struct ShadowHandle {
    events_tx: mpsc::Sender<ShadowEvent>,
    value_rx: watch::Receiver<Option<Value>>,
}

impl ShadowHandle {
    /// Requests setting the tracked property. The local value is adopted
    /// optimistically before the remote store confirms.
    pub async fn set(&self, value: Value) -> BridgeResult<()> {
        self.events_tx
            .send(ShadowEvent::Change(ChangeRequest::Set(value)))
            .await
            .map_err(|_| BridgeError::ChannelError("Shadow reconciler is gone".into()))
    }

    /// Requests deleting the shadow document contents on the remote store.
    pub async fn clear(&self) -> BridgeResult<()> {
        self.events_tx
            .send(ShadowEvent::Change(ChangeRequest::Clear))
            .await
            .map_err(|_| BridgeError::ChannelError("Shadow reconciler is gone".into()))
    }

    /// Current local value, `None` until the initial sync completes or
    /// after a clear.
    pub fn value(&self) -> Option<Value> {
        self.value_rx.borrow().clone()
    }

    /// A watch receiver notified on every adopted value change.
    pub fn watch(&self) -> watch::Receiver<Option<Value>> {
        self.value_rx.clone()
    }
}

// =============================================================================
// Shadow Subscriptions
// =============================================================================

/// Proof that all five shadow response topics are subscribed.
///
/// The reconciler cannot be constructed without one, so no Get or Update
/// can be published before its response topic is granted.
#[derive(Debug)]
pub struct ShadowSubscriptions {
    grants: Vec<SubscriptionGrant>,
}

impl ShadowSubscriptions {
    /// Subscribes to every shadow response topic, in order, blocking until
    /// each is acknowledged.
    pub async fn establish(
        transport: &TransportHandle,
        topics: &ShadowTopics,
    ) -> BridgeResult<Self> {
        let mut grants = Vec::with_capacity(5);
        for topic in topics.response_topics() {
            let grant = transport
                .subscribe(topic, DeliveryGuarantee::AtLeastOnce)
                .await?;
            info!(topic = %grant.topic(), "Shadow response topic subscribed");
            grants.push(grant);
        }
        Ok(ShadowSubscriptions { grants })
    }

    /// Builds the proof without subscribing, for exercising the reconciler
    /// against a detached transport.
    #[cfg(test)]
    pub(crate) fn assume(topics: &ShadowTopics) -> Self {
        ShadowSubscriptions {
            grants: topics
                .response_topics()
                .iter()
                .map(|t| SubscriptionGrant::assume(t))
                .collect(),
        }
    }

    /// The granted topics.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.grants.iter().map(|g| g.topic())
    }
}

// =============================================================================
// Shadow Reconciler
// =============================================================================

/// Single-writer loop reconciling the tracked property with the remote
/// shadow store.
pub struct ShadowReconciler {
    transport: TransportHandle,
    topics: ShadowTopics,

    /// Name of the tracked property inside the shadow document.
    property: String,

    /// Value adopted when the remote store has no opinion.
    default_value: Value,

    registry: RequestTokenRegistry,

    /// Local copy of the tracked property. `None` before the initial sync
    /// and after a clear.
    local_value: Option<Value>,

    value_tx: watch::Sender<Option<Value>>,
    events_rx: mpsc::Receiver<ShadowEvent>,

    // Held so the response subscriptions provably outlive the reconciler.
    _subscriptions: ShadowSubscriptions,
}

impl ShadowReconciler {
    /// Creates a reconciler and its handle.
    ///
    /// The returned sender is the router's input for delivering wire events;
    /// the handle wraps the same channel for local changes. Nothing is
    /// published until [`run`](Self::run) is called.
    pub fn new(
        transport: TransportHandle,
        topics: ShadowTopics,
        property: String,
        default_value: Value,
        subscriptions: ShadowSubscriptions,
    ) -> (ShadowReconciler, ShadowHandle, mpsc::Sender<ShadowEvent>) {
        let (events_tx, events_rx) = mpsc::channel(100);
        let (value_tx, value_rx) = watch::channel(None);

        let reconciler = ShadowReconciler {
            transport,
            topics,
            property,
            default_value,
            registry: RequestTokenRegistry::default(),
            local_value: None,
            value_tx,
            events_rx,
            _subscriptions: subscriptions,
        };

        let handle = ShadowHandle {
            events_tx: events_tx.clone(),
            value_rx,
        };

        (reconciler, handle, events_tx)
    }

    /// Runs the reconciler until shutdown or a fatal rejection.
    ///
    /// Issues the initial Get, then applies events one at a time. Returns
    /// `Ok(())` when every event sender is dropped (shutdown).
    pub async fn run(mut self) -> BridgeResult<()> {
        self.request_get().await?;

        while let Some(event) = self.events_rx.recv().await {
            self.handle_event(event).await?;
        }

        info!("Shadow reconciler stopping");
        Ok(())
    }

    async fn handle_event(&mut self, event: ShadowEvent) -> BridgeResult<()> {
        match event {
            ShadowEvent::GetAccepted(accepted) => self.handle_get_accepted(accepted).await,
            ShadowEvent::GetRejected(rejection) => self.handle_get_rejected(rejection).await,
            ShadowEvent::UpdateAccepted(accepted) => self.handle_update_accepted(accepted),
            ShadowEvent::UpdateRejected(rejection) => self.handle_update_rejected(rejection),
            ShadowEvent::Delta(delta) => self.handle_delta(delta).await,
            ShadowEvent::Change(change) => self.handle_change(change).await,
        }
    }

    /// Publishes the initial Get request.
    async fn request_get(&mut self) -> BridgeResult<()> {
        let token = self.registry.issue(RequestKind::Get);
        let request = GetRequest {
            client_token: token,
        };
        info!(%token, topic = %self.topics.get, "Requesting shadow document");
        self.transport
            .publish(
                &self.topics.get,
                serde_json::to_value(&request)?,
                DeliveryGuarantee::AtLeastOnce,
            )
            .await
    }

    async fn handle_get_accepted(&mut self, accepted: GetAccepted) -> BridgeResult<()> {
        if !self.registry.resolve_if(&accepted.client_token, RequestKind::Get) {
            debug!(token = %accepted.client_token, "Discarding stale get response");
            return Ok(());
        }

        // A delta may have set the value while the Get was in flight; the
        // initial query result is stale then and must not overwrite it.
        if self.local_value.is_some() {
            debug!("Value already set before the get response, discarding initial query result");
            return Ok(());
        }

        let delta_value = self.property_in(accepted.state.delta.as_ref());
        let reported_value = self.property_in(accepted.state.reported.as_ref());

        if let Some(value) = delta_value {
            // A pending delta outranks whatever was last reported.
            let adopted = if value.is_null() {
                self.default_value.clone()
            } else {
                value
            };
            info!(value = %adopted, "Initial sync: adopting pending delta");
            self.adopt_and_report(adopted).await
        } else if let Some(value) = reported_value {
            info!(value = %value, "Initial sync: adopting reported value");
            self.adopt(value);
            Ok(())
        } else {
            info!(value = %self.default_value, "Initial sync: shadow has no value, reporting default");
            self.adopt_and_report(self.default_value.clone()).await
        }
    }

    async fn handle_get_rejected(&mut self, rejection: ErrorResponse) -> BridgeResult<()> {
        // A rejection that cannot be correlated to an in-flight Get is not
        // ours to act on.
        let token = match rejection.client_token {
            Some(token) => token,
            None => {
                info!(code = rejection.code, "Ignoring rejection without a token");
                return Ok(());
            }
        };
        if !self.registry.resolve_if(&token, RequestKind::Get) {
            info!(%token, code = rejection.code, "Ignoring rejection with unexpected token");
            return Ok(());
        }

        if rejection.code == 404 {
            // No shadow document yet; create it with the default.
            warn!(
                value = %self.default_value,
                "Shadow document does not exist, reporting default"
            );
            self.adopt_and_report(self.default_value.clone()).await
        } else {
            Err(BridgeError::GetRejected {
                code: rejection.code,
                message: rejection.message,
            })
        }
    }

    fn handle_update_accepted(&mut self, accepted: UpdateAccepted) -> BridgeResult<()> {
        match self.registry.resolve(&accepted.client_token) {
            Some(kind) => {
                debug!(token = %accepted.client_token, %kind, "Update confirmed");
                if self.property_in(accepted.state.reported.as_ref()).is_none() {
                    warn!(
                        property = %self.property,
                        "Accepted update does not echo the tracked property"
                    );
                }
            }
            None => {
                debug!(token = %accepted.client_token, "Discarding stale update response");
            }
        }
        Ok(())
    }

    fn handle_update_rejected(&mut self, rejection: ErrorResponse) -> BridgeResult<()> {
        let kind = match rejection.client_token {
            Some(token) => match self.registry.resolve(&token) {
                Some(kind) => kind,
                None => {
                    // Not ours, or long since resolved. Stale, not fatal.
                    info!(%token, code = rejection.code, "Ignoring rejection with unknown token");
                    return Ok(());
                }
            },
            None => {
                // Uncorrelatable, same as an unknown token.
                info!(code = rejection.code, "Ignoring rejection without a token");
                return Ok(());
            }
        };
        Err(BridgeError::UpdateRejected {
            kind,
            code: rejection.code,
            message: rejection.message,
        })
    }

    async fn handle_delta(&mut self, delta: DeltaEvent) -> BridgeResult<()> {
        match delta.state.get(&self.property) {
            Some(Value::Null) => {
                // The property was deleted from desired; fall back.
                info!(value = %self.default_value, "Delta deleted the property, reverting to default");
                self.apply_change(self.default_value.clone()).await
            }
            Some(value) => {
                info!(value = %value, "Delta received, adopting desired value");
                self.apply_change(value.clone()).await
            }
            None => {
                debug!("Delta does not touch the tracked property");
                Ok(())
            }
        }
    }

    async fn handle_change(&mut self, change: ChangeRequest) -> BridgeResult<()> {
        match change {
            ChangeRequest::Set(value) => {
                info!(value = %value, "Local change requested");
                self.apply_change(value).await
            }
            ChangeRequest::Clear => {
                info!("Clearing shadow document");
                self.local_value = None;
                self.value_tx.send_replace(None);

                let token = self.registry.issue(RequestKind::Update);
                let request = UpdateRequest::clear(token);
                self.transport
                    .publish(
                        &self.topics.update,
                        serde_json::to_value(&request)?,
                        DeliveryGuarantee::AtLeastOnce,
                    )
                    .await
            }
        }
    }

    /// Idempotent value change: adopts and reports only when the value
    /// actually differs from the local copy.
    async fn apply_change(&mut self, value: Value) -> BridgeResult<()> {
        if self.local_value.as_ref() == Some(&value) {
            debug!(value = %value, "Already at value, no update issued");
            return Ok(());
        }
        self.adopt_and_report(value).await
    }

    /// Adopts a value locally and notifies watchers.
    fn adopt(&mut self, value: Value) {
        self.local_value = Some(value.clone());
        self.value_tx.send_replace(Some(value));
    }

    /// Adopts a value locally, then reports it to the remote store.
    async fn adopt_and_report(&mut self, value: Value) -> BridgeResult<()> {
        self.adopt(value.clone());

        let token = self.registry.issue(RequestKind::Update);
        let request = UpdateRequest::set_property(token, &self.property, &value);
        self.transport
            .publish(
                &self.topics.update,
                serde_json::to_value(&request)?,
                DeliveryGuarantee::AtLeastOnce,
            )
            .await
    }

    /// Extracts the tracked property from a shadow state object.
    fn property_in(&self, object: Option<&Value>) -> Option<Value> {
        object.and_then(|o| o.get(&self.property)).cloned()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ShadowState;
    use crate::transport::TransportCommand;
    use serde_json::json;
    use tokio::sync::mpsc::Receiver;

    const PROPERTY: &str = "scan_period_s";

    fn reconciler() -> (ShadowReconciler, ShadowHandle, Receiver<TransportCommand>) {
        let (transport, cmd_rx) = TransportHandle::detached();
        let topics = ShadowTopics::new("shadow/local-tester");
        let subscriptions = ShadowSubscriptions::assume(&topics);
        let (reconciler, handle, _events_tx) = ShadowReconciler::new(
            transport,
            topics,
            PROPERTY.into(),
            json!(10),
            subscriptions,
        );
        (reconciler, handle, cmd_rx)
    }

    fn next_publish(cmd_rx: &mut Receiver<TransportCommand>) -> (String, Value) {
        match cmd_rx.try_recv().expect("expected a publish") {
            TransportCommand::Publish { topic, payload, .. } => (topic, payload),
            other => panic!("expected publish, got {other:?}"),
        }
    }

    fn update_token(payload: &Value) -> Uuid {
        payload["clientToken"]
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .expect("update must carry a client token")
    }

    #[tokio::test]
    async fn test_initial_get_carries_in_flight_token() {
        let (mut r, _handle, mut cmd_rx) = reconciler();
        r.request_get().await.unwrap();

        let (topic, payload) = next_publish(&mut cmd_rx);
        assert_eq!(topic, "shadow/local-tester/get");
        let token = update_token(&payload);
        assert_eq!(r.registry.len(), 1);
        assert_eq!(r.registry.resolve(&token), Some(RequestKind::Get));
    }

    #[tokio::test]
    async fn test_get_accepted_adopts_reported_without_publishing() {
        let (mut r, handle, mut cmd_rx) = reconciler();
        let token = r.registry.issue(RequestKind::Get);

        r.handle_get_accepted(GetAccepted {
            client_token: token,
            state: ShadowState {
                reported: Some(json!({ PROPERTY: 30 })),
                desired: None,
                delta: None,
            },
            version: Some(3),
        })
        .await
        .unwrap();

        assert_eq!(handle.value(), Some(json!(30)));
        // Reported value is already in sync; nothing to publish.
        assert!(cmd_rx.try_recv().is_err());
        assert!(r.registry.is_empty());
    }

    #[tokio::test]
    async fn test_get_accepted_delta_outranks_reported() {
        let (mut r, handle, mut cmd_rx) = reconciler();
        let token = r.registry.issue(RequestKind::Get);

        r.handle_get_accepted(GetAccepted {
            client_token: token,
            state: ShadowState {
                reported: Some(json!({ PROPERTY: 30 })),
                desired: Some(json!({ PROPERTY: 5 })),
                delta: Some(json!({ PROPERTY: 5 })),
            },
            version: Some(4),
        })
        .await
        .unwrap();

        assert_eq!(handle.value(), Some(json!(5)));
        let (topic, payload) = next_publish(&mut cmd_rx);
        assert_eq!(topic, "shadow/local-tester/update");
        assert_eq!(payload["state"]["reported"][PROPERTY], json!(5));
    }

    #[tokio::test]
    async fn test_get_accepted_empty_shadow_reports_default() {
        let (mut r, handle, mut cmd_rx) = reconciler();
        let token = r.registry.issue(RequestKind::Get);

        r.handle_get_accepted(GetAccepted {
            client_token: token,
            state: ShadowState::default(),
            version: None,
        })
        .await
        .unwrap();

        assert_eq!(handle.value(), Some(json!(10)));
        let (_, payload) = next_publish(&mut cmd_rx);
        assert_eq!(payload["state"]["reported"][PROPERTY], json!(10));
    }

    #[tokio::test]
    async fn test_stale_get_response_is_discarded() {
        let (mut r, handle, mut cmd_rx) = reconciler();
        // No in-flight token at all.
        r.handle_get_accepted(GetAccepted {
            client_token: Uuid::new_v4(),
            state: ShadowState {
                reported: Some(json!({ PROPERTY: 99 })),
                desired: None,
                delta: None,
            },
            version: None,
        })
        .await
        .unwrap();

        assert_eq!(handle.value(), None);
        assert!(cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_get_accepted_after_delta_performs_no_mutation() {
        let (mut r, handle, mut cmd_rx) = reconciler();
        let token = r.registry.issue(RequestKind::Get);

        // A delta lands while the Get is in flight.
        let mut state = serde_json::Map::new();
        state.insert(PROPERTY.into(), json!(5));
        r.handle_delta(DeltaEvent {
            client_token: None,
            state,
        })
        .await
        .unwrap();
        let _ = next_publish(&mut cmd_rx);
        assert_eq!(handle.value(), Some(json!(5)));

        // The stale initial query result must not overwrite the delta.
        r.handle_get_accepted(GetAccepted {
            client_token: token,
            state: ShadowState {
                reported: Some(json!({ PROPERTY: 30 })),
                desired: None,
                delta: None,
            },
            version: Some(2),
        })
        .await
        .unwrap();

        assert_eq!(handle.value(), Some(json!(5)));
        assert!(cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_get_rejected_404_reports_default() {
        let (mut r, handle, mut cmd_rx) = reconciler();
        let token = r.registry.issue(RequestKind::Get);

        r.handle_get_rejected(ErrorResponse {
            client_token: Some(token),
            code: 404,
            message: "No shadow exists".into(),
        })
        .await
        .unwrap();

        assert_eq!(handle.value(), Some(json!(10)));
        let (_, payload) = next_publish(&mut cmd_rx);
        assert_eq!(payload["state"]["reported"][PROPERTY], json!(10));
    }

    #[tokio::test]
    async fn test_get_rejected_other_code_is_fatal() {
        let (mut r, _handle, _cmd_rx) = reconciler();
        let token = r.registry.issue(RequestKind::Get);

        let result = r
            .handle_get_rejected(ErrorResponse {
                client_token: Some(token),
                code: 500,
                message: "internal".into(),
            })
            .await;

        assert!(matches!(
            result,
            Err(BridgeError::GetRejected { code: 500, .. })
        ));
    }

    #[tokio::test]
    async fn test_tokenless_get_rejected_is_ignored() {
        let (mut r, handle, mut cmd_rx) = reconciler();

        // No Get in flight and no token to correlate: not ours to act on,
        // even when the code would otherwise trigger the default path.
        r.handle_get_rejected(ErrorResponse {
            client_token: None,
            code: 404,
            message: "No shadow exists".into(),
        })
        .await
        .unwrap();

        assert_eq!(handle.value(), None);
        assert!(cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_tokenless_update_rejected_is_ignored() {
        let (mut r, handle, mut cmd_rx) = reconciler();
        r.adopt(json!(7));

        r.handle_update_rejected(ErrorResponse {
            client_token: None,
            code: 400,
            message: "bad state".into(),
        })
        .unwrap();

        assert_eq!(handle.value(), Some(json!(7)));
        assert!(cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_get_response_leaves_update_token_in_flight() {
        let (mut r, handle, mut cmd_rx) = reconciler();
        let update_token = r.registry.issue(RequestKind::Update);

        // A get response misrouted onto an update token is discarded and
        // must not consume the token the real update response still needs.
        r.handle_get_accepted(GetAccepted {
            client_token: update_token,
            state: ShadowState {
                reported: Some(json!({ PROPERTY: 99 })),
                desired: None,
                delta: None,
            },
            version: None,
        })
        .await
        .unwrap();

        assert_eq!(handle.value(), None);
        assert!(cmd_rx.try_recv().is_err());
        assert_eq!(r.registry.len(), 1);
        assert_eq!(r.registry.resolve(&update_token), Some(RequestKind::Update));
    }

    #[tokio::test]
    async fn test_update_rejected_is_always_fatal_and_names_the_kind() {
        let (mut r, _handle, _cmd_rx) = reconciler();
        let token = r.registry.issue(RequestKind::Update);

        let result = r.handle_update_rejected(ErrorResponse {
            client_token: Some(token),
            code: 400,
            message: "bad state".into(),
        });

        match result {
            Err(BridgeError::UpdateRejected { kind, code, .. }) => {
                assert_eq!(kind, RequestKind::Update);
                assert_eq!(code, 400);
            }
            other => panic!("expected fatal update rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_update_rejected_with_unknown_token_is_ignored() {
        let (mut r, handle, mut cmd_rx) = reconciler();
        r.adopt(json!(7));

        r.handle_update_rejected(ErrorResponse {
            client_token: Some(Uuid::new_v4()),
            code: 400,
            message: "not yours".into(),
        })
        .unwrap();

        assert_eq!(handle.value(), Some(json!(7)));
        assert!(cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_delta_matching_local_value_publishes_nothing() {
        let (mut r, _handle, mut cmd_rx) = reconciler();
        r.adopt(json!(5));

        let mut state = serde_json::Map::new();
        state.insert(PROPERTY.into(), json!(5));
        r.handle_delta(DeltaEvent {
            client_token: None,
            state,
        })
        .await
        .unwrap();

        assert!(cmd_rx.try_recv().is_err());
        assert!(r.registry.is_empty());
    }

    #[tokio::test]
    async fn test_delta_adopts_and_reports() {
        let (mut r, handle, mut cmd_rx) = reconciler();

        let mut state = serde_json::Map::new();
        state.insert(PROPERTY.into(), json!(2));
        r.handle_delta(DeltaEvent {
            client_token: None,
            state,
        })
        .await
        .unwrap();

        assert_eq!(handle.value(), Some(json!(2)));
        let (topic, payload) = next_publish(&mut cmd_rx);
        assert_eq!(topic, "shadow/local-tester/update");
        assert_eq!(payload["state"]["desired"][PROPERTY], json!(2));
        assert_eq!(payload["state"]["reported"][PROPERTY], json!(2));
    }

    #[tokio::test]
    async fn test_delta_null_reverts_to_default() {
        let (mut r, handle, mut cmd_rx) = reconciler();
        r.adopt(json!(7));

        let mut state = serde_json::Map::new();
        state.insert(PROPERTY.into(), Value::Null);
        r.handle_delta(DeltaEvent {
            client_token: None,
            state,
        })
        .await
        .unwrap();

        assert_eq!(handle.value(), Some(json!(10)));
        let (_, payload) = next_publish(&mut cmd_rx);
        assert_eq!(payload["state"]["reported"][PROPERTY], json!(10));
    }

    #[tokio::test]
    async fn test_delta_for_other_property_is_ignored() {
        let (mut r, handle, mut cmd_rx) = reconciler();
        r.adopt(json!(7));

        let mut state = serde_json::Map::new();
        state.insert("unrelated".into(), json!(1));
        r.handle_delta(DeltaEvent {
            client_token: None,
            state,
        })
        .await
        .unwrap();

        assert_eq!(handle.value(), Some(json!(7)));
        assert!(cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_local_set_is_optimistic_and_idempotent() {
        let (mut r, handle, mut cmd_rx) = reconciler();

        r.handle_change(ChangeRequest::Set(json!(42))).await.unwrap();
        // Value adopted before any confirmation arrives.
        assert_eq!(handle.value(), Some(json!(42)));
        let (_, payload) = next_publish(&mut cmd_rx);
        let token = update_token(&payload);

        // Setting the same value again publishes nothing.
        r.handle_change(ChangeRequest::Set(json!(42))).await.unwrap();
        assert!(cmd_rx.try_recv().is_err());

        // Confirmation resolves the token.
        r.handle_update_accepted(UpdateAccepted {
            client_token: token,
            state: ShadowState::default(),
            version: Some(5),
        })
        .unwrap();
        assert!(r.registry.is_empty());
    }

    #[tokio::test]
    async fn test_clear_sends_explicit_nulls_and_unsets_local() {
        let (mut r, handle, mut cmd_rx) = reconciler();
        r.adopt(json!(7));

        r.handle_change(ChangeRequest::Clear).await.unwrap();

        assert_eq!(handle.value(), None);
        let (topic, payload) = next_publish(&mut cmd_rx);
        assert_eq!(topic, "shadow/local-tester/update");
        // Explicit nulls delete the document contents.
        assert_eq!(payload["state"]["reported"], Value::Null);
        assert_eq!(payload["state"]["desired"], Value::Null);
        assert_eq!(r.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_update_accepted_is_discarded() {
        let (mut r, _handle, _cmd_rx) = reconciler();
        r.handle_update_accepted(UpdateAccepted {
            client_token: Uuid::new_v4(),
            state: ShadowState::default(),
            version: None,
        })
        .unwrap();
        assert!(r.registry.is_empty());
    }

    #[tokio::test]
    async fn test_watch_sees_value_changes() {
        let (mut r, handle, _cmd_rx) = reconciler();
        let mut watcher = handle.watch();
        assert_eq!(*watcher.borrow_and_update(), None);

        r.adopt(json!(3));
        assert!(watcher.has_changed().unwrap());
        assert_eq!(*watcher.borrow_and_update(), Some(json!(3)));
    }
}
