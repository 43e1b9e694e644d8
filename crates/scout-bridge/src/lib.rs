//! # scout-bridge: Bridge Engine for Scout
//!
//! This crate connects a local observation stream to a remote pub/sub
//! service: observations are batched and published on a fixed cadence, and
//! one device-shadow property is kept in sync with the remote store.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Bridge Agent Architecture                        │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                   BridgeAgent (Main Orchestrator)                │  │
//! │  │                                                                  │  │
//! │  │  Spawned from the daemon binary                                  │  │
//! │  │  Wires transport, shadow sync, and batch publishing together     │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ BatchPublisher │  │   Transport    │  │  ShadowReconciler      │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Drains event   │  │ WebSocket with │  │ Get/Update/Delta       │    │
//! │  │ queue on each  │  │ auto-reconnect │  │ state machine with     │    │
//! │  │ trigger tick   │  │ & backoff      │  │ token correlation      │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  ┌────────────────┐  ┌────────────────┐                                │
//! │  │  EventQueue    │  │ PeriodicTrigger│                                │
//! │  │                │  │                │                                │
//! │  │ Thread-safe    │  │ Start/stop     │                                │
//! │  │ FIFO, cloneable│  │ controllable   │                                │
//! │  │ producer sink  │  │ flush cadence  │                                │
//! │  └────────────────┘  └────────────────┘                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`agent`] - Main `BridgeAgent` orchestrator and delivery router
//! - [`config`] - Bridge configuration (TOML file + environment)
//! - [`error`] - Bridge error types
//! - [`protocol`] - Wire frames, shadow payloads, and topic layout
//! - [`publisher`] - Batch publisher draining the event queue
//! - [`queue`] - Thread-safe event queue and producer sink
//! - [`shadow`] - Shadow reconciler, token registry, change requests
//! - [`transport`] - WebSocket pub/sub session with reconnection
//! - [`trigger`] - Periodic trigger with start/stop control
//!
//! ## Usage
//!
//! ```rust,ignore
//! use scout_bridge::{BridgeAgent, BridgeConfig};
//!
//! let config = BridgeConfig::load(None)?;
//! let mut agent = BridgeAgent::start(config).await?;
//!
//! // Enqueue observations from any thread
//! let sink = agent.event_sink();
//!
//! // Change the synced shadow value
//! agent.shadow().set(serde_json::json!(5)).await?;
//!
//! // Block until a fatal error
//! if let Some(e) = agent.wait().await {
//!     eprintln!("bridge failed: {e}");
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod config;
pub mod error;
pub mod protocol;
pub mod publisher;
pub mod queue;
pub mod shadow;
pub mod transport;
pub mod trigger;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::BridgeAgent;
pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use protocol::{DeliveryGuarantee, RequestKind, ShadowTopics, WireMessage};
pub use queue::{Event, EventSink};
pub use shadow::{ChangeRequest, ShadowHandle};
pub use transport::{ConnectionState, SessionEvent, SubscriptionGrant, Transport, TransportConfig, TransportHandle};
pub use trigger::{PeriodicTrigger, TriggerHandle};
