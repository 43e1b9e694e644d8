//! # Bridge Error Types
//!
//! Error types for the bridge engine.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Bridge Error Categories                            │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  SerializationFailed    │ │
//! │  │  ConfigLoad     │  │  Disconnected   │  │  DeserializationFailed  │ │
//! │  │  InvalidUrl     │  │  Timeout        │  │  HandshakeFailed        │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌──────────────────────────────────────────────┐ │
//! │  │  Subscription   │  │      Shadow (fatal for the session)          │ │
//! │  │                 │  │                                              │ │
//! │  │  SubscribeRej.  │  │  GetRejected (non-404)                       │ │
//! │  │  ResubscribeF.  │  │  UpdateRejected (any reason)                 │ │
//! │  └─────────────────┘  └──────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::protocol::RequestKind;

/// Result type alias for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Bridge error type covering all bridge failures.
///
/// ## Design Principles
/// - Each variant includes enough context for debugging
/// - Fatal session conditions are distinguishable via [`BridgeError::is_fatal`]
/// - All errors are `Send + Sync` for async compatibility
#[derive(Debug, Error)]
pub enum BridgeError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid bridge configuration.
    #[error("Invalid bridge configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Invalid transport endpoint URL.
    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to establish the transport connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Transport disconnected unexpectedly.
    #[error("Disconnected from endpoint")]
    Disconnected,

    /// Connection or acknowledgement timeout.
    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    /// TLS/SSL error.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// The broker never acknowledged the session.
    #[error("Session handshake failed: {0}")]
    HandshakeFailed(String),

    /// A publish did not hand off to the transport within its deadline.
    #[error("Publish to '{topic}' timed out")]
    PublishTimeout { topic: String },

    // =========================================================================
    // Subscription Errors
    // =========================================================================
    /// The broker rejected a subscription request.
    #[error("Subscription to '{topic}' was rejected")]
    SubscribeRejected { topic: String },

    /// A subscription could not be re-established after a session resume.
    #[error("Failed to resubscribe to '{topic}' after session resume")]
    ResubscribeFailed { topic: String },

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Failed to serialize a wire message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Failed to deserialize a wire message.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    // =========================================================================
    // Shadow Errors
    // =========================================================================
    /// The remote store rejected a Get request for a reason other than
    /// "no shadow document".
    #[error("Get request was rejected: code {code}: '{message}'")]
    GetRejected { code: u16, message: String },

    /// The remote store rejected an Update request. Always fatal: the
    /// optimistic local value can no longer be confirmed.
    #[error("{kind} request was rejected: code {code}: '{message}'")]
    UpdateRejected {
        kind: RequestKind,
        code: u16,
        message: String,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal bridge error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The bridge is shutting down.
    #[error("Bridge is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for BridgeError {
    fn from(err: url::ParseError) -> Self {
        BridgeError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed => BridgeError::Disconnected,
            WsError::AlreadyClosed => BridgeError::Disconnected,
            WsError::Protocol(p) => BridgeError::WebSocketError(p.to_string()),
            WsError::Io(io) => BridgeError::ConnectionFailed(io.to_string()),
            WsError::Tls(tls) => BridgeError::TlsError(tls.to_string()),
            other => BridgeError::WebSocketError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for BridgeError {
    fn from(err: toml::de::Error) -> Self {
        BridgeError::ConfigLoadFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl BridgeError {
    /// Returns true if this error must terminate the session.
    ///
    /// ## Fatal Conditions
    /// - Update rejected (optimistic local value is unconfirmed)
    /// - Get rejected for any reason other than "not found"
    /// - Resubscribe failure after a session resume
    /// - Broken internal channels (a component is gone)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::GetRejected { .. }
                | BridgeError::UpdateRejected { .. }
                | BridgeError::ResubscribeFailed { .. }
                | BridgeError::SubscribeRejected { .. }
                | BridgeError::HandshakeFailed(_)
                | BridgeError::ChannelError(_)
        )
    }

    /// Returns true if this error is a transient transport condition that
    /// the reconnect loop handles on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::ConnectionFailed(_)
                | BridgeError::Disconnected
                | BridgeError::Timeout(_)
                | BridgeError::WebSocketError(_)
                | BridgeError::PublishTimeout { .. }
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            BridgeError::InvalidConfig(_)
                | BridgeError::ConfigLoadFailed(_)
                | BridgeError::InvalidUrl(_)
        )
    }
}
