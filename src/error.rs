//! # Error Handling
//!
//! Error taxonomy for the bridge core. Every one of these errors is handled at
//! the point where it is detected: the frame or envelope involved is dropped,
//! a structured log line is written, and the connection keeps running.
//!
//! ## Categories:
//! - **Parse**: the input frame is not a JSON object with a type/event tag
//! - **Validation**: well-formed frame missing a field its type requires
//! - **UnresolvedSession**: a control message names a session nobody owns
//! - **Delivery**: no outbound channel, or the attempted channel errored
//! - **Connection**: the transport refused a write or went away
//!
//! Only startup problems (bad configuration, listener bind failure) are fatal,
//! and those travel as `anyhow::Error` out of `main` instead.

use thiserror::Error;

/// Errors raised inside the routing core.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(BridgeError::Validation("media frame without streamSid".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// Malformed input frame (not JSON, not an object, no type tag)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Frame type is known but a required field is absent
    #[error("Validation error: {0}")]
    Validation(String),

    /// Control message references a session that is not registered
    #[error("Unresolved session: {0}")]
    UnresolvedSession(String),

    /// Envelope could not be handed to the backend
    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryFailed),

    /// Transport-level failure on a connection
    #[error("Connection error: {0}")]
    Connection(String),
}

/// Why the delivery router could not hand an envelope to the backend.
///
/// The envelope is discarded in both cases; nothing is retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryFailed {
    /// No persistent socket is open and no callback URL is configured
    #[error("no delivery channel configured")]
    NoChannelConfigured,

    /// The attempted channel failed (timeout, non-success status, I/O error)
    #[error("channel error: {0}")]
    ChannelError(String),
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Parse(format!("JSON parsing error: {}", err))
    }
}

/// Shorthand for results produced by the routing core.
pub type BridgeResult<T> = Result<T, BridgeError>;
