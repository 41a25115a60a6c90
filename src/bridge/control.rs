//! # Inbound Control Handler
//!
//! Backend → caller commands. A control message is decoded, its session token
//! resolved through the registry, re-encoded in the caller's vocabulary and
//! written to the owning caller connection. Nothing is ever acknowledged back
//! to the sender; every failure ends with the message being dropped.

use crate::bridge::registry::SessionRegistry;
use crate::bridge::translator::{decode_control, encode_caller_frame};
use crate::error::BridgeError;
use crate::state::BridgeMetrics;
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened to one control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Written to the caller connection
    Delivered,
    /// Type not understood by the caller transport
    Ignored,
    /// Malformed or missing a required field
    Rejected(BridgeError),
    /// No session registered under the token
    Unresolved(BridgeError),
    /// Session found but its connection cannot take writes
    NotWritable,
}

pub struct ControlHandler {
    registry: Arc<SessionRegistry>,
    metrics: Arc<BridgeMetrics>,
}

impl ControlHandler {
    pub fn new(registry: Arc<SessionRegistry>, metrics: Arc<BridgeMetrics>) -> Self {
        Self { registry, metrics }
    }

    pub fn handle(&self, raw: &str) -> ControlOutcome {
        let outcome = self.route(raw);
        match &outcome {
            ControlOutcome::Delivered => self.metrics.record_control_written(),
            _ => self.metrics.record_control_dropped(),
        }
        outcome
    }

    fn route(&self, raw: &str) -> ControlOutcome {
        let envelope = match decode_control(raw) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                debug!("Ignoring unsupported control message");
                return ControlOutcome::Ignored;
            }
            Err(err) => {
                warn!(error = %err, "Dropping control message");
                return ControlOutcome::Rejected(err);
            }
        };

        // decode_control only yields variants that carry a token.
        let Some(stream_sid) = envelope.stream_sid() else {
            return ControlOutcome::Rejected(BridgeError::Validation(
                "control message without streamSid".to_string(),
            ));
        };

        let Some(connection) = self.registry.resolve(stream_sid) else {
            let err = BridgeError::UnresolvedSession(stream_sid.to_string());
            debug!(kind = envelope.kind(), error = %err, "Dropping control message");
            return ControlOutcome::Unresolved(err);
        };

        if !connection.is_writable() {
            debug!(stream_sid = %stream_sid, connection = %connection.id(), "Caller connection not writable");
            return ControlOutcome::NotWritable;
        }

        let frame = match encode_caller_frame(&envelope) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(stream_sid = %stream_sid, error = %err, "Cannot encode control message");
                return ControlOutcome::Rejected(err);
            }
        };

        match connection.write_text(frame) {
            Ok(()) => {
                debug!(stream_sid = %stream_sid, kind = envelope.kind(), "Control message forwarded to caller");
                self.registry.touch(stream_sid);
                ControlOutcome::Delivered
            }
            Err(err) => {
                debug!(stream_sid = %stream_sid, error = %err, "Caller write failed");
                ControlOutcome::NotWritable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::connection::testing::{recording_handle, RecordingSink};

    fn handler_with_session(
        token: &str,
    ) -> (ControlHandler, Arc<RecordingSink>, Arc<BridgeMetrics>) {
        let registry = Arc::new(SessionRegistry::new());
        let metrics = Arc::new(BridgeMetrics::default());
        let (caller, sink) = recording_handle();
        registry.register(token, caller).unwrap();
        (ControlHandler::new(registry, metrics.clone()), sink, metrics)
    }

    #[test]
    fn test_media_control_reaches_caller_verbatim() {
        let (handler, sink, metrics) = handler_with_session("S1");

        let outcome =
            handler.handle(r#"{"type":"media","streamSid":"S1","media":{"payload":"QUJD"}}"#);

        assert_eq!(outcome, ControlOutcome::Delivered);
        assert_eq!(
            sink.frames(),
            vec![r#"{"event":"media","streamSid":"S1","media":{"contentType":"audio/x-mulaw;rate=8000","payload":"QUJD"}}"#.to_string()]
        );
        assert_eq!(metrics.snapshot().controls_written, 1);
    }

    #[test]
    fn test_unknown_session_is_dropped_silently() {
        let (handler, sink, metrics) = handler_with_session("S1");

        let outcome = handler.handle(r#"{"type":"mark","streamSid":"UNKNOWN","mark":{"name":"x"}}"#);

        assert_eq!(
            outcome,
            ControlOutcome::Unresolved(BridgeError::UnresolvedSession("UNKNOWN".to_string()))
        );
        assert!(sink.frames().is_empty());
        assert_eq!(metrics.snapshot().controls_dropped, 1);
    }

    #[test]
    fn test_closed_caller_is_not_written() {
        let (handler, sink, _) = handler_with_session("S1");
        sink.close();

        let outcome = handler.handle(r#"{"type":"clear","streamSid":"S1"}"#);

        assert_eq!(outcome, ControlOutcome::NotWritable);
        assert!(sink.frames().is_empty());
    }

    #[test]
    fn test_unsupported_and_malformed_controls() {
        let (handler, sink, _) = handler_with_session("S1");

        assert_eq!(
            handler.handle(r#"{"type":"transcript","streamSid":"S1"}"#),
            ControlOutcome::Ignored
        );
        assert!(matches!(
            handler.handle("garbage"),
            ControlOutcome::Rejected(BridgeError::Parse(_))
        ));
        assert!(matches!(
            handler.handle(r#"{"type":"mark","streamSid":"S1"}"#),
            ControlOutcome::Rejected(BridgeError::Validation(_))
        ));
        assert!(sink.frames().is_empty());
    }
}
