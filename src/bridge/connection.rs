//! # Connection Handles
//!
//! A connection handle is what the registry and the observer set hold on to:
//! a stable identifier plus something that can accept a text frame. The
//! WebSocket actors hand out their own `Recipient` as the sink, so the core
//! never touches actix directly.

use crate::error::{BridgeError, BridgeResult};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Identifier of one physical connection (caller or observer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Write side of a connection.
///
/// `write_text` must not block; implementations queue the frame on the
/// transport and return.
pub trait FrameSink: Send + Sync {
    /// Whether the transport can currently take a frame.
    fn is_writable(&self) -> bool;

    /// Queue one text frame on the transport.
    fn write_text(&self, text: String) -> BridgeResult<()>;
}

/// Cheap, cloneable reference to a live connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sink: Arc<dyn FrameSink>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, sink: Arc<dyn FrameSink>) -> Self {
        Self { id, sink }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_writable(&self) -> bool {
        self.sink.is_writable()
    }

    /// Write a frame, refusing early when the transport is known to be gone.
    pub fn write_text(&self, text: String) -> BridgeResult<()> {
        if !self.sink.is_writable() {
            return Err(BridgeError::Connection(format!(
                "connection {} is not writable",
                self.id
            )));
        }
        self.sink.write_text(text)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("writable", &self.sink.is_writable())
            .finish()
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory sink used by the core's unit tests.

    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    pub struct RecordingSink {
        closed: AtomicBool,
        frames: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        pub fn frames(&self) -> Vec<String> {
            self.frames.lock().clone()
        }
    }

    impl FrameSink for RecordingSink {
        fn is_writable(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        fn write_text(&self, text: String) -> BridgeResult<()> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(BridgeError::Connection("sink closed".to_string()));
            }
            self.frames.lock().push(text);
            Ok(())
        }
    }

    /// Build a handle around a fresh recording sink.
    pub fn recording_handle() -> (ConnectionHandle, Arc<RecordingSink>) {
        let sink = RecordingSink::new();
        let handle = ConnectionHandle::new(ConnectionId::new(), sink.clone());
        (handle, sink)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::recording_handle;

    #[test]
    fn test_closed_handle_refuses_writes() {
        let (handle, sink) = recording_handle();
        assert!(handle.write_text("one".to_string()).is_ok());

        sink.close();
        assert!(!handle.is_writable());
        assert!(handle.write_text("two".to_string()).is_err());
        assert_eq!(sink.frames(), vec!["one".to_string()]);
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let (a, _) = recording_handle();
        let (b, _) = recording_handle();
        assert_ne!(a.id(), b.id());
    }
}
