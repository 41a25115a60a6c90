//! # Fanout Distributor
//!
//! Keeps the set of attached observer connections and copies every
//! caller-originated envelope to each of them. Membership changes only on
//! explicit connect/disconnect; a connection that is not writable at broadcast
//! time is skipped and stays in the set.

use crate::bridge::connection::{ConnectionHandle, ConnectionId};
use crate::bridge::translator::Envelope;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// Result of one broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub skipped: usize,
}

#[derive(Debug, Default)]
pub struct ObserverSet {
    observers: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, observer: ConnectionHandle) {
        self.observers.write().insert(observer.id(), observer);
    }

    /// Remove an observer. Detaching an unknown id is a no-op.
    pub fn detach(&self, id: ConnectionId) -> bool {
        self.observers.write().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    /// Write `envelope` to every writable observer.
    pub fn broadcast(&self, envelope: &Envelope) -> FanoutReport {
        let observers: Vec<ConnectionHandle> = self.observers.read().values().cloned().collect();
        let mut report = FanoutReport::default();

        if observers.is_empty() {
            return report;
        }

        let text = envelope.to_text();
        for observer in observers {
            if !observer.is_writable() {
                report.skipped += 1;
                continue;
            }

            match observer.write_text(text.clone()) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    debug!(connection = %observer.id(), error = %err, "Skipping observer");
                    report.skipped += 1;
                }
            }
        }

        report
    }
}
