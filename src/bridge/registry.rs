//! # Session Registry
//!
//! Maps a call's session token (`streamSid`) to the caller connection that
//! owns it. Control messages coming back from the backend are routed through
//! this map, so a token always resolves to at most one connection.
//!
//! ## Session Lifecycle:
//! 1. **Registered**: a `start` frame carrying the token arrives
//! 2. **Active**: every caller frame for the token refreshes its activity time
//! 3. **Removed**: `stop` frame, caller connection closed, or the idle sweep
//!
//! Registering a token that is already bound to another connection replaces
//! the binding. The previous connection is left open; only the mapping moves.

use crate::bridge::connection::{ConnectionHandle, ConnectionId};
use crate::error::{BridgeError, BridgeResult};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

/// One registered call session.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub connection: ConnectionHandle,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Token → caller connection map.
///
/// Each operation takes the lock for its own duration only, so callers never
/// observe a half-applied update.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `token` to `connection`.
    ///
    /// ## Returns:
    /// - **Ok(None)**: new session, or the same connection registering again
    /// - **Ok(Some(id))**: the token was bound to a different connection `id`,
    ///   which has now been replaced
    /// - **Err(Validation)**: empty token, nothing stored
    pub fn register(
        &self,
        token: &str,
        connection: ConnectionHandle,
    ) -> BridgeResult<Option<ConnectionId>> {
        if token.is_empty() {
            return Err(BridgeError::Validation(
                "cannot register an empty session token".to_string(),
            ));
        }

        let now = Utc::now();
        let mut sessions = self.sessions.write();

        let (created_at, replaced) = match sessions.get(token) {
            Some(existing) if existing.connection.id() == connection.id() => {
                (existing.created_at, None)
            }
            Some(existing) => (now, Some(existing.connection.id())),
            None => (now, None),
        };

        sessions.insert(
            token.to_string(),
            SessionEntry {
                connection,
                created_at,
                last_activity: now,
            },
        );

        Ok(replaced)
    }

    /// Look up the connection owning `token`. `None` is a normal outcome.
    pub fn resolve(&self, token: &str) -> Option<ConnectionHandle> {
        self.sessions
            .read()
            .get(token)
            .map(|entry| entry.connection.clone())
    }

    /// Snapshot of a session's bookkeeping.
    #[cfg(test)]
    pub fn get(&self, token: &str) -> Option<SessionEntry> {
        self.sessions.read().get(token).cloned()
    }

    /// Refresh the activity timestamp for `token`, if it is registered.
    pub fn touch(&self, token: &str) -> bool {
        match self.sessions.write().get_mut(token) {
            Some(entry) => {
                entry.last_activity = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Remove the mapping for `token` while `connection` still owns it.
    ///
    /// Removing an absent token, or one that another connection has since
    /// taken over, is a no-op.
    pub fn unregister_token(&self, token: &str, connection: ConnectionId) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(token) {
            Some(entry) if entry.connection.id() == connection => {
                sessions.remove(token);
                true
            }
            _ => false,
        }
    }

    /// Remove every mapping owned by `connection`. Returns the removed tokens.
    pub fn unregister_connection(&self, connection: ConnectionId) -> Vec<String> {
        let mut sessions = self.sessions.write();
        let tokens: Vec<String> = sessions
            .iter()
            .filter(|(_, entry)| entry.connection.id() == connection)
            .map(|(token, _)| token.clone())
            .collect();

        for token in &tokens {
            sessions.remove(token);
        }

        tokens
    }

    /// Drop sessions that have seen no traffic for longer than `max_idle`.
    pub fn sweep_idle(&self, max_idle: Duration) -> Vec<String> {
        let max_idle = chrono::Duration::from_std(max_idle)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = Utc::now()
            .checked_sub_signed(max_idle)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.sweep_inactive_since(cutoff)
    }

    fn sweep_inactive_since(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let mut sessions = self.sessions.write();
        let stale: Vec<String> = sessions
            .iter()
            .filter(|(_, entry)| entry.last_activity <= cutoff)
            .map(|(token, _)| token.clone())
            .collect();

        for token in &stale {
            sessions.remove(token);
        }

        stale
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// All registered tokens.
    pub fn tokens(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }
}
