//! # Bridge Core
//!
//! Session routing and delivery failover between the call-audio transport and
//! the automation backend.
//!
//! ## Key Components:
//! - **Connection**: handle + sink abstraction over a live WebSocket
//! - **Registry**: session token → caller connection
//! - **Translator**: caller frames / control messages ↔ canonical envelopes
//! - **Router**: persistent socket first, HTTP callback second
//! - **Supervisor**: keeps the persistent backend socket dialed
//! - **Control**: backend commands routed back to the right caller
//! - **Fanout**: live copy of caller traffic for observer connections

pub mod connection;
pub mod control;
pub mod fanout;
pub mod registry;
pub mod router;
pub mod supervisor;
pub mod translator;
