//! # Application State Management
//!
//! Everything the WebSocket actors and HTTP handlers share lives here. Each
//! component of the bridge core is built once in [`AppState::new`] and handed
//! out by `Arc`, so every worker thread sees the same registry, observer set
//! and backend link.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - Multiple workers and actors hold the same component at once
//! - The component is dropped when the last reference goes away
//!
//! ### Atomics for counters
//! - `AtomicU64` lets every connection bump a counter without taking a lock
//! - `Ordering::Relaxed` is enough: the counters are independent tallies

use crate::bridge::control::ControlHandler;
use crate::bridge::fanout::ObserverSet;
use crate::bridge::registry::SessionRegistry;
use crate::bridge::router::{CallbackTarget, ChannelUsed, DeliveryRouter};
use crate::bridge::supervisor::{BackendLink, ReconnectionSupervisor};
use crate::config::AppConfig;
use crate::error::DeliveryFailed;
use anyhow::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared state handed to every handler and actor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<SessionRegistry>,
    pub observers: Arc<ObserverSet>,
    pub link: Arc<BackendLink>,
    pub router: Arc<DeliveryRouter>,
    pub control: Arc<ControlHandler>,
    pub metrics: Arc<BridgeMetrics>,
    pub start_time: Instant,
}

impl AppState {
    /// Build the bridge core from configuration.
    ///
    /// Fails only if the callback HTTP client cannot be constructed.
    pub fn new(config: AppConfig) -> Result<Self> {
        let metrics = Arc::new(BridgeMetrics::default());
        let registry = Arc::new(SessionRegistry::new());
        let observers = Arc::new(ObserverSet::new());
        let link = Arc::new(BackendLink::new());

        let callback = match &config.bridge.callback_url {
            Some(url) => Some(CallbackTarget::new(
                url.clone(),
                config.bridge.callback_timeout(),
            )?),
            None => None,
        };

        let router = Arc::new(DeliveryRouter::new(link.clone(), callback, metrics.clone()));
        let control = Arc::new(ControlHandler::new(registry.clone(), metrics.clone()));

        Ok(Self {
            config: Arc::new(config),
            registry,
            observers,
            link,
            router,
            control,
            metrics,
            start_time: Instant::now(),
        })
    }

    /// Supervisor for the persistent backend socket, if one is configured.
    pub fn backend_supervisor(&self) -> Option<ReconnectionSupervisor> {
        self.config.bridge.backend_ws_url.as_ref().map(|url| {
            ReconnectionSupervisor::new(
                url.clone(),
                self.config.bridge.reconnect_delay(),
                self.link.clone(),
                self.control.clone(),
            )
        })
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Running totals of what the bridge did with each frame.
///
/// Drops are counted here so that best-effort delivery stays visible from the
/// health endpoint.
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    caller_frames: AtomicU64,
    rejected_caller_frames: AtomicU64,
    delivered_persistent: AtomicU64,
    delivered_callback: AtomicU64,
    delivery_failures: AtomicU64,
    controls_written: AtomicU64,
    controls_dropped: AtomicU64,
    observer_writes: AtomicU64,
    sessions_swept: AtomicU64,
}

/// Point-in-time copy of [`BridgeMetrics`].
#[derive(Debug, Default, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub caller_frames: u64,
    pub rejected_caller_frames: u64,
    pub delivered_persistent: u64,
    pub delivered_callback: u64,
    pub delivery_failures: u64,
    pub controls_written: u64,
    pub controls_dropped: u64,
    pub observer_writes: u64,
    pub sessions_swept: u64,
}

impl BridgeMetrics {
    pub fn record_caller_frame(&self) {
        self.caller_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_caller_frame(&self) {
        self.rejected_caller_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self, result: &Result<ChannelUsed, DeliveryFailed>) {
        let counter = match result {
            Ok(ChannelUsed::Persistent) => &self.delivered_persistent,
            Ok(ChannelUsed::Callback) => &self.delivered_callback,
            Err(_) => &self.delivery_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_control_written(&self) {
        self.controls_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_control_dropped(&self) {
        self.controls_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_observer_writes(&self, count: usize) {
        self.observer_writes.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_sessions_swept(&self, count: usize) {
        self.sessions_swept.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            caller_frames: self.caller_frames.load(Ordering::Relaxed),
            rejected_caller_frames: self.rejected_caller_frames.load(Ordering::Relaxed),
            delivered_persistent: self.delivered_persistent.load(Ordering::Relaxed),
            delivered_callback: self.delivered_callback.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            controls_written: self.controls_written.load(Ordering::Relaxed),
            controls_dropped: self.controls_dropped.load(Ordering::Relaxed),
            observer_writes: self.observer_writes.load(Ordering::Relaxed),
            sessions_swept: self.sessions_swept.load(Ordering::Relaxed),
        }
    }
}
