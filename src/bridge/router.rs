//! # Delivery Router
//!
//! Hands caller envelopes to the backend over exactly one channel per call:
//!
//! 1. The persistent backend socket, when it is open
//! 2. Otherwise the HTTP callback, when one is configured
//! 3. Otherwise nothing: the envelope is reported as undeliverable
//!
//! Failed envelopes are discarded. Retrying happens only at the connection
//! level, in the reconnection supervisor.

use crate::bridge::supervisor::BackendLink;
use crate::bridge::translator::Envelope;
use crate::error::DeliveryFailed;
use crate::state::BridgeMetrics;
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Channel that accepted an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelUsed {
    Persistent,
    Callback,
}

/// One-shot HTTP delivery target.
#[derive(Debug, Clone)]
pub struct CallbackTarget {
    url: String,
    client: reqwest::Client,
}

impl CallbackTarget {
    /// Build a callback target whose requests give up after `timeout`.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, envelope: &Envelope) -> Result<(), DeliveryFailed> {
        let response = self
            .client
            .post(&self.url)
            .json(envelope)
            .send()
            .await
            .map_err(|err| DeliveryFailed::ChannelError(format!("callback request failed: {}", err)))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryFailed::ChannelError(format!(
                "callback returned status {}",
                status.as_u16()
            )))
        }
    }
}

pub struct DeliveryRouter {
    link: Arc<BackendLink>,
    callback: Option<CallbackTarget>,
    metrics: Arc<BridgeMetrics>,
}

impl DeliveryRouter {
    pub fn new(
        link: Arc<BackendLink>,
        callback: Option<CallbackTarget>,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            link,
            callback,
            metrics,
        }
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Deliver one envelope to the backend.
    pub async fn deliver(&self, envelope: &Envelope) -> Result<ChannelUsed, DeliveryFailed> {
        let result = self.try_deliver(envelope).await;
        self.metrics.record_delivery(&result);
        result
    }

    async fn try_deliver(&self, envelope: &Envelope) -> Result<ChannelUsed, DeliveryFailed> {
        if self.link.is_open() {
            self.link.send(envelope.to_text()).await?;
            return Ok(ChannelUsed::Persistent);
        }

        match &self.callback {
            Some(callback) => {
                debug!(url = %callback.url(), kind = envelope.kind(), "Delivering via callback");
                callback.post(envelope).await?;
                Ok(ChannelUsed::Callback)
            }
            None => Err(DeliveryFailed::NoChannelConfigured),
        }
    }
}
