//! Transport Module - Agent to Collector Delivery
//!
//! - `signing.rs`: HMAC-SHA256 sign/verify
//! - `wire.rs`: WirePayload + SignedEnvelope (the wire contract)
//! - `outbox.rs`: durable queue and its state machine
//! - `client.rs`: MQTT / HTTPS publishers
//! - `sync.rs`: delivery loop and transport health

pub mod client;
pub mod outbox;
pub mod signing;
pub mod sync;
pub mod wire;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Notify;

use crate::logic::config::types::OutboundMode;
use crate::logic::config::ConfigSnapshot;
use crate::logic::detection::Alert;
use rusqlite::Connection;

use crate::logic::store::StoreError;

pub use client::{AnyPublisher, HttpsPublisher, MqttPublisher, Publisher};
pub use outbox::{Outbox, OutboxCounts, OutboxState};
pub use sync::{DeliveryWorker, SharedStatus, TransportStatus};
pub use wire::{SignedEnvelope, WirePayload};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport failure: {0}")]
    Failure(String),
    #[error("collector rejected the signature")]
    SignatureMismatch,
    #[error("collector rejected the alert ({0}): {1}")]
    Rejected(u16, String),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("outbox: {0}")]
    Store(#[from] StoreError),
}

/// Producer side of the outbox: serialise once, persist, wake the worker
#[derive(Clone)]
pub struct AlertSink {
    outbox: Outbox,
    agent_id: String,
    wake: Arc<Notify>,
}

impl AlertSink {
    pub fn new(outbox: Outbox, agent_id: &str, wake: Arc<Notify>) -> Self {
        Self {
            outbox,
            agent_id: agent_id.to_string(),
            wake,
        }
    }

    /// Durable once this returns Ok; redelivery of a queued alert is a no-op
    pub fn submit(&self, alert: &Alert) -> Result<bool, TransportError> {
        self.submit_with(alert, |_| Ok(()))
    }

    /// `submit`, committing `also` atomically with the outbox row
    pub fn submit_with<F>(&self, alert: &Alert, also: F) -> Result<bool, TransportError>
    where
        F: FnOnce(&Connection) -> Result<(), StoreError>,
    {
        let payload = WirePayload::from_alert(alert, &self.agent_id).to_bytes()?;
        let inserted = self.outbox.enqueue_with(alert.id, &payload, also)?;
        if inserted {
            log::debug!("[Transport] Alert #{} PENDING ({} bytes)", alert.id, payload.len());
            self.wake.notify_one();
        }
        Ok(inserted)
    }
}

/// Publisher for the snapshot's outbound mode
pub fn build_publisher(snapshot: &ConfigSnapshot) -> Result<AnyPublisher, TransportError> {
    let cfg = &snapshot.config;
    match cfg.outbound.mode {
        OutboundMode::Https => Ok(AnyPublisher::Https(HttpsPublisher::new(&cfg.outbound.https)?)),
        OutboundMode::Mqtt => {
            let client_id = cfg
                .outbound
                .mqtt
                .client_id
                .clone()
                .unwrap_or_else(|| format!("agent-{}", cfg.agent.id));
            Ok(AnyPublisher::Mqtt(MqttPublisher::new(
                &cfg.outbound.mqtt,
                &client_id,
                snapshot.mqtt_password.clone(),
            )?))
        }
    }
}
