//! Collector Clients
//!
//! Two interchangeable publishers behind one trait:
//! - `MqttPublisher`: persistent TLS session, QoS 1, waits for PUBACK (default)
//! - `HttpsPublisher`: one TLS POST per alert, 2xx = ack, 401 = signature rejected
//!
//! Both send the same bytes: a JSON `SignedEnvelope`.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport};

use crate::logic::config::types::{HttpsConfig, MqttConfig};

use super::TransportError;

/// One delivery attempt; Ok means the collector acknowledged it
#[allow(async_fn_in_trait)]
pub trait Publisher {
    async fn publish(&mut self, alert_id: u64, body: &[u8]) -> Result<(), TransportError>;

    fn describe(&self) -> String;
}

// ============================================================================
// HTTPS
// ============================================================================

pub struct HttpsPublisher {
    url: String,
    http_client: reqwest::Client,
}

impl HttpsPublisher {
    pub fn new(cfg: &HttpsConfig) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(cfg.timeout_secs.max(1)));
        if let Some(cafile) = &cfg.cafile {
            let pem = std::fs::read(cafile)
                .map_err(|e| TransportError::Failure(format!("cafile {:?}: {}", cafile, e)))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| TransportError::Failure(format!("cafile {:?}: {}", cafile, e)))?;
            builder = builder.add_root_certificate(cert);
        }
        let http_client = builder
            .build()
            .map_err(|e| TransportError::Failure(format!("http client: {}", e)))?;
        Ok(Self {
            url: cfg.url.clone(),
            http_client,
        })
    }
}

impl Publisher for HttpsPublisher {
    async fn publish(&mut self, alert_id: u64, body: &[u8]) -> Result<(), TransportError> {
        let response = self
            .http_client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| TransportError::Failure(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            log::debug!("[Transport] Alert #{} accepted ({})", alert_id, status);
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        match status.as_u16() {
            401 => Err(TransportError::SignatureMismatch),
            code @ 400..=499 => Err(TransportError::Rejected(code, text)),
            code => Err(TransportError::Failure(format!("collector returned {}: {}", code, text))),
        }
    }

    fn describe(&self) -> String {
        format!("https {}", self.url)
    }
}

// ============================================================================
// MQTT
// ============================================================================

/// Maps packet ids back to alert ids. With a persistent session a PUBACK
/// may belong to an earlier attempt that timed out, or a publish may be
/// retransmitted after reconnect under the same id.
#[derive(Debug, Default)]
pub(crate) struct AckTracker {
    /// Requested but not yet written to the socket, oldest first
    unsent: VecDeque<u64>,
    in_flight: HashMap<u16, u64>,
}

impl AckTracker {
    pub(crate) fn requested(&mut self, alert_id: u64) {
        self.unsent.push_back(alert_id);
    }

    /// A PUBLISH went out. Retransmits reuse a known id and are ignored.
    pub(crate) fn sent(&mut self, pkid: u16) {
        if self.in_flight.contains_key(&pkid) {
            return;
        }
        if let Some(alert_id) = self.unsent.pop_front() {
            self.in_flight.insert(pkid, alert_id);
        }
    }

    /// The alert a PUBACK acknowledges, if it is one of ours
    pub(crate) fn acked(&mut self, pkid: u16) -> Option<u64> {
        self.in_flight.remove(&pkid)
    }
}

pub struct MqttPublisher {
    client: AsyncClient,
    eventloop: EventLoop,
    topic: String,
    ack_timeout: Duration,
    endpoint: String,
    acks: AckTracker,
}

impl MqttPublisher {
    pub fn new(cfg: &MqttConfig, client_id: &str, password: Option<String>) -> Result<Self, TransportError> {
        let mut options = MqttOptions::new(client_id, cfg.host.clone(), cfg.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(false);
        if let Some(user) = &cfg.username {
            options.set_credentials(user.clone(), password.unwrap_or_default());
        }
        if cfg.tls {
            let transport = match &cfg.cafile {
                Some(cafile) => {
                    let ca = std::fs::read(cafile)
                        .map_err(|e| TransportError::Failure(format!("cafile {:?}: {}", cafile, e)))?;
                    Transport::tls(ca, None, None)
                }
                None => Transport::tls_with_default_config(),
            };
            options.set_transport(transport);
        }

        let (client, eventloop) = AsyncClient::new(options, 16);
        Ok(Self {
            client,
            eventloop,
            topic: cfg.topic.clone(),
            ack_timeout: Duration::from_secs(cfg.ack_timeout_secs.max(1)),
            endpoint: format!("mqtt{} {}:{}/{}", if cfg.tls { "s" } else { "" }, cfg.host, cfg.port, cfg.topic),
            acks: AckTracker::default(),
        })
    }
}

impl Publisher for MqttPublisher {
    async fn publish(&mut self, alert_id: u64, body: &[u8]) -> Result<(), TransportError> {
        self.client
            .publish(self.topic.clone(), QoS::AtLeastOnce, false, body.to_vec())
            .await
            .map_err(|e| TransportError::Failure(format!("mqtt request: {}", e)))?;
        self.acks.requested(alert_id);

        // Drive the connection until the PUBACK carrying our packet id arrives
        let deadline = tokio::time::Instant::now() + self.ack_timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.eventloop.poll()).await {
                Err(_) => {
                    return Err(TransportError::Failure(format!(
                        "no PUBACK for alert #{} within {:?}",
                        alert_id, self.ack_timeout
                    )))
                }
                Ok(Ok(Event::Outgoing(Outgoing::Publish(pkid)))) => self.acks.sent(pkid),
                Ok(Ok(Event::Incoming(Packet::PubAck(ack)))) => match self.acks.acked(ack.pkid) {
                    Some(id) if id == alert_id => return Ok(()),
                    Some(id) => log::debug!("[Transport] Late PUBACK for alert #{}", id),
                    None => log::debug!("[Transport] PUBACK for unknown packet {}", ack.pkid),
                },
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    log::info!("[Transport] MQTT connected ({:?})", ack.code);
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(TransportError::Failure(format!("mqtt: {}", e))),
            }
        }
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}

// ============================================================================
// MODE SELECTION
// ============================================================================

/// The configured publisher
pub enum AnyPublisher {
    Https(HttpsPublisher),
    Mqtt(MqttPublisher),
}

impl Publisher for AnyPublisher {
    async fn publish(&mut self, alert_id: u64, body: &[u8]) -> Result<(), TransportError> {
        match self {
            AnyPublisher::Https(p) => p.publish(alert_id, body).await,
            AnyPublisher::Mqtt(p) => p.publish(alert_id, body).await,
        }
    }

    fn describe(&self) -> String {
        match self {
            AnyPublisher::Https(p) => p.describe(),
            AnyPublisher::Mqtt(p) => p.describe(),
        }
    }
}
