//! Contrat du transport vers le service de salons.
//!
//! Le superviseur pilote le transport mais ne l'implémente pas : `mqtt::MqttTransport`
//! en production, `roombot_devkit::MockTransport` dans les tests.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Erreurs typées du transport.
/// `RateLimited` signale que le service a déjà fixé le prochain essai.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("rate limited by remote service, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, TransportError::RateLimited { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
}

/// Message reçu dans un salon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMessage {
    pub id: String,
    #[serde(default)]
    pub channel: String,
    pub from: String,
    pub body: String,
}

/// Événements remontés par la couche socket
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Disconnected { reason: String },
    Reconnecting,
    StateChange(TransportState),
    Message(RoomMessage),
}

pub trait Transport: Send + Sync + 'static {
    fn connect(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn disconnect(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn join_channel(&mut self, channel: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn login(&mut self, user: &str, pass: Option<&str>) -> impl Future<Output = Result<(), TransportError>> + Send;
}
