/**
 * BUS D'ÉVÉNEMENTS TYPÉ - Pub/sub interne du kernel
 *
 * Un bus par type d'événement, avec une liste explicite d'abonnés détenue
 * par le composant émetteur. Chaque événement porte son topic
 * (`health:system:changed`, `connection:reconnected`...).
 */

use crate::health::{HealthReport, HealthStatus, RecoveryStep, SystemHealthSnapshot};
use crate::state::{new_state, Shared};
use crate::transport::RoomMessage;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

pub trait Topic {
    fn topic(&self) -> &'static str;
}

/// Liste d'abonnés ; un abonné dont le receiver est fermé est retiré au prochain emit
pub struct EventBus<E> {
    subscribers: Shared<Vec<mpsc::UnboundedSender<E>>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self { subscribers: self.subscribers.clone() }
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self { subscribers: new_state(Vec::new()) }
    }
}

impl<E: Clone + Topic> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: E) {
        debug!("[events] {}", event.topic());
        self.subscribers.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Cycle de vie de la connexion au service de salons
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SupervisorEvent {
    Connecting { attempt: u32 },
    Reconnected { attempts: u32 },
    Disconnected { reason: String },
    Throttled { wait_ms: u64 },
    ConnectFailed { attempt: u32, error: String, rate_limited: bool },
    RetryScheduled { delay_ms: u64, next_attempt: u32 },
    BackoffIncreased { delay_ms: u64, attempts_last_hour: usize },
    GaveUp { attempts: u32 },
    Reset,
}

impl Topic for SupervisorEvent {
    fn topic(&self) -> &'static str {
        match self {
            SupervisorEvent::Connecting { .. } => "connection:connecting",
            SupervisorEvent::Reconnected { .. } => "connection:reconnected",
            SupervisorEvent::Disconnected { .. } => "connection:disconnected",
            SupervisorEvent::Throttled { .. } => "connection:throttled",
            SupervisorEvent::ConnectFailed { .. } => "connection:failed",
            SupervisorEvent::RetryScheduled { .. } => "connection:reconnecting",
            SupervisorEvent::BackoffIncreased { .. } => "connection:backoff",
            SupervisorEvent::GaveUp { .. } => "connection:max_attempts_exceeded",
            SupervisorEvent::Reset => "connection:reset",
        }
    }
}

/// Événements du moniteur de santé, consommés par les reporters
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HealthEvent {
    SystemChanged {
        from: Option<HealthStatus>,
        to: HealthStatus,
        score: f64,
    },
    EmergencyActivated {
        episode_id: Uuid,
        triggered_by: Vec<String>,
        score: f64,
        recovery_plan: Vec<RecoveryStep>,
    },
    EmergencyResolved {
        episode_id: Option<Uuid>,
        triggered_by: Vec<String>,
        duration_ms: u64,
        score: f64,
    },
    CheckCompleted {
        snapshot: SystemHealthSnapshot,
        duration_ms: u64,
    },
    BreakerOpened {
        component: String,
        reason: String,
        failure_count: u32,
    },
    BreakerClosed {
        component: String,
        open_for_ms: u64,
    },
    PredictionRisk {
        component: String,
        current: f64,
        projected: f64,
        slope: f64,
    },
    Report(Box<HealthReport>),
}

impl Topic for HealthEvent {
    fn topic(&self) -> &'static str {
        match self {
            HealthEvent::SystemChanged { .. } => "health:system:changed",
            HealthEvent::EmergencyActivated { .. } => "health:emergency:activated",
            HealthEvent::EmergencyResolved { .. } => "health:emergency:resolved",
            HealthEvent::CheckCompleted { .. } => "health:check:completed",
            HealthEvent::BreakerOpened { .. } => "circuit:breaker:opened",
            HealthEvent::BreakerClosed { .. } => "circuit:breaker:closed",
            HealthEvent::PredictionRisk { .. } => "health:prediction:risk",
            HealthEvent::Report(_) => "health:report",
        }
    }
}

impl Topic for RoomMessage {
    fn topic(&self) -> &'static str {
        "room:message"
    }
}
