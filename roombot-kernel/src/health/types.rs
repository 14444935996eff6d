//! Types du moniteur de santé : priorités, statuts, résultats, snapshots, état d'urgence.

use crate::breaker::BreakerSignal;
use crate::config::ThresholdsConf;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;
use uuid::Uuid;

/// Priorité d'un composant ; l'ordre de déclaration est l'ordre de gravité
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn weight(self) -> f64 {
        match self {
            Priority::Critical => 4.0,
            Priority::High => 3.0,
            Priority::Medium => 2.0,
            Priority::Low => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Degraded,
    Critical,
    Failed,
    Unknown,
}

impl HealthStatus {
    /// Rang de gravité des statuts gradués (Unknown hors échelle)
    pub fn severity(self) -> Option<u8> {
        match self {
            HealthStatus::Healthy => Some(0),
            HealthStatus::Warning => Some(1),
            HealthStatus::Degraded => Some(2),
            HealthStatus::Critical => Some(3),
            HealthStatus::Failed => Some(4),
            HealthStatus::Unknown => None,
        }
    }

    /// Statuts qui déclenchent le mode urgence
    pub fn is_emergency(self) -> bool {
        matches!(self, HealthStatus::Critical | HealthStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
            HealthStatus::Failed => "failed",
            HealthStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Thresholds = ThresholdsConf;

impl ThresholdsConf {
    /// Comparaison ordonnée aux seuils : healthy ≥ warning ≥ degraded ≥ critical, sinon failed
    pub fn classify(&self, score: f64) -> HealthStatus {
        if score >= self.healthy {
            HealthStatus::Healthy
        } else if score >= self.warning {
            HealthStatus::Warning
        } else if score >= self.degraded {
            HealthStatus::Degraded
        } else if score >= self.critical {
            HealthStatus::Critical
        } else {
            HealthStatus::Failed
        }
    }
}

/// Verdict d'un check de composant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResult {
    pub status: HealthStatus,
    /// 1.0 = pleinement sain
    pub score: f64,
    pub details: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breaker: Option<BreakerSignal>,
}

impl HealthResult {
    pub fn new(status: HealthStatus, score: f64) -> Self {
        let score = if status == HealthStatus::Failed { 0.0 } else { clamp_score(score) };
        Self { status, score, details: serde_json::Value::Null, breaker: None }
    }

    pub fn healthy() -> Self {
        Self::new(HealthStatus::Healthy, 1.0)
    }

    /// Statut déduit du score avec les seuils par défaut
    pub fn from_score(score: f64) -> Self {
        let score = clamp_score(score);
        Self::new(ThresholdsConf::default().classify(score), score)
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::new(HealthStatus::Failed, 0.0).with_details(serde_json::json!({ "error": error.into() }))
    }

    pub fn unknown(reason: impl Into<String>) -> Self {
        Self::new(HealthStatus::Unknown, 1.0).with_details(serde_json::json!({ "reason": reason.into() }))
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_breaker_signal(mut self, signal: Option<BreakerSignal>) -> Self {
        self.breaker = signal;
        self
    }

    /// Rend le résultat cohérent avec la table de seuils :
    /// score borné, failed ⇒ 0, statut gradué recalculé depuis le score
    pub fn normalized(mut self, thresholds: &Thresholds) -> Self {
        self.score = clamp_score(self.score);
        match self.status {
            HealthStatus::Failed => self.score = 0.0,
            HealthStatus::Unknown => {}
            _ => self.status = thresholds.classify(self.score),
        }
        self
    }
}

fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// Vue publique d'un composant enregistré
#[derive(Debug, Clone, Serialize)]
pub struct ComponentSummary {
    pub id: String,
    pub priority: Priority,
    pub kind: String,
    pub status: HealthStatus,
    pub score: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_check: Option<OffsetDateTime>,
    pub metrics: Option<serde_json::Value>,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealthSnapshot {
    pub status: HealthStatus,
    pub score: f64,
    pub category_averages: BTreeMap<Priority, f64>,
    pub failed_components: Vec<String>,
    pub component_count: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Restart,
    SafeMode,
}

/// Étape du plan de reprise (indicatif : le kernel ne l'exécute pas)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryStep {
    pub order: usize,
    pub action: RecoveryAction,
    pub component: Option<String>,
    pub description: String,
    pub estimated_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EmergencyState {
    pub is_active: bool,
    pub episode_id: Option<Uuid>,
    pub triggered_by: Vec<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    pub recovery_plan: Vec<RecoveryStep>,
    #[serde(skip)]
    pub(crate) started: Option<tokio::time::Instant>,
}
