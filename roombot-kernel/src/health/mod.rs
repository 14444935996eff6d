//! Surveillance de santé : checks par composant, agrégation pondérée, mode urgence.

pub mod monitor;
pub mod prediction;
pub mod report;
pub mod types;

pub use monitor::{ComponentConfig, HealthMonitor, MonitorError, MonitorHandle, MonitorView};
pub use prediction::{Prediction, PredictionParams};
pub use report::HealthReport;
pub use types::{
    ComponentSummary, EmergencyState, HealthResult, HealthStatus, Priority, RecoveryAction, RecoveryStep,
    SystemHealthSnapshot, Thresholds,
};
