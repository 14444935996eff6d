//! Rapport de santé périodique, construit à partir de la dernière vue publiée.

use super::monitor::MonitorView;
use super::types::{ComponentSummary, EmergencyState, HealthStatus, Priority};
use serde::Serialize;
use std::collections::BTreeMap;
use time::OffsetDateTime;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub status: HealthStatus,
    pub score: f64,
    pub category_averages: BTreeMap<Priority, f64>,
    pub components: Vec<ComponentSummary>,
    pub open_breakers: Vec<String>,
    pub emergency: EmergencyState,
    /// Écart de score entre le plus ancien et le plus récent snapshot conservé
    pub trend: Option<f64>,
    pub cycles: u64,
}

impl HealthReport {
    pub fn from_view(view: &MonitorView) -> Self {
        let (status, score, category_averages) = match &view.system {
            Some(s) => (s.status, s.score, s.category_averages.clone()),
            None => (HealthStatus::Unknown, 1.0, BTreeMap::new()),
        };

        let trend = match (view.history.first(), view.history.last()) {
            (Some(first), Some(last)) if view.history.len() >= 2 => Some(last.score - first.score),
            _ => None,
        };

        Self {
            generated_at: OffsetDateTime::now_utc(),
            status,
            score,
            category_averages,
            components: view.components.clone(),
            open_breakers: view.breakers.iter().filter(|(_, b)| b.is_open).map(|(id, _)| id.clone()).collect(),
            emergency: view.emergency.clone(),
            trend,
            cycles: view.cycles,
        }
    }
}
