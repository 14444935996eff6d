/**
 * PROBES - Checks de santé fournis par le kernel lui-même
 *
 * - connexion : lit le snapshot publié par le superviseur (jamais l'état interne)
 * - processus : mémoire résidente lue dans /proc, comparée à une limite
 */

use crate::breaker::FailureStreak;
use crate::health::{ComponentConfig, HealthResult, HealthStatus, Priority};
use crate::supervisor::{ConnectionSnapshot, ConnectionStatus};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

/// Score de la connexion d'après son dernier snapshot
pub fn connection_health_check(snapshot: &ConnectionSnapshot) -> HealthResult {
    // backoff au-dessus de la base : reconnexions freinées par le plafond horaire
    let paced = snapshot.backoff.current_ms > snapshot.backoff.base_ms;
    let (status, score) = match (snapshot.status, paced) {
        (ConnectionStatus::Connected, _) => (HealthStatus::Healthy, 1.0),
        (ConnectionStatus::Connecting | ConnectionStatus::Throttled, false) => (HealthStatus::Degraded, 0.75),
        (ConnectionStatus::Connecting | ConnectionStatus::Throttled, true) => (HealthStatus::Critical, 0.6),
        (ConnectionStatus::Disconnected, false) => (HealthStatus::Critical, 0.55),
        (ConnectionStatus::Disconnected, true) => (HealthStatus::Critical, 0.5),
        (ConnectionStatus::Failed, _) => (HealthStatus::Failed, 0.0),
    };

    HealthResult::new(status, score).with_details(serde_json::json!({
        "status": snapshot.status,
        "attempts": snapshot.attempts,
        "max_attempts": snapshot.max_attempts,
        "attempts_last_hour": snapshot.attempts_last_hour,
        "backoff_ms": snapshot.backoff.current_ms,
        "last_error": snapshot.last_error,
    }))
}

/// Composant "connexion" tel que vu par le moniteur
pub struct ConnectionProbe {
    snapshots: watch::Receiver<ConnectionSnapshot>,
    streak: Mutex<FailureStreak>,
}

impl ConnectionProbe {
    pub fn new(snapshots: watch::Receiver<ConnectionSnapshot>, breaker_threshold: u32) -> Arc<Self> {
        Arc::new(Self { snapshots, streak: Mutex::new(FailureStreak::new(breaker_threshold)) })
    }

    pub fn check(&self) -> HealthResult {
        let snapshot = self.snapshots.borrow().clone();
        let connected = snapshot.status == ConnectionStatus::Connected;
        let signal = self.streak.lock().observe(connected, || {
            let last_error = snapshot.last_error.as_deref().unwrap_or("none");
            format!("no connection for consecutive checks (last error: {last_error})")
        });
        connection_health_check(&snapshot).with_breaker_signal(signal)
    }

    pub fn component_config() -> ComponentConfig<ConnectionProbe> {
        ComponentConfig::new(Priority::Critical, |probe: Arc<ConnectionProbe>| async move { Ok(probe.check()) })
            .kind("connection")
            .with_metrics(|probe: Arc<ConnectionProbe>| async move {
                let snapshot = probe.snapshots.borrow().clone();
                Ok(serde_json::to_value(snapshot)?)
            })
    }
}

/// Mémoire résidente (VmRSS) du processus, en Mo
pub async fn memory_usage_mb() -> Option<f64> {
    let status = tokio::fs::read_to_string("/proc/self/status").await.ok()?;
    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<f64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb as f64 / 1024.0)
}

/// Score mémoire : plein jusqu'à la moitié de la limite, puis décroissance linéaire jusqu'à 0
pub fn score_memory(rss_mb: f64, limit_mb: f64) -> f64 {
    if limit_mb <= 0.0 {
        return 1.0;
    }
    let ratio = rss_mb / limit_mb;
    ((1.0 - ratio) * 2.0).clamp(0.0, 1.0)
}

pub async fn process_memory_check(limit_mb: f64) -> HealthResult {
    match memory_usage_mb().await {
        Some(rss) => HealthResult::from_score(score_memory(rss, limit_mb))
            .with_details(serde_json::json!({ "rss_mb": rss, "limit_mb": limit_mb })),
        None => HealthResult::unknown("memory usage unavailable on this platform"),
    }
}

/// Composant "processus" (priorité basse)
pub struct ProcessProbe {
    pub limit_mb: f64,
}

impl ProcessProbe {
    pub fn new(limit_mb: f64) -> Arc<Self> {
        Arc::new(Self { limit_mb })
    }

    pub fn component_config() -> ComponentConfig<ProcessProbe> {
        ComponentConfig::new(Priority::Low, |probe: Arc<ProcessProbe>| async move {
            Ok(process_memory_check(probe.limit_mb).await)
        })
        .kind("process")
        .with_metrics(|_: Arc<ProcessProbe>| async move {
            Ok(serde_json::json!({ "rss_mb": memory_usage_mb().await, "pid": std::process::id() }))
        })
    }
}
