/**
 * CONFIGURATION KERNEL - Chargement YAML + variables d'environnement
 *
 * RÔLE : Paramètres du transport MQTT, du superviseur de connexion,
 * du moniteur de santé, du ledger de connexions et du reporter.
 *
 * FONCTIONNEMENT :
 * - Fichier `kernel.yaml` (ou `ROOMBOT_KERNEL_CONFIG`)
 * - Toutes les sections ont des valeurs par défaut (fichier partiel accepté)
 * - `ROOMBOT_PASSWORD` surcharge le mot de passe du fichier
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub transport: TransportConf,
    pub supervisor: SupervisorConf,
    pub monitor: MonitorConf,
    pub ledger: LedgerConf,
    pub reporter: ReporterConf,
    pub operators: OperatorsConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// Salon rejoint après chaque connexion
    pub channel: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConf {
    pub base_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConf {
    /// Au-delà : état `failed`, intervention externe requise
    pub max_attempts: u32,
    pub max_connections_per_hour: usize,
    /// Délai minimal entre deux connexions (politique de bon voisinage)
    pub min_connect_delay_ms: u64,
    pub backoff: BackoffConf,
    pub mention_timeout_ms: u64,
    pub dedup_capacity: usize,
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThresholdsConf {
    pub healthy: f64,
    pub warning: f64,
    pub degraded: f64,
    pub critical: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConf {
    pub check_interval_secs: u64,
    pub aggregation_interval_secs: u64,
    pub report_interval_secs: u64,
    pub prediction_interval_secs: u64,
    pub check_timeout_secs: u64,
    /// Échecs consécutifs avant ouverture du circuit breaker
    pub breaker_threshold: u32,
    pub history_size: usize,
    pub prediction_window: usize,
    pub prediction_horizon: u32,
    pub risk_threshold: f64,
    /// Limite RSS du probe processus
    pub memory_limit_mb: f64,
    pub thresholds: ThresholdsConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConf {
    pub path: PathBuf,
    pub max_events: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConf {
    pub enabled: bool,
    pub mqtt_topic_prefix: String,
}

/// Auteurs autorisés à piloter le moniteur depuis le salon (liste vide : commandes ignorées)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorsConf {
    pub prefix: String,
    pub allowed: Vec<String>,
}

impl Default for TransportConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "roombot-kernel".into(),
            keep_alive_secs: 15,
            channel: "lobby".into(),
            username: "roombot".into(),
            password: None,
        }
    }
}

impl Default for BackoffConf {
    fn default() -> Self {
        Self { base_ms: 1_000, max_ms: 300_000, multiplier: 2.0 }
    }
}

impl Default for SupervisorConf {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            max_connections_per_hour: 20,
            min_connect_delay_ms: 5_000,
            backoff: BackoffConf::default(),
            mention_timeout_ms: 30_000,
            dedup_capacity: 256,
            connect_timeout_ms: 15_000,
        }
    }
}

impl Default for ThresholdsConf {
    fn default() -> Self {
        Self { healthy: 0.95, warning: 0.85, degraded: 0.70, critical: 0.50 }
    }
}

impl Default for MonitorConf {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            aggregation_interval_secs: 60,
            report_interval_secs: 300,
            prediction_interval_secs: 120,
            check_timeout_secs: 10,
            breaker_threshold: 3,
            history_size: 100,
            prediction_window: 10,
            prediction_horizon: 5,
            risk_threshold: 0.70,
            memory_limit_mb: 512.0,
            thresholds: ThresholdsConf::default(),
        }
    }
}

impl Default for LedgerConf {
    fn default() -> Self {
        Self { path: PathBuf::from("./data/connections.json"), max_events: 500 }
    }
}

impl Default for OperatorsConf {
    fn default() -> Self {
        Self { prefix: "!".into(), allowed: Vec::new() }
    }
}

impl Default for ReporterConf {
    fn default() -> Self {
        Self { enabled: true, mqtt_topic_prefix: "roombot/health".into() }
    }
}

impl BackoffConf {
    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

impl SupervisorConf {
    pub fn min_connect_delay(&self) -> Duration {
        Duration::from_millis(self.min_connect_delay_ms)
    }

    pub fn mention_timeout(&self) -> Duration {
        Duration::from_millis(self.mention_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl MonitorConf {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn aggregation_interval(&self) -> Duration {
        Duration::from_secs(self.aggregation_interval_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn prediction_interval(&self) -> Duration {
        Duration::from_secs(self.prediction_interval_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }
}

impl KernelConfig {
    /// Vérifie la cohérence des paramètres (seuils ordonnés, backoff borné, intervalles non nuls)
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.monitor.thresholds;
        let ordered = t.healthy <= 1.0 && t.healthy > t.warning && t.warning > t.degraded
            && t.degraded > t.critical && t.critical > 0.0;
        if !ordered {
            return Err(ConfigError::Invalid(format!(
                "thresholds must be strictly decreasing in (0, 1]: {:?}", t
            )));
        }

        let b = &self.supervisor.backoff;
        if !b.multiplier.is_finite() || b.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff multiplier must be finite and >= 1, got {}", b.multiplier
            )));
        }
        if b.base_ms == 0 || b.base_ms > b.max_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff base ({}ms) must be non-zero and <= max ({}ms)", b.base_ms, b.max_ms
            )));
        }

        let m = &self.monitor;
        let intervals = [
            ("check_interval_secs", m.check_interval_secs),
            ("aggregation_interval_secs", m.aggregation_interval_secs),
            ("report_interval_secs", m.report_interval_secs),
            ("prediction_interval_secs", m.prediction_interval_secs),
            ("check_timeout_secs", m.check_timeout_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be > 0")));
        }
        if m.breaker_threshold == 0 {
            return Err(ConfigError::Invalid("breaker_threshold must be > 0".into()));
        }

        Ok(())
    }

    /// Parse un fichier YAML et applique les surcharges d'environnement
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let txt = fs::read_to_string(path).await?;
        let mut cfg = if txt.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str::<Self>(&txt)?
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(pass) = std::env::var("ROOMBOT_PASSWORD") {
            self.transport.password = Some(pass);
        }
        if let Ok(host) = std::env::var("ROOMBOT_MQTT_HOST") {
            self.transport.host = host;
        }
    }
}

/// Charge la config depuis `ROOMBOT_KERNEL_CONFIG` (défaut `kernel.yaml`).
/// Fichier absent ou invalide : config par défaut, avec un warning.
pub async fn load_config() -> KernelConfig {
    let path = std::env::var("ROOMBOT_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if !Path::new(&path).exists() {
        warn!("[kernel] pas de {path}, usage config par défaut");
        let mut cfg = KernelConfig::default();
        cfg.apply_env();
        return cfg;
    }

    match KernelConfig::from_file(&path).await {
        Ok(cfg) => {
            info!("[kernel] config chargée depuis {path}");
            cfg
        }
        Err(e) => {
            warn!("[kernel] config invalide ({path}): {e}");
            let mut cfg = KernelConfig::default();
            cfg.apply_env();
            cfg
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = KernelConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.monitor.thresholds.healthy, 0.95);
        assert_eq!(cfg.monitor.breaker_threshold, 3);
        assert_eq!(cfg.transport.port, 1883);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "supervisor:\n  max_attempts: 3\nmonitor:\n  thresholds:\n    critical: 0.4\n";
        let cfg: KernelConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.supervisor.max_attempts, 3);
        assert_eq!(cfg.supervisor.max_connections_per_hour, 20);
        assert_eq!(cfg.monitor.thresholds.critical, 0.4);
        assert_eq!(cfg.monitor.thresholds.healthy, 0.95);
    }

    #[test]
    fn test_unordered_thresholds_rejected() {
        let mut cfg = KernelConfig::default();
        cfg.monitor.thresholds.warning = 0.99;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_backoff_bounds_rejected() {
        let mut cfg = KernelConfig::default();
        cfg.supervisor.backoff.base_ms = 10_000;
        cfg.supervisor.backoff.max_ms = 1_000;
        assert!(cfg.validate().is_err());

        let mut cfg = KernelConfig::default();
        cfg.supervisor.backoff.multiplier = 0.5;
        assert!(cfg.validate().is_err());

        for multiplier in [f64::INFINITY, f64::NAN] {
            let mut cfg = KernelConfig::default();
            cfg.supervisor.backoff.multiplier = multiplier;
            assert!(cfg.validate().is_err(), "multiplier {multiplier} accepted");
        }
    }

    #[tokio::test]
    async fn test_infinite_multiplier_in_yaml_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.yaml");
        std::fs::write(&path, "supervisor:\n  backoff:\n    multiplier: .inf\n").unwrap();
        assert!(matches!(KernelConfig::from_file(&path).await, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_from_file_empty_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.yaml");
        std::fs::write(&path, "   \n").unwrap();
        let cfg = KernelConfig::from_file(&path).await.unwrap();
        assert_eq!(cfg.monitor.check_interval_secs, 30);
    }
}
