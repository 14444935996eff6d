/**
 * LEDGER DE CONNEXIONS - Façade de persistance pour la politique de bon voisinage
 *
 * RÔLE : mémoriser l'heure des dernières connexions (par type d'événement)
 * pour respecter un délai minimal entre deux connexions, y compris après
 * un redémarrage du process.
 *
 * IMPLÉMENTATIONS :
 * - `MemoryLedger` : tests et exécutions éphémères
 * - `JsonFileLedger` : fichier JSON, chargé à l'ouverture, réécrit à chaque événement
 */

use crate::state::{new_state, Shared};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::fs;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    Attempt,
    Connected,
    Failure,
    Disconnect,
    GaveUp,
}

impl ConnectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionKind::Attempt => "attempt",
            ConnectionKind::Connected => "connected",
            ConnectionKind::Failure => "failure",
            ConnectionKind::Disconnect => "disconnect",
            ConnectionKind::GaveUp => "gave_up",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionEventRecord {
    pub kind: ConnectionKind,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub meta: serde_json::Value,
}

pub trait ConnectionLedger: Send + Sync + 'static {
    /// Vrai si la dernière tentative date d'au moins `min_delay`
    fn can_connect(&self, min_delay: Duration) -> impl Future<Output = Result<bool, LedgerError>> + Send;

    fn last_connection_time(
        &self,
        kind: ConnectionKind,
    ) -> impl Future<Output = Result<Option<OffsetDateTime>, LedgerError>> + Send;

    fn log_connection_event(
        &self,
        kind: ConnectionKind,
        meta: serde_json::Value,
    ) -> impl Future<Output = Result<(), LedgerError>> + Send;
}

/// Temps restant avant que `min_delay` soit écoulé depuis `last`
pub fn remaining_delay(last: Option<OffsetDateTime>, min_delay: Duration, now: OffsetDateTime) -> Duration {
    let Some(last) = last else {
        return Duration::ZERO;
    };
    // horloge revenue en arrière : on considère qu'aucun temps n'est écoulé
    let elapsed = Duration::try_from(now - last).unwrap_or_default();
    min_delay.saturating_sub(elapsed)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerData {
    #[serde(default)]
    last: BTreeMap<String, String>,
    #[serde(default)]
    events: VecDeque<ConnectionEventRecord>,
}

impl LedgerData {
    fn last(&self, kind: ConnectionKind) -> Option<OffsetDateTime> {
        let raw = self.last.get(kind.as_str())?;
        OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339).ok()
    }

    fn record(&mut self, kind: ConnectionKind, meta: serde_json::Value, at: OffsetDateTime, max_events: usize) {
        if let Ok(ts) = at.format(&time::format_description::well_known::Rfc3339) {
            self.last.insert(kind.as_str().to_string(), ts);
        }
        self.events.push_back(ConnectionEventRecord { kind, at, meta });
        while self.events.len() > max_events {
            self.events.pop_front();
        }
    }
}

/// Ledger en mémoire
#[derive(Clone)]
pub struct MemoryLedger {
    data: Shared<LedgerData>,
    max_events: usize,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self { data: new_state(LedgerData::default()), max_events: 500 }
    }

    /// Pré-remplit une date (ex: simuler une connexion récente avant redémarrage)
    pub fn with_last(self, kind: ConnectionKind, at: OffsetDateTime) -> Self {
        self.data.lock().record(kind, serde_json::Value::Null, at, self.max_events);
        self
    }

    pub fn events(&self) -> Vec<ConnectionEventRecord> {
        self.data.lock().events.iter().cloned().collect()
    }

    pub fn count(&self, kind: ConnectionKind) -> usize {
        self.data.lock().events.iter().filter(|e| e.kind == kind).count()
    }
}

impl ConnectionLedger for MemoryLedger {
    async fn can_connect(&self, min_delay: Duration) -> Result<bool, LedgerError> {
        let last = self.data.lock().last(ConnectionKind::Attempt);
        Ok(remaining_delay(last, min_delay, OffsetDateTime::now_utc()).is_zero())
    }

    async fn last_connection_time(&self, kind: ConnectionKind) -> Result<Option<OffsetDateTime>, LedgerError> {
        Ok(self.data.lock().last(kind))
    }

    async fn log_connection_event(&self, kind: ConnectionKind, meta: serde_json::Value) -> Result<(), LedgerError> {
        self.data.lock().record(kind, meta, OffsetDateTime::now_utc(), self.max_events);
        Ok(())
    }
}

/// Ledger persistant en fichier JSON
pub struct JsonFileLedger {
    path: PathBuf,
    max_events: usize,
    cache: Shared<LedgerData>,
}

impl JsonFileLedger {
    /// Ouvre (ou crée) le ledger ; charge l'historique existant
    pub async fn open<P: AsRef<Path>>(path: P, max_events: usize) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let data = if path.exists() {
            let content = fs::read_to_string(&path).await?;
            if content.trim().is_empty() {
                LedgerData::default()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            LedgerData::default()
        };

        info!("[ledger] opened {:?} ({} events)", path, data.events.len());
        Ok(Self { path, max_events: max_events.max(1), cache: new_state(data) })
    }

    async fn save(&self) -> Result<(), LedgerError> {
        let content = {
            let data = self.cache.lock();
            serde_json::to_string_pretty(&*data)?
        };
        fs::write(&self.path, content).await?;
        debug!("[ledger] saved {:?}", self.path);
        Ok(())
    }
}

impl ConnectionLedger for JsonFileLedger {
    async fn can_connect(&self, min_delay: Duration) -> Result<bool, LedgerError> {
        let last = self.cache.lock().last(ConnectionKind::Attempt);
        Ok(remaining_delay(last, min_delay, OffsetDateTime::now_utc()).is_zero())
    }

    async fn last_connection_time(&self, kind: ConnectionKind) -> Result<Option<OffsetDateTime>, LedgerError> {
        Ok(self.cache.lock().last(kind))
    }

    async fn log_connection_event(&self, kind: ConnectionKind, meta: serde_json::Value) -> Result<(), LedgerError> {
        self.cache.lock().record(kind, meta, OffsetDateTime::now_utc(), self.max_events);
        self.save().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_delay() {
        let now = OffsetDateTime::now_utc();
        let min = Duration::from_secs(60);
        assert_eq!(remaining_delay(None, min, now), Duration::ZERO);
        assert_eq!(remaining_delay(Some(now - time::Duration::seconds(20)), min, now), Duration::from_secs(40));
        assert_eq!(remaining_delay(Some(now - time::Duration::seconds(90)), min, now), Duration::ZERO);
        // horloge en arrière
        assert_eq!(remaining_delay(Some(now + time::Duration::seconds(5)), min, now), min);
    }

    #[tokio::test]
    async fn test_memory_ledger_throttles_recent_attempt() {
        let ledger = MemoryLedger::new();
        assert!(ledger.can_connect(Duration::from_secs(60)).await.unwrap());

        ledger.log_connection_event(ConnectionKind::Attempt, serde_json::json!({"attempt": 1})).await.unwrap();
        assert!(!ledger.can_connect(Duration::from_secs(60)).await.unwrap());
        assert!(ledger.can_connect(Duration::ZERO).await.unwrap());
        assert!(ledger.last_connection_time(ConnectionKind::Attempt).await.unwrap().is_some());
        assert!(ledger.last_connection_time(ConnectionKind::Connected).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("connections.json");

        {
            let ledger = JsonFileLedger::open(&path, 10).await.unwrap();
            ledger.log_connection_event(ConnectionKind::Attempt, serde_json::Value::Null).await.unwrap();
            ledger.log_connection_event(ConnectionKind::Connected, serde_json::Value::Null).await.unwrap();
        }

        let reopened = JsonFileLedger::open(&path, 10).await.unwrap();
        assert!(reopened.last_connection_time(ConnectionKind::Connected).await.unwrap().is_some());
        assert!(!reopened.can_connect(Duration::from_secs(3600)).await.unwrap());
    }

    #[tokio::test]
    async fn test_file_ledger_bounds_event_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connections.json");
        let ledger = JsonFileLedger::open(&path, 3).await.unwrap();
        for i in 0..5 {
            ledger.log_connection_event(ConnectionKind::Failure, serde_json::json!({ "i": i })).await.unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        let data: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(data["events"].as_array().unwrap().len(), 3);
        assert_eq!(data["events"][0]["meta"]["i"], 2);
    }
}
