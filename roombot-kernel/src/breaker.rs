/**
 * CIRCUIT BREAKERS - État ouvert/fermé par composant surveillé
 *
 * FONCTIONNEMENT :
 * - `FailureStreak` : utilisé par la fonction de check d'un composant pour
 *   détecter N échecs consécutifs et émettre un signal Trip/Recovered
 * - `CircuitBreakerState` : tenu par le moniteur (écrivain unique), ouvert
 *   seulement quand `failure_count` a franchi le seuil sans signal de reprise
 */

use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;

/// Signal émis par un composant dans son `HealthResult`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum BreakerSignal {
    Trip { reason: String },
    Recovered,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CircuitBreakerState {
    pub is_open: bool,
    pub failure_count: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_failure: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub opened_at: Option<OffsetDateTime>,
    #[serde(skip)]
    opened_instant: Option<Instant>,
}

impl CircuitBreakerState {
    /// Enregistre un échec ; retourne `true` si cet échec ouvre le circuit
    pub fn record_failure(&mut self, threshold: u32) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(OffsetDateTime::now_utc());
        if !self.is_open && self.failure_count >= threshold {
            self.open();
            return true;
        }
        false
    }

    /// Ouverture explicite demandée par le composant ou un opérateur
    pub fn trip(&mut self, threshold: u32) -> bool {
        self.failure_count = self.failure_count.max(threshold);
        self.last_failure = Some(OffsetDateTime::now_utc());
        if self.is_open {
            return false;
        }
        self.open();
        true
    }

    /// Fermeture sur signal de reprise ; retourne la durée d'ouverture si le circuit était ouvert
    pub fn record_recovery(&mut self) -> Option<Duration> {
        let open_for = if self.is_open { Some(self.open_duration().unwrap_or_default()) } else { None };
        self.reset();
        open_for
    }

    /// Un résultat non défaillant rompt la série tant que le circuit est fermé
    pub fn clear_streak(&mut self) {
        if !self.is_open {
            self.failure_count = 0;
        }
    }

    pub fn reset(&mut self) {
        self.is_open = false;
        self.failure_count = 0;
        self.opened_at = None;
        self.opened_instant = None;
    }

    pub fn open_duration(&self) -> Option<Duration> {
        self.opened_instant.map(|at| at.elapsed())
    }

    fn open(&mut self) {
        self.is_open = true;
        self.opened_at = Some(OffsetDateTime::now_utc());
        self.opened_instant = Some(Instant::now());
    }
}

/// Compteur d'échecs consécutifs côté composant
#[derive(Debug, Clone)]
pub struct FailureStreak {
    threshold: u32,
    count: u32,
    tripped: bool,
}

impl FailureStreak {
    pub fn new(threshold: u32) -> Self {
        Self { threshold: threshold.max(1), count: 0, tripped: false }
    }

    /// Observe le résultat d'un check. Trip au franchissement du seuil, Recovered au premier succès après.
    pub fn observe(&mut self, ok: bool, reason: impl FnOnce() -> String) -> Option<BreakerSignal> {
        if ok {
            self.count = 0;
            if std::mem::take(&mut self.tripped) {
                return Some(BreakerSignal::Recovered);
            }
            return None;
        }

        self.count += 1;
        if self.count >= self.threshold && !self.tripped {
            self.tripped = true;
            return Some(BreakerSignal::Trip { reason: reason() });
        }
        None
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_opens_at_threshold() {
        let mut b = CircuitBreakerState::default();
        assert!(!b.record_failure(3));
        assert!(!b.record_failure(3));
        assert!(b.record_failure(3));
        assert!(b.is_open);
        // déjà ouvert : pas de seconde ouverture
        assert!(!b.record_failure(3));
        assert_eq!(b.failure_count, 4);
    }

    #[test]
    fn test_streak_cleared_only_while_closed() {
        let mut b = CircuitBreakerState::default();
        b.record_failure(3);
        b.record_failure(3);
        b.clear_streak();
        assert_eq!(b.failure_count, 0);

        b.trip(3);
        b.clear_streak();
        assert!(b.is_open);
        assert_eq!(b.failure_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_reports_open_duration() {
        let mut b = CircuitBreakerState::default();
        assert!(b.trip(3));
        tokio::time::advance(Duration::from_secs(42)).await;
        let open_for = b.record_recovery().unwrap();
        assert_eq!(open_for, Duration::from_secs(42));
        assert!(!b.is_open);
        assert!(b.record_recovery().is_none());
    }

    #[test]
    fn test_failure_streak_signals() {
        let mut streak = FailureStreak::new(3);
        assert_eq!(streak.observe(false, || "down".into()), None);
        assert_eq!(streak.observe(false, || "down".into()), None);
        assert_eq!(
            streak.observe(false, || "down".into()),
            Some(BreakerSignal::Trip { reason: "down".into() })
        );
        assert_eq!(streak.observe(false, || "down".into()), None);
        assert_eq!(streak.observe(true, String::new), Some(BreakerSignal::Recovered));
        assert_eq!(streak.observe(true, String::new), None);
    }
}
