//! Primitives de temporisation partagées : backoff géométrique et fenêtre
//! glissante des tentatives de connexion (prévention des tempêtes).

use crate::config::BackoffConf;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Fenêtre de comptage des tentatives pour le plafond horaire
pub const CONNECTION_WINDOW: Duration = Duration::from_secs(3600);

/// Délai d'attente entre deux tentatives.
/// `current` ne revient à `base` que sur une connexion confirmée.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackoffView {
    pub base_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub current_ms: u64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, multiplier: f64) -> Self {
        let max = max.max(base);
        let multiplier = if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 };
        Self { base, max, multiplier, current: base }
    }

    pub fn from_conf(conf: &BackoffConf) -> Self {
        Self::new(conf.base(), conf.max(), conf.multiplier)
    }

    /// `current = min(current * multiplier, max)`, retourne le nouveau délai
    pub fn increase(&mut self) -> Duration {
        let next = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier).unwrap_or(self.max);
        self.current = next.min(self.max);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn is_elevated(&self) -> bool {
        self.current > self.base
    }

    pub fn view(&self) -> BackoffView {
        BackoffView {
            base_ms: self.base.as_millis() as u64,
            max_ms: self.max.as_millis() as u64,
            multiplier: self.multiplier,
            current_ms: self.current.as_millis() as u64,
        }
    }
}

/// Horodatages des tentatives récentes, élagués à la fenêtre d'une heure
#[derive(Debug, Clone, Default)]
pub struct ConnectionWindow {
    attempts: VecDeque<Instant>,
}

impl ConnectionWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, now: Instant) {
        self.prune(now);
        self.attempts.push_back(now);
    }

    pub fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.attempts.front() {
            if now.saturating_duration_since(*oldest) >= CONNECTION_WINDOW {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.attempts.len()
    }

    /// Vrai quand le nombre de tentatives de la dernière heure atteint le plafond
    pub fn exceeds(&mut self, ceiling: usize, now: Instant) -> bool {
        self.count(now) >= ceiling
    }

    pub fn clear(&mut self) {
        self.attempts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_geometrically_and_caps() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(5), 2.0);
        assert_eq!(b.increase(), Duration::from_secs(2));
        assert_eq!(b.increase(), Duration::from_secs(4));
        assert_eq!(b.increase(), Duration::from_secs(5));
        assert_eq!(b.increase(), Duration::from_secs(5));
        assert!(b.is_elevated());

        b.reset();
        assert_eq!(b.current(), Duration::from_secs(1));
        assert!(!b.is_elevated());
    }

    #[test]
    fn test_non_finite_multiplier_never_panics() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(5), f64::INFINITY);
        assert_eq!(b.increase(), Duration::from_secs(1));

        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(5), f64::NAN);
        assert_eq!(b.increase(), Duration::from_secs(1));

        // produit hors de la plage d'une Duration : plafonné au max
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(5), f64::MAX);
        assert_eq!(b.increase(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_prunes_after_one_hour() {
        let mut window = ConnectionWindow::new();
        window.record(Instant::now());
        window.record(Instant::now());
        assert_eq!(window.count(Instant::now()), 2);
        assert!(window.exceeds(2, Instant::now()));

        tokio::time::advance(Duration::from_secs(1800)).await;
        window.record(Instant::now());
        assert_eq!(window.count(Instant::now()), 3);

        tokio::time::advance(Duration::from_secs(1800)).await;
        assert_eq!(window.count(Instant::now()), 1);
        assert!(!window.exceeds(2, Instant::now()));
    }
}
