/**
 * TIMERS TRACÉS - Planification avec annulation garantie
 *
 * RÔLE :
 * Chaque délai ou intervalle créé par le kernel passe par ce registre,
 * sous un label lisible ("reconnect", "session:mention:alice"...).
 *
 * INVARIANTS :
 * - `shutdown()` annule tout ce qui est tracé, est idempotent, et laisse 0 timer
 * - aucun callback ne s'exécute une fois le shutdown commencé
 * - replanifier un label remplace (annule) le timer précédent
 */

use crate::state::{new_state, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Once,
    Interval,
    Task,
}

struct TrackedTimer {
    id: u64,
    kind: TimerKind,
    handle: AbortHandle,
}

struct Inner {
    timers: Shared<HashMap<String, TrackedTimer>>,
    shutting_down: AtomicBool,
    next_id: AtomicU64,
}

/// Registre des timers d'un composant (clonable, état partagé)
#[derive(Clone)]
pub struct TimerRegistry {
    inner: Arc<Inner>,
}

impl Default for TimerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                timers: new_state(HashMap::new()),
                shutting_down: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Exécute `callback` une fois après `delay`.
    /// Retourne `false` si le registre est déjà en shutdown.
    pub fn schedule_once<F>(&self, label: impl Into<String>, delay: Duration, callback: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let label = label.into();
        if self.is_shutting_down() {
            warn!("[timers] refusing to schedule {label}: shutting down");
            return false;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let task_label = label.clone();

        // Verrou tenu pendant spawn + insert : le timer ne peut pas se retirer avant d'être inscrit
        let mut timers = self.inner.timers.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.shutting_down.load(Ordering::Acquire) {
                return;
            }
            let still_tracked = {
                let mut timers = inner.timers.lock();
                match timers.get(&task_label) {
                    Some(t) if t.id == id => {
                        timers.remove(&task_label);
                        true
                    }
                    _ => false,
                }
            };
            if still_tracked {
                callback();
            }
        });
        Self::insert(&mut timers, label, TrackedTimer { id, kind: TimerKind::Once, handle: handle.abort_handle() });
        true
    }

    /// Exécute `callback` toutes les `period` (premier tir après une période).
    /// Un tick lent retarde le suivant, sans empilement.
    pub fn schedule_interval<F>(&self, label: impl Into<String>, period: Duration, callback: F) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        let label = label.into();
        if self.is_shutting_down() {
            warn!("[timers] refusing to schedule interval {label}: shutting down");
            return false;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let task_label = label.clone();

        let mut timers = self.inner.timers.lock();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if inner.shutting_down.load(Ordering::Acquire) {
                    return;
                }
                let tracked = inner.timers.lock().get(&task_label).is_some_and(|t| t.id == id);
                if !tracked {
                    return;
                }
                callback();
            }
        });
        Self::insert(&mut timers, label, TrackedTimer { id, kind: TimerKind::Interval, handle: handle.abort_handle() });
        true
    }

    /// Trace une tâche arbitraire (listener de signaux, publisher...) pour l'annuler au shutdown
    pub fn track_task(&self, label: impl Into<String>, handle: JoinHandle<()>) -> bool {
        let label = label.into();
        if self.is_shutting_down() {
            warn!("[timers] refusing to track {label}: shutting down");
            handle.abort();
            return false;
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut timers = self.inner.timers.lock();
        Self::insert(&mut timers, label, TrackedTimer { id, kind: TimerKind::Task, handle: handle.abort_handle() });
        true
    }

    fn insert(timers: &mut HashMap<String, TrackedTimer>, label: String, timer: TrackedTimer) {
        if let Some(previous) = timers.insert(label.clone(), timer) {
            debug!("[timers] replacing {label} ({:?})", previous.kind);
            previous.handle.abort();
        }
    }

    pub fn cancel(&self, label: &str) -> bool {
        match self.inner.timers.lock().remove(label) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Annule tous les timers dont le label commence par `prefix`
    pub fn cancel_prefix(&self, prefix: &str) -> usize {
        let mut timers = self.inner.timers.lock();
        let labels: Vec<String> = timers.keys().filter(|l| l.starts_with(prefix)).cloned().collect();
        for label in &labels {
            if let Some(timer) = timers.remove(label) {
                timer.handle.abort();
            }
        }
        labels.len()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.inner.timers.lock().get(label).is_some_and(|t| !t.handle.is_finished())
    }

    /// Nombre de timers/tâches encore actifs
    pub fn pending(&self) -> usize {
        self.inner.timers.lock().values().filter(|t| !t.handle.is_finished()).count()
    }

    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self
            .inner
            .timers
            .lock()
            .iter()
            .filter(|(_, t)| !t.handle.is_finished())
            .map(|(l, _)| l.clone())
            .collect();
        labels.sort();
        labels
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Annule tout, définitivement. Sans effet si déjà appelé.
    pub fn shutdown(&self) -> usize {
        let first = !self.inner.shutting_down.swap(true, Ordering::AcqRel);
        let drained: Vec<(String, TrackedTimer)> = self.inner.timers.lock().drain().collect();
        for (_, timer) in &drained {
            timer.handle.abort();
        }
        if first {
            debug!("[timers] shutdown, cancelled {} timers", drained.len());
        }
        drained.len()
    }
}

/// Attend Ctrl-C ou SIGTERM
pub async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("[timers] SIGTERM handler unavailable: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
