/**
 * MONITEUR DE SANTÉ - "Le système est-il sain ?"
 *
 * CYCLE DE CHECK :
 * 1. Checks des composants, un par un (timeout + capture de panic)
 * 2. Résultats normalisés, breakers mis à jour
 * 3. Score pondéré par priorité (critical=4 ... low=1) + moyennes par catégorie
 * 4. Transition d'état détectée contre le snapshot précédent (edge-triggered)
 * 5. Vue publiée, PUIS événements émis : aucun observateur ne voit un cycle partiel
 *
 * Le moniteur est l'unique écrivain des composants et des breakers.
 * Une fois lancé, les opérations externes (enregistrement, breakers manuels)
 * passent par des commandes appliquées entre deux cycles.
 * Rapport et prédiction tournent sur leurs propres timers à partir de la vue publiée.
 */

use super::prediction::{self, PredictionParams};
use super::report::HealthReport;
use super::types::{
    ComponentSummary, EmergencyState, HealthResult, HealthStatus, Priority, RecoveryAction, RecoveryStep,
    SystemHealthSnapshot,
};
use crate::breaker::{BreakerSignal, CircuitBreakerState};
use crate::config::MonitorConf;
use crate::events::{EventBus, HealthEvent};
use crate::scheduler::TimerRegistry;
use crate::state::{new_view, View};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const RESTART_ESTIMATE_SECS: u64 = 30;
const SAFE_MODE_ESTIMATE_SECS: u64 = 60;
const SAFE_MODE_SCORE: f64 = 0.3;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("component already registered: {0}")]
    DuplicateComponent(String),
    #[error("unknown component: {0}")]
    UnknownComponent(String),
    #[error("health monitor is not running")]
    NotRunning,
}

type CheckFn<C> = Arc<dyn Fn(Arc<C>) -> BoxFuture<'static, anyhow::Result<HealthResult>> + Send + Sync>;
type MetricsFn<C> = Arc<dyn Fn(Arc<C>) -> BoxFuture<'static, anyhow::Result<serde_json::Value>> + Send + Sync>;

type BoundCheck = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<HealthResult>> + Send + Sync>;
type BoundMetrics = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<serde_json::Value>> + Send + Sync>;

/// Paramètres d'enregistrement d'un composant : priorité, check, métriques optionnelles
pub struct ComponentConfig<C> {
    priority: Priority,
    kind: String,
    check: CheckFn<C>,
    metrics: Option<MetricsFn<C>>,
}

impl<C: Send + Sync + 'static> ComponentConfig<C> {
    pub fn new<F, Fut>(priority: Priority, check: F) -> Self
    where
        F: Fn(Arc<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<HealthResult>> + Send + 'static,
    {
        Self {
            priority,
            kind: "component".into(),
            check: Arc::new(move |instance| check(instance).boxed()),
            metrics: None,
        }
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_metrics<F, Fut>(mut self, metrics: F) -> Self
    where
        F: Fn(Arc<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        self.metrics = Some(Arc::new(move |instance| metrics(instance).boxed()));
        self
    }
}

/// Composant surveillé, mis à jour sur place à chaque cycle
struct ComponentRecord {
    id: String,
    priority: Priority,
    kind: String,
    check: BoundCheck,
    metrics_fn: Option<BoundMetrics>,
    last_check: Option<OffsetDateTime>,
    status: HealthStatus,
    score: f64,
    details: serde_json::Value,
    metrics: Option<serde_json::Value>,
    history: VecDeque<f64>,
}

impl ComponentRecord {
    /// Lie le check (et les métriques) à l'instance surveillée
    fn bind<C: Send + Sync + 'static>(id: String, instance: Arc<C>, config: ComponentConfig<C>) -> Self {
        let check = {
            let instance = Arc::clone(&instance);
            let check = config.check;
            Arc::new(move || check(Arc::clone(&instance))) as BoundCheck
        };
        let metrics_fn = config.metrics.map(|metrics| {
            let instance = Arc::clone(&instance);
            Arc::new(move || metrics(Arc::clone(&instance))) as BoundMetrics
        });
        Self {
            id,
            priority: config.priority,
            kind: config.kind,
            check,
            metrics_fn,
            last_check: None,
            status: HealthStatus::Unknown,
            score: 1.0,
            details: serde_json::Value::Null,
            metrics: None,
            history: VecDeque::new(),
        }
    }

    fn summary(&self) -> ComponentSummary {
        ComponentSummary {
            id: self.id.clone(),
            priority: self.priority,
            kind: self.kind.clone(),
            status: self.status,
            score: self.score,
            last_check: self.last_check,
            metrics: self.metrics.clone(),
            details: self.details.clone(),
        }
    }
}

/// État complet en lecture seule, republié après chaque cycle terminé
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorView {
    pub system: Option<SystemHealthSnapshot>,
    pub components: Vec<ComponentSummary>,
    pub breakers: BTreeMap<String, CircuitBreakerState>,
    pub emergency: EmergencyState,
    pub history: Vec<SystemHealthSnapshot>,
    pub score_history: BTreeMap<String, Vec<f64>>,
    pub cycles: u64,
}

impl MonitorView {
    pub fn component(&self, id: &str) -> Option<&ComponentSummary> {
        self.components.iter().find(|c| c.id == id)
    }

    pub fn is_breaker_open(&self, id: &str) -> bool {
        self.breakers.get(id).is_some_and(|b| b.is_open)
    }
}

pub struct HealthMonitor {
    config: MonitorConf,
    components: Vec<ComponentRecord>,
    breakers: BTreeMap<String, CircuitBreakerState>,
    emergency: EmergencyState,
    last_snapshot: Option<SystemHealthSnapshot>,
    history: VecDeque<SystemHealthSnapshot>,
    cycles: u64,
    events: EventBus<HealthEvent>,
    outbox: Vec<HealthEvent>,
    view_tx: watch::Sender<Arc<MonitorView>>,
    view_rx: View<MonitorView>,
}

impl HealthMonitor {
    pub fn new(config: MonitorConf) -> Self {
        let (view_tx, view_rx) = new_view(MonitorView::default());
        Self {
            config,
            components: Vec::new(),
            breakers: BTreeMap::new(),
            emergency: EmergencyState::default(),
            last_snapshot: None,
            history: VecDeque::new(),
            cycles: 0,
            events: EventBus::new(),
            outbox: Vec::new(),
            view_tx,
            view_rx,
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<HealthEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> EventBus<HealthEvent> {
        self.events.clone()
    }

    pub fn view(&self) -> View<MonitorView> {
        self.view_rx.clone()
    }

    pub fn emergency(&self) -> &EmergencyState {
        &self.emergency
    }

    pub fn breaker(&self, id: &str) -> Option<&CircuitBreakerState> {
        self.breakers.get(id)
    }

    pub fn last_snapshot(&self) -> Option<&SystemHealthSnapshot> {
        self.last_snapshot.as_ref()
    }

    pub fn component_ids(&self) -> Vec<String> {
        self.components.iter().map(|c| c.id.clone()).collect()
    }

    /// Enregistre un composant et son instance vivante. Un id ne peut servir qu'une fois.
    pub fn register_component<C: Send + Sync + 'static>(
        &mut self,
        id: impl Into<String>,
        instance: Arc<C>,
        config: ComponentConfig<C>,
    ) -> Result<(), MonitorError> {
        self.insert_component(ComponentRecord::bind(id.into(), instance, config))
    }

    fn insert_component(&mut self, record: ComponentRecord) -> Result<(), MonitorError> {
        if self.components.iter().any(|c| c.id == record.id) {
            return Err(MonitorError::DuplicateComponent(record.id));
        }
        info!("[health] registered {} ({:?}, {})", record.id, record.priority, record.kind);
        self.breakers.insert(record.id.clone(), CircuitBreakerState::default());
        self.components.push(record);
        self.publish();
        Ok(())
    }

    /// Un cycle complet : checks séquentiels, agrégation, transitions, publication
    pub async fn perform_health_check(&mut self) -> SystemHealthSnapshot {
        let started = Instant::now();
        let timeout = self.config.check_timeout();

        let mut results = BTreeMap::new();
        for idx in 0..self.components.len() {
            let check = Arc::clone(&self.components[idx].check);
            let id = self.components[idx].id.clone();
            let result = run_check(&id, check, timeout).await.normalized(&self.config.thresholds);
            results.insert(id, result);
        }

        let now = OffsetDateTime::now_utc();
        let history_size = self.config.history_size.max(1);
        for record in &mut self.components {
            if let Some(result) = results.get(&record.id) {
                record.status = result.status;
                record.score = result.score;
                record.details = result.details.clone();
                record.last_check = Some(now);
                record.history.push_back(result.score);
                while record.history.len() > history_size {
                    record.history.pop_front();
                }
            }
        }
        for (id, result) in &results {
            self.apply_breaker(id, result);
        }

        let snapshot = self.calculate_system_health(&results);
        self.apply_system_health(&snapshot);
        self.cycles += 1;

        let duration_ms = started.elapsed().as_millis() as u64;
        debug!("[health] cycle {} done in {}ms: {} ({:.3})", self.cycles, duration_ms, snapshot.status, snapshot.score);
        self.outbox.push(HealthEvent::CheckCompleted { snapshot: snapshot.clone(), duration_ms });

        self.publish();
        self.flush();
        snapshot
    }

    /// Moyenne pondérée par priorité + moyennes par catégorie.
    /// Une moyenne `critical` sous le seuil critique force au moins le statut `critical`.
    pub fn calculate_system_health(&self, results: &BTreeMap<String, HealthResult>) -> SystemHealthSnapshot {
        let thresholds = &self.config.thresholds;
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        let mut categories: BTreeMap<Priority, (f64, usize)> = BTreeMap::new();
        let mut failed_components = Vec::new();

        for (id, result) in results {
            let Some(priority) = self.priority_of(id) else {
                warn!("[health] result for unregistered component {id} ignored");
                continue;
            };
            if matches!(result.status, HealthStatus::Failed | HealthStatus::Critical) {
                failed_components.push(id.clone());
            }
            // un statut unknown n'apporte aucune information au score
            if result.status == HealthStatus::Unknown {
                continue;
            }
            weighted += result.score * priority.weight();
            total_weight += priority.weight();
            let entry = categories.entry(priority).or_insert((0.0, 0));
            entry.0 += result.score;
            entry.1 += 1;
        }

        let category_averages: BTreeMap<Priority, f64> =
            categories.into_iter().map(|(p, (sum, n))| (p, sum / n as f64)).collect();

        let (status, score) = if total_weight == 0.0 {
            (HealthStatus::Unknown, 1.0)
        } else {
            let score = weighted / total_weight;
            let mut status = thresholds.classify(score);
            if let Some(critical_avg) = category_averages.get(&Priority::Critical) {
                if *critical_avg < thresholds.critical && status.severity() < HealthStatus::Critical.severity() {
                    debug!("[health] critical category at {critical_avg:.3}, overriding {status}");
                    status = HealthStatus::Critical;
                }
            }
            (status, score)
        };

        SystemHealthSnapshot {
            status,
            score,
            category_averages,
            failed_components,
            component_count: self.components.len(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// Compare au snapshot précédent ; chaque transition est émise une seule fois
    pub fn update_system_health(&mut self, snapshot: &SystemHealthSnapshot) {
        self.apply_system_health(snapshot);
        self.publish();
        self.flush();
    }

    fn apply_system_health(&mut self, snapshot: &SystemHealthSnapshot) {
        let previous = self.last_snapshot.as_ref().map(|s| s.status);
        if previous != Some(snapshot.status) {
            match previous {
                Some(from) => info!("[health] system status {from} -> {} ({:.3})", snapshot.status, snapshot.score),
                None => info!("[health] system status {} ({:.3})", snapshot.status, snapshot.score),
            }
            self.outbox.push(HealthEvent::SystemChanged { from: previous, to: snapshot.status, score: snapshot.score });
        }

        if snapshot.status.is_emergency() && !self.emergency.is_active {
            self.enter_emergency(snapshot);
        } else if snapshot.status == HealthStatus::Healthy && self.emergency.is_active {
            self.leave_emergency(snapshot);
        }

        self.last_snapshot = Some(snapshot.clone());
        self.history.push_back(snapshot.clone());
        while self.history.len() > self.config.history_size.max(1) {
            self.history.pop_front();
        }
    }

    /// Entre en mode urgence avec un plan de reprise indicatif
    pub fn activate_emergency_mode(&mut self, snapshot: &SystemHealthSnapshot) {
        if self.emergency.is_active {
            debug!("[health] emergency already active");
            return;
        }
        self.enter_emergency(snapshot);
        self.publish();
        self.flush();
    }

    fn enter_emergency(&mut self, snapshot: &SystemHealthSnapshot) {
        let mut plan = Vec::new();
        for id in &snapshot.failed_components {
            if self.priority_of(id) == Some(Priority::Critical) {
                plan.push(RecoveryStep {
                    order: plan.len() + 1,
                    action: RecoveryAction::Restart,
                    component: Some(id.clone()),
                    description: format!("restart {id}"),
                    estimated_secs: RESTART_ESTIMATE_SECS,
                });
            }
        }
        if snapshot.score < SAFE_MODE_SCORE {
            plan.push(RecoveryStep {
                order: plan.len() + 1,
                action: RecoveryAction::SafeMode,
                component: None,
                description: "switch to safe mode".into(),
                estimated_secs: SAFE_MODE_ESTIMATE_SECS,
            });
        }

        let episode_id = uuid::Uuid::new_v4();
        error!(
            "[health] EMERGENCY {} ({:.3}), triggered by [{}], {} recovery step(s)",
            snapshot.status,
            snapshot.score,
            snapshot.failed_components.join(", "),
            plan.len()
        );

        self.emergency = EmergencyState {
            is_active: true,
            episode_id: Some(episode_id),
            triggered_by: snapshot.failed_components.clone(),
            start_time: Some(OffsetDateTime::now_utc()),
            recovery_plan: plan.clone(),
            started: Some(Instant::now()),
        };
        self.outbox.push(HealthEvent::EmergencyActivated {
            episode_id,
            triggered_by: snapshot.failed_components.clone(),
            score: snapshot.score,
            recovery_plan: plan,
        });
    }

    pub fn resolve_emergency_mode(&mut self, snapshot: &SystemHealthSnapshot) {
        if !self.emergency.is_active {
            return;
        }
        self.leave_emergency(snapshot);
        self.publish();
        self.flush();
    }

    fn leave_emergency(&mut self, snapshot: &SystemHealthSnapshot) {
        let ended = std::mem::take(&mut self.emergency);
        let duration = ended.started.map(|s| s.elapsed()).unwrap_or_default();
        info!("[health] emergency resolved after {}s ({:.3})", duration.as_secs(), snapshot.score);
        self.outbox.push(HealthEvent::EmergencyResolved {
            episode_id: ended.episode_id,
            triggered_by: ended.triggered_by,
            duration_ms: duration.as_millis() as u64,
            score: snapshot.score,
        });
    }

    /// Ouverture manuelle du breaker d'un composant
    pub fn trigger_circuit_breaker(&mut self, id: &str, reason: &str) -> Result<bool, MonitorError> {
        let opened = self.open_breaker(id, reason)?;
        self.publish();
        self.flush();
        Ok(opened)
    }

    /// Fermeture manuelle ; retourne la durée d'ouverture si le breaker était ouvert
    pub fn reset_circuit_breaker(&mut self, id: &str) -> Result<Option<Duration>, MonitorError> {
        let open_for = self.close_breaker(id)?;
        self.publish();
        self.flush();
        Ok(open_for)
    }

    fn open_breaker(&mut self, id: &str, reason: &str) -> Result<bool, MonitorError> {
        let threshold = self.config.breaker_threshold;
        let breaker = self.breakers.get_mut(id).ok_or_else(|| MonitorError::UnknownComponent(id.into()))?;
        if !breaker.trip(threshold) {
            return Ok(false);
        }
        warn!("[health] circuit breaker opened for {id}: {reason}");
        self.outbox.push(HealthEvent::BreakerOpened {
            component: id.into(),
            reason: reason.into(),
            failure_count: breaker.failure_count,
        });
        Ok(true)
    }

    fn close_breaker(&mut self, id: &str) -> Result<Option<Duration>, MonitorError> {
        let breaker = self.breakers.get_mut(id).ok_or_else(|| MonitorError::UnknownComponent(id.into()))?;
        let open_for = breaker.record_recovery();
        if let Some(open_for) = open_for {
            info!("[health] circuit breaker closed for {id} after {}ms", open_for.as_millis());
            self.outbox.push(HealthEvent::BreakerClosed {
                component: id.into(),
                open_for_ms: open_for.as_millis() as u64,
            });
        }
        Ok(open_for)
    }

    fn apply_breaker(&mut self, id: &str, result: &HealthResult) {
        let threshold = self.config.breaker_threshold;

        match &result.breaker {
            Some(BreakerSignal::Trip { reason }) => {
                let _ = self.open_breaker(id, reason);
            }
            Some(BreakerSignal::Recovered) => {
                let _ = self.close_breaker(id);
            }
            None => {}
        }

        let tripped = matches!(result.breaker, Some(BreakerSignal::Trip { .. }));
        let Some(breaker) = self.breakers.get_mut(id) else {
            return;
        };

        if result.status == HealthStatus::Failed {
            if !tripped && breaker.record_failure(threshold) {
                let failure_count = breaker.failure_count;
                warn!("[health] circuit breaker opened for {id}: {failure_count} consecutive failed checks");
                self.outbox.push(HealthEvent::BreakerOpened {
                    component: id.into(),
                    reason: format!("{failure_count} consecutive failed checks"),
                    failure_count,
                });
            }
        } else if result.status == HealthStatus::Healthy && breaker.is_open && !tripped {
            let _ = self.close_breaker(id);
        } else {
            breaker.clear_streak();
        }
    }

    /// Collecte les métriques de chaque composant ; une erreur garde le snapshot précédent
    pub async fn aggregate_metrics(&mut self) {
        let timeout = self.config.check_timeout();
        for idx in 0..self.components.len() {
            let Some(metrics) = self.components[idx].metrics_fn.clone() else {
                continue;
            };
            let id = self.components[idx].id.clone();
            let guarded = AssertUnwindSafe(async move { metrics().await }).catch_unwind();
            let outcome = tokio::time::timeout(timeout, guarded).await;
            match outcome {
                Ok(Ok(Ok(value))) => self.components[idx].metrics = Some(value),
                Ok(Ok(Err(e))) => warn!("[health] metrics for {id} failed: {e}"),
                Ok(Err(_)) => warn!("[health] metrics for {id} panicked"),
                Err(_) => warn!("[health] metrics for {id} timed out"),
            }
        }
        self.publish();
    }

    /// Retire tous les composants (arrêt du moniteur)
    pub fn shutdown(&mut self) {
        let count = self.components.len();
        self.components.clear();
        self.breakers.clear();
        self.publish();
        info!("[health] monitor stopped, {count} component(s) removed");
    }

    fn priority_of(&self, id: &str) -> Option<Priority> {
        self.components.iter().find(|c| c.id == id).map(|c| c.priority)
    }

    fn publish(&self) {
        let view = MonitorView {
            system: self.last_snapshot.clone(),
            components: self.components.iter().map(ComponentRecord::summary).collect(),
            breakers: self.breakers.clone(),
            emergency: self.emergency.clone(),
            history: self.history.iter().cloned().collect(),
            score_history: self
                .components
                .iter()
                .map(|c| (c.id.clone(), c.history.iter().copied().collect()))
                .collect(),
            cycles: self.cycles,
        };
        self.view_tx.send_replace(Arc::new(view));
    }

    fn flush(&mut self) {
        for event in self.outbox.drain(..) {
            self.events.emit(event);
        }
    }

    /// Lance la boucle du moniteur et les timers de rapport/prédiction
    pub fn spawn(self) -> MonitorHandle {
        let timers = TimerRegistry::new();
        let view = self.view();
        let events = self.events();

        {
            let view = view.clone();
            let events = events.clone();
            timers.schedule_interval("health:report", self.config.report_interval(), move || {
                let report = HealthReport::from_view(&view.borrow());
                debug!("[health] report generated ({} components)", report.components.len());
                events.emit(HealthEvent::Report(Box::new(report)));
            });
        }
        {
            let view = view.clone();
            let events = events.clone();
            let params = PredictionParams {
                window: self.config.prediction_window,
                horizon: self.config.prediction_horizon,
                risk_threshold: self.config.risk_threshold,
            };
            timers.schedule_interval("health:prediction", self.config.prediction_interval(), move || {
                let flagged = prediction::at_risk(&view.borrow().score_history, params);
                for event in flagged {
                    if let HealthEvent::PredictionRisk { component, projected, .. } = &event {
                        warn!("[health] {component} trending down, projected {projected:.3}");
                    }
                    events.emit(event);
                }
            });
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(stop_rx, commands_rx));

        MonitorHandle {
            view,
            events,
            timers,
            commands: commands_tx,
            stop: Mutex::new(Some(stop_tx)),
            task: Mutex::new(Some(task)),
        }
    }

    fn handle_command(&mut self, cmd: MonitorCommand) {
        match cmd {
            MonitorCommand::Register { record, reply } => {
                let _ = reply.send(self.insert_component(record));
            }
            MonitorCommand::TripBreaker { id, reason, reply } => {
                let _ = reply.send(self.trigger_circuit_breaker(&id, &reason));
            }
            MonitorCommand::ResetBreaker { id, reply } => {
                let _ = reply.send(self.reset_circuit_breaker(&id));
            }
        }
    }

    async fn run(mut self, mut stop: oneshot::Receiver<()>, mut commands: mpsc::UnboundedReceiver<MonitorCommand>) {
        let check_every = self.config.check_interval();
        let aggregate_every = self.config.aggregation_interval();
        let mut check = tokio::time::interval(check_every);
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut aggregate = tokio::time::interval_at(Instant::now() + aggregate_every, aggregate_every);
        aggregate.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            "[health] monitoring {} component(s) every {}s",
            self.components.len(),
            check_every.as_secs()
        );
        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = check.tick() => {
                    self.perform_health_check().await;
                }
                _ = aggregate.tick() => {
                    self.aggregate_metrics().await;
                }
                Some(cmd) = commands.recv() => self.handle_command(cmd),
            }
        }
        self.shutdown();
    }
}

/// Opérations externes sur un moniteur lancé, traitées entre deux cycles
enum MonitorCommand {
    Register {
        record: ComponentRecord,
        reply: oneshot::Sender<Result<(), MonitorError>>,
    },
    TripBreaker {
        id: String,
        reason: String,
        reply: oneshot::Sender<Result<bool, MonitorError>>,
    },
    ResetBreaker {
        id: String,
        reply: oneshot::Sender<Result<Option<Duration>, MonitorError>>,
    },
}

/// Poignée vers un moniteur lancé par `spawn()`
pub struct MonitorHandle {
    view: View<MonitorView>,
    events: EventBus<HealthEvent>,
    timers: TimerRegistry,
    commands: mpsc::UnboundedSender<MonitorCommand>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorHandle {
    pub fn view(&self) -> View<MonitorView> {
        self.view.clone()
    }

    pub fn current(&self) -> Arc<MonitorView> {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<HealthEvent> {
        self.events.subscribe()
    }

    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }

    /// Enregistrement à chaud, quand une dépendance devient disponible
    pub async fn register_component<C: Send + Sync + 'static>(
        &self,
        id: impl Into<String>,
        instance: Arc<C>,
        config: ComponentConfig<C>,
    ) -> Result<(), MonitorError> {
        let record = ComponentRecord::bind(id.into(), instance, config);
        self.request(|reply| MonitorCommand::Register { record, reply }).await?
    }

    pub async fn trigger_circuit_breaker(&self, id: &str, reason: &str) -> Result<bool, MonitorError> {
        let (id, reason) = (id.to_string(), reason.to_string());
        self.request(|reply| MonitorCommand::TripBreaker { id, reason, reply }).await?
    }

    pub async fn reset_circuit_breaker(&self, id: &str) -> Result<Option<Duration>, MonitorError> {
        let id = id.to_string();
        self.request(|reply| MonitorCommand::ResetBreaker { id, reply }).await?
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> MonitorCommand,
    ) -> Result<R, MonitorError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(command(tx)).map_err(|_| MonitorError::NotRunning)?;
        rx.await.map_err(|_| MonitorError::NotRunning)
    }

    /// Arrête les timers puis la boucle de check. Idempotent.
    pub async fn shutdown(&self) {
        self.timers.shutdown();
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("[health] monitor task ended abnormally: {e}");
            }
        }
    }
}

async fn run_check(id: &str, check: BoundCheck, timeout: Duration) -> HealthResult {
    let guarded = AssertUnwindSafe(async move { check().await }).catch_unwind();
    match tokio::time::timeout(timeout, guarded).await {
        Ok(Ok(Ok(result))) => result,
        Ok(Ok(Err(e))) => {
            warn!("[health] check for {id} failed: {e:#}");
            HealthResult::failed(e.to_string())
        }
        Ok(Err(_)) => {
            error!("[health] check for {id} panicked");
            HealthResult::failed("health check panicked")
        }
        Err(_) => {
            warn!("[health] check for {id} timed out after {}s", timeout.as_secs());
            HealthResult::failed(format!("health check timed out after {}s", timeout.as_secs()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Composant de test dont le score est piloté à la main
    struct Dial {
        score: Mutex<f64>,
    }

    impl Dial {
        fn new(score: f64) -> Arc<Self> {
            Arc::new(Self { score: Mutex::new(score) })
        }

        fn set(&self, score: f64) {
            *self.score.lock() = score;
        }
    }

    fn dial_config(priority: Priority) -> ComponentConfig<Dial> {
        ComponentConfig::new(priority, |dial: Arc<Dial>| async move {
            let score = *dial.score.lock();
            Ok(HealthResult::from_score(score))
        })
    }

    fn result(score: f64) -> HealthResult {
        HealthResult::from_score(score)
    }

    fn monitor_with(dials: &[(&str, Priority, Arc<Dial>)]) -> HealthMonitor {
        let mut monitor = HealthMonitor::new(MonitorConf::default());
        for (id, priority, dial) in dials {
            monitor.register_component(*id, dial.clone(), dial_config(*priority)).unwrap();
        }
        monitor
    }

    #[test]
    fn test_duplicate_component_rejected() {
        let mut monitor = HealthMonitor::new(MonitorConf::default());
        monitor.register_component("db", Dial::new(1.0), dial_config(Priority::High)).unwrap();
        let err = monitor.register_component("db", Dial::new(1.0), dial_config(Priority::Low)).unwrap_err();
        assert!(matches!(err, MonitorError::DuplicateComponent(id) if id == "db"));
    }

    #[test]
    fn test_healthy_critical_category_is_not_overridden() {
        let monitor = monitor_with(&[
            ("conn", Priority::Critical, Dial::new(1.0)),
            ("cache", Priority::High, Dial::new(1.0)),
            ("stats", Priority::Medium, Dial::new(1.0)),
        ]);
        let mut results = BTreeMap::new();
        results.insert("conn".to_string(), result(0.9));
        results.insert("cache".to_string(), result(1.0));
        results.insert("stats".to_string(), result(1.0));

        let snapshot = monitor.calculate_system_health(&results);
        // (0.9*4 + 3 + 2) / 9
        assert!((snapshot.score - 8.6 / 9.0).abs() < 1e-9);
        assert_eq!(snapshot.status, HealthStatus::Healthy);
        assert_eq!(snapshot.category_averages[&Priority::Critical], 0.9);
    }

    #[test]
    fn test_broken_critical_component_forces_critical() {
        let mut dials = vec![("conn", Priority::Critical, Dial::new(1.0))];
        let names: Vec<String> = (0..60).map(|i| format!("low{i}")).collect();
        for name in &names {
            dials.push((name.as_str(), Priority::Low, Dial::new(1.0)));
        }
        let monitor = monitor_with(&dials);

        let mut results = BTreeMap::new();
        results.insert("conn".to_string(), HealthResult::new(HealthStatus::Critical, 0.3));
        for name in &names {
            results.insert(name.clone(), result(1.0));
        }

        let snapshot = monitor.calculate_system_health(&results);
        assert!(snapshot.score >= 0.95, "weighted mean stays high: {}", snapshot.score);
        assert_eq!(snapshot.status, HealthStatus::Critical);
        assert_eq!(snapshot.failed_components, vec!["conn".to_string()]);
    }

    #[test]
    fn test_no_components_is_unknown() {
        let monitor = HealthMonitor::new(MonitorConf::default());
        let snapshot = monitor.calculate_system_health(&BTreeMap::new());
        assert_eq!(snapshot.status, HealthStatus::Unknown);
        assert_eq!(snapshot.score, 1.0);
    }

    #[tokio::test]
    async fn test_failing_check_does_not_abort_cycle() {
        let mut monitor = monitor_with(&[("ok", Priority::High, Dial::new(1.0))]);
        monitor
            .register_component(
                "broken",
                Dial::new(1.0),
                ComponentConfig::new(Priority::Medium, |_: Arc<Dial>| async move {
                    Err::<HealthResult, _>(anyhow::anyhow!("database unreachable"))
                }),
            )
            .unwrap();
        monitor
            .register_component(
                "panicky",
                Dial::new(1.0),
                ComponentConfig::new(Priority::Low, |_: Arc<Dial>| async move {
                    if true {
                        panic!("boom");
                    }
                    Ok(HealthResult::healthy())
                }),
            )
            .unwrap();

        let snapshot = monitor.perform_health_check().await;
        let view = monitor.view().borrow().clone();

        let broken = view.component("broken").unwrap();
        assert_eq!(broken.status, HealthStatus::Failed);
        assert_eq!(broken.score, 0.0);
        assert_eq!(broken.details["error"], "database unreachable");
        assert_eq!(view.component("panicky").unwrap().status, HealthStatus::Failed);
        assert_eq!(view.component("ok").unwrap().status, HealthStatus::Healthy);

        // (1.0*3 + 0*2 + 0*1) / 6
        assert!((snapshot.score - 0.5).abs() < 1e-9);
        assert_eq!(snapshot.component_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_check_times_out() {
        let mut conf = MonitorConf::default();
        conf.check_timeout_secs = 1;
        let mut monitor = HealthMonitor::new(conf);
        monitor
            .register_component(
                "slow",
                Dial::new(1.0),
                ComponentConfig::new(Priority::High, |_: Arc<Dial>| async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(HealthResult::healthy())
                }),
            )
            .unwrap();

        monitor.perform_health_check().await;
        let view = monitor.view().borrow().clone();
        assert_eq!(view.component("slow").unwrap().status, HealthStatus::Failed);
    }

    #[tokio::test]
    async fn test_emergency_activates_and_resolves_once() {
        let conn = Dial::new(1.0);
        let mut monitor = monitor_with(&[("conn", Priority::Critical, conn.clone())]);
        let mut events = monitor.subscribe();

        monitor.perform_health_check().await;
        conn.set(0.2);
        for _ in 0..5 {
            monitor.perform_health_check().await;
        }
        assert!(monitor.emergency().is_active);
        assert_eq!(monitor.emergency().triggered_by, vec!["conn".to_string()]);

        conn.set(1.0);
        for _ in 0..3 {
            monitor.perform_health_check().await;
        }
        assert!(!monitor.emergency().is_active);

        let mut activated = 0;
        let mut resolved = 0;
        let mut changes = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                HealthEvent::EmergencyActivated { recovery_plan, .. } => {
                    activated += 1;
                    assert_eq!(recovery_plan[0].action, RecoveryAction::Restart);
                    assert_eq!(recovery_plan[1].action, RecoveryAction::SafeMode);
                }
                HealthEvent::EmergencyResolved { .. } => resolved += 1,
                HealthEvent::SystemChanged { .. } => changes += 1,
                _ => {}
            }
        }
        assert_eq!(activated, 1);
        assert_eq!(resolved, 1);
        // healthy (initial) -> failed -> healthy
        assert_eq!(changes, 3);
    }

    #[tokio::test]
    async fn test_breaker_opens_after_consecutive_failures() {
        let db = Dial::new(0.0);
        let mut monitor = monitor_with(&[("db", Priority::High, db.clone())]);
        let mut events = monitor.subscribe();

        monitor.perform_health_check().await;
        monitor.perform_health_check().await;
        assert!(!monitor.breaker("db").unwrap().is_open);
        monitor.perform_health_check().await;
        assert!(monitor.breaker("db").unwrap().is_open);

        db.set(1.0);
        monitor.perform_health_check().await;
        assert!(!monitor.breaker("db").unwrap().is_open);

        let topics: Vec<&str> = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, HealthEvent::BreakerOpened { .. } | HealthEvent::BreakerClosed { .. }))
            .map(|e| crate::events::Topic::topic(&e))
            .collect();
        assert_eq!(topics, vec!["circuit:breaker:opened", "circuit:breaker:closed"]);
    }

    #[tokio::test]
    async fn test_breaker_signal_from_component() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut monitor = HealthMonitor::new(MonitorConf::default());
        let counter = calls.clone();
        monitor
            .register_component(
                "conn",
                Arc::new(()),
                ComponentConfig::new(Priority::Critical, move |_: Arc<()>| {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        let result = HealthResult::from_score(0.75);
                        Ok(if n == 0 {
                            result.with_breaker_signal(Some(BreakerSignal::Trip { reason: "flapping".into() }))
                        } else {
                            result.with_breaker_signal(Some(BreakerSignal::Recovered))
                        })
                    }
                }),
            )
            .unwrap();

        monitor.perform_health_check().await;
        assert!(monitor.breaker("conn").unwrap().is_open);
        monitor.perform_health_check().await;
        assert!(!monitor.breaker("conn").unwrap().is_open);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_manual_breaker_unknown_component() {
        let mut monitor = HealthMonitor::new(MonitorConf::default());
        assert!(matches!(
            monitor.trigger_circuit_breaker("ghost", "test"),
            Err(MonitorError::UnknownComponent(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_breaker_reset_reports_open_duration() {
        let mut monitor = monitor_with(&[("db", Priority::High, Dial::new(1.0))]);
        let mut events = monitor.subscribe();

        assert!(monitor.trigger_circuit_breaker("db", "maintenance").unwrap());
        assert!(!monitor.trigger_circuit_breaker("db", "still in maintenance").unwrap());
        assert!(monitor.view().borrow().is_breaker_open("db"));

        tokio::time::advance(Duration::from_secs(42)).await;
        assert_eq!(monitor.reset_circuit_breaker("db").unwrap(), Some(Duration::from_secs(42)));
        assert_eq!(monitor.reset_circuit_breaker("db").unwrap(), None);
        assert!(!monitor.view().borrow().is_breaker_open("db"));

        let mut opened = 0;
        let mut closed = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                HealthEvent::BreakerOpened { .. } => opened += 1,
                HealthEvent::BreakerClosed { component, open_for_ms } => closed.push((component, open_for_ms)),
                _ => {}
            }
        }
        assert_eq!(opened, 1);
        assert_eq!(closed, vec![("db".to_string(), 42_000)]);
    }

    #[test]
    fn test_direct_emergency_activation_is_idempotent() {
        let mut monitor = monitor_with(&[("conn", Priority::Critical, Dial::new(1.0))]);
        let mut events = monitor.subscribe();

        let mut results = BTreeMap::new();
        results.insert("conn".to_string(), HealthResult::new(HealthStatus::Failed, 0.0));
        let failing = monitor.calculate_system_health(&results);
        monitor.activate_emergency_mode(&failing);
        let episode = monitor.emergency().episode_id;
        monitor.activate_emergency_mode(&failing);
        monitor.update_system_health(&failing);
        assert!(monitor.emergency().is_active);
        assert_eq!(monitor.emergency().episode_id, episode);
        assert!(monitor.view().borrow().emergency.is_active);

        results.insert("conn".to_string(), result(1.0));
        let healthy = monitor.calculate_system_health(&results);
        monitor.resolve_emergency_mode(&healthy);
        monitor.resolve_emergency_mode(&healthy);
        assert!(!monitor.emergency().is_active);

        let topics: Vec<&str> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| crate::events::Topic::topic(&e))
            .filter(|t| t.starts_with("health:emergency"))
            .collect();
        assert_eq!(topics, vec!["health:emergency:activated", "health:emergency:resolved"]);
    }

    #[test]
    fn test_update_system_health_is_edge_triggered() {
        let mut monitor = monitor_with(&[("conn", Priority::Critical, Dial::new(1.0))]);
        let mut events = monitor.subscribe();

        let mut results = BTreeMap::new();
        results.insert("conn".to_string(), result(0.2));
        let failing = monitor.calculate_system_health(&results);
        results.insert("conn".to_string(), result(1.0));
        let healthy = monitor.calculate_system_health(&results);

        for _ in 0..3 {
            monitor.update_system_health(&failing);
        }
        assert!(monitor.emergency().is_active);
        for _ in 0..3 {
            monitor.update_system_health(&healthy);
        }
        assert!(!monitor.emergency().is_active);
        assert_eq!(monitor.last_snapshot().map(|s| s.status), Some(HealthStatus::Healthy));

        let mut changes = Vec::new();
        let mut emergencies = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                HealthEvent::SystemChanged { from, to, .. } => changes.push((from, to)),
                HealthEvent::EmergencyActivated { .. } | HealthEvent::EmergencyResolved { .. } => emergencies += 1,
                _ => {}
            }
        }
        assert_eq!(
            changes,
            vec![(None, failing.status), (Some(failing.status), HealthStatus::Healthy)]
        );
        assert_eq!(emergencies, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_monitor_accepts_commands() {
        let mut conf = MonitorConf::default();
        conf.check_interval_secs = 1;
        let monitor = HealthMonitor::new(conf).spawn();

        monitor.register_component("db", Dial::new(0.9), dial_config(Priority::High)).await.unwrap();
        let dup = monitor.register_component("db", Dial::new(1.0), dial_config(Priority::Low)).await;
        assert!(matches!(dup, Err(MonitorError::DuplicateComponent(_))));

        assert!(monitor.trigger_circuit_breaker("db", "operator").await.unwrap());
        assert!(monitor.current().is_breaker_open("db"));

        // des résultats warning ne referment pas un breaker ouvert à la main
        tokio::time::sleep(Duration::from_secs(3)).await;
        let view = monitor.current();
        assert!(view.is_breaker_open("db"));
        assert_eq!(view.component("db").map(|c| c.status), Some(HealthStatus::Warning));

        let open_for = monitor.reset_circuit_breaker("db").await.unwrap();
        assert!(open_for.is_some_and(|d| d >= Duration::from_secs(3)));
        assert!(!monitor.current().is_breaker_open("db"));
        let ghost = monitor.reset_circuit_breaker("ghost").await;
        assert!(matches!(ghost, Err(MonitorError::UnknownComponent(_))));

        monitor.shutdown().await;
        let after = monitor.trigger_circuit_breaker("db", "late").await;
        assert!(matches!(after, Err(MonitorError::NotRunning)));
    }

    #[tokio::test]
    async fn test_metrics_are_collected() {
        let mut monitor = HealthMonitor::new(MonitorConf::default());
        let config = dial_config(Priority::Low).with_metrics(|dial: Arc<Dial>| async move {
            let score = *dial.score.lock();
            Ok(serde_json::json!({ "score": score }))
        });
        monitor.register_component("dial", Dial::new(0.5), config).unwrap();

        monitor.aggregate_metrics().await;
        let view = monitor.view().borrow().clone();
        assert_eq!(view.component("dial").unwrap().metrics, Some(serde_json::json!({ "score": 0.5 })));
    }
}
