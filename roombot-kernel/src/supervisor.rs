/**
 * SUPERVISEUR DE CONNEXION - Cycle de vie de la connexion au service de salons
 *
 * RÔLE :
 * Garder le bot connecté sans jamais dépasser un rythme de tentatives sûr.
 *
 * MACHINE À ÉTATS :
 * disconnected → connecting → connected
 * connecting → throttled → connecting   (délai minimal entre connexions)
 * connecting → failed                   (plafond de tentatives, terminal jusqu'à reset)
 *
 * FONCTIONNEMENT :
 * - Acteur unique : toutes les mutations passent par `&mut self`, donc au plus
 *   une tentative de reconnexion en cours
 * - "Faut-il réessayer" (plafond de tentatives) et "combien attendre"
 *   (backoff + fenêtre horaire) sont décidés séparément
 * - Le plafond horaire s'applique à toute tentative, y compris après une
 *   connexion réussie puis perdue (connexion instable)
 * - Chaque délai passe par le `TimerRegistry` ; `cleanup()` annule tout
 */

use crate::backoff::{Backoff, BackoffView, ConnectionWindow};
use crate::config::{SupervisorConf, TransportConf};
use crate::events::{EventBus, SupervisorEvent};
use crate::ledger::{remaining_delay, ConnectionKind, ConnectionLedger};
use crate::scheduler::{termination_signal, TimerRegistry};
use crate::session::SessionCache;
use crate::transport::{RoomMessage, Transport, TransportError, TransportEvent};
use serde::Serialize;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub const RECONNECT_TIMER: &str = "reconnect";
const SIGNAL_TASK: &str = "signal:termination";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Throttled,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("supervisor is not running")]
    NotRunning,
}

/// Salon et identifiants utilisés à chaque (re)connexion
#[derive(Debug, Clone)]
pub struct SessionTarget {
    pub channel: String,
    pub username: String,
    pub password: Option<String>,
}

impl From<&TransportConf> for SessionTarget {
    fn from(conf: &TransportConf) -> Self {
        Self {
            channel: conf.channel.clone(),
            username: conf.username.clone(),
            password: conf.password.clone(),
        }
    }
}

/// État de connexion, muté uniquement par le superviseur
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Tentatives depuis la dernière connexion réussie
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub history: ConnectionWindow,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_connected: Option<OffsetDateTime>,
}

/// Vue en lecture seule publiée après chaque transition
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: BackoffView,
    pub attempts_last_hour: usize,
    pub consecutive_failures: u32,
    pub pending_timers: Vec<String>,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_connected: Option<OffsetDateTime>,
    pub shutting_down: bool,
}

#[derive(Debug)]
enum SupervisorCommand {
    Connect,
    Disconnect,
    /// Timer de retry échu, identifié par son ticket
    Retry(u64),
    Reset,
    Shutdown(Option<oneshot::Sender<()>>),
}

/// Retry en attente : ticket du timer, et délai déjà freiné par le plafond horaire
#[derive(Debug, Clone, Copy)]
struct PendingRetry {
    ticket: u64,
    paced: bool,
}

/// Poignée clonable vers l'acteur superviseur
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<SupervisorCommand>,
    snapshots: watch::Receiver<ConnectionSnapshot>,
    events: EventBus<SupervisorEvent>,
    messages: EventBus<RoomMessage>,
}

impl SupervisorHandle {
    pub fn connect(&self) -> Result<(), SupervisorError> {
        self.send(SupervisorCommand::Connect)
    }

    pub fn disconnect(&self) -> Result<(), SupervisorError> {
        self.send(SupervisorCommand::Disconnect)
    }

    /// Sortie de l'état `failed` (intervention externe)
    pub fn reset(&self) -> Result<(), SupervisorError> {
        self.send(SupervisorCommand::Reset)
    }

    /// Demande l'arrêt et attend que le nettoyage soit terminé
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(SupervisorCommand::Shutdown(Some(tx)))?;
        rx.await.map_err(|_| SupervisorError::NotRunning)
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshots.clone()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Messages de salon dédupliqués, pour le dispatch des commandes
    pub fn subscribe_messages(&self) -> mpsc::UnboundedReceiver<RoomMessage> {
        self.messages.subscribe()
    }

    fn send(&self, cmd: SupervisorCommand) -> Result<(), SupervisorError> {
        self.commands.send(cmd).map_err(|_| SupervisorError::NotRunning)
    }
}

pub struct ConnectionSupervisor<T: Transport, L: ConnectionLedger> {
    transport: T,
    ledger: L,
    config: SupervisorConf,
    target: SessionTarget,
    state: ConnectionState,
    timers: TimerRegistry,
    session: SessionCache,
    events: EventBus<SupervisorEvent>,
    messages: EventBus<RoomMessage>,
    commands_tx: mpsc::UnboundedSender<SupervisorCommand>,
    commands_rx: mpsc::UnboundedReceiver<SupervisorCommand>,
    snapshot_tx: watch::Sender<ConnectionSnapshot>,
    snapshot_rx: watch::Receiver<ConnectionSnapshot>,
    retry: Option<PendingRetry>,
    retry_seq: u64,
    transport_closed: bool,
}

impl<T: Transport, L: ConnectionLedger> ConnectionSupervisor<T, L> {
    pub fn new(transport: T, ledger: L, config: SupervisorConf, target: SessionTarget) -> Self {
        let timers = TimerRegistry::new();
        let session = SessionCache::new(timers.clone(), config.dedup_capacity, config.mention_timeout());
        let state = ConnectionState {
            status: ConnectionStatus::Disconnected,
            attempts: 0,
            max_attempts: config.max_attempts,
            backoff: Backoff::from_conf(&config.backoff),
            history: ConnectionWindow::new(),
            consecutive_failures: 0,
            last_error: None,
            last_connected: None,
        };
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let initial = ConnectionSnapshot {
            status: state.status,
            attempts: 0,
            max_attempts: state.max_attempts,
            backoff: state.backoff.view(),
            attempts_last_hour: 0,
            consecutive_failures: 0,
            pending_timers: Vec::new(),
            last_error: None,
            last_connected: None,
            shutting_down: false,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);

        Self {
            transport,
            ledger,
            config,
            target,
            state,
            timers,
            session,
            events: EventBus::new(),
            messages: EventBus::new(),
            commands_tx,
            commands_rx,
            snapshot_tx,
            snapshot_rx,
            retry: None,
            retry_seq: 0,
            transport_closed: false,
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            commands: self.commands_tx.clone(),
            snapshots: self.snapshot_rx.clone(),
            events: self.events.clone(),
            messages: self.messages.clone(),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let mut history = self.state.history.clone();
        ConnectionSnapshot {
            status: self.state.status,
            attempts: self.state.attempts,
            max_attempts: self.state.max_attempts,
            backoff: self.state.backoff.view(),
            attempts_last_hour: history.count(Instant::now()),
            consecutive_failures: self.state.consecutive_failures,
            pending_timers: self.timers.labels(),
            last_error: self.state.last_error.clone(),
            last_connected: self.state.last_connected,
            shutting_down: self.timers.is_shutting_down(),
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    /// Connexion initiale. Sans effet (log) si déjà connecté.
    pub async fn connect(&mut self) {
        match self.state.status {
            ConnectionStatus::Connected => {
                info!("[supervisor] connect ignored: already connected");
            }
            ConnectionStatus::Failed => {
                warn!("[supervisor] connect ignored: max attempts exceeded, reset required");
            }
            _ => self.handle_reconnect().await,
        }
    }

    /// Ferme la connexion et purge l'état de session (timers compris)
    pub async fn disconnect(&mut self) {
        self.cancel_retry();
        self.session.clear();

        if let Err(e) = self.transport.disconnect().await {
            warn!("[supervisor] transport disconnect failed: {e}");
        }

        let was_connected = self.state.status == ConnectionStatus::Connected;
        if self.state.status != ConnectionStatus::Failed {
            self.state.status = ConnectionStatus::Disconnected;
        }
        if was_connected {
            self.log_event(ConnectionKind::Disconnect, serde_json::json!({ "reason": "requested" })).await;
        }
        self.events.emit(SupervisorEvent::Disconnected { reason: "requested".into() });
        info!("[supervisor] disconnected on request");
        self.publish();
    }

    /// Cœur de la reconnexion, déclenché par le transport (`Reconnecting`) ou par le timer de retry.
    pub async fn handle_reconnect(&mut self) {
        if self.timers.is_shutting_down() {
            debug!("[supervisor] reconnect skipped: shutting down");
            return;
        }
        if self.state.status == ConnectionStatus::Failed {
            warn!("[supervisor] reconnect skipped: max attempts exceeded, reset required");
            return;
        }
        let paced = self.retry.take().is_some_and(|r| r.paced);

        // Politique de bon voisinage : délai minimal depuis la dernière tentative
        if let Some(wait) = self.throttle_wait().await {
            self.state.status = ConnectionStatus::Throttled;
            info!("[supervisor] throttled, next attempt in {}ms", wait.as_millis());
            self.events.emit(SupervisorEvent::Throttled { wait_ms: wait.as_millis() as u64 });
            self.schedule_retry(wait, paced);
            self.publish();
            return;
        }

        // Plafond horaire : un délai déjà freiné n'est pas repénalisé
        if !paced {
            if let Some(delay) = self.storm_check() {
                self.state.status = ConnectionStatus::Disconnected;
                self.schedule_retry(delay, true);
                self.events.emit(SupervisorEvent::RetryScheduled {
                    delay_ms: delay.as_millis() as u64,
                    next_attempt: self.state.attempts + 1,
                });
                self.publish();
                return;
            }
        }

        // Incrément après les contrôles de rythme : une attente imposée ne consomme pas de tentative
        self.state.attempts += 1;
        let attempt = self.state.attempts;

        if attempt > self.state.max_attempts {
            self.state.status = ConnectionStatus::Failed;
            self.cancel_retry();
            error!(
                "[supervisor] max attempts exceeded ({}), giving up until reset",
                self.state.max_attempts
            );
            self.log_event(ConnectionKind::GaveUp, serde_json::json!({ "attempts": attempt - 1 })).await;
            self.events.emit(SupervisorEvent::GaveUp { attempts: attempt - 1 });
            self.publish();
            return;
        }

        // Session périmée : caches anti-écho et mentions en attente
        self.session.clear();
        self.cancel_retry();

        self.state.status = ConnectionStatus::Connecting;
        self.state.history.record(Instant::now());
        self.events.emit(SupervisorEvent::Connecting { attempt });
        self.publish();
        self.log_event(ConnectionKind::Attempt, serde_json::json!({ "attempt": attempt })).await;
        info!("[supervisor] connection attempt {}/{}", attempt, self.state.max_attempts);

        match self.establish().await {
            Ok(()) => self.on_connected(attempt).await,
            Err(e) => self.on_connect_failed(attempt, e).await,
        }
        self.publish();
    }

    /// connect + join + login ; en cas d'échec partiel la connexion est refermée
    async fn establish(&mut self) -> Result<(), TransportError> {
        self.transport.connect().await?;

        let joined = self.transport.join_channel(&self.target.channel).await;
        let logged = match joined {
            Ok(()) => {
                self.transport
                    .login(&self.target.username, self.target.password.as_deref())
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = logged {
            if let Err(close) = self.transport.disconnect().await {
                debug!("[supervisor] cleanup after failed session setup: {close}");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn on_connected(&mut self, attempts: u32) {
        self.state.attempts = 0;
        self.state.backoff.reset();
        self.state.consecutive_failures = 0;
        self.state.last_error = None;
        self.state.status = ConnectionStatus::Connected;
        self.state.last_connected = Some(OffsetDateTime::now_utc());

        info!("[supervisor] connected to #{} after {} attempt(s)", self.target.channel, attempts);
        self.log_event(ConnectionKind::Connected, serde_json::json!({ "attempts": attempts })).await;
        self.events.emit(SupervisorEvent::Reconnected { attempts });
    }

    async fn on_connect_failed(&mut self, attempt: u32, err: TransportError) {
        self.state.consecutive_failures += 1;
        self.state.last_error = Some(err.to_string());
        self.state.status = ConnectionStatus::Disconnected;

        warn!("[supervisor] attempt {attempt} failed: {err}");
        self.log_event(
            ConnectionKind::Failure,
            serde_json::json!({ "attempt": attempt, "error": err.to_string() }),
        )
        .await;
        self.events.emit(SupervisorEvent::ConnectFailed {
            attempt,
            error: err.to_string(),
            rate_limited: err.is_rate_limited(),
        });

        // Le service a lui-même fixé le prochain essai : un seul retry, sans contrôle anti-tempête
        if let Some(retry_after) = err.retry_after() {
            info!("[supervisor] rate limited, retrying in {}ms", retry_after.as_millis());
            self.schedule_retry(retry_after, true);
            self.events.emit(SupervisorEvent::RetryScheduled {
                delay_ms: retry_after.as_millis() as u64,
                next_attempt: attempt + 1,
            });
            return;
        }

        let (delay, paced) = match self.storm_check() {
            Some(delay) => (delay, true),
            None => (self.state.backoff.current(), false),
        };
        self.schedule_retry(delay, paced);
        self.events.emit(SupervisorEvent::RetryScheduled {
            delay_ms: delay.as_millis() as u64,
            next_attempt: attempt + 1,
        });
    }

    /// Plafond horaire atteint : le backoff grandit au lieu d'un retry immédiat
    fn storm_check(&mut self) -> Option<Duration> {
        let now = Instant::now();
        let ceiling = self.config.max_connections_per_hour;
        if !self.state.history.exceeds(ceiling, now) {
            return None;
        }
        let delay = self.state.backoff.increase();
        let attempts_last_hour = self.state.history.count(now);
        warn!(
            "[supervisor] {} attempts in the last hour (ceiling {}), backing off {}ms",
            attempts_last_hour,
            ceiling,
            delay.as_millis()
        );
        self.events.emit(SupervisorEvent::BackoffIncreased {
            delay_ms: delay.as_millis() as u64,
            attempts_last_hour,
        });
        Some(delay)
    }

    async fn throttle_wait(&self) -> Option<Duration> {
        let min_delay = self.config.min_connect_delay();
        if min_delay.is_zero() {
            return None;
        }
        match self.ledger.can_connect(min_delay).await {
            Ok(true) => None,
            Ok(false) => {
                let last = match self.ledger.last_connection_time(ConnectionKind::Attempt).await {
                    Ok(last) => last,
                    Err(e) => {
                        warn!("[supervisor] ledger read failed: {e}");
                        None
                    }
                };
                let wait = remaining_delay(last, min_delay, OffsetDateTime::now_utc());
                if wait.is_zero() {
                    None
                } else {
                    Some(wait)
                }
            }
            Err(e) => {
                warn!("[supervisor] ledger unavailable, skipping throttle check: {e}");
                None
            }
        }
    }

    /// Remplace le retry en attente ; le ticket permet d'écarter un timer périmé
    fn schedule_retry(&mut self, delay: Duration, paced: bool) {
        self.retry_seq += 1;
        let ticket = self.retry_seq;
        let tx = self.commands_tx.clone();
        let scheduled = self.timers.schedule_once(RECONNECT_TIMER, delay, move || {
            let _ = tx.send(SupervisorCommand::Retry(ticket));
        });
        self.retry = scheduled.then_some(PendingRetry { ticket, paced });
    }

    fn cancel_retry(&mut self) {
        self.timers.cancel(RECONNECT_TIMER);
        self.retry = None;
    }

    async fn log_event(&self, kind: ConnectionKind, meta: serde_json::Value) {
        if let Err(e) = self.ledger.log_connection_event(kind, meta).await {
            warn!("[supervisor] failed to record {} in ledger: {e}", kind.as_str());
        }
    }

    /// Déclencheur de reconnexion venant du transport (`None`) ou d'un timer de retry.
    /// Les déclencheurs redondants ou périmés sont fusionnés.
    async fn request_reconnect(&mut self, ticket: Option<u64>) {
        match self.state.status {
            ConnectionStatus::Connected => {
                debug!("[supervisor] reconnect trigger ignored: connected");
                return;
            }
            ConnectionStatus::Failed => {
                debug!("[supervisor] reconnect trigger ignored: failed state");
                return;
            }
            _ => {}
        }
        match ticket {
            Some(ticket) if self.retry.map(|r| r.ticket) != Some(ticket) => {
                debug!("[supervisor] stale retry #{ticket} ignored");
                return;
            }
            None if self.timers.contains(RECONNECT_TIMER) => {
                debug!("[supervisor] reconnect trigger ignored: retry already scheduled");
                return;
            }
            _ => {}
        }
        self.handle_reconnect().await;
    }

    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Disconnected { reason } => {
                if matches!(self.state.status, ConnectionStatus::Connected | ConnectionStatus::Connecting) {
                    warn!("[supervisor] connection lost: {reason}");
                    self.state.status = ConnectionStatus::Disconnected;
                    self.session.clear();
                    self.log_event(ConnectionKind::Disconnect, serde_json::json!({ "reason": reason })).await;
                    self.events.emit(SupervisorEvent::Disconnected { reason });
                    self.publish();
                }
            }
            TransportEvent::Reconnecting => self.request_reconnect(None).await,
            TransportEvent::StateChange(state) => debug!("[supervisor] transport state: {state:?}"),
            TransportEvent::Message(msg) => {
                if self.session.is_duplicate(&msg.id) {
                    debug!("[supervisor] dropping echo {}", msg.id);
                } else {
                    self.messages.emit(msg);
                }
            }
        }
    }

    pub fn is_duplicate(&mut self, message_id: &str) -> bool {
        self.session.is_duplicate(message_id)
    }

    pub fn track_mention(&mut self, user: &str) -> bool {
        self.session.track_mention(user)
    }

    pub fn resolve_mention(&mut self, user: &str) -> bool {
        self.session.resolve_mention(user)
    }

    pub fn pending_mentions(&self) -> Vec<String> {
        self.session.pending_mentions()
    }

    /// Remise à zéro après `failed` : compteur, backoff, statut
    pub fn reset(&mut self) {
        self.state.attempts = 0;
        self.state.consecutive_failures = 0;
        self.state.backoff.reset();
        self.state.last_error = None;
        if self.state.status == ConnectionStatus::Failed {
            self.state.status = ConnectionStatus::Disconnected;
        }
        info!("[supervisor] state reset, ready for a new connection");
        self.events.emit(SupervisorEvent::Reset);
        self.publish();
    }

    /// Écoute Ctrl-C/SIGTERM ; le listener est tracé et détaché par `cleanup()`
    pub fn watch_termination_signals(&self) -> bool {
        let tx = self.commands_tx.clone();
        let listener = tokio::spawn(async move {
            termination_signal().await;
            info!("[supervisor] termination signal received");
            let _ = tx.send(SupervisorCommand::Shutdown(None));
        });
        self.timers.track_task(SIGNAL_TASK, listener)
    }

    /// Arrêt : annule tous les timers (et le listener de signaux), purge la session
    /// et l'historique, ferme le transport. Idempotent.
    pub async fn cleanup(&mut self) {
        let first = !self.timers.is_shutting_down();
        let cancelled = self.timers.shutdown();
        self.retry = None;
        self.session.clear();
        self.state.history.clear();

        if first {
            if matches!(self.state.status, ConnectionStatus::Connected | ConnectionStatus::Connecting) {
                if let Err(e) = self.transport.disconnect().await {
                    warn!("[supervisor] transport disconnect during cleanup failed: {e}");
                }
                self.log_event(ConnectionKind::Disconnect, serde_json::json!({ "reason": "shutdown" })).await;
            }
            if self.state.status != ConnectionStatus::Failed {
                self.state.status = ConnectionStatus::Disconnected;
            }
            info!("[supervisor] cleanup complete ({cancelled} timers cancelled)");
        }
        self.publish();
    }

    async fn handle_command(&mut self, cmd: SupervisorCommand) -> bool {
        match cmd {
            SupervisorCommand::Connect => self.connect().await,
            SupervisorCommand::Disconnect => self.disconnect().await,
            SupervisorCommand::Retry(ticket) => self.request_reconnect(Some(ticket)).await,
            SupervisorCommand::Reset => self.reset(),
            SupervisorCommand::Shutdown(ack) => {
                self.cleanup().await;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                return false;
            }
        }
        true
    }

    /// Boucle de l'acteur : commandes + événements du transport, un message à la fois
    pub async fn run(mut self, mut transport_events: mpsc::UnboundedReceiver<TransportEvent>) {
        info!("[supervisor] running (channel #{})", self.target.channel);
        loop {
            tokio::select! {
                cmd = self.commands_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }
                event = transport_events.recv(), if !self.transport_closed => {
                    match event {
                        Some(event) => self.handle_transport_event(event).await,
                        None => {
                            debug!("[supervisor] transport event stream closed");
                            self.transport_closed = true;
                        }
                    }
                }
            }
        }
        self.cleanup().await;
        info!("[supervisor] stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Transport minimal : résultats de connexion scriptés
    #[derive(Clone, Default)]
    struct ScriptedTransport {
        outcomes: Arc<parking_lot::Mutex<VecDeque<Result<(), TransportError>>>>,
        connects: Arc<parking_lot::Mutex<u32>>,
    }

    impl ScriptedTransport {
        fn failing(n: usize) -> Self {
            let t = Self::default();
            for _ in 0..n {
                t.outcomes.lock().push_back(Err(TransportError::Refused("down".into())));
            }
            t
        }
    }

    impl Transport for ScriptedTransport {
        async fn connect(&mut self) -> Result<(), TransportError> {
            *self.connects.lock() += 1;
            self.outcomes.lock().pop_front().unwrap_or(Ok(()))
        }

        async fn disconnect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn join_channel(&mut self, _channel: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn login(&mut self, _user: &str, _pass: Option<&str>) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn conf() -> SupervisorConf {
        let mut conf = SupervisorConf::default();
        conf.min_connect_delay_ms = 0;
        conf.max_attempts = 3;
        conf
    }

    fn target() -> SessionTarget {
        SessionTarget { channel: "lobby".into(), username: "bot".into(), password: None }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_grow_then_reset_on_success() {
        let transport = ScriptedTransport::failing(2);
        let mut sup = ConnectionSupervisor::new(transport, MemoryLedger::new(), conf(), target());

        sup.handle_reconnect().await;
        assert_eq!(sup.state().attempts, 1);
        sup.handle_reconnect().await;
        assert_eq!(sup.state().attempts, 2);
        assert!(sup.timers().contains(RECONNECT_TIMER));

        sup.handle_reconnect().await;
        assert_eq!(sup.state().status, ConnectionStatus::Connected);
        assert_eq!(sup.state().attempts, 0);
        assert_eq!(sup.state().backoff.current(), sup.state().backoff.base());
        assert!(!sup.timers().contains(RECONNECT_TIMER));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_retry_ticket_is_ignored() {
        let transport = ScriptedTransport::failing(10);
        let connects = transport.connects.clone();
        let mut sup = ConnectionSupervisor::new(transport, MemoryLedger::new(), conf(), target());

        sup.handle_reconnect().await;
        let stale = sup.retry.map(|r| r.ticket).unwrap();
        sup.handle_reconnect().await;
        assert_eq!(*connects.lock(), 2);

        // un timer déjà échu ne doit pas court-circuiter le retry plus récent
        sup.request_reconnect(Some(stale)).await;
        assert_eq!(*connects.lock(), 2);
        assert!(sup.timers().contains(RECONNECT_TIMER));

        let current = sup.retry.map(|r| r.ticket).unwrap();
        sup.request_reconnect(Some(current)).await;
        assert_eq!(*connects.lock(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_noop_when_connected() {
        let transport = ScriptedTransport::default();
        let connects = transport.connects.clone();
        let mut sup = ConnectionSupervisor::new(transport, MemoryLedger::new(), conf(), target());

        sup.connect().await;
        sup.connect().await;
        assert_eq!(*connects.lock(), 1);
        assert_eq!(sup.state().status, ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_leaves_failed_state() {
        let transport = ScriptedTransport::failing(10);
        let mut sup = ConnectionSupervisor::new(transport, MemoryLedger::new(), conf(), target());
        for _ in 0..4 {
            sup.handle_reconnect().await;
        }
        assert_eq!(sup.state().status, ConnectionStatus::Failed);

        sup.reset();
        assert_eq!(sup.state().status, ConnectionStatus::Disconnected);
        assert_eq!(sup.state().attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_messages_are_not_forwarded() {
        let mut sup = ConnectionSupervisor::new(ScriptedTransport::default(), MemoryLedger::new(), conf(), target());
        let mut messages = sup.handle().subscribe_messages();
        let msg = RoomMessage { id: "m1".into(), channel: "lobby".into(), from: "alice".into(), body: "!help".into() };

        sup.handle_transport_event(TransportEvent::Message(msg.clone())).await;
        sup.handle_transport_event(TransportEvent::Message(msg.clone())).await;

        assert_eq!(messages.recv().await, Some(msg));
        assert!(messages.try_recv().is_err());
    }
}
