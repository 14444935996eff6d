/*!
Test Harness pour le kernel Roombot

Facilite l'écriture de tests du superviseur et du moniteur avec:
- Setup automatique du transport mock et d'un ledger mémoire
- Enregistrement des événements émis, assertions par topic
- Config rapide (pas de délai de bon voisinage, plafond bas)
*/

use crate::mock_transport::MockTransport;
use anyhow::{bail, Result};
use roombot_kernel::config::SupervisorConf;
use roombot_kernel::events::{SupervisorEvent, Topic};
use roombot_kernel::ledger::MemoryLedger;
use roombot_kernel::supervisor::{ConnectionSupervisor, SessionTarget};
use roombot_kernel::transport::TransportEvent;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Logs visibles dans la sortie des tests ; sans effet si déjà initialisé
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("roombot_kernel=debug"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}

/// Accumule les événements d'un bus pour les assertions
pub struct EventRecorder<E> {
    rx: mpsc::UnboundedReceiver<E>,
    seen: Vec<E>,
}

impl<E: Clone + Topic> EventRecorder<E> {
    pub fn new(rx: mpsc::UnboundedReceiver<E>) -> Self {
        Self { rx, seen: Vec::new() }
    }

    /// Récupère tout ce qui est en attente sans bloquer
    pub fn drain(&mut self) -> &[E] {
        while let Ok(event) = self.rx.try_recv() {
            self.seen.push(event);
        }
        &self.seen
    }

    pub fn topics(&mut self) -> Vec<&'static str> {
        self.drain().iter().map(|e| e.topic()).collect()
    }

    pub fn count(&mut self, topic: &str) -> usize {
        self.drain().iter().filter(|e| e.topic() == topic).count()
    }

    pub fn clear(&mut self) {
        self.drain();
        self.seen.clear();
    }

    /// Attend le prochain événement du topic donné (ignore les autres)
    pub async fn wait_for(&mut self, topic: &str, timeout: Duration) -> Result<E> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(event)) => {
                    self.seen.push(event.clone());
                    if event.topic() == topic {
                        return Ok(event);
                    }
                }
                Ok(None) => bail!("event stream closed while waiting for {topic}"),
                Err(_) => bail!("timeout waiting for {topic} after {}ms", timeout.as_millis()),
            }
        }
    }
}

pub type MockSupervisor = ConnectionSupervisor<MockTransport, MemoryLedger>;

/// Superviseur câblé sur un transport mock et un ledger mémoire
pub struct TestHarness {
    pub transport: MockTransport,
    pub ledger: MemoryLedger,
    pub supervisor: MockSupervisor,
    pub events: EventRecorder<SupervisorEvent>,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl TestHarness {
    pub fn new(conf: SupervisorConf) -> Self {
        Self::with_ledger(conf, MemoryLedger::new())
    }

    pub fn with_ledger(conf: SupervisorConf, ledger: MemoryLedger) -> Self {
        init_tracing();
        let (transport, transport_events) = MockTransport::new();
        let target = SessionTarget { channel: "lobby".into(), username: "roombot".into(), password: None };
        let supervisor = ConnectionSupervisor::new(transport.clone(), ledger.clone(), conf, target);
        let events = EventRecorder::new(supervisor.subscribe());
        Self { transport, ledger, supervisor, events, transport_events: Some(transport_events) }
    }

    /// Config de test : pas de délai minimal, 3 tentatives, backoff court
    pub fn fast_conf() -> SupervisorConf {
        let mut conf = SupervisorConf::default();
        conf.min_connect_delay_ms = 0;
        conf.max_attempts = 3;
        conf.backoff.base_ms = 100;
        conf.backoff.max_ms = 1_000;
        conf
    }

    /// Récepteur des événements du transport, pour `run()`
    pub fn take_transport_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.transport_events.take()
    }

    /// Transmet au superviseur les événements transport en attente ; retourne leur nombre
    pub async fn pump(&mut self) -> usize {
        let Some(rx) = self.transport_events.as_mut() else {
            return 0;
        };
        let mut pending = Vec::new();
        while let Ok(event) = rx.try_recv() {
            pending.push(event);
        }
        let count = pending.len();
        for event in pending {
            self.supervisor.handle_transport_event(event).await;
        }
        count
    }
}
