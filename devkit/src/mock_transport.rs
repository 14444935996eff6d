/*!
Mock Transport pour tester le superviseur sans broker

Scénarise les résultats de connexion, enregistre tous les appels et permet
de simuler les événements de la couche socket (perte de connexion, messages).
*/

use parking_lot::Mutex;
use roombot_kernel::transport::{RoomMessage, Transport, TransportError, TransportEvent, TransportState};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect,
    Disconnect,
    JoinChannel(String),
    Login(String),
}

struct Inner {
    outcomes: Mutex<VecDeque<Result<(), TransportError>>>,
    fallback: Mutex<Result<(), TransportError>>,
    join_failure: Mutex<Option<TransportError>>,
    calls: Mutex<Vec<TransportCall>>,
    connect_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    connected: AtomicBool,
    events: mpsc::UnboundedSender<TransportEvent>,
}

/// Transport scénarisé, clonable (état partagé) pour garder la main depuis le test
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

impl MockTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Self {
            inner: Arc::new(Inner {
                outcomes: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(Ok(())),
                join_failure: Mutex::new(None),
                calls: Mutex::new(Vec::new()),
                connect_delay: Mutex::new(Duration::ZERO),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                connected: AtomicBool::new(false),
                events,
            }),
        };
        (transport, rx)
    }

    /// Résultat du prochain `connect()` (file FIFO)
    pub fn push_outcome(&self, outcome: Result<(), TransportError>) {
        self.inner.outcomes.lock().push_back(outcome);
    }

    pub fn fail_next(&self, n: usize, err: TransportError) {
        let mut outcomes = self.inner.outcomes.lock();
        for _ in 0..n {
            outcomes.push_back(Err(err.clone()));
        }
    }

    /// Résultat quand la file est vide (par défaut : succès)
    pub fn set_fallback(&self, outcome: Result<(), TransportError>) {
        *self.inner.fallback.lock() = outcome;
    }

    pub fn fail_join(&self, err: TransportError) {
        *self.inner.join_failure.lock() = Some(err);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.inner.connect_delay.lock() = delay;
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.inner.calls.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.inner.calls.lock().iter().filter(|c| **c == TransportCall::Connect).count()
    }

    /// Plus grand nombre de `connect()` observés simultanément
    pub fn max_concurrent_connects(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Injecte un événement comme le ferait la couche socket
    pub fn simulate(&self, event: TransportEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Perte de connexion : Disconnected puis Reconnecting
    pub fn drop_connection(&self, reason: &str) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.simulate(TransportEvent::Disconnected { reason: reason.to_string() });
        self.simulate(TransportEvent::StateChange(TransportState::Disconnected));
        self.simulate(TransportEvent::Reconnecting);
    }

    pub fn deliver(&self, id: &str, from: &str, body: &str) {
        self.simulate(TransportEvent::Message(RoomMessage {
            id: id.to_string(),
            channel: "lobby".to_string(),
            from: from.to_string(),
            body: body.to_string(),
        }));
    }

    fn record(&self, call: TransportCall) {
        self.inner.calls.lock().push(call);
    }
}

impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.record(TransportCall::Connect);
        let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.inner.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);

        let next = self.inner.outcomes.lock().pop_front();
        let outcome = match next {
            Some(outcome) => outcome,
            None => self.inner.fallback.lock().clone(),
        };
        if outcome.is_ok() {
            self.inner.connected.store(true, Ordering::SeqCst);
            self.simulate(TransportEvent::StateChange(TransportState::Connected));
        }
        outcome
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.record(TransportCall::Disconnect);
        self.inner.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn join_channel(&mut self, channel: &str) -> Result<(), TransportError> {
        self.record(TransportCall::JoinChannel(channel.to_string()));
        let failure = self.inner.join_failure.lock().take();
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn login(&mut self, user: &str, _pass: Option<&str>) -> Result<(), TransportError> {
        self.record(TransportCall::Login(user.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_outcomes_are_consumed_in_order() {
        let (mut transport, _rx) = MockTransport::new();
        transport.push_outcome(Err(TransportError::Refused("down".into())));

        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_ok());
        assert!(transport.is_connected());
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_drop_connection_emits_reconnecting() {
        let (transport, mut rx) = MockTransport::new();
        transport.drop_connection("reset by peer");

        assert_eq!(rx.recv().await, Some(TransportEvent::Disconnected { reason: "reset by peer".into() }));
        assert_eq!(rx.recv().await, Some(TransportEvent::StateChange(TransportState::Disconnected)));
        assert_eq!(rx.recv().await, Some(TransportEvent::Reconnecting));
    }
}
