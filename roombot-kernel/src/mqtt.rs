/**
 * TRANSPORT MQTT - Connexion au service de salons via le broker
 *
 * TOPICS :
 * - rooms/{channel}/msg/{id}        : messages du salon (JSON RoomMessage)
 * - rooms/{channel}/presence/{user} : présence du bot (retained)
 *
 * FONCTIONNEMENT :
 * - connect() attend le CONNACK ; un refus "server unavailable" est un rate-limit typé
 * - une tâche de polling relaie les messages entrants en TransportEvent
 * - sur perte de connexion : Disconnected + Reconnecting une seule fois, puis arrêt du polling.
 *   La reconnexion appartient au superviseur.
 */

use crate::config::TransportConf;
use crate::transport::{RoomMessage, Transport, TransportError, TransportEvent, TransportState};
use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Délai imposé quand le broker refuse la connexion faute de capacité
pub const RATE_LIMIT_RETRY: Duration = Duration::from_secs(60);
const POLLER_GRACE: Duration = Duration::from_secs(1);

pub struct MqttTransport {
    conf: TransportConf,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
    client: Option<AsyncClient>,
    poller: Option<JoinHandle<()>>,
    closing: Arc<AtomicBool>,
    channel: Option<String>,
}

impl MqttTransport {
    pub fn new(conf: TransportConf, connect_timeout: Duration) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Self {
            conf,
            connect_timeout,
            events,
            client: None,
            poller: None,
            closing: Arc::new(AtomicBool::new(false)),
            channel: None,
        };
        (transport, rx)
    }

    fn options(&self) -> MqttOptions {
        let mut opts = MqttOptions::new(&self.conf.client_id, &self.conf.host, self.conf.port);
        opts.set_keep_alive(Duration::from_secs(self.conf.keep_alive_secs));
        if let Some(password) = &self.conf.password {
            opts.set_credentials(&self.conf.username, password);
        }
        opts
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        self.client.as_ref().ok_or(TransportError::NotConnected)
    }

    async fn stop_poller(&mut self) {
        if let Some(mut poller) = self.poller.take() {
            if tokio::time::timeout(POLLER_GRACE, &mut poller).await.is_err() {
                debug!("[mqtt] poller still running after disconnect, aborting");
                poller.abort();
            }
        }
    }
}

fn map_connection_error(err: ConnectionError) -> TransportError {
    match err {
        ConnectionError::ConnectionRefused(ConnectReturnCode::ServiceUnavailable) => {
            TransportError::RateLimited { retry_after: RATE_LIMIT_RETRY }
        }
        ConnectionError::ConnectionRefused(
            code @ (ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized),
        ) => TransportError::Auth(format!("{code:?}")),
        ConnectionError::ConnectionRefused(code) => TransportError::Refused(format!("{code:?}")),
        other => TransportError::Other(other.to_string()),
    }
}

/// Décode un publish de salon ; `None` pour la présence ou un JSON invalide
fn parse_room_message(topic: &str, payload: &[u8]) -> Option<RoomMessage> {
    let mut parts = topic.split('/');
    if parts.next() != Some("rooms") {
        return None;
    }
    let channel = parts.next()?;
    if parts.next() != Some("msg") {
        return None;
    }
    match serde_json::from_slice::<RoomMessage>(payload) {
        Ok(mut msg) => {
            if msg.channel.is_empty() {
                msg.channel = channel.to_string();
            }
            Some(msg)
        }
        Err(e) => {
            warn!("[mqtt] invalid room message on {topic}: {e}");
            None
        }
    }
}

fn spawn_poller(
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<TransportEvent>,
    closing: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    if let Some(msg) = parse_room_message(&p.topic, &p.payload) {
                        if events.send(TransportEvent::Message(msg)).is_err() {
                            return;
                        }
                    }
                }
                Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                    debug!("[mqtt] disconnect sent");
                }
                Ok(_) => {}
                Err(e) => {
                    if closing.load(Ordering::Acquire) {
                        debug!("[mqtt] poller stopped after requested disconnect");
                    } else {
                        warn!("[mqtt] connection lost: {e}");
                        let _ = events.send(TransportEvent::Disconnected { reason: e.to_string() });
                        let _ = events.send(TransportEvent::StateChange(TransportState::Disconnected));
                        let _ = events.send(TransportEvent::Reconnecting);
                    }
                    return;
                }
            }
        }
    })
}

impl Transport for MqttTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.client.is_some() {
            self.disconnect().await?;
        }
        self.closing.store(false, Ordering::Release);
        let _ = self.events.send(TransportEvent::StateChange(TransportState::Connecting));

        let (client, mut eventloop) = AsyncClient::new(self.options(), 64);
        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        debug!("[mqtt] CONNACK (session present: {})", ack.session_present);
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(e) => return Err(map_connection_error(e)),
                }
            }
        };

        match tokio::time::timeout(self.connect_timeout, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = self.events.send(TransportEvent::StateChange(TransportState::Disconnected));
                return Err(e);
            }
            Err(_) => {
                let _ = self.events.send(TransportEvent::StateChange(TransportState::Disconnected));
                return Err(TransportError::Timeout(self.connect_timeout));
            }
        }

        info!("[mqtt] connected to {}:{}", self.conf.host, self.conf.port);
        self.poller = Some(spawn_poller(eventloop, self.events.clone(), Arc::clone(&self.closing)));
        self.client = Some(client);
        let _ = self.events.send(TransportEvent::StateChange(TransportState::Connected));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.closing.store(true, Ordering::Release);
        let Some(client) = self.client.take() else {
            self.stop_poller().await;
            return Ok(());
        };

        if let Some(channel) = self.channel.take() {
            let topic = format!("rooms/{channel}/presence/{}", self.conf.username);
            if let Err(e) = client.try_publish(topic, QoS::AtLeastOnce, true, Vec::new()) {
                debug!("[mqtt] presence cleanup failed: {e}");
            }
        }
        let result = client.disconnect().await.map_err(|e| TransportError::Other(e.to_string()));
        self.stop_poller().await;
        let _ = self.events.send(TransportEvent::StateChange(TransportState::Disconnected));
        info!("[mqtt] disconnected");
        result
    }

    async fn join_channel(&mut self, channel: &str) -> Result<(), TransportError> {
        let topic = format!("rooms/{channel}/msg/#");
        self.client()?
            .subscribe(topic.as_str(), QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;
        self.channel = Some(channel.to_string());
        info!("[mqtt] joined #{channel}");
        Ok(())
    }

    /// Les identifiants partent dans le CONNECT ; le login annonce la présence du bot
    async fn login(&mut self, user: &str, _pass: Option<&str>) -> Result<(), TransportError> {
        let channel = self.channel.clone().ok_or(TransportError::NotConnected)?;
        let topic = format!("rooms/{channel}/presence/{user}");
        let payload = serde_json::json!({ "user": user, "online": true }).to_string();
        self.client()?
            .publish(topic, QoS::AtLeastOnce, true, payload)
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;
        debug!("[mqtt] presence announced as {user}");
        Ok(())
    }
}
