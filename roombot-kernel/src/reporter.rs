/**
 * REPORTERS - Puits externes pour les événements du kernel
 *
 * - LogReporter  : chaque événement en log structuré, niveau selon la gravité
 * - MqttReporter : événements de santé publiés en JSON sur {prefix}/{topic}
 *
 * Un reporter lent ou en erreur ne touche jamais le cycle de check :
 * il ne fait que consommer ses propres receivers.
 */

use crate::config::{ReporterConf, TransportConf};
use crate::events::{HealthEvent, SupervisorEvent, Topic};
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct LogReporter;

impl LogReporter {
    pub fn spawn(
        mut health: mpsc::UnboundedReceiver<HealthEvent>,
        mut connection: mpsc::UnboundedReceiver<SupervisorEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (mut health_open, mut connection_open) = (true, true);
            while health_open || connection_open {
                tokio::select! {
                    event = health.recv(), if health_open => match event {
                        Some(event) => log_health_event(&event),
                        None => health_open = false,
                    },
                    event = connection.recv(), if connection_open => match event {
                        Some(event) => log_supervisor_event(&event),
                        None => connection_open = false,
                    },
                }
            }
            debug!("[reporter] event streams closed");
        })
    }
}

fn log_health_event(event: &HealthEvent) {
    let topic = event.topic();
    match event {
        HealthEvent::EmergencyActivated { triggered_by, score, recovery_plan, .. } => {
            error!(topic, score, steps = recovery_plan.len(), "[reporter] emergency: {}", triggered_by.join(", "));
        }
        HealthEvent::EmergencyResolved { duration_ms, score, .. } => {
            info!(topic, score, duration_ms, "[reporter] emergency resolved");
        }
        HealthEvent::SystemChanged { from, to, score } => {
            let from = from.map(|s| s.as_str()).unwrap_or("none");
            if to.is_emergency() {
                warn!(topic, score, "[reporter] system {from} -> {to}");
            } else {
                info!(topic, score, "[reporter] system {from} -> {to}");
            }
        }
        HealthEvent::BreakerOpened { component, reason, failure_count } => {
            warn!(topic, failure_count, "[reporter] breaker open on {component}: {reason}");
        }
        HealthEvent::BreakerClosed { component, open_for_ms } => {
            info!(topic, open_for_ms, "[reporter] breaker closed on {component}");
        }
        HealthEvent::PredictionRisk { component, projected, slope, .. } => {
            warn!(topic, projected, slope, "[reporter] {component} at risk");
        }
        HealthEvent::CheckCompleted { snapshot, duration_ms } => {
            debug!(topic, duration_ms, score = snapshot.score, "[reporter] check: {}", snapshot.status);
        }
        HealthEvent::Report(report) => {
            info!(
                topic,
                score = report.score,
                components = report.components.len(),
                open_breakers = report.open_breakers.len(),
                "[reporter] health report: {}",
                report.status
            );
        }
    }
}

fn log_supervisor_event(event: &SupervisorEvent) {
    let topic = event.topic();
    match event {
        SupervisorEvent::GaveUp { attempts } => error!(topic, attempts, "[reporter] connection abandoned"),
        SupervisorEvent::ConnectFailed { attempt, error, rate_limited } => {
            warn!(topic, attempt, rate_limited, "[reporter] connect failed: {error}")
        }
        SupervisorEvent::BackoffIncreased { delay_ms, attempts_last_hour } => {
            warn!(topic, delay_ms, attempts_last_hour, "[reporter] connection storm, backing off")
        }
        SupervisorEvent::Disconnected { reason } => warn!(topic, "[reporter] disconnected: {reason}"),
        other => info!(topic, "[reporter] {other:?}"),
    }
}

/// Topic MQTT d'un événement : `health:system:changed` → `{prefix}/health/system/changed`
pub fn mqtt_topic(prefix: &str, event: &impl Topic) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), event.topic().replace(':', "/"))
}

pub struct MqttReporter;

impl MqttReporter {
    /// Publie les événements de santé sur le broker. Le rapport et le statut système sont retained.
    pub fn spawn(
        reporter: &ReporterConf,
        transport: &TransportConf,
        mut events: mpsc::UnboundedReceiver<HealthEvent>,
    ) -> JoinHandle<()> {
        let prefix = reporter.mqtt_topic_prefix.clone();
        let mut opts = MqttOptions::new(format!("{}-health", transport.client_id), &transport.host, transport.port);
        opts.set_keep_alive(Duration::from_secs(transport.keep_alive_secs));
        if let Some(password) = &transport.password {
            opts.set_credentials(&transport.username, password);
        }

        tokio::spawn(async move {
            let (client, mut eventloop) = AsyncClient::new(opts, 32);
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let topic = mqtt_topic(&prefix, &event);
                        let retain = matches!(event, HealthEvent::Report(_) | HealthEvent::SystemChanged { .. });
                        match serde_json::to_vec(&event) {
                            Ok(payload) => {
                                let published = client.publish(topic.as_str(), QoS::AtLeastOnce, retain, payload);
                                if let Err(e) = published.await {
                                    warn!("[reporter] failed to publish {topic}: {e}");
                                }
                            }
                            Err(e) => warn!("[reporter] failed to encode {topic}: {e}"),
                        }
                    }
                    polled = eventloop.poll() => {
                        if let Err(e) = polled {
                            warn!("[reporter] MQTT error: {e}");
                            tokio::time::sleep(Duration::from_secs(2)).await;
                        }
                    }
                }
            }
            if let Err(e) = client.disconnect().await {
                debug!("[reporter] disconnect: {e}");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthStatus;

    #[test]
    fn test_mqtt_topic_mapping() {
        let ev = HealthEvent::SystemChanged { from: None, to: HealthStatus::Healthy, score: 1.0 };
        assert_eq!(mqtt_topic("roombot/health/", &ev), "roombot/health/health/system/changed");
        let ev = HealthEvent::BreakerOpened { component: "db".into(), reason: "x".into(), failure_count: 3 };
        assert_eq!(mqtt_topic("roombot/health", &ev), "roombot/health/circuit/breaker/opened");
    }

    #[tokio::test]
    async fn test_log_reporter_stops_when_streams_close() {
        let (health_tx, health_rx) = mpsc::unbounded_channel();
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let task = LogReporter::spawn(health_rx, conn_rx);

        health_tx.send(HealthEvent::BreakerClosed { component: "db".into(), open_for_ms: 5 }).unwrap();
        conn_tx.send(SupervisorEvent::Reset).unwrap();
        drop(health_tx);
        drop(conn_tx);

        task.await.unwrap();
    }
}
