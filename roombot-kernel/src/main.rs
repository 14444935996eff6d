/**
 * ROOMBOT KERNEL - Point d'entrée
 *
 * Bootstrap : config, ledger, transport MQTT, superviseur de connexion,
 * moniteur de santé (connexion = critical, processus = low), reporters,
 * commandes opérateur lues dans le salon.
 * Arrêt : Ctrl-C/SIGTERM capté par le superviseur, puis moniteur et reporters.
 */

use anyhow::{Context, Result};
use roombot_kernel::commands::{self, OperatorCommand};
use roombot_kernel::config::load_config;
use roombot_kernel::health::HealthMonitor;
use roombot_kernel::ledger::JsonFileLedger;
use roombot_kernel::mqtt::MqttTransport;
use roombot_kernel::probes::{ConnectionProbe, ProcessProbe};
use roombot_kernel::reporter::{LogReporter, MqttReporter};
use roombot_kernel::scheduler::TimerRegistry;
use roombot_kernel::supervisor::{ConnectionSupervisor, SessionTarget};
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("roombot_kernel=info")))
        .init();

    let cfg = load_config().await;
    info!("[kernel] starting, channel #{} on {}:{}", cfg.transport.channel, cfg.transport.host, cfg.transport.port);

    // ledger de connexions (politique de bon voisinage)
    let ledger = JsonFileLedger::open(&cfg.ledger.path, cfg.ledger.max_events)
        .await
        .with_context(|| format!("failed to open connection ledger {}", cfg.ledger.path.display()))?;

    // superviseur de connexion
    let (transport, transport_events) = MqttTransport::new(cfg.transport.clone(), cfg.supervisor.connect_timeout());
    let supervisor =
        ConnectionSupervisor::new(transport, ledger, cfg.supervisor.clone(), SessionTarget::from(&cfg.transport));
    let connection = supervisor.handle();
    supervisor.watch_termination_signals();

    // moniteur de santé
    let mut monitor = HealthMonitor::new(cfg.monitor.clone());
    monitor.register_component(
        "connection",
        ConnectionProbe::new(connection.watch(), cfg.monitor.breaker_threshold),
        ConnectionProbe::component_config(),
    )?;
    monitor.register_component(
        "process",
        ProcessProbe::new(cfg.monitor.memory_limit_mb),
        ProcessProbe::component_config(),
    )?;

    // reporters
    let tasks = TimerRegistry::new();
    tasks.track_task("reporter:log", LogReporter::spawn(monitor.subscribe(), connection.subscribe()));
    if cfg.reporter.enabled {
        tasks.track_task("reporter:mqtt", MqttReporter::spawn(&cfg.reporter, &cfg.transport, monitor.subscribe()));
    }
    let monitor = Arc::new(monitor.spawn());

    // messages du salon : commandes opérateur vers le moniteur
    let mut messages = connection.subscribe_messages();
    let operators = cfg.operators.clone();
    let room_monitor = Arc::clone(&monitor);
    tasks.track_task(
        "room:messages",
        tokio::spawn(async move {
            while let Some(msg) = messages.recv().await {
                debug!("[kernel] #{} <{}> {}", msg.channel, msg.from, msg.body);
                if let Some(cmd) = OperatorCommand::from_message(&operators, &msg) {
                    let outcome = commands::execute(cmd, &room_monitor).await;
                    info!("[kernel] operator {}: {outcome}", msg.from);
                }
            }
        }),
    );
    let supervisor_task = tokio::spawn(supervisor.run(transport_events));
    connection.connect()?;

    // le superviseur rend la main après un signal d'arrêt (cleanup déjà fait)
    if let Err(e) = supervisor_task.await {
        error!("[kernel] supervisor task failed: {e}");
    }

    monitor.shutdown().await;
    let cancelled = tasks.shutdown();
    info!("[kernel] shutdown complete ({cancelled} background tasks stopped)");
    Ok(())
}
