/**
 * COMMANDES OPÉRATEUR - Pilotage du moniteur depuis le salon
 *
 * SYNTAXE (préfixe configurable, `!` par défaut) :
 * - `!health`                        : statut courant du système
 * - `!breaker open <id> [raison]`    : ouverture manuelle d'un breaker
 * - `!breaker reset <id>`            : fermeture manuelle d'un breaker
 *
 * Seuls les auteurs listés dans `operators.allowed` sont écoutés.
 */

use crate::config::OperatorsConf;
use crate::health::MonitorHandle;
use crate::transport::RoomMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Health,
    BreakerOpen { component: String, reason: String },
    BreakerReset { component: String },
}

impl OperatorCommand {
    pub fn parse(prefix: &str, body: &str) -> Option<Self> {
        let rest = body.trim().strip_prefix(prefix)?;
        let mut words = rest.split_whitespace();
        match (words.next()?, words.next()) {
            ("health", None) => Some(Self::Health),
            ("breaker", Some("open")) => {
                let component = words.next()?.to_string();
                let reason = words.collect::<Vec<_>>().join(" ");
                let reason = if reason.is_empty() { "operator request".to_string() } else { reason };
                Some(Self::BreakerOpen { component, reason })
            }
            ("breaker", Some("reset")) => {
                let component = words.next()?.to_string();
                words.next().is_none().then_some(Self::BreakerReset { component })
            }
            _ => None,
        }
    }

    /// Commande portée par un message, si l'auteur est un opérateur
    pub fn from_message(conf: &OperatorsConf, msg: &RoomMessage) -> Option<Self> {
        if !conf.allowed.iter().any(|op| op == &msg.from) {
            return None;
        }
        Self::parse(&conf.prefix, &msg.body)
    }
}

/// Exécute la commande contre le moniteur lancé ; retourne le compte rendu
pub async fn execute(cmd: OperatorCommand, monitor: &MonitorHandle) -> String {
    match cmd {
        OperatorCommand::Health => match &monitor.current().system {
            Some(system) => format!(
                "system {} ({:.3}), failing: [{}]",
                system.status,
                system.score,
                system.failed_components.join(", ")
            ),
            None => "no completed health check yet".to_string(),
        },
        OperatorCommand::BreakerOpen { component, reason } => {
            match monitor.trigger_circuit_breaker(&component, &reason).await {
                Ok(true) => format!("breaker {component} opened"),
                Ok(false) => format!("breaker {component} already open"),
                Err(e) => format!("breaker {component}: {e}"),
            }
        }
        OperatorCommand::BreakerReset { component } => match monitor.reset_circuit_breaker(&component).await {
            Ok(Some(open_for)) => format!("breaker {component} closed after {}s", open_for.as_secs()),
            Ok(None) => format!("breaker {component} was not open"),
            Err(e) => format!("breaker {component}: {e}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConf;
    use crate::health::{ComponentConfig, HealthMonitor, HealthResult, Priority};
    use std::sync::Arc;

    fn msg(from: &str, body: &str) -> RoomMessage {
        RoomMessage { id: "m1".into(), channel: "lobby".into(), from: from.into(), body: body.into() }
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(OperatorCommand::parse("!", "!health"), Some(OperatorCommand::Health));
        assert_eq!(
            OperatorCommand::parse("!", "  !breaker open connection broker maintenance "),
            Some(OperatorCommand::BreakerOpen {
                component: "connection".into(),
                reason: "broker maintenance".into()
            })
        );
        assert_eq!(
            OperatorCommand::parse("!", "!breaker open process"),
            Some(OperatorCommand::BreakerOpen { component: "process".into(), reason: "operator request".into() })
        );
        assert_eq!(
            OperatorCommand::parse("!", "!breaker reset connection"),
            Some(OperatorCommand::BreakerReset { component: "connection".into() })
        );
        assert_eq!(OperatorCommand::parse("!", "!breaker reset"), None);
        assert_eq!(OperatorCommand::parse("!", "!breaker reset a b"), None);
        assert_eq!(OperatorCommand::parse("!", "health"), None);
        assert_eq!(OperatorCommand::parse("!", "!dance"), None);
    }

    #[test]
    fn test_only_operators_are_heard() {
        let conf = OperatorsConf { prefix: "!".into(), allowed: vec!["alice".into()] };
        assert_eq!(OperatorCommand::from_message(&conf, &msg("alice", "!health")), Some(OperatorCommand::Health));
        assert_eq!(OperatorCommand::from_message(&conf, &msg("mallory", "!health")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_against_running_monitor() {
        let mut monitor = HealthMonitor::new(MonitorConf::default());
        // warning : un résultat healthy refermerait le breaker au cycle suivant
        let config = ComponentConfig::new(Priority::High, |_: Arc<()>| async { Ok(HealthResult::from_score(0.9)) });
        monitor.register_component("db", Arc::new(()), config).unwrap();
        let monitor = monitor.spawn();

        let open = OperatorCommand::BreakerOpen { component: "db".into(), reason: "drill".into() };
        assert_eq!(execute(open.clone(), &monitor).await, "breaker db opened");
        assert_eq!(execute(open, &monitor).await, "breaker db already open");

        let reset = OperatorCommand::BreakerReset { component: "db".into() };
        assert!(execute(reset.clone(), &monitor).await.starts_with("breaker db closed after"));
        assert_eq!(execute(reset, &monitor).await, "breaker db was not open");

        let ghost = OperatorCommand::BreakerReset { component: "ghost".into() };
        assert_eq!(execute(ghost, &monitor).await, "breaker ghost: unknown component: ghost");

        monitor.shutdown().await;
    }
}
