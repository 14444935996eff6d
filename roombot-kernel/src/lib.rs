/**
 * ROOMBOT KERNEL - Cœur de résilience du bot de salons
 *
 * RÔLE : garder la connexion au service de salons vivante sans tempête de
 * reconnexions, et répondre en continu à "le système est-il sain ?".
 *
 * ARCHITECTURE : acteurs propriétaires de leur état (superviseur, moniteur),
 * commandes via mpsc, vues en lecture seule via watch, événements typés par bus.
 */

pub mod backoff;
pub mod breaker;
pub mod commands;
pub mod config;
pub mod events;
pub mod health;
pub mod ledger;
pub mod mqtt;
pub mod probes;
pub mod reporter;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod supervisor;
pub mod transport;

pub use config::{load_config, KernelConfig};
pub use events::{EventBus, HealthEvent, SupervisorEvent, Topic};
pub use health::{HealthMonitor, HealthResult, HealthStatus, Priority};
pub use scheduler::TimerRegistry;
pub use supervisor::{ConnectionSnapshot, ConnectionStatus, ConnectionSupervisor, SessionTarget, SupervisorHandle};
pub use transport::{Transport, TransportError, TransportEvent};
