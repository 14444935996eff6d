/*!
# Roombot DevKit - Mocks et harness de test

Bibliothèque facilitant les tests du kernel Roombot avec:
- Transport mock scénarisé (sans broker)
- Enregistreur d'événements par topic
- Harness superviseur prêt à l'emploi
*/

pub mod mock_transport;
pub mod test_utils;

pub use mock_transport::{MockTransport, TransportCall};
pub use test_utils::{init_tracing, EventRecorder, MockSupervisor, TestHarness};
