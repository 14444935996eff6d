//! État partagé du kernel : verrous courts (parking_lot) et vues publiées (watch).

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

/// Donnée mutable partagée entre tâches.
/// Le verrou n'est jamais tenu à travers un `.await`.
pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Vue en lecture seule, republiée en bloc par son unique écrivain
pub type View<T> = watch::Receiver<Arc<T>>;

pub fn new_view<T>(value: T) -> (watch::Sender<Arc<T>>, View<T>) {
    watch::channel(Arc::new(value))
}
