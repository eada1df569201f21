use std::io;
use std::sync::Arc;

use tracing::info;

use crate::catalog::Fleet;
use crate::compactor;
use crate::config::Config;
use crate::engine::Engine;
use crate::notify::{NotificationDispatcher, Outbox};
use crate::store::ReservationStore;

pub const FLEET_WAL: &str = "fleet.wal";
pub const RESERVATIONS_WAL: &str = "reservations.wal";

/// Everything a connection needs, wired together once at start-up.
///
/// The fleet is kept concretely for its administrative operations; the
/// engine only sees it through the `Catalog` trait.
pub struct Services {
    pub engine: Arc<Engine>,
    pub fleet: Arc<Fleet>,
    pub store: Arc<ReservationStore>,
}

impl Services {
    /// Open (or create) both logs under `config.data_dir`, replay them, and
    /// start the notification dispatch loop. Must run inside a tokio runtime.
    pub fn open(config: &Config, dispatcher: Arc<dyn NotificationDispatcher>) -> io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let fleet = Arc::new(Fleet::open(&config.data_dir.join(FLEET_WAL))?);
        let store = Arc::new(ReservationStore::open(config.data_dir.join(RESERVATIONS_WAL))?);
        let outbox = Outbox::spawn(config.outbox_capacity, dispatcher);
        let engine = Arc::new(Engine::new(store.clone(), fleet.clone(), outbox));

        metrics::gauge!(crate::observability::FLEET_SIZE).set(fleet.len() as f64);
        info!(
            "loaded {} cars and {} reservations from {}",
            fleet.len(),
            store.reservation_count(),
            config.data_dir.display()
        );
        Ok(Self { engine, fleet, store })
    }

    /// Spawn the periodic WAL compactor.
    pub fn spawn_background(&self, config: &Config) {
        let store = self.store.clone();
        let fleet = self.fleet.clone();
        let threshold = config.compact_threshold;
        let every = config.compact_interval;
        tokio::spawn(async move {
            compactor::run_compactor(store, fleet, threshold, every).await;
        });
    }
}
