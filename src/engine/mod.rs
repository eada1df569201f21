mod conflict;
mod error;
mod mutations;
mod pricing;
mod queries;

pub use error::EngineError;
pub use pricing::price;

use std::sync::Arc;

use crate::catalog::Catalog;
use crate::notify::Outbox;
use crate::store::ReservationStore;

/// Decides whether a car can be booked for a window, records the decision,
/// and drives reservations through their lifecycle.
///
/// Collaborators are injected; the engine itself holds no mutable state.
/// Every write goes through one of the store's two atomic primitives, and
/// notifications leave through the outbox only after the commit.
pub struct Engine {
    store: Arc<ReservationStore>,
    catalog: Arc<dyn Catalog>,
    outbox: Outbox,
}

impl Engine {
    pub fn new(store: Arc<ReservationStore>, catalog: Arc<dyn Catalog>, outbox: Outbox) -> Self {
        Self {
            store,
            catalog,
            outbox,
        }
    }

    pub fn store(&self) -> &Arc<ReservationStore> {
        &self.store
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }
}
