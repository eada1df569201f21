mod ledger;

pub use ledger::CarLedger;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, RwLockReadGuard, mpsc, oneshot};
use tracing::debug;
use ulid::Ulid;

use crate::limits::MAX_HOLDING_RESERVATIONS_PER_CAR;
use crate::model::*;
use crate::wal::Wal;

pub type SharedLedger = Arc<RwLock<CarLedger>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(crate) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    #[cfg(test)]
    FailNextFlush {
        after_bytes: usize,
        response: oneshot::Sender<()>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            // The whole batch fails together, so none of it may reach disk
            wal.discard_pending();
            return Err(e);
        }
    }
    wal.flush_sync()
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        #[cfg(test)]
        WalCommand::FailNextFlush { after_bytes, response } => {
            wal.fail_next_flush_after(after_bytes);
            let _ = response.send(());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Apply an event to a ledger (no locking: caller holds the ledger lock).
fn apply_to_ledger(
    ledger: &mut CarLedger,
    event: &Event,
    reservation_to_car: &DashMap<Ulid, Ulid>,
    by_customer: &DashMap<String, Vec<Ulid>>,
) {
    match event {
        Event::ReservationCreated { reservation } => {
            reservation_to_car.insert(reservation.id, reservation.car_id);
            by_customer
                .entry(reservation.customer.email_key())
                .or_default()
                .push(reservation.id);
            ledger.insert(reservation.clone());
        }
        Event::ReservationStatusChanged { id, status, at, .. } => {
            if let Some(r) = ledger.get_mut(id) {
                r.status = *status;
                r.updated_at = *at;
            }
        }
    }
}

/// Durable reservation records, partitioned into one lock per car.
///
/// Writers for the same car serialize on that car's ledger lock for the whole
/// check → WAL append → apply sequence. Writers for different cars never
/// contend. Reads take the ledger's shared lock and see committed state only.
pub struct ReservationStore {
    ledgers: DashMap<Ulid, SharedLedger>,
    /// Reverse lookup: reservation id → car id
    reservation_to_car: DashMap<Ulid, Ulid>,
    /// Normalized customer email → reservation ids, in commit order.
    by_customer: DashMap<String, Vec<Ulid>>,
    /// Shared by commits, exclusive for compaction.
    commit_gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
}

/// Exclusive hold on one car's ledger for a check-then-write sequence.
///
/// Dropping it without `commit` releases the lock and leaves the store untouched.
pub struct UnitOfWork<'a> {
    store: &'a ReservationStore,
    _gate: RwLockReadGuard<'a, ()>,
    ledger: OwnedRwLockWriteGuard<CarLedger>,
}

impl UnitOfWork<'_> {
    pub fn ledger(&self) -> &CarLedger {
        &self.ledger
    }

    /// Persist `event` to the WAL, then apply it. If the append fails nothing
    /// is applied.
    pub async fn commit(&mut self, event: Event) -> Result<(), StoreError> {
        self.store.wal_append(&event).await?;
        apply_to_ledger(
            &mut self.ledger,
            &event,
            &self.store.reservation_to_car,
            &self.store.by_customer,
        );
        Ok(())
    }
}

impl ReservationStore {
    /// Replay `wal_path` and start the group-commit writer. Must be called
    /// inside a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let events: Vec<Event> = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            ledgers: DashMap::new(),
            reservation_to_car: DashMap::new(),
            by_customer: DashMap::new(),
            commit_gate: RwLock::new(()),
            wal_tx,
        };

        // Replay into plain ledgers first; they're wrapped in locks once complete.
        let mut ledgers: HashMap<Ulid, CarLedger> = HashMap::new();
        for event in &events {
            let car_id = event.car_id();
            let ledger = ledgers
                .entry(car_id)
                .or_insert_with(|| CarLedger::new(car_id));
            apply_to_ledger(ledger, event, &store.reservation_to_car, &store.by_customer);
        }
        for (car_id, ledger) in ledgers {
            store.ledgers.insert(car_id, Arc::new(RwLock::new(ledger)));
        }
        debug!(
            "replayed {} events from {} ({} reservations)",
            events.len(),
            wal_path.display(),
            store.reservation_to_car.len()
        );

        Ok(store)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    fn ledger(&self, car_id: &Ulid) -> Option<SharedLedger> {
        self.ledgers.get(car_id).map(|e| e.value().clone())
    }

    fn ledger_or_create(&self, car_id: Ulid) -> SharedLedger {
        self.ledgers
            .entry(car_id)
            .or_insert_with(|| Arc::new(RwLock::new(CarLedger::new(car_id))))
            .value()
            .clone()
    }

    fn car_for(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_car.get(reservation_id).map(|e| *e.value())
    }

    /// Acquire the commit gate (shared) and the car's ledger (exclusive).
    pub async fn begin(&self, car_id: Ulid) -> UnitOfWork<'_> {
        let gate = self.commit_gate.read().await;
        let ledger = self.ledger_or_create(car_id).write_owned().await;
        UnitOfWork {
            store: self,
            _gate: gate,
            ledger,
        }
    }

    // ── Atomic primitives ────────────────────────────────────

    /// Insert `reservation` unless its car already has a reservation in one of
    /// `statuses` whose window overlaps. Check and insert happen under the
    /// car's lock, so two overlapping inserts can never both succeed.
    /// Sets `created_at`/`updated_at`.
    pub async fn insert_if_no_overlap(
        &self,
        mut reservation: Reservation,
        statuses: &[ReservationStatus],
    ) -> Result<Reservation, StoreError> {
        let car_id = reservation.car_id;
        let mut uow = self.begin(car_id).await;

        if let Some(existing) = uow
            .ledger()
            .overlapping(&reservation.window)
            .find(|r| statuses.contains(&r.status))
        {
            return Err(StoreError::Conflict {
                car_id,
                conflicting: existing.id,
            });
        }
        if uow.ledger().holding_count() >= MAX_HOLDING_RESERVATIONS_PER_CAR {
            return Err(StoreError::LimitExceeded("too many open reservations on car"));
        }

        let now = Utc::now();
        reservation.created_at = now;
        reservation.updated_at = now;
        uow.commit(Event::ReservationCreated {
            reservation: reservation.clone(),
        })
        .await?;
        Ok(reservation)
    }

    /// Compare-and-swap status change: applies only if the stored status is
    /// still `expected`.
    pub async fn update_status(
        &self,
        id: Ulid,
        expected: ReservationStatus,
        new_status: ReservationStatus,
    ) -> Result<Reservation, StoreError> {
        let car_id = self.car_for(&id).ok_or(StoreError::NotFound(id))?;
        let mut uow = self.begin(car_id).await;

        let actual = uow
            .ledger()
            .get(&id)
            .map(|r| r.status)
            .ok_or(StoreError::NotFound(id))?;
        if actual != expected {
            return Err(StoreError::StaleState { id, expected, actual });
        }

        uow.commit(Event::ReservationStatusChanged {
            id,
            car_id,
            status: new_status,
            at: Utc::now(),
        })
        .await?;

        uow.ledger().get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    // ── Reads ────────────────────────────────────────────────

    pub async fn find_overlapping(
        &self,
        car_id: &Ulid,
        window: &DateWindow,
        statuses: &[ReservationStatus],
    ) -> Vec<Reservation> {
        let Some(ledger) = self.ledger(car_id) else {
            return Vec::new();
        };
        let guard = ledger.read().await;
        guard
            .overlapping(window)
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect()
    }

    pub async fn find_by_id(&self, id: &Ulid) -> Option<Reservation> {
        let car_id = self.car_for(id)?;
        let ledger = self.ledger(&car_id)?;
        let guard = ledger.read().await;
        guard.get(id).cloned()
    }

    pub async fn find_by_car(&self, car_id: &Ulid) -> Vec<Reservation> {
        let Some(ledger) = self.ledger(car_id) else {
            return Vec::new();
        };
        let guard = ledger.read().await;
        guard.iter().cloned().collect()
    }

    pub async fn find_by_customer_email(&self, email: &str) -> Vec<Reservation> {
        let ids = self
            .by_customer
            .get(&normalize_email(email))
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(r) = self.find_by_id(&id).await {
                found.push(r);
            }
        }
        found
    }

    /// All reservations ordered by creation time, then id.
    pub async fn find_all(&self) -> Vec<Reservation> {
        // Collect the Arcs first so no map shard is held across an await.
        let ledgers: Vec<SharedLedger> = self.ledgers.iter().map(|e| e.value().clone()).collect();
        let mut all = Vec::with_capacity(self.reservation_to_car.len());
        for ledger in ledgers {
            let guard = ledger.read().await;
            all.extend(guard.iter().cloned());
        }
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    pub fn reservation_count(&self) -> usize {
        self.reservation_to_car.len()
    }

    // ── Maintenance ──────────────────────────────────────────

    /// Rewrite the WAL as one `ReservationCreated` per reservation with its
    /// current status folded in. Commits are paused for the duration.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.commit_gate.write().await;

        let ledgers: Vec<SharedLedger> = self.ledgers.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::with_capacity(self.reservation_to_car.len());
        for ledger in ledgers {
            let guard = ledger.read().await;
            events.extend(guard.iter().map(|r| Event::ReservationCreated {
                reservation: r.clone(),
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> Result<u64, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))
    }

    /// Make the next WAL flush write `after_bytes` of its batch and then fail.
    #[cfg(test)]
    pub(crate) async fn fail_next_wal_flush(&self, after_bytes: usize) {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::FailNextFlush { after_bytes, response: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

#[derive(Debug)]
pub enum StoreError {
    Conflict { car_id: Ulid, conflicting: Ulid },
    NotFound(Ulid),
    StaleState {
        id: Ulid,
        expected: ReservationStatus,
        actual: ReservationStatus,
    },
    LimitExceeded(&'static str),
    Wal(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Conflict { car_id, conflicting } => {
                write!(f, "car {car_id}: window overlaps reservation {conflicting}")
            }
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::StaleState { id, expected, actual } => {
                write!(f, "stale state for {id}: expected {expected}, found {actual}")
            }
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::Wal(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
