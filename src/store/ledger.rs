use ulid::Ulid;

use crate::model::{DateWindow, Reservation};

/// Every reservation ever made for one car, in any status, sorted by
/// `window.start`.
#[derive(Debug, Clone)]
pub struct CarLedger {
    pub car_id: Ulid,
    reservations: Vec<Reservation>,
}

impl CarLedger {
    pub fn new(car_id: Ulid) -> Self {
        Self {
            car_id,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by window start (stable for equal starts).
    pub fn insert(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.window.start <= reservation.window.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn get(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn get_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Reservations whose window overlaps `window` (inclusive on both ends),
    /// regardless of status. Entries starting after `window.end` are skipped
    /// by binary search.
    pub fn overlapping(&self, window: &DateWindow) -> impl Iterator<Item = &Reservation> {
        let window = *window;
        let right_bound = self
            .reservations
            .partition_point(|r| r.window.start <= window.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.window.end >= window.start)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter()
    }

    /// Reservations still holding the car.
    pub fn holding_count(&self) -> usize {
        self.reservations.iter().filter(|r| r.status.is_holding()).count()
    }

    pub fn len(&self) -> usize {
        self.reservations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }
}
