use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::ReservationStatus;
use crate::report::RevenueOverflow;
use crate::store::StoreError;

#[derive(Debug)]
pub enum EngineError {
    /// End date before start date.
    InvalidWindow { start: NaiveDate, end: NaiveDate },
    /// Malformed caller input other than the window.
    Validation(String),
    CarNotFound(Ulid),
    /// Car exists but is administratively not bookable.
    CarUnavailable(Ulid),
    /// Requested window overlaps a reservation that still holds the car.
    SchedulingConflict { car_id: Ulid, conflicting: Ulid },
    NotFound(Ulid),
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    /// A concurrent transition moved the reservation first.
    StaleState {
        id: Ulid,
        expected: ReservationStatus,
        actual: ReservationStatus,
    },
    DuplicateLicensePlate(String),
    LimitExceeded(&'static str),
    Storage(String),
}

impl EngineError {
    /// Caller mistakes and expected outcomes, as opposed to server faults.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, EngineError::Storage(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidWindow { start, end } => {
                write!(f, "invalid window: end date {end} is before start date {start}")
            }
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::CarNotFound(id) => write!(f, "car not found: {id}"),
            EngineError::CarUnavailable(id) => write!(f, "car {id} is not available for booking"),
            EngineError::SchedulingConflict { car_id, conflicting } => write!(
                f,
                "car {car_id} is not available for the selected dates (conflicts with reservation {conflicting})"
            ),
            EngineError::NotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition: {from} -> {to}")
            }
            EngineError::StaleState { id, expected, actual } => write!(
                f,
                "reservation {id} changed concurrently: expected {expected}, found {actual}"
            ),
            EngineError::DuplicateLicensePlate(plate) => {
                write!(f, "license plate already registered: {plate}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { car_id, conflicting } => {
                EngineError::SchedulingConflict { car_id, conflicting }
            }
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::StaleState { id, expected, actual } => {
                EngineError::StaleState { id, expected, actual }
            }
            StoreError::LimitExceeded(msg) => EngineError::LimitExceeded(msg),
            StoreError::Wal(e) => EngineError::Storage(e),
        }
    }
}

impl From<RevenueOverflow> for EngineError {
    fn from(_: RevenueOverflow) -> Self {
        EngineError::LimitExceeded("report totals overflow")
    }
}
