//! Hard caps on input sizes. Anything above these is rejected with
//! `EngineError::LimitExceeded` before it reaches the store or the WAL.

pub const MAX_CARS: usize = 100_000;
/// Open (PENDING, CONFIRMED or ACTIVE) reservations one car may carry.
/// Finished and cancelled history does not count.
pub const MAX_HOLDING_RESERVATIONS_PER_CAR: usize = 10_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_PHONE_LEN: usize = 32;
pub const MAX_NOTES_LEN: usize = 4096;

pub const MAX_PLATE_LEN: usize = 32;
pub const MAX_DESCRIPTION_LEN: usize = 4096;

/// Highest daily rate a car may carry, in whole currency units.
pub const MAX_DAILY_RATE: i64 = 1_000_000;

/// Longest bookable window, in calendar days.
pub const MAX_RESERVATION_DAYS: i64 = 366;

/// Widest creation-date range a report may scan, in calendar days.
pub const MAX_REPORT_RANGE_DAYS: i64 = 3660;
