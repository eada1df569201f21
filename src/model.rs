use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Inclusive calendar-date window `[start, end]`.
///
/// Both ends are occupied days: a window ending on day X and another starting
/// on day X overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start <= end, "DateWindow start must not be after end");
        Self { start, end }
    }

    /// `None` when `end` is before `start`.
    pub fn try_new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Whole days between start and end (0 for a same-day window).
    pub fn nights(&self) -> i64 {
        self.end.signed_duration_since(self.start).num_days()
    }

    /// Days charged: same-day windows bill one day.
    pub fn billable_days(&self) -> i64 {
        self.nights().max(1)
    }

    /// Calendar days touched by the window, both ends included.
    pub fn rental_days(&self) -> i64 {
        self.nights() + 1
    }

    pub fn overlaps(&self, other: &DateWindow) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains_date(&self, d: NaiveDate) -> bool {
        self.start <= d && d <= self.end
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Reservation lifecycle.
///
/// ```text
/// PENDING -> CONFIRMED -> ACTIVE -> COMPLETED
///    \            \          \
///     +------------+----------+--> CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Active,
    Completed,
    Cancelled,
}

/// Statuses that occupy the car's calendar.
pub const HOLDING_STATUSES: [ReservationStatus; 3] = [
    ReservationStatus::Pending,
    ReservationStatus::Confirmed,
    ReservationStatus::Active,
];

/// Statuses counted as revenue by the reports.
pub const REVENUE_STATUSES: [ReservationStatus; 3] = [
    ReservationStatus::Confirmed,
    ReservationStatus::Active,
    ReservationStatus::Completed,
];

impl ReservationStatus {
    pub fn is_holding(self) -> bool {
        HOLDING_STATUSES.contains(&self)
    }

    pub fn is_revenue(self) -> bool {
        REVENUE_STATUSES.contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ReservationStatus::Completed | ReservationStatus::Cancelled)
    }

    pub fn can_transition_to(self, target: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, target),
            (Pending, Confirmed)
                | (Confirmed, Active)
                | (Active, Completed)
                | (Pending, Cancelled)
                | (Confirmed, Cancelled)
                | (Active, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::Active => "ACTIVE",
            ReservationStatus::Completed => "COMPLETED",
            ReservationStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(ReservationStatus::Pending),
            "CONFIRMED" => Ok(ReservationStatus::Confirmed),
            "ACTIVE" => Ok(ReservationStatus::Active),
            "COMPLETED" => Ok(ReservationStatus::Completed),
            "CANCELLED" | "CANCELED" => Ok(ReservationStatus::Cancelled),
            other => Err(format!("unknown reservation status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerContact {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

impl CustomerContact {
    /// Lookup key for the customer index.
    pub fn email_key(&self) -> String {
        normalize_email(&self.email)
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub car_id: Ulid,
    pub customer: CustomerContact,
    pub window: DateWindow,
    /// Fixed at creation; never recomputed.
    pub total_amount: Decimal,
    pub status: ReservationStatus,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input to `Engine::create_reservation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub car_id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub customer: CustomerContact,
    pub notes: Option<String>,
}

/// Conjunction of optional equality filters. The empty filter matches all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub id: Option<Ulid>,
    pub car_id: Option<Ulid>,
    pub customer_email: Option<String>,
    pub status: Option<ReservationStatus>,
}

impl ReservationFilter {
    pub fn matches(&self, r: &Reservation) -> bool {
        self.id.is_none_or(|id| r.id == id)
            && self.car_id.is_none_or(|car| r.car_id == car)
            && self
                .customer_email
                .as_deref()
                .is_none_or(|email| normalize_email(email) == r.customer.email_key())
            && self.status.is_none_or(|s| r.status == s)
    }
}

// ── Cars ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CarStatus {
    Available,
    Unavailable,
    Maintenance,
}

impl CarStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CarStatus::Available => "AVAILABLE",
            CarStatus::Unavailable => "UNAVAILABLE",
            CarStatus::Maintenance => "MAINTENANCE",
        }
    }
}

impl fmt::Display for CarStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CarStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AVAILABLE" => Ok(CarStatus::Available),
            "UNAVAILABLE" => Ok(CarStatus::Unavailable),
            "MAINTENANCE" => Ok(CarStatus::Maintenance),
            other => Err(format!("unknown car status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Car {
    pub id: Ulid,
    pub make: String,
    pub model: String,
    pub year: i32,
    pub color: String,
    pub license_plate: String,
    pub daily_rate: Decimal,
    pub status: CarStatus,
    pub location: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Car {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.make, self.model)
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// Reservation store log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationStatusChanged {
        id: Ulid,
        car_id: Ulid,
        status: ReservationStatus,
        at: DateTime<Utc>,
    },
}

impl Event {
    pub fn car_id(&self) -> Ulid {
        match self {
            Event::ReservationCreated { reservation } => reservation.car_id,
            Event::ReservationStatusChanged { car_id, .. } => *car_id,
        }
    }
}

/// Fleet log record. Each carries the full car snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FleetEvent {
    CarRegistered { car: Car },
    CarUpdated { car: Car },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn w(a: u32, b: u32) -> DateWindow {
        DateWindow::new(d(2024, 6, a), d(2024, 6, b))
    }

    #[test]
    fn window_rejects_reversed_dates() {
        assert!(DateWindow::try_new(d(2024, 6, 3), d(2024, 6, 1)).is_none());
        assert!(DateWindow::try_new(d(2024, 6, 1), d(2024, 6, 1)).is_some());
    }

    #[test]
    fn window_day_counts() {
        let same_day = w(1, 1);
        assert_eq!(same_day.nights(), 0);
        assert_eq!(same_day.billable_days(), 1);
        assert_eq!(same_day.rental_days(), 1);

        let two_nights = w(1, 3);
        assert_eq!(two_nights.billable_days(), 2);
        assert_eq!(two_nights.rental_days(), 3);
    }

    #[test]
    fn window_overlap_is_inclusive() {
        // Same-day turnover counts as overlap
        assert!(w(1, 3).overlaps(&w(3, 5)));
        assert!(w(3, 5).overlaps(&w(1, 3)));
        // Containment both ways
        assert!(w(1, 10).overlaps(&w(4, 5)));
        assert!(w(4, 5).overlaps(&w(1, 10)));
        // Disjoint
        assert!(!w(1, 3).overlaps(&w(4, 6)));
        assert!(!w(4, 6).overlaps(&w(1, 3)));
    }

    #[test]
    fn window_contains_date() {
        let win = w(2, 4);
        assert!(win.contains_date(d(2024, 6, 2)));
        assert!(win.contains_date(d(2024, 6, 4)));
        assert!(!win.contains_date(d(2024, 6, 5)));
    }

    #[test]
    fn lifecycle_happy_path() {
        use ReservationStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(Active));
        assert!(Active.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Active));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn lifecycle_terminal_states_are_final() {
        use ReservationStatus::*;
        for target in [Pending, Confirmed, Active, Completed, Cancelled] {
            assert!(!Completed.can_transition_to(target), "COMPLETED -> {target}");
            assert!(!Cancelled.can_transition_to(target), "CANCELLED -> {target}");
        }
    }

    #[test]
    fn lifecycle_cancel_from_holding_states() {
        for s in HOLDING_STATUSES {
            assert!(s.can_transition_to(ReservationStatus::Cancelled));
            assert!(s.is_holding());
            assert!(!s.is_terminal());
        }
        assert!(ReservationStatus::Completed.is_terminal());
        assert!(ReservationStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_parsing() {
        assert_eq!("confirmed".parse::<ReservationStatus>().unwrap(), ReservationStatus::Confirmed);
        assert_eq!("CANCELED".parse::<ReservationStatus>().unwrap(), ReservationStatus::Cancelled);
        assert!("booked".parse::<ReservationStatus>().is_err());
        assert_eq!("maintenance".parse::<CarStatus>().unwrap(), CarStatus::Maintenance);
    }

    #[test]
    fn filter_matches_email_case_insensitively() {
        let r = Reservation {
            id: Ulid::new(),
            car_id: Ulid::new(),
            customer: CustomerContact {
                name: "Ada".into(),
                email: "Ada@Example.com".into(),
                phone: None,
            },
            window: w(1, 2),
            total_amount: Decimal::new(5000, 2),
            status: ReservationStatus::Pending,
            notes: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let f = ReservationFilter {
            customer_email: Some("ada@example.COM".into()),
            ..Default::default()
        };
        assert!(f.matches(&r));
        let f = ReservationFilter {
            status: Some(ReservationStatus::Confirmed),
            ..Default::default()
        };
        assert!(!f.matches(&r));
        assert!(ReservationFilter::default().matches(&r));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationStatusChanged {
            id: Ulid::new(),
            car_id: Ulid::new(),
            status: ReservationStatus::Active,
            at: Utc::now(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
