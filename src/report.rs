//! Read-only aggregations over reservation history.
//!
//! Every report scopes reservations by the calendar date of `created_at`
//! falling in an inclusive `[from, to]` range. Revenue figures only count
//! CONFIRMED, ACTIVE and COMPLETED reservations.

use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, NaiveDate};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use ulid::Ulid;

use crate::model::{DateWindow, Reservation};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SalesSummary {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub total_reservations: u64,
    pub total_revenue: Decimal,
    pub average_booking_value: Decimal,
    pub total_rental_days: i64,
    pub most_popular_car: Option<Ulid>,
    pub top_customer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthlySummary {
    pub year: i32,
    pub month: u32,
    pub reservations: u64,
    pub revenue: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CarPerformance {
    pub car_id: Ulid,
    pub car_name: Option<String>,
    pub reservations: u64,
    pub revenue: Decimal,
    pub average_booking_value: Decimal,
    pub rental_days: i64,
}

/// A revenue total grew past what `Decimal` can represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevenueOverflow;

impl std::fmt::Display for RevenueOverflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "revenue total overflowed")
    }
}

impl std::error::Error for RevenueOverflow {}

fn add_to(total: &mut Decimal, amount: Decimal) -> Result<(), RevenueOverflow> {
    *total = total.checked_add(amount).ok_or(RevenueOverflow)?;
    Ok(())
}

fn created_in<'a>(
    reservations: &'a [Reservation],
    range: &DateWindow,
) -> impl Iterator<Item = &'a Reservation> {
    let range = *range;
    reservations
        .iter()
        .filter(move |r| range.contains_date(r.created_at.date_naive()))
}

/// Two decimal places, halves away from zero. Zero when there is nothing to average.
fn average(total: Decimal, count: u64) -> Decimal {
    if count == 0 {
        return Decimal::ZERO;
    }
    (total / Decimal::from(count)).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

pub fn sales_summary(reservations: &[Reservation], range: &DateWindow) -> Result<SalesSummary, RevenueOverflow> {
    let mut total_reservations = 0u64;
    let mut total_revenue = Decimal::ZERO;
    let mut total_rental_days = 0i64;
    let mut per_car: HashMap<Ulid, u64> = HashMap::new();
    let mut per_customer: HashMap<String, Decimal> = HashMap::new();

    for r in created_in(reservations, range) {
        *per_car.entry(r.car_id).or_default() += 1;
        add_to(per_customer.entry(r.customer.email_key()).or_default(), r.total_amount)?;
        if r.status.is_revenue() {
            total_reservations += 1;
            add_to(&mut total_revenue, r.total_amount)?;
            total_rental_days += r.window.rental_days();
        }
    }

    // Ties go to the smallest key so the answer doesn't depend on map order.
    let most_popular_car = per_car
        .into_iter()
        .max_by(|(a_id, a), (b_id, b)| a.cmp(b).then(b_id.cmp(a_id)))
        .map(|(id, _)| id);
    let top_customer = per_customer
        .into_iter()
        .max_by(|(a_email, a), (b_email, b)| a.cmp(b).then(b_email.cmp(a_email)))
        .map(|(email, _)| email);

    Ok(SalesSummary {
        from: range.start,
        to: range.end,
        total_reservations,
        total_revenue,
        average_booking_value: average(total_revenue, total_reservations),
        total_rental_days,
        most_popular_car,
        top_customer,
    })
}

/// One row per month that has revenue, oldest first.
pub fn monthly_summary(
    reservations: &[Reservation],
    range: &DateWindow,
) -> Result<Vec<MonthlySummary>, RevenueOverflow> {
    let mut months: BTreeMap<(i32, u32), (u64, Decimal)> = BTreeMap::new();
    for r in created_in(reservations, range).filter(|r| r.status.is_revenue()) {
        let created = r.created_at.date_naive();
        let entry = months.entry((created.year(), created.month())).or_default();
        entry.0 += 1;
        add_to(&mut entry.1, r.total_amount)?;
    }
    Ok(months
        .into_iter()
        .map(|((year, month), (reservations, revenue))| MonthlySummary {
            year,
            month,
            reservations,
            revenue,
        })
        .collect())
}

/// Per-car revenue, highest first (ties by car id). `car_name` resolves
/// display names; cars it doesn't know keep `None`.
pub fn car_performance(
    reservations: &[Reservation],
    range: &DateWindow,
    car_name: impl Fn(&Ulid) -> Option<String>,
) -> Result<Vec<CarPerformance>, RevenueOverflow> {
    let mut per_car: HashMap<Ulid, (u64, Decimal, i64)> = HashMap::new();
    for r in created_in(reservations, range).filter(|r| r.status.is_revenue()) {
        let entry = per_car.entry(r.car_id).or_default();
        entry.0 += 1;
        add_to(&mut entry.1, r.total_amount)?;
        entry.2 += r.window.rental_days();
    }

    let mut rows: Vec<CarPerformance> = per_car
        .into_iter()
        .map(|(car_id, (count, revenue, days))| CarPerformance {
            car_id,
            car_name: car_name(&car_id),
            reservations: count,
            revenue,
            average_booking_value: average(revenue, count),
            rental_days: days,
        })
        .collect();
    rows.sort_by(|a, b| b.revenue.cmp(&a.revenue).then(a.car_id.cmp(&b.car_id)));
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::{TimeZone, Utc};

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, day).unwrap()
    }

    fn res(
        car_id: Ulid,
        email: &str,
        created: (u32, u32),
        days: (u32, u32),
        cents: i64,
        status: ReservationStatus,
    ) -> Reservation {
        let at = Utc
            .with_ymd_and_hms(2024, created.0, created.1, 12, 0, 0)
            .unwrap();
        Reservation {
            id: Ulid::new(),
            car_id,
            customer: CustomerContact {
                name: "Edsger".into(),
                email: email.into(),
                phone: None,
            },
            window: DateWindow::new(d(7, days.0), d(7, days.1)),
            total_amount: Decimal::new(cents, 2),
            status,
            notes: None,
            created_at: at,
            updated_at: at,
        }
    }

    fn year() -> DateWindow {
        DateWindow::new(d(1, 1), d(12, 31))
    }

    #[test]
    fn sales_summary_counts_revenue_statuses_only() {
        use ReservationStatus::*;
        let car = Ulid::new();
        let rs = vec![
            res(car, "a@x.io", (3, 1), (1, 3), 10000, Confirmed),
            res(car, "a@x.io", (3, 2), (5, 5), 5000, Completed),
            res(car, "b@x.io", (3, 3), (8, 9), 7000, Active),
            res(car, "c@x.io", (3, 4), (10, 11), 99900, Pending),
            res(car, "c@x.io", (3, 5), (12, 13), 50000, Cancelled),
        ];
        let s = sales_summary(&rs, &year()).unwrap();
        assert_eq!(s.total_reservations, 3);
        assert_eq!(s.total_revenue, Decimal::new(22000, 2));
        // 220.00 / 3 = 73.333.. -> 73.33
        assert_eq!(s.average_booking_value, Decimal::new(7333, 2));
        // 3 + 1 + 2 days, inclusive
        assert_eq!(s.total_rental_days, 6);
        assert_eq!(s.most_popular_car, Some(car));
        // Top customer looks at every status
        assert_eq!(s.top_customer.as_deref(), Some("c@x.io"));
    }

    #[test]
    fn average_rounds_half_away_from_zero() {
        // 0.01 + 0.02 = 0.03 / 2 = 0.015 -> 0.02
        assert_eq!(average(Decimal::new(3, 2), 2), Decimal::new(2, 2));
        assert_eq!(average(Decimal::new(100, 0), 0), Decimal::ZERO);
    }

    #[test]
    fn sales_summary_respects_creation_range() {
        let car = Ulid::new();
        let rs = vec![
            res(car, "a@x.io", (1, 15), (1, 2), 1000, ReservationStatus::Confirmed),
            res(car, "a@x.io", (2, 1), (3, 4), 2000, ReservationStatus::Confirmed),
            res(car, "a@x.io", (2, 29), (5, 6), 4000, ReservationStatus::Confirmed),
        ];
        let feb = DateWindow::new(d(2, 1), d(2, 29));
        let s = sales_summary(&rs, &feb).unwrap();
        assert_eq!(s.total_reservations, 2);
        assert_eq!(s.total_revenue, Decimal::new(6000, 2));
        assert_eq!(s.from, d(2, 1));
    }

    #[test]
    fn sales_summary_empty() {
        let s = sales_summary(&[], &year()).unwrap();
        assert_eq!(s.total_reservations, 0);
        assert_eq!(s.average_booking_value, Decimal::ZERO);
        assert!(s.most_popular_car.is_none());
        assert!(s.top_customer.is_none());
    }

    #[test]
    fn monthly_summary_groups_and_orders() {
        use ReservationStatus::*;
        let car = Ulid::new();
        let rs = vec![
            res(car, "a@x.io", (5, 20), (1, 1), 3000, Completed),
            res(car, "a@x.io", (3, 2), (2, 2), 1000, Confirmed),
            res(car, "a@x.io", (3, 30), (3, 3), 2000, Active),
            res(car, "a@x.io", (4, 1), (4, 4), 9000, Cancelled),
        ];
        let months = monthly_summary(&rs, &year()).unwrap();
        assert_eq!(
            months,
            vec![
                MonthlySummary { year: 2024, month: 3, reservations: 2, revenue: Decimal::new(3000, 2) },
                MonthlySummary { year: 2024, month: 5, reservations: 1, revenue: Decimal::new(3000, 2) },
            ]
        );
    }

    #[test]
    fn car_performance_sorted_by_revenue() {
        use ReservationStatus::*;
        let cheap = Ulid::new();
        let pricey = Ulid::new();
        let rs = vec![
            res(cheap, "a@x.io", (6, 1), (1, 1), 2000, Confirmed),
            res(cheap, "a@x.io", (6, 2), (2, 3), 2000, Completed),
            res(pricey, "b@x.io", (6, 3), (4, 6), 15000, Active),
            res(pricey, "b@x.io", (6, 4), (7, 8), 80000, Pending),
        ];
        let rows = car_performance(&rs, &year(), |id| {
            (*id == pricey).then(|| "Porsche 911".to_string())
        })
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].car_id, pricey);
        assert_eq!(rows[0].car_name.as_deref(), Some("Porsche 911"));
        assert_eq!(rows[0].reservations, 1);
        assert_eq!(rows[0].rental_days, 3);
        assert_eq!(rows[1].car_id, cheap);
        assert_eq!(rows[1].car_name, None);
        assert_eq!(rows[1].revenue, Decimal::new(4000, 2));
        assert_eq!(rows[1].average_booking_value, Decimal::new(2000, 2));
        assert_eq!(rows[1].rental_days, 3);
    }

    #[test]
    fn revenue_overflow_is_an_error() {
        let car = Ulid::new();
        let mut huge = res(car, "a@x.io", (8, 1), (1, 2), 0, ReservationStatus::Confirmed);
        huge.total_amount = Decimal::MAX;
        let rs = vec![huge.clone(), huge];

        assert_eq!(sales_summary(&rs, &year()), Err(RevenueOverflow));
        assert_eq!(monthly_summary(&rs, &year()), Err(RevenueOverflow));
        assert_eq!(car_performance(&rs, &year(), |_| None), Err(RevenueOverflow));
    }
}
