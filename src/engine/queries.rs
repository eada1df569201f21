use chrono::NaiveDate;
use rust_decimal::Decimal;
use ulid::Ulid;

use crate::model::*;
use crate::report::{self, CarPerformance, MonthlySummary, SalesSummary};

use super::conflict::{bookable_car, validate_report_range, validate_window};
use super::{Engine, EngineError, price};

impl Engine {
    pub async fn get_reservation(&self, id: &Ulid) -> Result<Reservation, EngineError> {
        self.store
            .find_by_id(id)
            .await
            .ok_or(EngineError::NotFound(*id))
    }

    /// Reservations matching every set field of `filter`, ordered by creation
    /// time then id. Starts from the narrowest index the filter allows.
    pub async fn list_reservations(&self, filter: &ReservationFilter) -> Vec<Reservation> {
        let mut found = if let Some(id) = filter.id {
            self.store.find_by_id(&id).await.into_iter().collect()
        } else if let Some(car_id) = filter.car_id {
            self.store.find_by_car(&car_id).await
        } else if let Some(email) = &filter.customer_email {
            self.store.find_by_customer_email(email).await
        } else {
            self.store.find_all().await
        };
        found.retain(|r| filter.matches(r));
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        found
    }

    pub async fn list_by_car(&self, car_id: Ulid) -> Vec<Reservation> {
        self.list_reservations(&ReservationFilter {
            car_id: Some(car_id),
            ..Default::default()
        })
        .await
    }

    pub async fn list_by_customer(&self, email: &str) -> Vec<Reservation> {
        self.list_reservations(&ReservationFilter {
            customer_email: Some(email.to_string()),
            ..Default::default()
        })
        .await
    }

    pub async fn list_by_status(&self, status: ReservationStatus) -> Vec<Reservation> {
        self.list_reservations(&ReservationFilter {
            status: Some(status),
            ..Default::default()
        })
        .await
    }

    /// What `create_reservation` would charge, without reserving anything.
    pub fn quote(&self, car_id: &Ulid, start: NaiveDate, end: NaiveDate) -> Result<Decimal, EngineError> {
        let window = validate_window(start, end)?;
        let car = bookable_car(self.catalog.as_ref(), car_id)?;
        price(car.daily_rate, &window)
    }

    /// Bookable cars with no holding reservation touching the window.
    pub async fn available_cars(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<Car>, EngineError> {
        let window = validate_window(start, end)?;
        let mut free = Vec::new();
        for car in self.catalog.list() {
            if !self.catalog.is_bookable(&car) {
                continue;
            }
            if self
                .store
                .find_overlapping(&car.id, &window, &HOLDING_STATUSES)
                .await
                .is_empty()
            {
                free.push(car);
            }
        }
        Ok(free)
    }

    // ── Reports ──────────────────────────────────────────────

    pub async fn sales_summary(&self, from: NaiveDate, to: NaiveDate) -> Result<SalesSummary, EngineError> {
        let range = validate_report_range(from, to)?;
        let all = self.store.find_all().await;
        Ok(report::sales_summary(&all, &range)?)
    }

    pub async fn monthly_summary(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<MonthlySummary>, EngineError> {
        let range = validate_report_range(from, to)?;
        let all = self.store.find_all().await;
        Ok(report::monthly_summary(&all, &range)?)
    }

    pub async fn car_performance(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<CarPerformance>, EngineError> {
        let range = validate_report_range(from, to)?;
        let all = self.store.find_all().await;
        Ok(report::car_performance(&all, &range, |id| {
            self.catalog.get(id).map(|car| car.display_name())
        })?)
    }
}
