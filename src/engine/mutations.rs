use chrono::Utc;
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Notification, NotificationKind};
use crate::store::StoreError;

use super::conflict::{bookable_car, validate_customer, validate_notes, validate_window};
use super::{Engine, EngineError, price};

impl Engine {
    /// Book a car for `[start_date, end_date]`. The reservation starts out
    /// PENDING with its total fixed at the car's current daily rate.
    pub async fn create_reservation(&self, req: NewReservation) -> Result<Reservation, EngineError> {
        let window = validate_window(req.start_date, req.end_date)?;
        let customer = validate_customer(req.customer)?;
        validate_notes(&req.notes)?;
        let car = bookable_car(self.catalog.as_ref(), &req.car_id)?;
        let total_amount = price(car.daily_rate, &window)?;

        let now = Utc::now();
        let reservation = Reservation {
            id: Ulid::new(),
            car_id: car.id,
            customer,
            window,
            total_amount,
            status: ReservationStatus::Pending,
            notes: req.notes,
            created_at: now,
            updated_at: now,
        };

        let reservation = match self
            .store
            .insert_if_no_overlap(reservation, &HOLDING_STATUSES)
            .await
        {
            Ok(r) => r,
            Err(StoreError::Conflict { car_id, conflicting }) => {
                debug!("car {car_id} {window}: conflicts with reservation {conflicting}");
                metrics::counter!(crate::observability::SCHEDULING_CONFLICTS_TOTAL).increment(1);
                return Err(EngineError::SchedulingConflict { car_id, conflicting });
            }
            Err(e) => return Err(e.into()),
        };

        metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        info!(
            "reservation {} created: car {} {} total {}",
            reservation.id, reservation.car_id, reservation.window, reservation.total_amount
        );
        self.outbox.publish(Notification {
            kind: NotificationKind::Created,
            reservation: reservation.clone(),
        });
        Ok(reservation)
    }

    /// Move a reservation along the lifecycle graph. The store applies the
    /// change only if nobody else moved it since it was read here.
    pub async fn change_status(&self, id: Ulid, target: ReservationStatus) -> Result<Reservation, EngineError> {
        let current = self
            .store
            .find_by_id(&id)
            .await
            .ok_or(EngineError::NotFound(id))?;
        if !current.status.can_transition_to(target) {
            debug!("reservation {id}: rejected {} -> {target}", current.status);
            return Err(EngineError::InvalidTransition {
                from: current.status,
                to: target,
            });
        }

        let updated = match self.store.update_status(id, current.status, target).await {
            Ok(r) => r,
            Err(e @ StoreError::StaleState { .. }) => {
                metrics::counter!(crate::observability::STALE_STATE_TOTAL).increment(1);
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        metrics::counter!(crate::observability::STATUS_TRANSITIONS_TOTAL, "to" => target.as_str())
            .increment(1);
        info!("reservation {id}: {} -> {target}", current.status);

        // Only holding statuses can reach CANCELLED, so this fires once per reservation.
        if target == ReservationStatus::Cancelled {
            self.outbox.publish(Notification {
                kind: NotificationKind::Cancelled,
                reservation: updated.clone(),
            });
        }
        Ok(updated)
    }

    /// Cancel, treating an already cancelled reservation as success.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let current = self
            .store
            .find_by_id(&id)
            .await
            .ok_or(EngineError::NotFound(id))?;
        if current.status == ReservationStatus::Cancelled {
            return Ok(current);
        }

        match self.change_status(id, ReservationStatus::Cancelled).await {
            // Lost the race to another cancel: same outcome
            Err(
                EngineError::StaleState {
                    actual: ReservationStatus::Cancelled,
                    ..
                }
                | EngineError::InvalidTransition {
                    from: ReservationStatus::Cancelled,
                    ..
                },
            ) => self
                .store
                .find_by_id(&id)
                .await
                .ok_or(EngineError::NotFound(id)),
            other => other,
        }
    }
}
