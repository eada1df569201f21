use chrono::NaiveDate;
use ulid::Ulid;

use crate::catalog::Catalog;
use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Checked before anything touches the catalog or the store.
pub(crate) fn validate_window(start: NaiveDate, end: NaiveDate) -> Result<DateWindow, EngineError> {
    let window = DateWindow::try_new(start, end).ok_or(EngineError::InvalidWindow { start, end })?;
    if window.rental_days() > MAX_RESERVATION_DAYS {
        return Err(EngineError::LimitExceeded("reservation window too long"));
    }
    Ok(window)
}

pub(crate) fn validate_report_range(from: NaiveDate, to: NaiveDate) -> Result<DateWindow, EngineError> {
    let range = DateWindow::try_new(from, to).ok_or(EngineError::InvalidWindow { start: from, end: to })?;
    if range.rental_days() > MAX_REPORT_RANGE_DAYS {
        return Err(EngineError::LimitExceeded("report range too wide"));
    }
    Ok(range)
}

/// Trim the contact and reject anything unusable for a confirmation.
pub(crate) fn validate_customer(customer: CustomerContact) -> Result<CustomerContact, EngineError> {
    let name = customer.name.trim().to_string();
    let email = customer.email.trim().to_string();
    let phone = customer
        .phone
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty());

    if name.is_empty() {
        return Err(EngineError::Validation("customer name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("customer name too long"));
    }
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("customer email too long"));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {}
        _ => {
            return Err(EngineError::Validation(format!(
                "invalid customer email: {email:?}"
            )));
        }
    }
    if phone.as_ref().is_some_and(|p| p.len() > MAX_PHONE_LEN) {
        return Err(EngineError::LimitExceeded("customer phone too long"));
    }
    Ok(CustomerContact { name, email, phone })
}

pub(crate) fn validate_notes(notes: &Option<String>) -> Result<(), EngineError> {
    if notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    Ok(())
}

/// Look the car up and refuse it unless it is administratively bookable.
pub(crate) fn bookable_car(catalog: &dyn Catalog, car_id: &Ulid) -> Result<Car, EngineError> {
    let car = catalog.get(car_id).ok_or(EngineError::CarNotFound(*car_id))?;
    if !catalog.is_bookable(&car) {
        return Err(EngineError::CarUnavailable(*car_id));
    }
    Ok(car)
}
