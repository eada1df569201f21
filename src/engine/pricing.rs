use rust_decimal::Decimal;

use crate::model::DateWindow;

use super::EngineError;

/// Flat daily rate times billable days. A same-day window bills one day.
pub fn price(daily_rate: Decimal, window: &DateWindow) -> Result<Decimal, EngineError> {
    daily_rate
        .checked_mul(Decimal::from(window.billable_days()))
        .ok_or(EngineError::LimitExceeded("reservation total too large"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn window(start: (i32, u32, u32), end: (i32, u32, u32)) -> DateWindow {
        DateWindow::new(
            NaiveDate::from_ymd_opt(start.0, start.1, start.2).unwrap(),
            NaiveDate::from_ymd_opt(end.0, end.1, end.2).unwrap(),
        )
    }

    #[test]
    fn two_days_at_fifty() {
        let total = price(Decimal::new(5000, 2), &window((2024, 6, 1), (2024, 6, 3))).unwrap();
        assert_eq!(total, Decimal::new(10000, 2));
        assert_eq!(total.to_string(), "100.00");
    }

    #[test]
    fn same_day_bills_one_day() {
        let total = price(Decimal::new(4999, 2), &window((2024, 6, 1), (2024, 6, 1))).unwrap();
        assert_eq!(total, Decimal::new(4999, 2));
    }

    #[test]
    fn spans_month_and_leap_day() {
        // Feb 28 -> Mar 1 in a leap year is two days
        let total = price(Decimal::new(30, 0), &window((2024, 2, 28), (2024, 3, 1))).unwrap();
        assert_eq!(total, Decimal::new(60, 0));
    }

    #[test]
    fn zero_rate_is_free() {
        let total = price(Decimal::ZERO, &window((2024, 6, 1), (2024, 6, 10))).unwrap();
        assert!(total.is_zero());
    }

    #[test]
    fn overflowing_total_is_an_error() {
        let err = price(Decimal::MAX, &window((2024, 6, 1), (2024, 6, 3))).unwrap_err();
        assert!(matches!(err, EngineError::LimitExceeded(_)));
        // One billable day cannot overflow
        assert_eq!(price(Decimal::MAX, &window((2024, 6, 1), (2024, 6, 2))).unwrap(), Decimal::MAX);
    }
}
