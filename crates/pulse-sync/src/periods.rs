use std::collections::BTreeSet;

use chrono::{Datelike, Days, Months, NaiveDate};
use pulse_core::{DateRange, Period, PeriodType};

/// The calendar bucket holding `date`: its Monday–Sunday week, or its month.
pub fn period_containing(period_type: PeriodType, date: NaiveDate) -> Period {
    match period_type {
        PeriodType::Weekly => {
            let offset = u64::from(date.weekday().num_days_from_monday());
            let start = date.checked_sub_days(Days::new(offset)).unwrap_or(NaiveDate::MIN);
            let end = start.checked_add_days(Days::new(6)).unwrap_or(NaiveDate::MAX);
            Period { start, end }
        }
        PeriodType::Monthly => {
            let start = date
                .checked_sub_days(Days::new(u64::from(date.day0())))
                .unwrap_or(NaiveDate::MIN);
            let end = start
                .checked_add_months(Months::new(1))
                .and_then(|next| next.pred_opt())
                .unwrap_or(NaiveDate::MAX);
            Period { start, end }
        }
    }
}

/// Every full bucket that overlaps `range`, in calendar order.
///
/// Buckets are never clipped to the range, so a range ending mid-week still
/// yields the whole week and its sum covers all seven days.
pub fn periods_for_range(period_type: PeriodType, range: DateRange) -> Vec<Period> {
    let mut periods = BTreeSet::new();
    let mut cursor = range.from();
    loop {
        let period = period_containing(period_type, cursor);
        periods.insert(period);
        match period.end.succ_opt() {
            Some(next) if next <= range.to() => cursor = next,
            _ => break,
        }
    }
    // The closing bucket is reachable from the far end too; the set keeps it once.
    periods.insert(period_containing(period_type, range.to()));
    periods.into_iter().collect()
}
