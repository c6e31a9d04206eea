use crate::domain::ports::ExchangeCalendar;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Datelike, Days, NaiveDate, Weekday};

fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// The last weekday strictly before `date`. Fallback used when no exchange
/// calendar is wired; it knows weekends but not holidays.
pub fn naive_previous_weekday(date: NaiveDate) -> NaiveDate {
    let mut day = date.pred_opt().unwrap_or(date);
    while !is_weekday(day) {
        day = day.pred_opt().unwrap_or(day);
    }
    day
}

/// All weekdays in `start..=end`.
pub fn naive_trading_days(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut day = start;
    while day <= end {
        if is_weekday(day) {
            days.push(day);
        }
        day = match day.checked_add_days(Days::new(1)) {
            Some(next) => next,
            None => break,
        };
    }
    days
}

/// Weekday-only exchange calendar.
pub struct WeekdayCalendar;

#[async_trait]
impl ExchangeCalendar for WeekdayCalendar {
    async fn trading_days(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>> {
        Ok(naive_trading_days(start, end))
    }

    async fn last_trading_day(&self, date: NaiveDate) -> Result<NaiveDate> {
        let mut day = date;
        while !is_weekday(day) {
            day = day.pred_opt().unwrap_or(day);
        }
        Ok(day)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn previous_weekday_skips_weekends() {
        // 2024-05-06 is a Monday; the previous weekday is Friday the 3rd.
        let monday = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();
        assert_eq!(
            naive_previous_weekday(monday),
            NaiveDate::from_ymd_opt(2024, 5, 3).unwrap()
        );

        let tuesday = NaiveDate::from_ymd_opt(2024, 5, 7).unwrap();
        assert_eq!(naive_previous_weekday(tuesday), monday);
    }

    #[test]
    fn trading_days_excludes_weekends() {
        let start = NaiveDate::from_ymd_opt(2024, 5, 3).unwrap(); // Friday
        let end = NaiveDate::from_ymd_opt(2024, 5, 7).unwrap(); // Tuesday
        let days = naive_trading_days(start, end);
        assert_eq!(days.len(), 3);
        assert!(days.iter().all(|d| is_weekday(*d)));
    }

    #[tokio::test]
    async fn last_trading_day_rolls_saturday_back_to_friday() {
        let saturday = NaiveDate::from_ymd_opt(2024, 5, 4).unwrap();
        let day = WeekdayCalendar.last_trading_day(saturday).await.unwrap();
        assert_eq!(day, NaiveDate::from_ymd_opt(2024, 5, 3).unwrap());
    }
}
