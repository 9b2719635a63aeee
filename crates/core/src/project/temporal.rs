//! Temporal composition strategies for summaries.

use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};

/// How daily index outputs are grouped into composites before summarizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositionStrategy {
    /// Calendar months, starting on the 1st.
    GregorianMonthly,
    /// Seven-day weeks starting on Monday.
    WhoWeekly,
    /// Fixed-length composites restarting on January 1st of each year.
    Days(u32),
}

impl CompositionStrategy {
    /// First day of the composite containing `date`.
    pub fn composite_start(&self, date: NaiveDate) -> NaiveDate {
        match *self {
            Self::GregorianMonthly => date.with_day(1).unwrap_or(date),
            Self::WhoWeekly => {
                date - Duration::days(date.weekday().num_days_from_monday() as i64)
            }
            Self::Days(length) => {
                let length = length.max(1);
                let offset = date.ordinal0() / length * length;
                date - Duration::days((date.ordinal0() - offset) as i64)
            }
        }
    }

    /// Number of days in the composite starting at `start`.
    pub fn days_in_composite(&self, start: NaiveDate) -> u32 {
        match *self {
            Self::GregorianMonthly => {
                let (year, month) = if start.month() == 12 {
                    (start.year() + 1, 1)
                } else {
                    (start.year(), start.month() + 1)
                };
                NaiveDate::from_ymd_opt(year, month, 1)
                    .map(|next| (next - start.with_day(1).unwrap_or(start)).num_days() as u32)
                    .unwrap_or(31)
            }
            Self::WhoWeekly => 7,
            Self::Days(length) => {
                let days_in_year = if start.leap_year() { 366 } else { 365 };
                length.max(1).min(days_in_year - start.ordinal0())
            }
        }
    }

    /// Count the composites lying entirely within `[first, last]`.
    pub fn complete_composites(&self, first: NaiveDate, last: NaiveDate) -> u64 {
        if last < first {
            return 0;
        }

        let mut count = 0;
        let mut start = self.composite_start(first);
        while start <= last {
            let length = self.days_in_composite(start);
            let end = start + Duration::days(length as i64 - 1);
            if start >= first && end <= last {
                count += 1;
            }
            start += Duration::days(length as i64);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_monthly_start_and_length() {
        let s = CompositionStrategy::GregorianMonthly;
        assert_eq!(s.composite_start(date(2024, 2, 17)), date(2024, 2, 1));
        assert_eq!(s.days_in_composite(date(2024, 2, 1)), 29);
        assert_eq!(s.days_in_composite(date(2023, 2, 1)), 28);
        assert_eq!(s.days_in_composite(date(2024, 12, 1)), 31);
    }

    #[test]
    fn test_weekly_starts_on_monday() {
        let s = CompositionStrategy::WhoWeekly;
        // 2024-01-10 is a Wednesday
        assert_eq!(s.composite_start(date(2024, 1, 10)), date(2024, 1, 8));
        assert_eq!(s.composite_start(date(2024, 1, 8)), date(2024, 1, 8));
        assert_eq!(s.days_in_composite(date(2024, 1, 8)), 7);
    }

    #[test]
    fn test_fixed_length_restarts_each_year() {
        let s = CompositionStrategy::Days(16);
        assert_eq!(s.composite_start(date(2024, 1, 20)), date(2024, 1, 17));
        // Last composite of 2023 is truncated at the year boundary
        let last = s.composite_start(date(2023, 12, 31));
        assert_eq!(last, date(2023, 12, 19));
        assert_eq!(s.days_in_composite(last), 13);
    }

    #[test]
    fn test_complete_composites() {
        let monthly = CompositionStrategy::GregorianMonthly;
        assert_eq!(monthly.complete_composites(date(2024, 1, 1), date(2024, 3, 31)), 3);
        assert_eq!(monthly.complete_composites(date(2024, 1, 2), date(2024, 3, 30)), 1);
        assert_eq!(monthly.complete_composites(date(2024, 3, 1), date(2024, 1, 1)), 0);

        let weekly = CompositionStrategy::WhoWeekly;
        // Monday 2024-01-01 through Sunday 2024-01-14
        assert_eq!(weekly.complete_composites(date(2024, 1, 1), date(2024, 1, 14)), 2);
        assert_eq!(weekly.complete_composites(date(2024, 1, 1), date(2024, 1, 13)), 1);
    }

    #[test]
    fn test_deserialize_strategies() {
        #[derive(Deserialize)]
        struct Wrapper {
            strategy: CompositionStrategy,
        }
        let w: Wrapper = toml::from_str(r#"strategy = "who_weekly""#).unwrap();
        assert_eq!(w.strategy, CompositionStrategy::WhoWeekly);
        let w: Wrapper = toml::from_str("strategy = { days = 8 }").unwrap();
        assert_eq!(w.strategy, CompositionStrategy::Days(8));
    }
}
