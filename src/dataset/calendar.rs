//! Minimal exchange calendar classification (§4.2 step 7).
//!
//! "Exchange calendar" is kept deliberately abstract and narrowed here to
//! two concrete calendars, documented in SPEC_FULL.md:
//! `24x7` (crypto-style, every gap beyond the declared bar interval is
//! unexpected) and `us_equity` (weekends are expected closures).

use chrono::{Datelike, TimeZone, Utc, Weekday};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Calendar {
    Always,
    UsEquity,
}

impl Calendar {
    pub fn from_id(id: &str) -> Self {
        match id {
            "us_equity" => Self::UsEquity,
            _ => Self::Always,
        }
    }

    pub fn id(self) -> &'static str {
        match self {
            Self::Always => "24x7",
            Self::UsEquity => "us_equity",
        }
    }

    /// Whether a gap between two consecutive UTC-ms timestamps that exceeds
    /// the declared bar interval is an *expected* market closure.
    pub fn is_expected_closure(self, prev_ts: i64, next_ts: i64) -> bool {
        match self {
            Self::Always => false,
            Self::UsEquity => {
                let prev = Utc.timestamp_millis_opt(prev_ts).single();
                let next = Utc.timestamp_millis_opt(next_ts).single();
                match (prev, next) {
                    (Some(p), Some(n)) => {
                        // Any gap spanning a Saturday or Sunday, or an
                        // overnight gap (different calendar day), counts as
                        // an expected closure under this simplified model.
                        p.date_naive() != n.date_naive()
                            || matches!(p.weekday(), Weekday::Fri)
                                && matches!(n.weekday(), Weekday::Mon)
                    }
                    _ => false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_calendar_never_expects_gaps() {
        let cal = Calendar::from_id("24x7");
        assert!(!cal.is_expected_closure(0, 1_000_000_000));
    }

    #[test]
    fn us_equity_calendar_treats_day_change_as_expected() {
        let cal = Calendar::from_id("us_equity");
        let day1 = Utc.with_ymd_and_hms(2024, 1, 2, 20, 0, 0).unwrap().timestamp_millis();
        let day2 = Utc.with_ymd_and_hms(2024, 1, 3, 14, 30, 0).unwrap().timestamp_millis();
        assert!(cal.is_expected_closure(day1, day2));
    }
}
