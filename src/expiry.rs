//! Project expiry dates and the urgency badge shown next to each project.

use chrono::{Duration, NaiveDate};
use std::fmt;

/// Stored form of a disabled expiry.
pub const NEVER: &str = "never";
/// Stored form of an expiry date.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Days a freshly saved project stays around.
pub const DEFAULT_EXPIRY_DAYS: i64 = 90;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expiry {
    Never,
    On(NaiveDate),
}

impl Expiry {
    /// Parse the stored form: `never` or `YYYY-MM-DD`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case(NEVER) {
            return Some(Expiry::Never);
        }
        NaiveDate::parse_from_str(raw, DATE_FORMAT).ok().map(Expiry::On)
    }

    /// Expiry `days` after `today`.
    pub fn days_from(today: NaiveDate, days: i64) -> Self {
        Expiry::On(today + Duration::days(days))
    }
}

impl fmt::Display for Expiry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expiry::Never => write!(f, "{}", NEVER),
            Expiry::On(date) => write!(f, "{}", date.format(DATE_FORMAT)),
        }
    }
}

/// Urgency of a project's expiry relative to today.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Badge {
    /// Expiry could not be parsed; renders as an empty string.
    Unknown,
    Expired,
    OneWeek,
    /// Remaining time rounded up to whole 30-day months.
    Months(i64),
    Never,
}

impl Badge {
    /// Classify a stored expiry string.
    ///
    /// Past dates are expired, a week or less is the one-week warning, and
    /// anything further is rounded up to 30-day months so that 89 days
    /// reads as 3 months.
    pub fn classify(expires_at: &str, today: NaiveDate) -> Self {
        match Expiry::parse(expires_at) {
            None => Badge::Unknown,
            Some(Expiry::Never) => Badge::Never,
            Some(Expiry::On(date)) => {
                let delta = (date - today).num_days();
                if delta < 0 {
                    Badge::Expired
                } else if delta <= 7 {
                    Badge::OneWeek
                } else {
                    Badge::Months((delta + 29) / 30)
                }
            }
        }
    }
}

impl fmt::Display for Badge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Badge::Unknown => Ok(()),
            Badge::Expired => write!(f, "❌ expired"),
            Badge::OneWeek => write!(f, "🔴🔴🔴 1 wk"),
            Badge::Months(n) if *n >= 3 => write!(f, "🟢 {} mo", n),
            Badge::Months(2) => write!(f, "🟡 2 mo"),
            Badge::Months(_) => write!(f, "🔴 1 mo"),
            Badge::Never => write!(f, "♾️ never"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FORMAT).unwrap()
    }

    fn badge(expires_at: &str) -> String {
        Badge::classify(expires_at, day("2026-03-01")).to_string()
    }

    #[test]
    fn badge_thresholds() {
        assert_eq!(badge("garbage"), "");
        assert_eq!(badge(""), "");
        assert_eq!(badge("2026-02-28"), "❌ expired");
        assert_eq!(badge("2026-03-01"), "🔴🔴🔴 1 wk");
        assert_eq!(badge("2026-03-08"), "🔴🔴🔴 1 wk");
        assert_eq!(badge("2026-03-09"), "🔴 1 mo");
        assert_eq!(badge("2026-03-31"), "🔴 1 mo");
        assert_eq!(badge("2026-04-01"), "🟡 2 mo");
        // 89 days rounds up to three months
        assert_eq!(badge("2026-05-29"), "🟢 3 mo");
        assert_eq!(badge("2026-12-01"), "🟢 10 mo");
        assert_eq!(badge("never"), "♾️ never");
    }

    #[test]
    fn expiry_parse_and_display() {
        assert_eq!(Expiry::parse("NEVER"), Some(Expiry::Never));
        assert_eq!(Expiry::parse("2026-01-31"), Some(Expiry::On(day("2026-01-31"))));
        assert_eq!(Expiry::parse("31/01/2026"), None);
        assert_eq!(
            Expiry::days_from(day("2026-01-01"), DEFAULT_EXPIRY_DAYS).to_string(),
            "2026-04-01"
        );
        assert_eq!(Expiry::Never.to_string(), "never");
    }
}
