//! ISO-8601 billing cadences
//!
//! Cadences are kept as calendar components rather than a fixed `Duration` so
//! that `P1M` means "same day next month" and not "30 days later".

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month, OffsetDateTime};

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cadence {
    years: u32,
    months: u32,
    weeks: u32,
    days: u32,
    hours: u32,
    minutes: u32,
    seconds: u32,
}

impl Cadence {
    pub fn hours(hours: u32) -> Self {
        Self {
            hours,
            ..Self::default()
        }
    }

    pub fn days(days: u32) -> Self {
        Self {
            days,
            ..Self::default()
        }
    }

    pub fn months(months: u32) -> Self {
        Self {
            months,
            ..Self::default()
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    fn calendar_months(&self) -> i64 {
        i64::from(self.years) * 12 + i64::from(self.months)
    }

    fn fixed_part(&self) -> Duration {
        Duration::weeks(i64::from(self.weeks))
            + Duration::days(i64::from(self.days))
            + Duration::hours(i64::from(self.hours))
            + Duration::minutes(i64::from(self.minutes))
            + Duration::seconds(i64::from(self.seconds))
    }

    /// `anchor` advanced by this cadence once
    pub fn add_to(&self, anchor: OffsetDateTime) -> BillingResult<OffsetDateTime> {
        self.add_times(anchor, 1)
    }

    /// `anchor` advanced by `times` whole cadences. Month arithmetic is done
    /// from the anchor each time, so a Jan 31 anchor yields Feb 29, Mar 31, ...
    pub fn add_times(&self, anchor: OffsetDateTime, times: u32) -> BillingResult<OffsetDateTime> {
        let overflow = || BillingError::InvalidCadence {
            value: self.to_string(),
            reason: "timestamp overflow".to_string(),
        };
        let months = self.calendar_months() * i64::from(times);

        let shifted = if months == 0 {
            anchor
        } else {
            anchor.replace_date(add_months(anchor.date(), months).ok_or_else(|| {
                BillingError::InvalidCadence {
                    value: self.to_string(),
                    reason: format!("date out of range after {months} months"),
                }
            })?)
        };

        let fixed = self
            .fixed_part()
            .checked_mul(i32::try_from(times).map_err(|_| overflow())?)
            .ok_or_else(overflow)?;
        shifted.checked_add(fixed).ok_or_else(overflow)
    }
}

fn add_months(date: Date, months: i64) -> Option<Date> {
    let zero_based = i64::from(date.year()) * 12 + i64::from(u8::from(date.month())) - 1 + months;
    let year = i32::try_from(zero_based.div_euclid(12)).ok()?;
    let month = Month::try_from(u8::try_from(zero_based.rem_euclid(12) + 1).ok()?).ok()?;
    let day = date.day().min(time::util::days_in_year_month(year, month));
    Date::from_calendar_date(year, month, day).ok()
}

impl FromStr for Cadence {
    type Err = BillingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| BillingError::InvalidCadence {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let rest = value
            .strip_prefix('P')
            .ok_or_else(|| invalid("must start with P"))?;

        let mut cadence = Cadence::default();
        let mut in_time = false;
        let mut digits = String::new();
        let mut seen_component = false;
        let mut seen_time_component = false;

        for ch in rest.chars() {
            if ch.is_ascii_digit() {
                digits.push(ch);
                continue;
            }
            if ch == 'T' {
                if in_time || !digits.is_empty() {
                    return Err(invalid("unexpected T"));
                }
                in_time = true;
                continue;
            }

            if digits.is_empty() {
                return Err(invalid("missing number before designator"));
            }
            let n: u32 = digits.parse().map_err(|_| invalid("number too large"))?;
            digits.clear();
            seen_component = true;
            seen_time_component |= in_time;

            let slot = match (in_time, ch) {
                (false, 'Y') => &mut cadence.years,
                (false, 'M') => &mut cadence.months,
                (false, 'W') => &mut cadence.weeks,
                (false, 'D') => &mut cadence.days,
                (true, 'H') => &mut cadence.hours,
                (true, 'M') => &mut cadence.minutes,
                (true, 'S') => &mut cadence.seconds,
                _ => return Err(invalid("unknown designator")),
            };
            *slot = n;
        }

        if !digits.is_empty() {
            return Err(invalid("trailing number without designator"));
        }
        if in_time && !seen_time_component {
            return Err(invalid("T without time components"));
        }
        if !seen_component {
            return Err(invalid("no components"));
        }
        if cadence.is_zero() {
            return Err(invalid("cadence must be positive"));
        }

        Ok(cadence)
    }
}

impl TryFrom<String> for Cadence {
    type Error = BillingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cadence> for String {
    fn from(cadence: Cadence) -> Self {
        cadence.to_string()
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("P")?;
        for (n, unit) in [(self.years, 'Y'), (self.months, 'M'), (self.weeks, 'W'), (self.days, 'D')] {
            if n > 0 {
                write!(f, "{n}{unit}")?;
            }
        }
        if self.hours > 0 || self.minutes > 0 || self.seconds > 0 {
            f.write_str("T")?;
            for (n, unit) in [(self.hours, 'H'), (self.minutes, 'M'), (self.seconds, 'S')] {
                if n > 0 {
                    write!(f, "{n}{unit}")?;
                }
            }
        }
        Ok(())
    }
}
