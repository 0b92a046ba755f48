//! Units for scheduler periods.

use std::time::Duration;

/// Unit a scheduler period is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// Convert `amount` of this unit into a `Duration`.
    ///
    /// Returns `None` for negative amounts.
    pub fn duration(self, amount: i64) -> Option<Duration> {
        let amount = u64::try_from(amount).ok()?;
        Some(match self {
            TimeUnit::Nanoseconds => Duration::from_nanos(amount),
            TimeUnit::Microseconds => Duration::from_micros(amount),
            TimeUnit::Milliseconds => Duration::from_millis(amount),
            TimeUnit::Seconds => Duration::from_secs(amount),
            TimeUnit::Minutes => Duration::from_secs(amount.saturating_mul(60)),
            TimeUnit::Hours => Duration::from_secs(amount.saturating_mul(3600)),
            TimeUnit::Days => Duration::from_secs(amount.saturating_mul(86_400)),
        })
    }
}
