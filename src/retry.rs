//! What happens to a job after it fails.

use chrono::TimeDelta;

use crate::types::DateTime;

/// Outcome of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// Worth another try later.
    Retryable(String),
    /// No retry can fix this one, e.g. a payload that does not decode.
    Terminal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Unlock and run again no earlier than `run_at`.
    Reschedule { run_at: DateTime },
    /// Give up: delete the row or mark it failed.
    GiveUp,
}

/// Seconds to wait before the next try: `attempts^4 + 5`.
pub fn backoff_delay(attempts: u32) -> TimeDelta {
    let secs = i64::from(attempts).saturating_pow(4).saturating_add(5);
    TimeDelta::try_seconds(secs).unwrap_or(TimeDelta::MAX)
}

/// Decides between retrying and giving up after a failed attempt.
pub fn decide(
    attempts: u32,
    max_attempts: u32,
    force_terminal: bool,
    now: DateTime,
) -> Disposition {
    if force_terminal || attempts >= max_attempts {
        return Disposition::GiveUp;
    }
    let run_at = now
        .checked_add_signed(backoff_delay(attempts))
        .unwrap_or(DateTime::MAX_UTC);
    Disposition::Reschedule { run_at }
}
