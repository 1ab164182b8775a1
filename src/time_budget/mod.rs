//! Duration parsing and wall-clock budget tracking.
//!
//! Duration strings are the `NhMmSs` style used throughout the control
//! plane's CLI flags and internal reports: `4h`, `30m`, `45s`. Only a
//! single unit per string is accepted — `\d+[hms]` — there is no
//! compound `1h30m` form on input, though `FormatDuration` may emit a
//! mixed form for readability.

use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::RunnerError;

static DURATION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)([hms])$").expect("valid duration regex"));

/// Parses a duration string matching `^\d+[hms]$`.
pub fn parse_duration(input: &str) -> Result<Duration, RunnerError> {
    let captures = DURATION_RE
        .captures(input)
        .ok_or_else(|| RunnerError::BadDuration(input.to_string()))?;

    let amount: u64 = captures[1]
        .parse()
        .map_err(|_| RunnerError::BadDuration(input.to_string()))?;

    let duration = match &captures[2] {
        "h" => Duration::from_secs(amount * 3600),
        "m" => Duration::from_secs(amount * 60),
        "s" => Duration::from_secs(amount),
        _ => unreachable!("regex only captures h, m, or s"),
    };

    Ok(duration)
}

/// Formats a millisecond count as the most coarse-grained string that
/// preserves the exact value: `2h`, `90m` when hours don't divide
/// evenly, `45s` under a minute.
pub fn format_duration(ms: u64) -> String {
    let total_secs = ms / 1000;

    if total_secs == 0 {
        return format!("{}s", total_secs);
    }
    if total_secs % 3600 == 0 {
        return format!("{}h", total_secs / 3600);
    }
    if total_secs % 60 == 0 {
        return format!("{}m", total_secs / 60);
    }
    format!("{}s", total_secs)
}

/// Tracks elapsed/remaining time against a fixed overall budget.
///
/// `started_at` is an `Instant` rather than a wall-clock timestamp
/// because only relative elapsed time matters here; `Run.startedAt`
/// (the wall-clock value reported to subscribers) lives on the State
/// Hub instead.
#[derive(Debug)]
pub struct TimeBudget {
    started_at: Instant,
    overall_limit: Duration,
}

impl TimeBudget {
    pub fn new(overall_limit: Duration) -> Self {
        Self {
            started_at: Instant::now(),
            overall_limit,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Remaining budget; saturates at zero rather than underflowing
    /// once the overall limit has been exceeded.
    pub fn remaining(&self) -> Duration {
        self.overall_limit.saturating_sub(self.elapsed())
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn overall_limit(&self) -> Duration {
        self.overall_limit
    }
}
