//! Runtime configuration: built-in defaults, environment overrides,
//! and pre-flight validation.
//!
//! Grounded in the teacher's `ExecutionLimits::from_env()` pattern: a
//! malformed environment variable never panics the process — it's
//! logged and the default is kept — and problems are collected into a
//! list rather than failing eagerly, so the CLI can report all of them
//! at once.

use std::path::PathBuf;
use std::time::Duration;

use crate::time_budget::parse_duration;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub max_attempts: u32,
    pub overall_time_limit: Duration,
    pub min_attempt_time: Duration,
    pub supervision_threshold: u32,
    pub event_history_capacity: usize,
    pub subscriber_queue_capacity: usize,
    pub replan_every_n_iterations: u32,
    pub working_directory: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            overall_time_limit: Duration::from_secs(3600),
            min_attempt_time: Duration::from_secs(300),
            supervision_threshold: 3,
            event_history_capacity: 1024,
            subscriber_queue_capacity: 256,
            replan_every_n_iterations: 1,
            working_directory: None,
        }
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, raw, "malformed env var, keeping default");
            default
        }),
        Err(_) => default,
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, raw, "malformed env var, keeping default");
            default
        }),
        Err(_) => default,
    }
}

fn env_duration(key: &str, default: Duration) -> Duration {
    match std::env::var(key) {
        Ok(raw) => parse_duration(&raw).unwrap_or_else(|_| {
            tracing::warn!(key, raw, "malformed duration env var, keeping default");
            default
        }),
        Err(_) => default,
    }
}

impl RunnerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: env_u32("RUNNER_MAX_ATTEMPTS", defaults.max_attempts),
            overall_time_limit: env_duration("RUNNER_TIME_LIMIT", defaults.overall_time_limit),
            min_attempt_time: env_duration("RUNNER_MIN_ATTEMPT_TIME", defaults.min_attempt_time),
            supervision_threshold: env_u32("RUNNER_SUPERVISION_THRESHOLD", defaults.supervision_threshold),
            event_history_capacity: env_usize("RUNNER_EVENT_HISTORY_CAPACITY", defaults.event_history_capacity),
            subscriber_queue_capacity: env_usize(
                "RUNNER_SUBSCRIBER_QUEUE_CAPACITY",
                defaults.subscriber_queue_capacity,
            ),
            replan_every_n_iterations: env_u32("RUNNER_REPLAN_EVERY_N", defaults.replan_every_n_iterations),
            working_directory: std::env::var("RUNNER_WORKING_DIR").ok().map(PathBuf::from),
        }
    }

    /// Returns every configuration problem found rather than failing on
    /// the first one, so the CLI can print the whole list before
    /// exiting with code 4.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.max_attempts == 0 {
            problems.push("max_attempts must be at least 1".to_string());
        }
        if self.overall_time_limit.is_zero() {
            problems.push("overall_time_limit must be positive".to_string());
        }
        if self.min_attempt_time.is_zero() {
            problems.push("min_attempt_time must be positive".to_string());
        }
        if self.min_attempt_time > self.overall_time_limit {
            problems.push("min_attempt_time cannot exceed overall_time_limit".to_string());
        }
        if self.supervision_threshold == 0 {
            problems.push("supervision_threshold must be at least 1".to_string());
        }
        if self.event_history_capacity == 0 {
            problems.push("event_history_capacity must be at least 1".to_string());
        }
        if self.subscriber_queue_capacity == 0 {
            problems.push("subscriber_queue_capacity must be at least 1".to_string());
        }
        if self.replan_every_n_iterations == 0 {
            problems.push("replan_every_n_iterations must be at least 1".to_string());
        }

        problems
    }
}
