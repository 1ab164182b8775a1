//! Structured error kinds for the control plane.
//!
//! The run has a small, closed set of error kinds: most of them are
//! *data* that gets recorded on a Step or an Attempt rather than
//! something that unwinds the stack. `RunnerError` exists for the
//! handful of cases that do need to propagate — bad input, a rejected
//! mutation, or a fatal adapter failure — and for mapping those onto
//! CLI exit codes.

use thiserror::Error;

use crate::plan::StepStatus;

#[derive(Debug, Clone, Error)]
pub enum RunnerError {
    #[error("invalid duration string '{0}': expected \\d+[hms]")]
    BadDuration(String),

    #[error("illegal step transition on step {step}: {from:?} -> {to:?}")]
    IllegalStepTransition {
        step: u32,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("worker failed on step {step}: {reason}")]
    WorkerStepError { step: u32, reason: String },

    #[error("planner adapter failed: {0}")]
    PlannerError(String),

    #[error("verifier adapter failed: {0}")]
    VerifierError(String),

    #[error("supervisor requested abort: {reason}")]
    SupervisorAbort { reason: String },

    #[error("time budget exhausted")]
    TimeExhausted,

    #[error("subscriber {0} lagged and dropped events")]
    SubscriberLagged(String),

    #[error("internal invariant violated: {0}")]
    InternalInvariantViolation(String),
}

impl RunnerError {
    /// Exit code for the CLI wrapper: 0 on HIGH+goalAchieved (handled by
    /// the caller, not here), 1 on plain verification failure, 2 on
    /// abort/escalation, 3 on time exhaustion, 4 on internal error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::SupervisorAbort { .. } => 2,
            Self::TimeExhausted => 3,
            _ => 4,
        }
    }

    /// True for the two kinds that short-circuit the Retry Controller
    /// outright — every other kind is absorbed at the attempt or step
    /// boundary and does not stop further attempts.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(
            self,
            Self::SupervisorAbort { .. } | Self::InternalInvariantViolation(_)
        )
    }
}
