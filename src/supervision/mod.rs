//! Rolling issue counter and escalation policy for supervisor feedback.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SupervisorAction {
    Continue,
    Redirect,
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assessment {
    pub action: SupervisorAction,
    pub score: u8,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupervisionState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_assessment: Option<Assessment>,
    pub consecutive_issues: u32,
    pub needs_intervention: bool,
    pub checks: u32,
    pub interventions: u32,
}

/// Wraps a [`SupervisionState`] and applies the escalation rules from
/// the design: `consecutive_issues` counts REDIRECT/ABORT and any
/// score below 50, a healthy CONTINUE resets it, and `needs_intervention`
/// latches once the threshold is crossed or an ABORT is ever seen
/// (it never un-latches on its own — only a Reset mutation clears it).
pub struct SupervisionTracker {
    state: SupervisionState,
    threshold: u32,
}

impl SupervisionTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            state: SupervisionState::default(),
            threshold,
        }
    }

    pub fn state(&self) -> &SupervisionState {
        &self.state
    }

    pub fn record(&mut self, assessment: Assessment) -> &SupervisionState {
        self.state.checks += 1;

        let is_issue = matches!(
            assessment.action,
            SupervisorAction::Redirect | SupervisorAction::Abort
        ) || assessment.score < 50;

        if is_issue {
            self.state.consecutive_issues += 1;
        } else {
            self.state.consecutive_issues = 0;
        }

        if assessment.action == SupervisorAction::Abort {
            self.state.interventions += 1;
        }

        self.state.needs_intervention |=
            self.state.consecutive_issues >= self.threshold || assessment.action == SupervisorAction::Abort;

        self.state.last_assessment = Some(assessment);
        &self.state
    }

    pub fn should_abort(&self) -> bool {
        matches!(
            self.state.last_assessment.as_ref().map(|a| a.action),
            Some(SupervisorAction::Abort)
        )
    }
}
