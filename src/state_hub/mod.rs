//! Authoritative run state: the sole mutator of Run/Plan/Attempt data.
//!
//! All writes go through [`StateHub::apply`], which takes the write
//! lock for the whole mutation (single-writer discipline) and, for
//! mutations that are supposed to, publishes the corresponding derived
//! event on the Event Bus before releasing it. Reads via [`StateHub::snapshot`]
//! take only a read lock and return an owned clone, so a snapshot can
//! never observe a partially-applied mutation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;

use crate::errors::RunnerError;
use crate::event_bus::{Event, SharedEventBus};
use crate::plan::{is_allowed_transition, Plan, StatusTransition, Step, StepDiff, StepStatus};
use crate::supervision::{Assessment, SupervisionState, SupervisionTracker, SupervisorAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Initializing,
    Planning,
    Executing,
    Verifying,
    Completed,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    High,
    Medium,
    Low,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub passed: bool,
    pub confidence: Confidence,
    pub goal_achieved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gaps: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smoke_tests_passed: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub status: RunStatus,
    pub confidence: Confidence,
    pub completed_steps: u32,
    pub failed_steps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gaps: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    pub time_limit_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_report: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub status: RunStatus,
    pub goal: String,
    pub sub_goals: Vec<String>,
    pub initial_context: String,
    pub started_at: DateTime<Utc>,
    pub session_id: String,
}

/// Optional fields carried by an `UpdateStepStatus` mutation, beyond
/// the status itself.
#[derive(Debug, Clone, Default)]
pub struct StepUpdateFields {
    pub fail_reason: Option<String>,
    pub verification: Option<String>,
    pub output: Option<String>,
    pub increment_retry_count: bool,
}

pub enum Mutation {
    SetStatus(RunStatus),
    SetGoal {
        goal: String,
        sub_goals: Vec<String>,
    },
    ReplacePlan(Plan),
    UpdateStepStatus {
        number: u32,
        new_status: StepStatus,
        fields: StepUpdateFields,
    },
    RecordSupervision(Assessment),
    RecordVerification(VerificationResult),
    AppendError(String),
    Reset {
        goal: String,
        sub_goals: Vec<String>,
        initial_context: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub run: Run,
    pub plan: Plan,
    pub supervision: SupervisionState,
    pub attempts: Vec<Attempt>,
    pub errors: Vec<String>,
}

struct State {
    run: Run,
    plan: Plan,
    supervision: SupervisionTracker,
    attempts: Vec<Attempt>,
    errors: Vec<String>,
}

pub struct StateHub {
    inner: RwLock<State>,
    bus: SharedEventBus,
    supervision_threshold: u32,
}

impl StateHub {
    pub fn new(
        bus: SharedEventBus,
        goal: String,
        sub_goals: Vec<String>,
        initial_context: String,
        session_id: String,
        supervision_threshold: u32,
    ) -> Self {
        let run = Run {
            status: RunStatus::Idle,
            goal,
            sub_goals,
            initial_context,
            started_at: Utc::now(),
            session_id,
        };

        Self {
            inner: RwLock::new(State {
                run,
                plan: Plan::default(),
                supervision: SupervisionTracker::new(supervision_threshold),
                attempts: Vec::new(),
                errors: Vec::new(),
            }),
            bus,
            supervision_threshold,
        }
    }

    pub async fn snapshot(&self) -> Snapshot {
        let state = self.inner.read().await;
        Snapshot {
            run: state.run.clone(),
            plan: state.plan.clone(),
            supervision: state.supervision.state().clone(),
            attempts: state.attempts.clone(),
            errors: state.errors.clone(),
        }
    }

    pub async fn current_plan(&self) -> Plan {
        self.inner.read().await.plan.clone()
    }

    pub async fn apply(&self, mutation: Mutation) -> Result<(), RunnerError> {
        let mut state = self.inner.write().await;

        match mutation {
            Mutation::SetStatus(status) => {
                state.run.status = status;
            }
            Mutation::SetGoal { goal, sub_goals } => {
                state.run.goal = goal;
                state.run.sub_goals = sub_goals;
            }
            Mutation::ReplacePlan(mut new_plan) => {
                new_plan.validate()?;
                let old_plan = state.plan.clone();

                for old_step in &old_plan.steps {
                    if let Some(new_step) = new_plan.find(old_step.number) {
                        if old_step.status != new_step.status
                            && !is_allowed_transition(old_step.status, new_step.status)
                        {
                            return Err(RunnerError::IllegalStepTransition {
                                step: old_step.number,
                                from: old_step.status,
                                to: new_step.status,
                            });
                        }
                    }
                }

                StepDiff::carry_over_unchanged_fields(&old_plan, &mut new_plan);
                let now = Utc::now();
                let diff = StepDiff::compute(&old_plan, &new_plan, now);
                new_plan.version = old_plan.version + 1;
                state.plan = new_plan.clone();

                drop(state);
                self.publish_state_update(diff, now).await;
                return Ok(());
            }
            Mutation::UpdateStepStatus {
                number,
                new_status,
                fields,
            } => {
                let now = Utc::now();
                let step: &mut Step = state
                    .plan
                    .find_mut(number)
                    .ok_or_else(|| RunnerError::InternalInvariantViolation(format!(
                        "UpdateStepStatus for unknown step {number}"
                    )))?;

                if new_status == StepStatus::InProgress {
                    let already_in_progress = state
                        .plan
                        .steps
                        .iter()
                        .any(|s| s.status == StepStatus::InProgress && s.number != number);
                    if already_in_progress {
                        return Err(RunnerError::InternalInvariantViolation(
                            "more than one step would be in_progress at once".to_string(),
                        ));
                    }
                }

                let from = step.status;
                step.transition_to(new_status, now)?;

                if let Some(reason) = fields.fail_reason {
                    step.fail_reason = Some(reason);
                }
                if let Some(verification) = fields.verification {
                    step.verification = Some(verification);
                }
                if let Some(output) = fields.output {
                    step.output = Some(output);
                }
                if fields.increment_retry_count {
                    step.retry_count += 1;
                }

                let diff = StepDiff {
                    changed_steps: vec![number],
                    new_steps: Vec::new(),
                    status_transitions: vec![StatusTransition {
                        step_number: number,
                        from,
                        to: new_status,
                        timestamp: now,
                    }],
                };

                drop(state);
                self.publish_state_update(diff, now).await;
                return Ok(());
            }
            Mutation::RecordSupervision(assessment) => {
                let supervision = state.supervision.record(assessment).clone();
                drop(state);
                self.bus
                    .publish(Event::new(
                        "supervision",
                        serde_json::to_value(&supervision).unwrap_or(json!({})),
                    ))
                    .await;
                return Ok(());
            }
            Mutation::RecordVerification(result) => {
                drop(state);
                self.bus
                    .publish(Event::new(
                        "verification",
                        serde_json::to_value(&result).unwrap_or(json!({})),
                    ))
                    .await;
                return Ok(());
            }
            Mutation::AppendError(message) => {
                state.errors.push(message.clone());
                drop(state);
                self.bus
                    .publish(Event::new("error", json!({ "error": message })))
                    .await;
                return Ok(());
            }
            Mutation::Reset {
                goal,
                sub_goals,
                initial_context,
            } => {
                state.run.status = RunStatus::Idle;
                state.run.goal = goal;
                state.run.sub_goals = sub_goals;
                state.run.initial_context = initial_context;
                state.run.started_at = Utc::now();
                state.plan = Plan::default();
                state.supervision = SupervisionTracker::new(self.supervision_threshold);
                state.attempts.clear();
                state.errors.clear();

                let snapshot = Snapshot {
                    run: state.run.clone(),
                    plan: state.plan.clone(),
                    supervision: state.supervision.state().clone(),
                    attempts: state.attempts.clone(),
                    errors: state.errors.clone(),
                };
                drop(state);
                self.bus
                    .publish(Event::new(
                        "reset",
                        serde_json::to_value(&snapshot).unwrap_or(json!({})),
                    ))
                    .await;
                return Ok(());
            }
        }

        Ok(())
    }

    pub async fn append_attempt(&self, attempt: Attempt) {
        let mut state = self.inner.write().await;
        state.attempts.push(attempt);
    }

    async fn publish_state_update(&self, diff: StepDiff, now: DateTime<Utc>) {
        let snapshot = self.snapshot().await;
        let data = json!({
            "snapshot": snapshot,
            "stepChanges": {
                "lastUpdated": now,
                "changedSteps": diff.changed_steps,
                "newSteps": diff.new_steps,
                "statusTransitions": diff.status_transitions,
            }
        });
        self.bus.publish(Event::new("stateUpdate", data)).await;
    }
}

pub type SharedStateHub = Arc<StateHub>;
