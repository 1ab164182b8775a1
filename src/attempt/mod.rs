//! Inner loop: one planning→execution→verification pass.
//!
//! A fresh `AttemptEngine` is constructed per attempt by the Retry
//! Controller; it owns nothing across attempts except what the State
//! Hub persists (the Hub is shared, the engine itself is not).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::instrument;

use crate::adapters::{
    AssessRequest, PlanRequest, PlannerAdapter, RequestContext, StepExecutionRequest,
    StepOutcomeStatus, SupervisorAdapter, VerifierAdapter, VerifyRequest, WorkerAdapter,
};
use crate::errors::RunnerError;
use crate::event_bus::{Event, SharedEventBus};
use crate::plan::{Plan, Step, StepStatus};
use crate::state_hub::{Mutation, RunStatus, SharedStateHub, StepUpdateFields, VerificationResult};
use crate::supervision::{Assessment, SupervisionState, SupervisorAction};
use crate::time_budget::TimeBudget;

#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub attempt_number: u32,
    pub plan: Plan,
    pub verification: Option<VerificationResult>,
    pub supervision: SupervisionState,
    pub elapsed_ms: u64,
    pub iterations: u32,
    pub status: RunStatus,
    pub stop_requested: bool,
    pub time_exhausted: bool,
    pub error: Option<RunnerError>,
}

impl AttemptReport {
    pub fn goal_achieved(&self) -> bool {
        self.verification
            .as_ref()
            .map(|v| v.goal_achieved)
            .unwrap_or(false)
    }

    pub fn verification_passed(&self) -> bool {
        self.verification.as_ref().map(|v| v.passed).unwrap_or(false)
    }
}

pub struct AttemptConfig {
    pub primary_goal: String,
    pub sub_goals: Vec<String>,
    pub accumulated_context: String,
    pub time_limit: Duration,
    pub working_directory: Option<PathBuf>,
    pub replan_every_n_iterations: u32,
    pub session_id: String,
}

pub struct AttemptEngine {
    config: AttemptConfig,
    state_hub: SharedStateHub,
    bus: SharedEventBus,
    worker: Arc<dyn WorkerAdapter>,
    planner: Arc<dyn PlannerAdapter>,
    verifier: Arc<dyn VerifierAdapter>,
    supervisor: Arc<dyn SupervisorAdapter>,
    stop_flag: Arc<AtomicBool>,
}

impl AttemptEngine {
    pub fn new(
        config: AttemptConfig,
        state_hub: SharedStateHub,
        bus: SharedEventBus,
        worker: Arc<dyn WorkerAdapter>,
        planner: Arc<dyn PlannerAdapter>,
        verifier: Arc<dyn VerifierAdapter>,
        supervisor: Arc<dyn SupervisorAdapter>,
    ) -> Self {
        Self {
            config,
            state_hub,
            bus,
            worker,
            planner,
            verifier,
            supervisor,
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a handle the caller can use to request a cooperative stop.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop_flag.clone()
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    fn request_context(&self, budget: &TimeBudget) -> RequestContext {
        RequestContext {
            session_id: self.config.session_id.clone(),
            deadline: Some(std::time::Instant::now() + budget.remaining()),
        }
    }

    #[instrument(skip_all, fields(session_id = %self.config.session_id))]
    pub async fn run(&self, attempt_number: u32) -> AttemptReport {
        let budget = TimeBudget::new(self.config.time_limit);

        self.state_hub
            .apply(Mutation::SetStatus(RunStatus::Planning))
            .await
            .ok();

        let plan = match self
            .planner
            .plan(
                &self.request_context(&budget),
                PlanRequest {
                    goal: &self.config.primary_goal,
                    sub_goals: &self.config.sub_goals,
                    context: &self.config.accumulated_context,
                    prior_plan: None,
                },
            )
            .await
        {
            Ok(plan) => plan,
            Err(e) => {
                return self
                    .errored_report(attempt_number, &budget, RunnerError::PlannerError(e.to_string()))
                    .await;
            }
        };

        if let Err(e) = self.state_hub.apply(Mutation::ReplacePlan(plan)).await {
            return self.errored_report(attempt_number, &budget, e).await;
        }

        self.state_hub
            .apply(Mutation::SetStatus(RunStatus::Executing))
            .await
            .ok();

        let mut iterations: u32 = 0;
        let mut time_exhausted = false;
        let mut aborted = false;
        let mut abort_error: Option<RunnerError> = None;

        loop {
            if self.is_stopped() {
                break;
            }
            if budget.is_exhausted() {
                time_exhausted = true;
                break;
            }

            let current_plan = self.state_hub.current_plan().await;
            let Some(step_number) = current_plan.next_ready_step() else {
                break;
            };

            self.dispatch_step(&budget, &current_plan, step_number).await;

            iterations += 1;
            self.bus
                .publish(
                    Event::new(
                        "progress",
                        json!({ "iteration": iterations, "stepNumber": step_number }),
                    )
                    .with_iteration(iterations),
                )
                .await;

            if self.is_stopped() {
                break;
            }

            match self
                .supervisor
                .assess(
                    &self.request_context(&budget),
                    AssessRequest {
                        plan: &current_plan,
                        last_step_result: None,
                        history: &[],
                    },
                )
                .await
            {
                Ok(assessment) => {
                    let is_abort = assessment.action == SupervisorAction::Abort;
                    let reason = assessment.reason.clone();
                    self.state_hub
                        .apply(Mutation::RecordSupervision(assessment))
                        .await
                        .ok();
                    if is_abort {
                        self.state_hub
                            .apply(Mutation::SetStatus(RunStatus::Aborted))
                            .await
                            .ok();
                        aborted = true;
                        abort_error = Some(RunnerError::SupervisorAbort { reason });
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "supervisor adapter call failed, continuing without assessment");
                }
            }

            let replan_due = self.config.replan_every_n_iterations > 0
                && iterations % self.config.replan_every_n_iterations == 0;
            if replan_due {
                self.maybe_replan(&budget).await;
            }
        }

        if aborted {
            return self
                .final_report(attempt_number, &budget, iterations, false, None, None, abort_error)
                .await;
        }

        if self.is_stopped() {
            self.state_hub
                .apply(Mutation::SetStatus(RunStatus::Aborted))
                .await
                .ok();
            return self
                .final_report(attempt_number, &budget, iterations, true, None, None, None)
                .await;
        }

        self.state_hub
            .apply(Mutation::SetStatus(RunStatus::Verifying))
            .await
            .ok();

        let final_plan = self.state_hub.current_plan().await;
        let completed_steps: Vec<Step> = final_plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .cloned()
            .collect();

        let verification = match self
            .verifier
            .verify(
                &self.request_context(&budget),
                VerifyRequest {
                    goal: &self.config.primary_goal,
                    plan: &final_plan,
                    completed_steps: &completed_steps,
                },
            )
            .await
        {
            Ok(v) => v,
            Err(e) => {
                return self
                    .errored_report(attempt_number, &budget, RunnerError::VerifierError(e.to_string()))
                    .await;
            }
        };

        self.state_hub
            .apply(Mutation::RecordVerification(verification.clone()))
            .await
            .ok();

        let terminal_status = if verification.passed && verification.goal_achieved {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        self.state_hub
            .apply(Mutation::SetStatus(terminal_status))
            .await
            .ok();

        self.final_report(
            attempt_number,
            &budget,
            iterations,
            false,
            Some(verification),
            Some(terminal_status),
            None,
        )
        .await
    }

    async fn dispatch_step(&self, budget: &TimeBudget, plan: &Plan, step_number: u32) {
        self.state_hub
            .apply(Mutation::UpdateStepStatus {
                number: step_number,
                new_status: StepStatus::InProgress,
                fields: StepUpdateFields::default(),
            })
            .await
            .ok();

        let result = self
            .worker
            .execute_step(
                &self.request_context(budget),
                StepExecutionRequest {
                    goal: &self.config.primary_goal,
                    plan,
                    step_number,
                    accumulated_context: &self.config.accumulated_context,
                    working_directory: self.config.working_directory.as_ref(),
                },
            )
            .await;

        match result {
            Ok(step_result) => {
                let (new_status, fields) = match step_result.status {
                    StepOutcomeStatus::Completed => (
                        StepStatus::Completed,
                        StepUpdateFields {
                            verification: step_result.verification,
                            output: step_result.output,
                            ..Default::default()
                        },
                    ),
                    StepOutcomeStatus::Failed => (
                        StepStatus::Failed,
                        StepUpdateFields {
                            fail_reason: step_result
                                .fail_reason
                                .or_else(|| Some("worker reported failure".to_string())),
                            ..Default::default()
                        },
                    ),
                    StepOutcomeStatus::Blocked => (StepStatus::Blocked, StepUpdateFields::default()),
                };
                self.state_hub
                    .apply(Mutation::UpdateStepStatus {
                        number: step_number,
                        new_status,
                        fields,
                    })
                    .await
                    .ok();
            }
            Err(e) => {
                // Worker exceptions on a single step mark it failed and the
                // attempt continues — they are data, not control flow.
                let error = RunnerError::WorkerStepError {
                    step: step_number,
                    reason: e.to_string(),
                };
                self.state_hub
                    .apply(Mutation::UpdateStepStatus {
                        number: step_number,
                        new_status: StepStatus::Failed,
                        fields: StepUpdateFields {
                            fail_reason: Some(error.to_string()),
                            ..Default::default()
                        },
                    })
                    .await
                    .ok();
            }
        }
    }

    async fn maybe_replan(&self, budget: &TimeBudget) {
        let current_plan = self.state_hub.current_plan().await;
        match self
            .planner
            .plan(
                &self.request_context(budget),
                PlanRequest {
                    goal: &self.config.primary_goal,
                    sub_goals: &self.config.sub_goals,
                    context: &self.config.accumulated_context,
                    prior_plan: Some(&current_plan),
                },
            )
            .await
        {
            Ok(new_plan) => {
                self.state_hub.apply(Mutation::ReplacePlan(new_plan)).await.ok();
            }
            Err(e) => {
                tracing::debug!(error = %e, "replan attempt failed, keeping current plan");
            }
        }
    }

    async fn errored_report(
        &self,
        attempt_number: u32,
        budget: &TimeBudget,
        error: RunnerError,
    ) -> AttemptReport {
        self.state_hub
            .apply(Mutation::AppendError(error.to_string()))
            .await
            .ok();
        self.state_hub
            .apply(Mutation::SetStatus(RunStatus::Failed))
            .await
            .ok();
        let snapshot = self.state_hub.snapshot().await;
        AttemptReport {
            attempt_number,
            plan: snapshot.plan,
            verification: None,
            supervision: snapshot.supervision,
            elapsed_ms: budget.elapsed().as_millis() as u64,
            iterations: 0,
            status: RunStatus::Failed,
            stop_requested: false,
            time_exhausted: false,
            error: Some(error),
        }
    }

    async fn final_report(
        &self,
        attempt_number: u32,
        budget: &TimeBudget,
        iterations: u32,
        stop_requested: bool,
        verification: Option<VerificationResult>,
        terminal_status: Option<RunStatus>,
        error: Option<RunnerError>,
    ) -> AttemptReport {
        let snapshot = self.state_hub.snapshot().await;
        AttemptReport {
            attempt_number,
            plan: snapshot.plan,
            verification,
            supervision: snapshot.supervision,
            elapsed_ms: budget.elapsed().as_millis() as u64,
            iterations,
            status: terminal_status.unwrap_or(snapshot.run.status),
            stop_requested,
            time_exhausted: budget.is_exhausted(),
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::StepResult;
    use crate::event_bus::EventBus;
    use crate::plan::Complexity;
    use crate::state_hub::{Confidence, StateHub};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct ScriptedWorker {
        calls: AtomicU32,
    }

    #[async_trait]
    impl WorkerAdapter for ScriptedWorker {
        async fn execute_step(
            &self,
            _ctx: &RequestContext,
            _request: StepExecutionRequest<'_>,
        ) -> anyhow::Result<StepResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(StepResult {
                status: StepOutcomeStatus::Completed,
                output: Some("done".to_string()),
                fail_reason: None,
                verification: None,
            })
        }
    }

    struct TwoStepPlanner;

    #[async_trait]
    impl PlannerAdapter for TwoStepPlanner {
        async fn plan(&self, _ctx: &RequestContext, request: PlanRequest<'_>) -> anyhow::Result<Plan> {
            if let Some(prior) = request.prior_plan {
                return Ok(prior.clone());
            }
            Ok(Plan {
                steps: vec![
                    Step::new(1, "step one", Complexity::Low),
                    Step::new(2, "step two", Complexity::Low),
                ],
                version: 0,
            })
        }
    }

    struct AlwaysHighVerifier;

    #[async_trait]
    impl VerifierAdapter for AlwaysHighVerifier {
        async fn verify(
            &self,
            _ctx: &RequestContext,
            _request: VerifyRequest<'_>,
        ) -> anyhow::Result<VerificationResult> {
            Ok(VerificationResult {
                passed: true,
                confidence: Confidence::High,
                goal_achieved: true,
                gaps: None,
                recommendation: None,
                smoke_tests_passed: Some(true),
            })
        }
    }

    struct CalmSupervisor;

    #[async_trait]
    impl SupervisorAdapter for CalmSupervisor {
        async fn assess(
            &self,
            _ctx: &RequestContext,
            _request: AssessRequest<'_>,
        ) -> anyhow::Result<Assessment> {
            Ok(Assessment {
                action: SupervisorAction::Continue,
                score: 95,
                reason: "fine".to_string(),
            })
        }
    }

    struct AbortingSupervisor {
        calls: AtomicU32,
    }

    #[async_trait]
    impl SupervisorAdapter for AbortingSupervisor {
        async fn assess(
            &self,
            _ctx: &RequestContext,
            _request: AssessRequest<'_>,
        ) -> anyhow::Result<Assessment> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n >= 1 {
                Ok(Assessment {
                    action: SupervisorAction::Abort,
                    score: 0,
                    reason: "drift detected".to_string(),
                })
            } else {
                Ok(Assessment {
                    action: SupervisorAction::Continue,
                    score: 90,
                    reason: "fine".to_string(),
                })
            }
        }
    }

    fn make_engine(
        worker: Arc<dyn WorkerAdapter>,
        planner: Arc<dyn PlannerAdapter>,
        verifier: Arc<dyn VerifierAdapter>,
        supervisor: Arc<dyn SupervisorAdapter>,
    ) -> AttemptEngine {
        let bus = Arc::new(EventBus::new(1024, 256));
        let hub = Arc::new(StateHub::new(
            bus.clone(),
            "goal".to_string(),
            vec![],
            "ctx".to_string(),
            "session-1".to_string(),
            3,
        ));
        AttemptEngine::new(
            AttemptConfig {
                primary_goal: "goal".to_string(),
                sub_goals: vec![],
                accumulated_context: "ctx".to_string(),
                time_limit: Duration::from_secs(60),
                working_directory: None,
                replan_every_n_iterations: 1,
                session_id: "session-1".to_string(),
            },
            hub,
            bus,
            worker,
            planner,
            verifier,
            supervisor,
        )
    }

    #[tokio::test]
    async fn successful_attempt_completes_all_steps_and_reaches_high_confidence() {
        let worker = Arc::new(ScriptedWorker {
            calls: AtomicU32::new(0),
        });
        let engine = make_engine(
            worker.clone(),
            Arc::new(TwoStepPlanner),
            Arc::new(AlwaysHighVerifier),
            Arc::new(CalmSupervisor),
        );

        let report = engine.run(1).await;

        assert_eq!(worker.calls.load(Ordering::SeqCst), 2);
        assert!(report.goal_achieved());
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.iterations, 2);
    }

    #[tokio::test]
    async fn supervisor_abort_stops_the_loop_before_verification() {
        let worker = Arc::new(ScriptedWorker {
            calls: AtomicU32::new(0),
        });
        let engine = make_engine(
            worker.clone(),
            Arc::new(TwoStepPlanner),
            Arc::new(AlwaysHighVerifier),
            Arc::new(AbortingSupervisor {
                calls: AtomicU32::new(0),
            }),
        );

        let report = engine.run(1).await;

        assert_eq!(report.status, RunStatus::Aborted);
        assert!(report.verification.is_none());
        // Second step never dispatched because the loop broke after the
        // first step's assessment came back ABORT.
        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(report.error, Some(RunnerError::SupervisorAbort { .. })));
    }

    #[tokio::test]
    async fn time_exhaustion_ends_the_attempt_cleanly() {
        let worker = Arc::new(ScriptedWorker {
            calls: AtomicU32::new(0),
        });
        let bus = Arc::new(EventBus::new(1024, 256));
        let hub = Arc::new(StateHub::new(
            bus.clone(),
            "goal".to_string(),
            vec![],
            "ctx".to_string(),
            "session-1".to_string(),
            3,
        ));
        let engine = AttemptEngine::new(
            AttemptConfig {
                primary_goal: "goal".to_string(),
                sub_goals: vec![],
                accumulated_context: "ctx".to_string(),
                time_limit: Duration::from_millis(0),
                working_directory: None,
                replan_every_n_iterations: 1,
                session_id: "session-1".to_string(),
            },
            hub,
            bus,
            worker.clone(),
            Arc::new(TwoStepPlanner),
            Arc::new(AlwaysHighVerifier),
            Arc::new(CalmSupervisor),
        );

        let report = engine.run(1).await;
        assert!(report.time_exhausted);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_handle_halts_before_the_next_step_dispatch() {
        let worker = Arc::new(ScriptedWorker {
            calls: AtomicU32::new(0),
        });
        let engine = make_engine(
            worker.clone(),
            Arc::new(TwoStepPlanner),
            Arc::new(AlwaysHighVerifier),
            Arc::new(CalmSupervisor),
        );
        engine.stop();

        let report = engine.run(1).await;
        assert!(report.stop_requested);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 0);
    }
}
