//! Outer loop: attempt budgeting, failure-context accumulation, and
//! the stop decision across attempts.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::adapters::{PlannerAdapter, SupervisorAdapter, VerifierAdapter, WorkerAdapter};
use crate::attempt::{AttemptConfig, AttemptEngine, AttemptReport};
use crate::errors::RunnerError;
use crate::event_bus::{Event, SharedEventBus};
use crate::plan::StepStatus;
use crate::state_hub::{Confidence, RunStatus, SharedStateHub};
use crate::time_budget::format_duration;

/// A failed or blocked step's description paired with why it didn't
/// complete, for rendering into the next attempt's failure context.
#[derive(Debug, Clone, Serialize)]
pub struct FailedStepSummary {
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Up to 5 completed / 3 failed-or-blocked step descriptions per prior
/// attempt per SPEC_FULL.md 4.G's `buildFailureContext`.
const MAX_COMPLETED_STEPS_IN_CONTEXT: usize = 5;
const MAX_FAILED_STEPS_IN_CONTEXT: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct AttemptSummary {
    pub attempt_number: u32,
    pub duration_ms: u64,
    pub status: RunStatus,
    pub confidence: Confidence,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub completed_step_descriptions: Vec<String>,
    pub failed_step_summaries: Vec<FailedStepSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gaps: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

impl From<&AttemptReport> for AttemptSummary {
    fn from(report: &AttemptReport) -> Self {
        let completed_steps = report
            .plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        let failed_steps = report
            .plan
            .steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Failed | StepStatus::Blocked))
            .count();

        let completed_step_descriptions = report
            .plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .take(MAX_COMPLETED_STEPS_IN_CONTEXT)
            .map(|s| s.description.clone())
            .collect();

        let failed_step_summaries = report
            .plan
            .steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Failed | StepStatus::Blocked))
            .take(MAX_FAILED_STEPS_IN_CONTEXT)
            .map(|s| FailedStepSummary {
                description: s.description.clone(),
                reason: s.fail_reason.clone(),
            })
            .collect();

        Self {
            attempt_number: report.attempt_number,
            duration_ms: report.elapsed_ms,
            status: report.status,
            confidence: report
                .verification
                .as_ref()
                .map(|v| v.confidence)
                .unwrap_or(Confidence::Unknown),
            completed_steps,
            failed_steps,
            completed_step_descriptions,
            failed_step_summaries,
            gaps: report.verification.as_ref().and_then(|v| v.gaps.clone()),
            recommendation: report
                .verification
                .as_ref()
                .and_then(|v| v.recommendation.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryInfo {
    pub total_attempts: u32,
    pub attempt_history: Vec<AttemptSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalReport {
    pub last_report: Option<AttemptReportView>,
    pub retry_info: RetryInfo,
}

/// A serializable view of the last `AttemptReport`; `AttemptReport`
/// itself is not `Serialize` because it's an internal working type.
/// This mirrors its shape for the CLI's final JSON dump.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptReportView {
    pub attempt_number: u32,
    pub status: RunStatus,
    pub final_verification: Option<crate::state_hub::VerificationResult>,
    pub iterations: u32,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Not serialized (no stable JSON shape for the error enum is
    /// promised to CLI consumers); kept for `exit_code()`/
    /// `is_fatal_to_run()` to drive the CLI's exit code without a
    /// second, hand-rolled mapping.
    #[serde(skip)]
    pub error: Option<RunnerError>,
}

impl From<&AttemptReport> for AttemptReportView {
    fn from(report: &AttemptReport) -> Self {
        Self {
            attempt_number: report.attempt_number,
            status: report.status,
            final_verification: report.verification.clone(),
            iterations: report.iterations,
            elapsed_ms: report.elapsed_ms,
            error_message: report.error.as_ref().map(|e| e.to_string()),
            error: report.error.clone(),
        }
    }
}

pub struct RetryConfig {
    pub primary_goal: String,
    pub sub_goals: Vec<String>,
    pub initial_context: String,
    pub overall_time_limit: Duration,
    pub min_attempt_time: Duration,
    pub max_attempts: u32,
    pub working_directory: Option<PathBuf>,
    pub replan_every_n_iterations: u32,
    pub session_id: String,
}

/// Adapter set handed to every attempt the controller spawns.
pub struct AdapterSet {
    pub worker: Arc<dyn WorkerAdapter>,
    pub planner: Arc<dyn PlannerAdapter>,
    pub verifier: Arc<dyn VerifierAdapter>,
    pub supervisor: Arc<dyn SupervisorAdapter>,
}

pub struct RetryController {
    config: RetryConfig,
    adapters: AdapterSet,
    state_hub: SharedStateHub,
    bus: SharedEventBus,
    started_at: Instant,
    stop_flag: Arc<AtomicBool>,
}

impl RetryController {
    pub fn new(
        config: RetryConfig,
        adapters: AdapterSet,
        state_hub: SharedStateHub,
        bus: SharedEventBus,
    ) -> Self {
        Self {
            config,
            adapters,
            state_hub,
            bus,
            started_at: Instant::now(),
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop_flag.clone()
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// `factor = {1:0.5, 2:0.3, 3:0.5}[min(attempt,3)]`, attempts beyond
    /// 3 also get 0.5 — preserved as-is per the design notes, flagged
    /// there for review rather than "fixed" here.
    fn calculate_attempt_time_limit(&self, attempt: u32) -> Duration {
        let remaining = self.config.overall_time_limit.saturating_sub(self.elapsed());
        if remaining < self.config.min_attempt_time {
            return Duration::ZERO;
        }

        let factor = match attempt.min(3) {
            1 => 0.5,
            2 => 0.3,
            3 => 0.5,
            _ => 0.5,
        };

        let allotted = remaining.mul_f64(factor);
        allotted.max(self.config.min_attempt_time)
    }

    fn has_time_remaining(&self) -> bool {
        self.config.overall_time_limit.saturating_sub(self.elapsed()) >= self.config.min_attempt_time
    }

    fn should_retry(&self, report: Option<&AttemptReport>) -> bool {
        match report {
            None => self.has_time_remaining(),
            Some(report) => {
                if report.goal_achieved() {
                    return false;
                }
                if report.error.as_ref().is_some_and(RunnerError::is_fatal_to_run) {
                    return false;
                }
                if report.status == RunStatus::Aborted {
                    return false;
                }
                if report.verification_passed() {
                    return false;
                }
                self.has_time_remaining()
            }
        }
    }

    /// With no prior attempts, the next attempt's context is just the
    /// original initial context. Otherwise it's the original context
    /// plus a summary section per prior attempt plus a trailing
    /// task-framing block telling the next attempt to build on what
    /// completed and close the declared gaps.
    fn build_failure_context(&self, history: &[AttemptSummary]) -> String {
        if history.is_empty() {
            return self.config.initial_context.clone();
        }

        let mut text = self.config.initial_context.clone();
        text.push_str("\n\n--- Prior attempt history ---\n");

        for summary in history {
            text.push_str(&format!(
                "\nAttempt {}: status={:?}, confidence={:?}\n",
                summary.attempt_number, summary.status, summary.confidence
            ));
            for description in &summary.completed_step_descriptions {
                text.push_str(&format!("Completed: {description}\n"));
            }
            for failed in &summary.failed_step_summaries {
                match &failed.reason {
                    Some(reason) => text.push_str(&format!("Failed: {} ({reason})\n", failed.description)),
                    None => text.push_str(&format!("Failed: {}\n", failed.description)),
                }
            }
            if let Some(gaps) = &summary.gaps {
                text.push_str(&format!("Gaps: {gaps}\n"));
            }
            if let Some(recommendation) = &summary.recommendation {
                text.push_str(&format!("Recommendation: {recommendation}\n"));
            }
        }

        text.push_str(
            "\n--- Next attempt ---\nBuild on what was already completed above; \
             do not redo finished work. Prioritize closing the gaps listed above.\n",
        );
        text
    }

    pub async fn run(&self) -> FinalReport {
        let mut attempt_history: Vec<AttemptSummary> = Vec::new();
        let mut last_report: Option<AttemptReport> = None;
        let mut granted_total = Duration::ZERO;

        for attempt_number in 1..=self.config.max_attempts {
            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }

            let attempt_time_limit = self.calculate_attempt_time_limit(attempt_number);
            if attempt_time_limit.is_zero() {
                self.bus
                    .publish(Event::new(
                        "progress",
                        serde_json::json!({ "type": "time_exhausted", "attemptNumber": attempt_number }),
                    ))
                    .await;
                break;
            }
            granted_total += attempt_time_limit;

            let failure_context = self.build_failure_context(&attempt_history);

            let engine = AttemptEngine::new(
                AttemptConfig {
                    primary_goal: self.config.primary_goal.clone(),
                    sub_goals: self.config.sub_goals.clone(),
                    accumulated_context: failure_context,
                    time_limit: attempt_time_limit,
                    working_directory: self.config.working_directory.clone(),
                    replan_every_n_iterations: self.config.replan_every_n_iterations,
                    session_id: self.config.session_id.clone(),
                },
                self.state_hub.clone(),
                self.bus.clone(),
                self.adapters.worker.clone(),
                self.adapters.planner.clone(),
                self.adapters.verifier.clone(),
                self.adapters.supervisor.clone(),
            );

            tracing::info!(
                attempt_number,
                time_limit = %format_duration(attempt_time_limit.as_millis() as u64),
                "starting attempt"
            );

            let report = engine.run(attempt_number).await;
            let summary = AttemptSummary::from(&report);
            attempt_history.push(summary);

            let retry = self.should_retry(Some(&report));
            last_report = Some(report);

            if !retry {
                break;
            }
        }

        let _ = granted_total;

        FinalReport {
            last_report: last_report.as_ref().map(AttemptReportView::from),
            retry_info: RetryInfo {
                total_attempts: attempt_history.len() as u32,
                attempt_history,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{
        AssessRequest, PlanRequest, RequestContext, StepExecutionRequest, StepOutcomeStatus,
        StepResult, VerifyRequest,
    };
    use crate::event_bus::EventBus;
    use crate::plan::{Complexity, Plan, Step};
    use crate::state_hub::StateHub;
    use crate::supervision::{Assessment, SupervisorAction};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct OneStepWorker;

    #[async_trait]
    impl WorkerAdapter for OneStepWorker {
        async fn execute_step(
            &self,
            _ctx: &RequestContext,
            _request: StepExecutionRequest<'_>,
        ) -> anyhow::Result<StepResult> {
            Ok(StepResult {
                status: StepOutcomeStatus::Completed,
                output: None,
                fail_reason: None,
                verification: None,
            })
        }
    }

    struct OneStepPlanner;

    #[async_trait]
    impl PlannerAdapter for OneStepPlanner {
        async fn plan(&self, _ctx: &RequestContext, request: PlanRequest<'_>) -> anyhow::Result<Plan> {
            if let Some(prior) = request.prior_plan {
                return Ok(prior.clone());
            }
            Ok(Plan {
                steps: vec![Step::new(1, "only step", Complexity::Low)],
                version: 0,
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

    /// Verifier scripted to fail N times (MEDIUM, with a gap message)
    /// before returning HIGH + achieved.
    struct ScriptedVerifier {
        fail_times: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl VerifierAdapter for ScriptedVerifier {
        async fn verify(
            &self,
            _ctx: &RequestContext,
            _request: VerifyRequest<'_>,
        ) -> anyhow::Result<crate::state_hub::VerificationResult> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Ok(crate::state_hub::VerificationResult {
                    passed: false,
                    confidence: Confidence::Medium,
                    goal_achieved: false,
                    gaps: Some("missing test".to_string()),
                    recommendation: Some("add a test".to_string()),
                    smoke_tests_passed: Some(false),
                })
            } else {
                Ok(crate::state_hub::VerificationResult {
                    passed: true,
                    confidence: Confidence::High,
                    goal_achieved: true,
                    gaps: None,
                    recommendation: None,
                    smoke_tests_passed: Some(true),
                })
            }
        }
    }

    fn make_controller(
        verifier: Arc<dyn VerifierAdapter>,
        supervisor: Arc<dyn SupervisorAdapter>,
        max_attempts: u32,
        overall_time_limit: Duration,
    ) -> RetryController {
        let bus = Arc::new(EventBus::new(1024, 256));
        let hub = Arc::new(StateHub::new(
            bus.clone(),
            "goal".to_string(),
            vec![],
            "initial context".to_string(),
            "session-1".to_string(),
            3,
        ));
        RetryController::new(
            RetryConfig {
                primary_goal: "goal".to_string(),
                sub_goals: vec![],
                initial_context: "initial context".to_string(),
                overall_time_limit,
                min_attempt_time: Duration::from_millis(1),
                max_attempts,
                working_directory: None,
                replan_every_n_iterations: 1,
                session_id: "session-1".to_string(),
            },
            AdapterSet {
                worker: Arc::new(OneStepWorker),
                planner: Arc::new(OneStepPlanner),
                verifier,
                supervisor,
            },
            hub,
            bus,
        )
    }

    #[tokio::test]
    async fn first_attempt_high_stops_immediately() {
        let controller = make_controller(
            Arc::new(ScriptedVerifier {
                fail_times: 0,
                calls: AtomicU32::new(0),
            }),
            Arc::new(CalmSupervisor),
            3,
            Duration::from_secs(3600),
        );

        let report = controller.run().await;
        assert_eq!(report.retry_info.total_attempts, 1);
        assert_eq!(
            report.last_report.unwrap().final_verification.unwrap().confidence,
            Confidence::High
        );
    }

    #[tokio::test]
    async fn retries_on_medium_and_carries_gap_into_failure_context() {
        let controller = make_controller(
            Arc::new(ScriptedVerifier {
                fail_times: 1,
                calls: AtomicU32::new(0),
            }),
            Arc::new(CalmSupervisor),
            3,
            Duration::from_secs(3600),
        );

        let report = controller.run().await;
        assert_eq!(report.retry_info.total_attempts, 2);
        assert_eq!(report.retry_info.attempt_history[0].gaps.as_deref(), Some("missing test"));
        assert_eq!(
            report.last_report.unwrap().final_verification.unwrap().confidence,
            Confidence::High
        );
    }

    #[tokio::test]
    async fn never_exceeds_max_attempts_when_always_failing() {
        let controller = make_controller(
            Arc::new(ScriptedVerifier {
                fail_times: 100,
                calls: AtomicU32::new(0),
            }),
            Arc::new(CalmSupervisor),
            3,
            Duration::from_secs(3600),
        );

        let report = controller.run().await;
        assert_eq!(report.retry_info.total_attempts, 3);
    }

    #[tokio::test]
    async fn time_exhaustion_before_min_attempt_time_stops_the_loop() {
        let controller = make_controller(
            Arc::new(ScriptedVerifier {
                fail_times: 100,
                calls: AtomicU32::new(0),
            }),
            Arc::new(CalmSupervisor),
            5,
            Duration::from_millis(0),
        );

        let report = controller.run().await;
        assert_eq!(report.retry_info.total_attempts, 0);
    }

    #[test]
    fn progressive_time_allocation_follows_the_05_03_05_sequence() {
        let bus = Arc::new(EventBus::new(1024, 256));
        let hub = Arc::new(StateHub::new(
            bus.clone(),
            "goal".to_string(),
            vec![],
            "ctx".to_string(),
            "session-1".to_string(),
            3,
        ));
        let controller = RetryController::new(
            RetryConfig {
                primary_goal: "goal".to_string(),
                sub_goals: vec![],
                initial_context: "ctx".to_string(),
                overall_time_limit: Duration::from_secs(3600),
                min_attempt_time: Duration::from_secs(300),
                max_attempts: 3,
                working_directory: None,
                replan_every_n_iterations: 1,
                session_id: "session-1".to_string(),
            },
            AdapterSet {
                worker: Arc::new(OneStepWorker),
                planner: Arc::new(OneStepPlanner),
                verifier: Arc::new(ScriptedVerifier {
                    fail_times: 0,
                    calls: AtomicU32::new(0),
                }),
                supervisor: Arc::new(CalmSupervisor),
            },
            hub,
            bus,
        );

        // Zero elapsed: attempt 1 gets 0.5 * 3600s = 1800s = 30m.
        assert_eq!(controller.calculate_attempt_time_limit(1), Duration::from_secs(1800));
    }

    #[test]
    fn failure_context_lists_completed_and_failed_step_descriptions() {
        let controller = RetryController::new(
            RetryConfig {
                primary_goal: "goal".to_string(),
                sub_goals: vec![],
                initial_context: "the original context".to_string(),
                overall_time_limit: Duration::from_secs(3600),
                min_attempt_time: Duration::from_secs(300),
                max_attempts: 3,
                working_directory: None,
                replan_every_n_iterations: 1,
                session_id: "session-1".to_string(),
            },
            AdapterSet {
                worker: Arc::new(OneStepWorker),
                planner: Arc::new(OneStepPlanner),
                verifier: Arc::new(ScriptedVerifier {
                    fail_times: 0,
                    calls: AtomicU32::new(0),
                }),
                supervisor: Arc::new(CalmSupervisor),
            },
            Arc::new(StateHub::new(
                Arc::new(EventBus::new(1024, 256)),
                "goal".to_string(),
                vec![],
                "the original context".to_string(),
                "session-1".to_string(),
                3,
            )),
            Arc::new(EventBus::new(1024, 256)),
        );

        let history = vec![AttemptSummary {
            attempt_number: 1,
            duration_ms: 1000,
            status: RunStatus::Failed,
            confidence: Confidence::Medium,
            completed_steps: 1,
            failed_steps: 1,
            completed_step_descriptions: vec!["set up the project".to_string()],
            failed_step_summaries: vec![FailedStepSummary {
                description: "run the integration suite".to_string(),
                reason: Some("missing fixture".to_string()),
            }],
            gaps: Some("missing test".to_string()),
            recommendation: Some("add a test".to_string()),
        }];

        let context = controller.build_failure_context(&history);
        assert!(context.contains("the original context"));
        assert!(context.contains("Completed: set up the project"));
        assert!(context.contains("Failed: run the integration suite (missing fixture)"));
        assert!(context.contains("Gaps: missing test"));
    }
}
