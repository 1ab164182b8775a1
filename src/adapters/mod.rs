//! External capability interfaces: Worker, Planner, Verifier, Supervisor.
//!
//! These are the only points where the control plane talks to the
//! outside world. Each trait takes plain data and returns plain data —
//! no callbacks, no leaking of the underlying transport (subprocess,
//! HTTP, in-process) into the core. A bundled demo implementation of
//! each is provided for local smoke testing, the same way the teacher
//! ships a `WaitExecutor` alongside its real HTTP executor.

use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::plan::{Complexity, Plan, Step};
use crate::state_hub::VerificationResult;
use crate::supervision::Assessment;

/// Carries the session identity and an optional deadline an adapter
/// should honor internally; the control plane never forcibly cancels
/// an in-flight adapter call (see the concurrency model).
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub session_id: String,
    pub deadline: Option<Instant>,
}

impl RequestContext {
    pub fn is_past_deadline(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcomeStatus {
    Completed,
    Failed,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepOutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<String>,
}

pub struct StepExecutionRequest<'a> {
    pub goal: &'a str,
    pub plan: &'a Plan,
    pub step_number: u32,
    pub accumulated_context: &'a str,
    pub working_directory: Option<&'a PathBuf>,
}

#[async_trait]
pub trait WorkerAdapter: Send + Sync {
    async fn execute_step(
        &self,
        ctx: &RequestContext,
        request: StepExecutionRequest<'_>,
    ) -> anyhow::Result<StepResult>;
}

pub struct PlanRequest<'a> {
    pub goal: &'a str,
    pub sub_goals: &'a [String],
    pub context: &'a str,
    pub prior_plan: Option<&'a Plan>,
}

#[async_trait]
pub trait PlannerAdapter: Send + Sync {
    async fn plan(&self, ctx: &RequestContext, request: PlanRequest<'_>) -> anyhow::Result<Plan>;
}

pub struct VerifyRequest<'a> {
    pub goal: &'a str,
    pub plan: &'a Plan,
    pub completed_steps: &'a [Step],
}

#[async_trait]
pub trait VerifierAdapter: Send + Sync {
    async fn verify(
        &self,
        ctx: &RequestContext,
        request: VerifyRequest<'_>,
    ) -> anyhow::Result<VerificationResult>;
}

pub struct AssessRequest<'a> {
    pub plan: &'a Plan,
    pub last_step_result: Option<&'a StepResult>,
    pub history: &'a [Assessment],
}

#[async_trait]
pub trait SupervisorAdapter: Send + Sync {
    async fn assess(
        &self,
        ctx: &RequestContext,
        request: AssessRequest<'_>,
    ) -> anyhow::Result<Assessment>;
}

/// Bundled demo adapters: canned, deterministic, no external process.
/// Wired in by the `run`/`serve` CLI subcommands for local smoke
/// testing when no real adapter set is configured.
pub mod demo {
    use super::*;
    use crate::state_hub::Confidence;
    use crate::supervision::SupervisorAction;

    pub struct DemoWorker;

    #[async_trait]
    impl WorkerAdapter for DemoWorker {
        async fn execute_step(
            &self,
            _ctx: &RequestContext,
            request: StepExecutionRequest<'_>,
        ) -> anyhow::Result<StepResult> {
            Ok(StepResult {
                status: StepOutcomeStatus::Completed,
                output: Some(format!("demo worker completed step {}", request.step_number)),
                fail_reason: None,
                verification: Some("looks fine".to_string()),
            })
        }
    }

    pub struct DemoPlanner;

    #[async_trait]
    impl PlannerAdapter for DemoPlanner {
        async fn plan(&self, _ctx: &RequestContext, request: PlanRequest<'_>) -> anyhow::Result<Plan> {
            if let Some(prior) = request.prior_plan {
                return Ok(prior.clone());
            }
            Ok(Plan {
                steps: vec![
                    Step::new(1, format!("Understand the goal: {}", request.goal), Complexity::Low),
                    Step::new(2, "Produce a result", Complexity::Medium),
                ],
                version: 0,
            })
        }
    }

    pub struct DemoVerifier;

    #[async_trait]
    impl VerifierAdapter for DemoVerifier {
        async fn verify(
            &self,
            _ctx: &RequestContext,
            request: VerifyRequest<'_>,
        ) -> anyhow::Result<VerificationResult> {
            let all_done = request.completed_steps.len() == request.plan.steps.len();
            Ok(VerificationResult {
                passed: all_done,
                confidence: if all_done { Confidence::High } else { Confidence::Low },
                goal_achieved: all_done,
                gaps: if all_done { None } else { Some("not all steps completed".to_string()) },
                recommendation: None,
                smoke_tests_passed: Some(true),
            })
        }
    }

    pub struct DemoSupervisor;

    #[async_trait]
    impl SupervisorAdapter for DemoSupervisor {
        async fn assess(
            &self,
            _ctx: &RequestContext,
            _request: AssessRequest<'_>,
        ) -> anyhow::Result<Assessment> {
            Ok(Assessment {
                action: SupervisorAction::Continue,
                score: 90,
                reason: "on track".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::demo::*;
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext {
            session_id: "s1".to_string(),
            deadline: None,
        }
    }

    #[tokio::test]
    async fn demo_planner_produces_two_steps_with_no_prior_plan() {
        let planner = DemoPlanner;
        let plan = planner
            .plan(
                &ctx(),
                PlanRequest {
                    goal: "ship feature",
                    sub_goals: &[],
                    context: "",
                    prior_plan: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(plan.steps.len(), 2);
    }

    #[tokio::test]
    async fn demo_worker_completes_any_step() {
        let worker = DemoWorker;
        let plan = Plan::default();
        let result = worker
            .execute_step(
                &ctx(),
                StepExecutionRequest {
                    goal: "goal",
                    plan: &plan,
                    step_number: 1,
                    accumulated_context: "",
                    working_directory: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(result.status, StepOutcomeStatus::Completed);
    }

    #[tokio::test]
    async fn demo_verifier_passes_only_when_all_steps_completed() {
        let verifier = DemoVerifier;
        let plan = Plan {
            steps: vec![Step::new(1, "a", Complexity::Low), Step::new(2, "b", Complexity::Low)],
            version: 0,
        };
        let none_done = verifier
            .verify(
                &ctx(),
                VerifyRequest {
                    goal: "g",
                    plan: &plan,
                    completed_steps: &[],
                },
            )
            .await
            .unwrap();
        assert!(!none_done.passed);

        let all_done = verifier
            .verify(
                &ctx(),
                VerifyRequest {
                    goal: "g",
                    plan: &plan,
                    completed_steps: &plan.steps,
                },
            )
            .await
            .unwrap();
        assert!(all_done.passed);
        assert!(all_done.goal_achieved);
    }
}
