//! Plan and Step data model, status transitions, and diffing.
//!
//! A Plan is an acyclic graph of numbered Steps. The Planner replaces
//! the whole plan on every revision, but step identities survive across
//! versions by number, which is what makes `diff` meaningful to
//! animated consumers on the Event Bus.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RunnerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// Step lifecycle status. Edges not in [`is_allowed_transition`] are
/// rejected with `IllegalStepTransition`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

/// Returns whether a direct transition `from -> to` is one of the
/// edges in the design's transition table:
///
/// ```text
/// pending ──► in_progress ──► completed
///                           ╰─► failed
///                           ╰─► blocked
/// pending  ──► blocked
/// blocked  ──► pending
/// failed   ──► in_progress
/// ```
pub fn is_allowed_transition(from: StepStatus, to: StepStatus) -> bool {
    use StepStatus::*;
    matches!(
        (from, to),
        (Pending, InProgress)
            | (InProgress, Completed)
            | (InProgress, Failed)
            | (InProgress, Blocked)
            | (Pending, Blocked)
            | (Blocked, Pending)
            | (Failed, InProgress)
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubStep {
    pub description: String,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub number: u32,
    pub description: String,
    pub complexity: Complexity,
    #[serde(default)]
    pub dependencies: HashSet<u32>,
    #[serde(default)]
    pub sub_steps: Vec<SubStep>,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
}

impl Step {
    pub fn new(number: u32, description: impl Into<String>, complexity: Complexity) -> Self {
        Self {
            number,
            description: description.into(),
            complexity,
            dependencies: HashSet::new(),
            sub_steps: Vec::new(),
            status: StepStatus::Pending,
            started_at: None,
            ended_at: None,
            duration_ms: None,
            fail_reason: None,
            verification: None,
            output: None,
            retry_count: 0,
        }
    }

    /// Applies a status transition, enforcing the table above plus the
    /// `startedAt`/`endedAt`/`durationMs` invariants from the data model.
    pub fn transition_to(&mut self, to: StepStatus, now: DateTime<Utc>) -> Result<(), RunnerError> {
        if !is_allowed_transition(self.status, to) {
            return Err(RunnerError::IllegalStepTransition {
                step: self.number,
                from: self.status,
                to,
            });
        }

        match to {
            StepStatus::InProgress => {
                self.started_at = Some(now);
                self.ended_at = None;
                self.duration_ms = None;
            }
            StepStatus::Completed | StepStatus::Failed | StepStatus::Blocked => {
                self.ended_at = Some(now);
                if let Some(started) = self.started_at {
                    self.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
                }
            }
            StepStatus::Pending => {}
        }

        self.status = to;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<Step>,
    pub version: u64,
}

impl Plan {
    /// Validates step-number uniqueness, dependency existence, and
    /// acyclicity (property P1). Does not mutate `self`.
    pub fn validate(&self) -> Result<(), RunnerError> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.number) {
                return Err(RunnerError::InternalInvariantViolation(format!(
                    "duplicate step number {}",
                    step.number
                )));
            }
        }

        let numbers: HashSet<u32> = self.steps.iter().map(|s| s.number).collect();
        for step in &self.steps {
            for dep in &step.dependencies {
                if !numbers.contains(dep) {
                    return Err(RunnerError::InternalInvariantViolation(format!(
                        "step {} depends on unknown step {}",
                        step.number, dep
                    )));
                }
            }
        }

        detect_cycle(&self.steps)
    }

    pub fn find(&self, number: u32) -> Option<&Step> {
        self.steps.iter().find(|s| s.number == number)
    }

    pub fn find_mut(&mut self, number: u32) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.number == number)
    }

    /// The lowest-numbered `pending` step whose dependencies are all
    /// `completed` — the deterministic tie-break the Attempt Engine
    /// dispatch loop uses (4.F step 3a).
    pub fn next_ready_step(&self) -> Option<u32> {
        let completed: HashSet<u32> = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.number)
            .collect();

        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .filter(|s| s.dependencies.iter().all(|d| completed.contains(d)))
            .map(|s| s.number)
            .min()
    }

    pub fn has_pending_work(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s.status, StepStatus::Pending | StepStatus::InProgress))
    }
}

/// White/gray/black DFS cycle detection over the dependency graph.
fn detect_cycle(steps: &[Step]) -> Result<(), RunnerError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let graph: HashMap<u32, &HashSet<u32>> =
        steps.iter().map(|s| (s.number, &s.dependencies)).collect();
    let mut color: HashMap<u32, Color> = steps.iter().map(|s| (s.number, Color::White)).collect();

    fn visit(
        node: u32,
        graph: &HashMap<u32, &HashSet<u32>>,
        color: &mut HashMap<u32, Color>,
    ) -> bool {
        color.insert(node, Color::Gray);
        if let Some(deps) = graph.get(&node) {
            for &dep in *deps {
                match color.get(&dep) {
                    Some(Color::Gray) => return true,
                    Some(Color::White) => {
                        if visit(dep, graph, color) {
                            return true;
                        }
                    }
                    _ => {}
                }
            }
        }
        color.insert(node, Color::Black);
        false
    }

    for step in steps {
        if color.get(&step.number) == Some(&Color::White) && visit(step.number, &graph, &mut color)
        {
            return Err(RunnerError::InternalInvariantViolation(format!(
                "dependency cycle involving step {}",
                step.number
            )));
        }
    }

    Ok(())
}

/// A single step's status change between two plan snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub step_number: u32,
    pub from: StepStatus,
    pub to: StepStatus,
    pub timestamp: DateTime<Utc>,
}

/// Structural difference between two consecutive Plan snapshots
/// (property P4: exactly the steps whose status differs, with correct
/// `from`/`to`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepDiff {
    pub changed_steps: Vec<u32>,
    pub new_steps: Vec<u32>,
    pub status_transitions: Vec<StatusTransition>,
}

impl StepDiff {
    pub fn compute(old: &Plan, new: &Plan, now: DateTime<Utc>) -> Self {
        let old_by_number: HashMap<u32, &Step> =
            old.steps.iter().map(|s| (s.number, s)).collect();

        let mut changed = HashSet::new();
        let mut new_steps = HashSet::new();
        let mut transitions = Vec::new();

        for step in &new.steps {
            match old_by_number.get(&step.number) {
                None => {
                    new_steps.insert(step.number);
                }
                Some(old_step) => {
                    if old_step.status != step.status {
                        changed.insert(step.number);
                        transitions.push(StatusTransition {
                            step_number: step.number,
                            from: old_step.status,
                            to: step.status,
                            timestamp: now,
                        });
                    }
                }
            }
        }

        let mut changed_steps: Vec<u32> = changed.into_iter().collect();
        changed_steps.sort_unstable();
        let mut new_steps: Vec<u32> = new_steps.into_iter().collect();
        new_steps.sort_unstable();
        transitions.sort_by_key(|t| t.step_number);

        Self {
            changed_steps,
            new_steps,
            status_transitions: transitions,
        }
    }

    /// Carries over `duration_ms`/`retry_count` for steps that
    /// re-appear unchanged across a replan, per the Plan Model
    /// invariant that those fields survive a wholesale plan swap.
    pub fn carry_over_unchanged_fields(old: &Plan, new: &mut Plan) {
        let old_by_number: HashMap<u32, &Step> =
            old.steps.iter().map(|s| (s.number, s)).collect();
        for step in &mut new.steps {
            if let Some(old_step) = old_by_number.get(&step.number) {
                if old_step.status == step.status {
                    step.duration_ms = old_step.duration_ms;
                    step.retry_count = old_step.retry_count;
                    step.started_at = old_step.started_at;
                    step.ended_at = old_step.ended_at;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(number: u32, deps: &[u32]) -> Step {
        let mut s = Step::new(number, format!("step {number}"), Complexity::Low);
        s.dependencies = deps.iter().copied().collect();
        s
    }

    #[test]
    fn allowed_transitions_match_the_table() {
        use StepStatus::*;
        assert!(is_allowed_transition(Pending, InProgress));
        assert!(is_allowed_transition(InProgress, Completed));
        assert!(is_allowed_transition(InProgress, Failed));
        assert!(is_allowed_transition(InProgress, Blocked));
        assert!(is_allowed_transition(Pending, Blocked));
        assert!(is_allowed_transition(Blocked, Pending));
        assert!(is_allowed_transition(Failed, InProgress));
        assert!(!is_allowed_transition(Pending, Completed));
        assert!(!is_allowed_transition(Completed, InProgress));
    }

    #[test]
    fn transition_sets_timestamps_and_duration() {
        let mut s = Step::new(1, "do thing", Complexity::Low);
        let t0 = Utc::now();
        s.transition_to(StepStatus::InProgress, t0).unwrap();
        assert_eq!(s.started_at, Some(t0));

        let t1 = t0 + chrono::Duration::milliseconds(500);
        s.transition_to(StepStatus::Completed, t1).unwrap();
        assert_eq!(s.ended_at, Some(t1));
        assert_eq!(s.duration_ms, Some(500));
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut s = Step::new(1, "do thing", Complexity::Low);
        let err = s.transition_to(StepStatus::Completed, Utc::now()).unwrap_err();
        assert!(matches!(err, RunnerError::IllegalStepTransition { .. }));
        assert_eq!(s.status, StepStatus::Pending);
    }

    #[test]
    fn plan_rejects_cycles() {
        let plan = Plan {
            steps: vec![step(1, &[2]), step(2, &[1])],
            version: 1,
        };
        assert!(plan.validate().is_err());
    }

    #[test]
    fn plan_rejects_unknown_dependency() {
        let plan = Plan {
            steps: vec![step(1, &[99])],
            version: 1,
        };
        assert!(plan.validate().is_err());
    }

    #[test]
    fn plan_accepts_acyclic_dag() {
        let plan = Plan {
            steps: vec![step(1, &[]), step(2, &[1]), step(3, &[1, 2])],
            version: 1,
        };
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn next_ready_step_picks_lowest_number_with_satisfied_deps() {
        let mut plan = Plan {
            steps: vec![step(1, &[]), step(2, &[]), step(3, &[1])],
            version: 1,
        };
        assert_eq!(plan.next_ready_step(), Some(1));

        plan.find_mut(1).unwrap().status = StepStatus::Completed;
        assert_eq!(plan.next_ready_step(), Some(2));
    }

    #[test]
    fn diff_reports_only_changed_steps_with_correct_from_to() {
        let old = Plan {
            steps: vec![step(1, &[]), step(2, &[])],
            version: 1,
        };
        let mut new = old.clone();
        new.find_mut(1).unwrap().status = StepStatus::InProgress;
        new.steps.push(step(3, &[]));

        let diff = StepDiff::compute(&old, &new, Utc::now());
        assert_eq!(diff.changed_steps, vec![1]);
        assert_eq!(diff.new_steps, vec![3]);
        assert_eq!(diff.status_transitions.len(), 1);
        assert_eq!(diff.status_transitions[0].from, StepStatus::Pending);
        assert_eq!(diff.status_transitions[0].to, StepStatus::InProgress);
    }

    #[test]
    fn carry_over_preserves_duration_and_retry_count_for_unchanged_steps() {
        let mut old = Plan {
            steps: vec![step(1, &[])],
            version: 1,
        };
        old.steps[0].duration_ms = Some(1234);
        old.steps[0].retry_count = 2;

        let mut new = Plan {
            steps: vec![step(1, &[])],
            version: 2,
        };
        StepDiff::carry_over_unchanged_fields(&old, &mut new);

        assert_eq!(new.steps[0].duration_ms, Some(1234));
        assert_eq!(new.steps[0].retry_count, 2);
    }
}
