// SPDX-License-Identifier: MIT
//! Execution plans — the dependency DAG of steps driven by the engine.
//!
//! A plan is a `Vec<Step>` plus an index by step id; dependencies are
//! plan-local id references, validated at construction (unique ids, no
//! dangling references, no cycles, parsable guards). Construction errors
//! surface as `Invalid` — a plan that enters the engine is structurally
//! sound.

pub mod guard;
pub mod template;

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ErrorKind, SwarmError};
use guard::Guard;

// ─── Policy ───────────────────────────────────────────────────────────────────

/// What the engine does when a step exhausts its attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    /// Re-enqueue with backoff until `max_attempts`, then fail the step.
    #[default]
    Retry,
    /// Mark the step skipped and keep the plan going.
    Skip,
    /// Fail the whole plan and cancel everything non-terminal.
    Abort,
}

// ─── Status ───────────────────────────────────────────────────────────────────

/// Step lifecycle state. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled
        )
    }
}

/// Valid step status transitions.
pub fn valid_transition(from: StepStatus, to: StepStatus) -> bool {
    use StepStatus::*;
    matches!(
        (from, to),
        (Pending, Ready)
            | (Pending, Skipped)
            | (Pending, Cancelled)
            | (Ready, Running)
            | (Ready, Cancelled)
            | (Running, Succeeded)
            | (Running, Failed)
            | (Running, Skipped)
            | (Running, Cancelled)
            | (Running, Ready) // retry re-enqueue
    )
}

// ─── Step ─────────────────────────────────────────────────────────────────────

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    250
}
fn default_timeout_ms() -> u64 {
    60_000
}

/// One schedulable unit: a single agent capability invocation with policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Unique within the plan.
    pub step_id: String,
    #[serde(default)]
    pub name: String,
    pub agent_id: String,
    pub capability: String,

    // Scheduling
    #[serde(default)]
    pub priority: i32,
    /// Steps sharing a group may run concurrently; ungrouped steps
    /// serialize with each other.
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,

    // Execution policy
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub on_failure: OnFailure,

    // Condition guards (validated at construction)
    #[serde(default)]
    pub run_if: Option<String>,
    #[serde(default)]
    pub skip_if: Option<String>,

    /// Template value; `{{key}}` placeholders render against the plan
    /// context at dispatch time.
    #[serde(default)]
    pub input: Value,

    // Runtime state
    #[serde(default = "default_status")]
    pub status: StepStatus,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

fn default_status() -> StepStatus {
    StepStatus::Pending
}

impl Step {
    /// Minimal step with default policy; used by tests and the planner.
    pub fn new(step_id: impl Into<String>, agent_id: impl Into<String>, capability: impl Into<String>) -> Self {
        let step_id = step_id.into();
        Self {
            name: step_id.clone(),
            step_id,
            agent_id: agent_id.into(),
            capability: capability.into(),
            priority: 0,
            parallel_group: None,
            dependencies: Vec::new(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            timeout_ms: default_timeout_ms(),
            on_failure: OnFailure::default(),
            run_if: None,
            skip_if: None,
            input: Value::Null,
            status: StepStatus::Pending,
            attempt: 0,
            result: None,
            error_kind: None,
            error_message: None,
            enqueued_at: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Apply a transition, enforcing the state machine and terminal
    /// immutability. A violation is an engine bug, surfaced as `Invalid`.
    pub fn transition(&mut self, to: StepStatus) -> Result<(), SwarmError> {
        if self.status == to {
            return Ok(());
        }
        if !valid_transition(self.status, to) {
            return Err(SwarmError::invalid(format!(
                "step {}: illegal transition {:?} -> {:?}",
                self.step_id, self.status, to
            )));
        }
        self.status = to;
        match to {
            StepStatus::Ready => self.enqueued_at = Some(Utc::now()),
            StepStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    /// Key under which this step's result lands in the plan context.
    pub fn result_key(&self) -> String {
        format!("{}_result", self.step_id)
    }
}

// ─── Plan ─────────────────────────────────────────────────────────────────────

/// A validated dependency DAG of steps plus the shared context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub plan_id: String,
    pub steps: Vec<Step>,
    /// Shared key/value state; written only by the engine on step success.
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl ExecutionPlan {
    /// Construct and validate. Dangling or duplicate ids, cycles, bad
    /// guards, and zero `max_attempts` are all `Invalid`.
    pub fn new(
        plan_id: impl Into<String>,
        steps: Vec<Step>,
        context: Map<String, Value>,
    ) -> Result<Self, SwarmError> {
        let plan = Self {
            plan_id: plan_id.into(),
            steps,
            context,
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Parse a client-submitted plan document, minting a plan id when the
    /// caller did not provide one.
    pub fn from_value(doc: Value) -> Result<Self, SwarmError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct PlanDoc {
            #[serde(default)]
            plan_id: Option<String>,
            steps: Vec<Step>,
            #[serde(default)]
            context: Map<String, Value>,
        }
        let doc: PlanDoc = serde_json::from_value(doc)
            .map_err(|e| SwarmError::invalid(format!("malformed plan: {e}")))?;
        let plan_id = doc
            .plan_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self::new(plan_id, doc.steps, doc.context)
    }

    pub fn index_of(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.step_id == step_id)
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// All validation the engine relies on downstream.
    fn validate(&self) -> Result<(), SwarmError> {
        if self.steps.is_empty() {
            return Err(SwarmError::invalid(format!(
                "plan {} has no steps",
                self.plan_id
            )));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if step.step_id.is_empty() {
                return Err(SwarmError::invalid("step with empty step_id"));
            }
            if !ids.insert(step.step_id.as_str()) {
                return Err(SwarmError::invalid(format!(
                    "duplicate step id {:?}",
                    step.step_id
                )));
            }
            if step.agent_id.is_empty() || step.capability.is_empty() {
                return Err(SwarmError::invalid(format!(
                    "step {:?} must name an agent and capability",
                    step.step_id
                )));
            }
            if step.max_attempts < 1 {
                return Err(SwarmError::invalid(format!(
                    "step {:?}: max_attempts must be at least 1",
                    step.step_id
                )));
            }
            if let Some(expr) = &step.run_if {
                Guard::parse(expr)?;
            }
            if let Some(expr) = &step.skip_if {
                Guard::parse(expr)?;
            }
        }

        // Dangling dependency references.
        for step in &self.steps {
            for dep in &step.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(SwarmError::invalid(format!(
                        "step {:?} depends on unknown step {:?}",
                        step.step_id, dep
                    )));
                }
                if dep == &step.step_id {
                    return Err(SwarmError::invalid(format!(
                        "step {:?} depends on itself",
                        step.step_id
                    )));
                }
            }
        }

        // Cycle detection — Kahn's algorithm over index references.
        let index: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.step_id.as_str(), i))
            .collect();
        let mut indegree = vec![0usize; self.steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for (i, step) in self.steps.iter().enumerate() {
            for dep in &step.dependencies {
                let d = index[dep.as_str()];
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }
        let mut queue: VecDeque<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut visited = 0usize;
        while let Some(i) = queue.pop_front() {
            visited += 1;
            for &dep in &dependents[i] {
                indegree[dep] -= 1;
                if indegree[dep] == 0 {
                    queue.push_back(dep);
                }
            }
        }
        if visited != self.steps.len() {
            return Err(SwarmError::invalid(format!(
                "plan {} contains a dependency cycle",
                self.plan_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: &str, deps: &[&str]) -> Step {
        let mut s = Step::new(id, "echo", "chat");
        s.dependencies = deps.iter().map(|d| d.to_string()).collect();
        s
    }

    #[test]
    fn accepts_a_linear_chain() {
        let plan = ExecutionPlan::new(
            "p1",
            vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])],
            Map::new(),
        );
        assert!(plan.is_ok());
    }

    #[test]
    fn rejects_cycles() {
        let err = ExecutionPlan::new(
            "p1",
            vec![step("a", &["c"]), step("b", &["a"]), step("c", &["b"])],
            Map::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Invalid);
        assert!(err.message.contains("cycle"));
    }

    #[test]
    fn rejects_dangling_and_duplicate_ids() {
        let err =
            ExecutionPlan::new("p1", vec![step("a", &["ghost"])], Map::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Invalid);

        let err = ExecutionPlan::new("p1", vec![step("a", &[]), step("a", &[])], Map::new())
            .unwrap_err();
        assert!(err.message.contains("duplicate"));
    }

    #[test]
    fn rejects_bad_guard_at_construction() {
        let mut s = step("a", &[]);
        s.run_if = Some("system('rm -rf /')".to_string());
        let err = ExecutionPlan::new("p1", vec![s], Map::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Invalid);
    }

    #[test]
    fn rejects_zero_attempts() {
        let mut s = step("a", &[]);
        s.max_attempts = 0;
        let err = ExecutionPlan::new("p1", vec![s], Map::new()).unwrap_err();
        assert!(err.message.contains("max_attempts"));
    }

    #[test]
    fn transition_guardrails() {
        let mut s = step("a", &[]);
        s.transition(StepStatus::Ready).unwrap();
        s.transition(StepStatus::Running).unwrap();
        s.transition(StepStatus::Succeeded).unwrap();
        // Terminal is forever.
        assert!(s.transition(StepStatus::Running).is_err());
        assert!(s.finished_at.is_some());
    }

    #[test]
    fn retry_reenqueue_is_legal() {
        let mut s = step("a", &[]);
        s.transition(StepStatus::Ready).unwrap();
        s.transition(StepStatus::Running).unwrap();
        s.transition(StepStatus::Ready).unwrap();
        assert_eq!(s.status, StepStatus::Ready);
    }

    #[test]
    fn from_value_mints_plan_id() {
        let plan = ExecutionPlan::from_value(json!({
            "steps": [{"stepId": "a", "agentId": "echo", "capability": "chat"}]
        }))
        .unwrap();
        assert!(!plan.plan_id.is_empty());
        assert_eq!(plan.steps[0].max_attempts, 3);
        assert_eq!(plan.steps[0].timeout_ms, 60_000);
        assert_eq!(plan.steps[0].on_failure, OnFailure::Retry);
    }
}
