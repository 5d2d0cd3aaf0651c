// SPDX-License-Identifier: MIT
//! Typed lifecycle events multicast on the progress bus.
//!
//! The wire shape is `{type, taskId?, stepId?, payload, timestamp}`. The
//! event set is closed — adapters never invent ad-hoc types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of event types carried by the progress bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ContextAnalyzed,
    PlanCreated,
    TaskStarted,
    StepStarted,
    StepProgress,
    StepSucceeded,
    StepFailed,
    StepSkipped,
    StepCancelled,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    ConfigUpdated,
    DeliverablesSubmitted,
    RateLimitedRetry,
    Heartbeat,
    /// Final event before the bus closes.
    Shutdown,
}

impl EventType {
    /// Wire name, e.g. `"step_succeeded"`.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::ContextAnalyzed => "context_analyzed",
            EventType::PlanCreated => "plan_created",
            EventType::TaskStarted => "task_started",
            EventType::StepStarted => "step_started",
            EventType::StepProgress => "step_progress",
            EventType::StepSucceeded => "step_succeeded",
            EventType::StepFailed => "step_failed",
            EventType::StepSkipped => "step_skipped",
            EventType::StepCancelled => "step_cancelled",
            EventType::TaskCompleted => "task_completed",
            EventType::TaskFailed => "task_failed",
            EventType::TaskCancelled => "task_cancelled",
            EventType::ConfigUpdated => "config_updated",
            EventType::DeliverablesSubmitted => "deliverables_submitted",
            EventType::RateLimitedRetry => "rate_limited_retry",
            EventType::Heartbeat => "heartbeat",
            EventType::Shutdown => "shutdown",
        }
    }

    /// Progress-class events may be dropped for a subscriber over its
    /// high-water mark; everything else is delivered or recorded as missed.
    pub fn is_droppable(self) -> bool {
        matches!(self, EventType::StepProgress)
    }

    /// Task-terminal events — the bus blocks briefly rather than drop these.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventType::TaskCompleted
                | EventType::TaskFailed
                | EventType::TaskCancelled
                | EventType::Shutdown
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single lifecycle event as it travels on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(rename = "taskId", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(rename = "stepId", skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Set when a step-terminal failure aborts the whole plan; promotes the
    /// event to must-not-drop delivery. Not serialized.
    #[serde(skip)]
    pub aborts_plan: bool,
}

impl Event {
    /// Event with no task association (heartbeat, config_updated, shutdown).
    pub fn bare(event_type: EventType, payload: Value) -> Self {
        Self {
            event_type,
            task_id: None,
            step_id: None,
            payload,
            timestamp: Utc::now(),
            aborts_plan: false,
        }
    }

    /// Task-scoped event.
    pub fn task(event_type: EventType, task_id: impl Into<String>, payload: Value) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..Self::bare(event_type, payload)
        }
    }

    /// Step-scoped event.
    pub fn step(
        event_type: EventType,
        task_id: impl Into<String>,
        step_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            step_id: Some(step_id.into()),
            ..Self::task(event_type, task_id, payload)
        }
    }

    /// Mark a `step_failed` as plan-aborting (delivery becomes guaranteed).
    pub fn aborting(mut self) -> Self {
        self.aborts_plan = true;
        self
    }

    /// Whether the bus may drop this event for a lagging subscriber.
    pub fn is_droppable(&self) -> bool {
        self.event_type.is_droppable() && !self.aborts_plan
    }

    /// Whether the bus must block briefly rather than skip delivery.
    pub fn must_not_drop(&self) -> bool {
        self.event_type.is_terminal() || self.aborts_plan
    }
}
