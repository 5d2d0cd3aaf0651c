// SPDX-License-Identifier: MIT
//! Task orchestration — from request to terminal `TaskExecution`.
//!
//! The orchestrator resolves a request into a validated plan (directly or
//! through the planner pipeline), gates it on confidence and optional
//! approval, hands it to the execution engine, and owns the live task
//! table plus the bounded in-memory history ring of finished tasks.
//!
//! Rejections that happen before a task exists (`Invalid`,
//! `LowConfidence`) are synchronous: no task id is minted and no events
//! are emitted for them.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::SharedBus;
use crate::engine::{ParallelExecutionEngine, PlanStatus};
use crate::error::SwarmError;
use crate::events::{Event, EventType};
use crate::metrics::SharedMetrics;
use crate::plan::{ExecutionPlan, StepStatus};
use crate::planner::{build_plan, plan_confidence, Planner};
use crate::registry::{AgentFilter, SharedRegistry};

/// Wire path clients use to watch progress.
pub const STREAM_PATH: &str = "/stream";

// ─── Request / options ────────────────────────────────────────────────────────

fn default_min_confidence() -> f64 {
    0.5
}
fn default_max_agents() -> usize {
    5
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOptions {
    /// When false, execution waits for approval even without
    /// `require_approval`.
    #[serde(default = "default_true")]
    pub auto_deploy: bool,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Cap on agents considered during selection.
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,
    /// Overall task deadline; expiry cancels the plan and fails the task.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default)]
    pub approval_token: Option<String>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            auto_deploy: true,
            min_confidence: default_min_confidence(),
            max_agents: default_max_agents(),
            timeout_ms: None,
            require_approval: false,
            approval_token: None,
        }
    }
}

/// A task submission: a plan, or a description for the planner.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub plan: Option<Value>,
    #[serde(default)]
    pub context: Option<Map<String, Value>>,
    #[serde(default)]
    pub options: Option<TaskOptions>,
}

// ─── Task state ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Analyzing,
    Planning,
    Deploying,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Live (and, after completion, archived) view of one task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecution {
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: TaskStatus,
    pub plan: ExecutionPlan,
    /// Per-step result collection, keyed by step id.
    pub step_results: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SwarmError>,
}

/// Receipt returned by [`TaskOrchestrator::submit`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub task_id: String,
    pub stream_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    AlreadyTerminal,
}

// ─── Approval seam ────────────────────────────────────────────────────────────

/// Caller-supplied gate invoked while a task is suspended at `planning`.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn approve(&self, task: &TaskExecution, token: Option<&str>) -> bool;
}

/// Default gate: everything is approved.
pub struct AutoApprove;

#[async_trait]
impl ApprovalHandler for AutoApprove {
    async fn approve(&self, _task: &TaskExecution, _token: Option<&str>) -> bool {
        true
    }
}

// ─── Orchestrator ─────────────────────────────────────────────────────────────

struct TaskHandle {
    state: Arc<Mutex<TaskExecution>>,
    cancel: CancellationToken,
    done_rx: watch::Receiver<bool>,
}

/// Shared core; driver tasks hold their own `Arc` of this.
struct Inner {
    registry: SharedRegistry,
    planner: Arc<dyn Planner>,
    engine: Arc<ParallelExecutionEngine>,
    bus: SharedBus,
    metrics: SharedMetrics,
    approval: std::sync::RwLock<Arc<dyn ApprovalHandler>>,
    history_size: usize,
    tasks: RwLock<HashMap<String, TaskHandle>>,
    history: Mutex<VecDeque<TaskExecution>>,
    /// Flipped during drain: new submissions are refused.
    accepting: AtomicBool,
}

pub struct TaskOrchestrator {
    inner: Arc<Inner>,
}

impl TaskOrchestrator {
    pub fn new(
        registry: SharedRegistry,
        planner: Arc<dyn Planner>,
        engine: Arc<ParallelExecutionEngine>,
        bus: SharedBus,
        metrics: SharedMetrics,
        history_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                planner,
                engine,
                bus,
                metrics,
                approval: std::sync::RwLock::new(Arc::new(AutoApprove)),
                history_size: history_size.max(1),
                tasks: RwLock::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
                accepting: AtomicBool::new(true),
            }),
        }
    }

    /// Replace the approval gate (builder-style, at wiring time).
    pub fn with_approval(self, approval: Arc<dyn ApprovalHandler>) -> Self {
        *self.inner.approval.write().expect("approval lock") = approval;
        self
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Relaxed)
    }

    /// Accept a task and start driving it. Returns as soon as the task
    /// exists; progress flows over the bus.
    pub async fn submit(&self, request: TaskRequest) -> Result<SubmitReceipt, SwarmError> {
        if !self.is_accepting() {
            return Err(SwarmError::overloaded(
                "daemon is draining — not accepting tasks",
            ));
        }
        let inner = &self.inner;
        let options = request.options.clone().unwrap_or_default();
        let (plan, confidence, analysis) = inner.resolve_plan(&request, &options).await?;

        let task_id = uuid::Uuid::new_v4().to_string();
        let execution = TaskExecution {
            task_id: task_id.clone(),
            description: request.description.clone(),
            status: TaskStatus::Pending,
            plan,
            step_results: Map::new(),
            confidence,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        };

        let state = Arc::new(Mutex::new(execution));
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        {
            let mut tasks = inner.tasks.write().await;
            tasks.insert(
                task_id.clone(),
                TaskHandle {
                    state: state.clone(),
                    cancel: cancel.clone(),
                    done_rx,
                },
            );
        }
        inner.metrics.tasks_created.fetch_add(1, Ordering::Relaxed);
        info!(task_id = %task_id, nl = request.description.is_some(), "task accepted");

        // Planner-produced tasks announce their analysis and plan.
        if let Some(analysis) = analysis {
            inner
                .bus
                .publish(&Event::task(EventType::ContextAnalyzed, &task_id, analysis))
                .await;
            let (plan_id, step_count) = {
                let s = state.lock().await;
                (s.plan.plan_id.clone(), s.plan.steps.len())
            };
            inner
                .bus
                .publish(&Event::task(
                    EventType::PlanCreated,
                    &task_id,
                    json!({
                        "planId": plan_id,
                        "steps": step_count,
                        "confidence": confidence,
                    }),
                ))
                .await;
        }

        let driver = inner.clone();
        let driver_task_id = task_id.clone();
        tokio::spawn(async move {
            driver
                .drive(driver_task_id, state, options, cancel, done_tx)
                .await;
        });

        Ok(SubmitReceipt {
            task_id,
            stream_path: STREAM_PATH.to_string(),
        })
    }

    /// Cancel a task. Running steps observe the signal and wind down.
    pub async fn cancel(&self, task_id: &str) -> CancelOutcome {
        let tasks = self.inner.tasks.read().await;
        let Some(handle) = tasks.get(task_id) else {
            drop(tasks);
            // A terminal task still in history is AlreadyTerminal.
            let history = self.inner.history.lock().await;
            return if history.iter().any(|t| t.task_id == task_id) {
                CancelOutcome::AlreadyTerminal
            } else {
                CancelOutcome::NotFound
            };
        };
        handle.cancel.cancel();
        CancelOutcome::Cancelled
    }

    /// Snapshot of one task, live or archived.
    pub async fn get(&self, task_id: &str) -> Option<TaskExecution> {
        if let Some(handle) = self.inner.tasks.read().await.get(task_id) {
            return Some(handle.state.lock().await.clone());
        }
        self.inner
            .history
            .lock()
            .await
            .iter()
            .rev()
            .find(|t| t.task_id == task_id)
            .cloned()
    }

    pub async fn list_active(&self) -> Vec<TaskExecution> {
        let tasks = self.inner.tasks.read().await;
        let mut out = Vec::with_capacity(tasks.len());
        for handle in tasks.values() {
            out.push(handle.state.lock().await.clone());
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Most recent `n` terminal tasks, newest first.
    pub async fn history(&self, n: usize) -> Vec<TaskExecution> {
        self.inner
            .history
            .lock()
            .await
            .iter()
            .rev()
            .take(n)
            .cloned()
            .collect()
    }

    /// Block until the task reaches a terminal state; returns the
    /// archived snapshot.
    pub async fn wait(&self, task_id: &str) -> Option<TaskExecution> {
        let rx = {
            let tasks = self.inner.tasks.read().await;
            tasks.get(task_id).map(|h| h.done_rx.clone())
        };
        if let Some(mut rx) = rx {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
        self.get(task_id).await
    }

    /// Drain for shutdown: refuse new tasks, cancel the active ones, and
    /// wait for each to settle.
    pub async fn drain(&self) {
        self.inner.accepting.store(false, Ordering::Relaxed);
        let ids: Vec<String> = self.inner.tasks.read().await.keys().cloned().collect();
        for id in &ids {
            if let Some(handle) = self.inner.tasks.read().await.get(id) {
                handle.cancel.cancel();
            }
        }
        for id in &ids {
            let _ = self.wait(id).await;
        }
        info!(cancelled = ids.len(), "orchestrator drained");
    }
}

impl Inner {
    /// Resolve the request into a validated plan. Runs before any task
    /// exists so rejections leave no trace.
    async fn resolve_plan(
        &self,
        request: &TaskRequest,
        options: &TaskOptions,
    ) -> Result<(ExecutionPlan, Option<f64>, Option<Value>), SwarmError> {
        if let Some(doc) = &request.plan {
            let mut plan = ExecutionPlan::from_value(doc.clone())?;
            if let Some(extra) = &request.context {
                for (k, v) in extra {
                    plan.context.insert(k.clone(), v.clone());
                }
            }
            return Ok((plan, None, None));
        }

        let Some(description) = request.description.as_deref() else {
            return Err(SwarmError::invalid(
                "request must carry a plan or a description",
            ));
        };

        let requirements = self.planner.analyze(description).await?;
        let available = self
            .registry
            .list(&AgentFilter {
                enabled_only: true,
                ..Default::default()
            })
            .await;
        let mut recommendations = self.planner.select_agents(&requirements, &available).await?;
        recommendations.truncate(options.max_agents);

        let confidence = plan_confidence(&recommendations);
        if confidence < options.min_confidence {
            return Err(SwarmError::low_confidence(format!(
                "plan confidence {confidence:.2} below required {:.2}",
                options.min_confidence
            )));
        }

        let context = request.context.clone().unwrap_or_default();
        let plan = build_plan(&requirements, &recommendations, &available, context)?;
        let analysis = json!({
            "requirements": requirements,
            "recommendations": recommendations,
        });
        Ok((plan, Some(confidence), Some(analysis)))
    }

    /// Run one task to a terminal state.
    async fn drive(
        self: Arc<Self>,
        task_id: String,
        state: Arc<Mutex<TaskExecution>>,
        options: TaskOptions,
        cancel: CancellationToken,
        done_tx: watch::Sender<bool>,
    ) {
        // Approval gate: explicit, or implied by auto_deploy = false.
        if options.require_approval || !options.auto_deploy {
            {
                let mut s = state.lock().await;
                s.status = TaskStatus::Planning;
            }
            let snapshot = state.lock().await.clone();
            let gate = self.approval.read().expect("approval lock").clone();
            let approved = gate
                .approve(&snapshot, options.approval_token.as_deref())
                .await;
            if !approved || cancel.is_cancelled() {
                let snapshot = {
                    let mut s = state.lock().await;
                    s.status = TaskStatus::Cancelled;
                    s.finished_at = Some(Utc::now());
                    s.error = Some(SwarmError::cancelled("plan rejected at approval"));
                    s.clone()
                };
                self.bus
                    .publish(&Event::task(
                        EventType::TaskCancelled,
                        &task_id,
                        json!({ "reason": "approval rejected" }),
                    ))
                    .await;
                self.metrics.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
                self.archive(snapshot).await;
                let _ = done_tx.send(true);
                return;
            }
        }

        let plan = {
            let mut s = state.lock().await;
            s.status = TaskStatus::Deploying;
            s.plan.clone()
        };

        {
            let mut s = state.lock().await;
            s.status = TaskStatus::Executing;
            s.started_at = Some(Utc::now());
        }
        self.bus
            .publish(&Event::task(
                EventType::TaskStarted,
                &task_id,
                json!({ "steps": plan.steps.len() }),
            ))
            .await;

        // A task deadline is a watchdog on the cancel token, so the plan
        // winds down through the normal cancellation path.
        let timed_out = Arc::new(AtomicBool::new(false));
        if let Some(ms) = options.timeout_ms {
            let watchdog_cancel = cancel.clone();
            let timed_out = timed_out.clone();
            let watchdog_task = task_id.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(ms)) => {
                        warn!(task_id = %watchdog_task, timeout_ms = ms, "task deadline expired — cancelling");
                        timed_out.store(true, Ordering::Relaxed);
                        watchdog_cancel.cancel();
                    }
                    _ = watchdog_cancel.cancelled() => {}
                }
            });
        }

        let mut outcome = self.engine.execute(&task_id, plan, cancel.clone()).await;
        if outcome.status == PlanStatus::Cancelled && timed_out.load(Ordering::Relaxed) {
            outcome.status = PlanStatus::Failed;
            outcome.error = Some(SwarmError::timeout(format!(
                "task deadline of {} ms expired",
                options.timeout_ms.unwrap_or_default()
            )));
        }

        let snapshot = {
            let mut s = state.lock().await;
            s.plan.steps = outcome.steps;
            s.plan.context = outcome.context;
            s.step_results = s
                .plan
                .steps
                .iter()
                .filter(|step| step.status == StepStatus::Succeeded)
                .filter_map(|step| step.result.clone().map(|r| (step.step_id.clone(), r)))
                .collect();
            s.finished_at = Some(Utc::now());
            match outcome.status {
                PlanStatus::Completed => s.status = TaskStatus::Completed,
                PlanStatus::Failed => {
                    s.status = TaskStatus::Failed;
                    s.error = outcome.error.clone();
                }
                PlanStatus::Cancelled => {
                    s.status = TaskStatus::Cancelled;
                    s.error = outcome.error.clone();
                }
            }
            s.clone()
        };

        match outcome.status {
            PlanStatus::Completed => {
                self.metrics.tasks_completed.fetch_add(1, Ordering::Relaxed);
                // Deliverables precede the terminal event so subscribers
                // holding results see them before tearing down.
                self.bus
                    .publish(&Event::task(
                        EventType::DeliverablesSubmitted,
                        &task_id,
                        json!({ "results": snapshot.step_results }),
                    ))
                    .await;
                self.bus
                    .publish(&Event::task(
                        EventType::TaskCompleted,
                        &task_id,
                        json!({
                            "steps": snapshot.plan.steps.len(),
                            "succeeded": snapshot
                                .plan
                                .steps
                                .iter()
                                .filter(|s| s.status == StepStatus::Succeeded)
                                .count(),
                        }),
                    ))
                    .await;
            }
            PlanStatus::Failed => {
                self.metrics.tasks_failed.fetch_add(1, Ordering::Relaxed);
                let err = snapshot
                    .error
                    .clone()
                    .unwrap_or_else(|| SwarmError::fatal("plan failed without a recorded error"));
                self.bus
                    .publish(&Event::task(
                        EventType::TaskFailed,
                        &task_id,
                        json!({
                            "kind": err.kind,
                            "message": err.message,
                            "stepId": outcome.failed_step,
                        }),
                    ))
                    .await;
            }
            PlanStatus::Cancelled => {
                self.metrics.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
                self.bus
                    .publish(&Event::task(
                        EventType::TaskCancelled,
                        &task_id,
                        json!({ "reason": snapshot
                            .error
                            .as_ref()
                            .map(|e| e.message.clone())
                            .unwrap_or_else(|| "cancelled".to_string()) }),
                    ))
                    .await;
            }
        }

        self.archive(snapshot).await;
        let _ = done_tx.send(true);
    }

    /// Move a terminal task from the live table into the history ring.
    async fn archive(&self, snapshot: TaskExecution) {
        let task_id = snapshot.task_id.clone();
        {
            let mut history = self.history.lock().await;
            if history.len() == self.history_size {
                history.pop_front();
            }
            history.push_back(snapshot);
        }
        self.tasks.write().await.remove(&task_id);
    }
}

/// Thread-safe shared orchestrator.
pub type SharedOrchestrator = Arc<TaskOrchestrator>;
