// SPDX-License-Identifier: MIT
//! Parallel execution engine — drives a plan to a terminal state.
//!
//! One scheduling loop per plan owns the plan state exclusively; workers
//! are spawned tasks that report back over a channel, so no lock guards
//! the steps. Ready steps dispatch in priority order (FIFO within a
//! tier), bounded by `max_parallel_steps`. Ungrouped steps serialize with
//! each other; members of parallel groups run concurrently up to the
//! pool limit.
//!
//! Retriable failures (`Transient`, `Timeout`, `RateLimited`) re-enqueue
//! with exponential backoff until the step's attempts are exhausted, then
//! the step's `on_failure` policy decides: fail the step, skip it, or
//! abort the whole plan. Capability invocations are at-least-once.

pub mod backoff;
pub mod queue;

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::InvokeContext;
use crate::bus::SharedBus;
use crate::config::EngineConfig;
use crate::error::{ErrorKind, SwarmError};
use crate::events::{Event, EventType};
use crate::limiter::SharedLimiter;
use crate::metrics::SharedMetrics;
use crate::plan::guard::Guard;
use crate::plan::{template, ExecutionPlan, OnFailure, Step, StepStatus};
use crate::registry::SharedRegistry;
use backoff::{backoff_with_jitter, seed_for};
use queue::{ReadyEntry, ReadyQueue};

// ─── Outcome ──────────────────────────────────────────────────────────────────

/// Terminal state of a whole plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStatus {
    /// All steps terminal, no abort — partial step failures allowed.
    Completed,
    /// A step with `on_failure = abort` failed.
    Failed,
    /// The caller's cancellation fired first.
    Cancelled,
}

/// What the engine hands back to the orchestrator.
#[derive(Debug)]
pub struct PlanOutcome {
    pub status: PlanStatus,
    /// The aborting (or cancellation) error, if any.
    pub error: Option<SwarmError>,
    /// Step that triggered the abort.
    pub failed_step: Option<String>,
    pub steps: Vec<Step>,
    pub context: Map<String, Value>,
}

// ─── Worker messages ──────────────────────────────────────────────────────────

enum EngineMsg {
    Done {
        step_index: usize,
        outcome: Result<Value, SwarmError>,
        duration: Duration,
    },
    /// Backoff elapsed; the step may rejoin the ready queue.
    Requeue { step_index: usize },
}

// ─── Engine ───────────────────────────────────────────────────────────────────

pub struct ParallelExecutionEngine {
    config: EngineConfig,
    registry: SharedRegistry,
    limiter: SharedLimiter,
    bus: SharedBus,
    metrics: SharedMetrics,
}

impl ParallelExecutionEngine {
    pub fn new(
        config: EngineConfig,
        registry: SharedRegistry,
        limiter: SharedLimiter,
        bus: SharedBus,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            config,
            registry,
            limiter,
            bus,
            metrics,
        }
    }

    /// Attempts allowed for a step: its own policy, bounded by the global
    /// retry ceiling.
    fn effective_max_attempts(&self, step: &Step) -> u32 {
        step.max_attempts
            .min(self.config.max_retries.saturating_add(1))
            .max(1)
    }

    fn backoff_base(&self, step: &Step) -> u64 {
        if step.backoff_base_ms > 0 {
            step.backoff_base_ms
        } else {
            self.config.retry_base_ms
        }
    }

    fn step_deadline(&self, step: &Step) -> Duration {
        let step_ms = if step.timeout_ms > 0 {
            step.timeout_ms
        } else {
            self.config.step_timeout_ms
        };
        Duration::from_millis(step_ms.min(self.config.step_timeout_ms))
    }

    /// Drive `plan` to a terminal state. The caller's token cancels the
    /// whole plan; the engine derives a child token so an aborting step
    /// can stop its siblings without touching the caller's token.
    pub async fn execute(
        &self,
        task_id: &str,
        mut plan: ExecutionPlan,
        cancel: CancellationToken,
    ) -> PlanOutcome {
        let plan_cancel = cancel.child_token();
        let (tx, mut rx) = mpsc::unbounded_channel::<EngineMsg>();
        let mut ready = ReadyQueue::new();
        let mut running = 0usize;
        let mut running_ungrouped = 0usize;
        let mut backoff_pending = 0usize;
        let mut abort: Option<(SwarmError, String)> = None;
        let mut externally_cancelled = false;

        self.evaluate_pending(task_id, &mut plan, &mut ready).await;

        loop {
            let halted = abort.is_some() || externally_cancelled;

            // Dispatch as many ready steps as the pool allows.
            if !halted {
                let mut deferred: Vec<ReadyEntry> = Vec::new();
                while running < self.config.max_parallel_steps {
                    let Some(entry) = ready.pop() else { break };
                    self.metrics.queue_size.fetch_sub(1, Ordering::Relaxed);
                    let idx = entry.step_index;
                    if plan.steps[idx].status != StepStatus::Ready {
                        continue; // stale entry, e.g. cancelled while queued
                    }
                    if plan.steps[idx].parallel_group.is_none() && running_ungrouped > 0 {
                        deferred.push(entry);
                        continue;
                    }
                    if plan.steps[idx].parallel_group.is_none() {
                        running_ungrouped += 1;
                    }
                    running += 1;
                    self.dispatch(task_id, &mut plan, idx, &tx, &plan_cancel).await;
                }
                for entry in deferred {
                    self.metrics.queue_size.fetch_add(1, Ordering::Relaxed);
                    ready.push_back(entry);
                }
            }

            if running == 0 && backoff_pending == 0 && (ready.is_empty() || halted) {
                break;
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled(), if !externally_cancelled => {
                    externally_cancelled = true;
                    info!(task_id = %task_id, "cancellation observed — stopping plan");
                    self.cancel_remaining(task_id, &mut plan, "task cancelled").await;
                }

                msg = rx.recv() => {
                    // Senders live as long as `tx`, held here.
                    let Some(msg) = msg else { break };
                    match msg {
                        EngineMsg::Requeue { step_index } => {
                            backoff_pending -= 1;
                            if plan.steps[step_index].status == StepStatus::Ready {
                                self.metrics.queue_size.fetch_add(1, Ordering::Relaxed);
                                ready.push(step_index, plan.steps[step_index].priority);
                            }
                        }
                        EngineMsg::Done { step_index, outcome, duration } => {
                            running -= 1;
                            if plan.steps[step_index].parallel_group.is_none() {
                                running_ungrouped -= 1;
                            }
                            self.metrics.steps_running.fetch_sub(1, Ordering::Relaxed);
                            self.metrics.step_duration.observe(duration.as_secs_f64());
                            let aborted = self
                                .complete_step(
                                    task_id,
                                    &mut plan,
                                    step_index,
                                    outcome,
                                    &tx,
                                    &plan_cancel,
                                    &mut backoff_pending,
                                    abort.is_some() || externally_cancelled,
                                )
                                .await;
                            if let Some((err, step_id)) = aborted {
                                if abort.is_none() && !externally_cancelled {
                                    abort = Some((err, step_id));
                                    plan_cancel.cancel();
                                    self.cancel_remaining(task_id, &mut plan, "plan aborted").await;
                                }
                            } else if abort.is_none() && !externally_cancelled {
                                self.evaluate_pending(task_id, &mut plan, &mut ready).await;
                            }
                        }
                    }
                }
            }
        }

        // Entries still queued were counted into the gauge when pushed.
        self.metrics
            .queue_size
            .fetch_sub(ready.len() as u64, Ordering::Relaxed);

        if let Some((err, step_id)) = &abort {
            PlanOutcome {
                status: PlanStatus::Failed,
                error: Some(err.clone()),
                failed_step: Some(step_id.clone()),
                steps: plan.steps,
                context: plan.context,
            }
        } else if externally_cancelled {
            PlanOutcome {
                status: PlanStatus::Cancelled,
                error: Some(SwarmError::cancelled("task cancelled")),
                failed_step: None,
                steps: plan.steps,
                context: plan.context,
            }
        } else {
            PlanOutcome {
                status: PlanStatus::Completed,
                error: None,
                failed_step: None,
                steps: plan.steps,
                context: plan.context,
            }
        }
    }

    /// Move dependency-resolved pending steps to ready (or skipped),
    /// cascading until a fixpoint — a skip this round can settle a
    /// dependent's fate next round.
    async fn evaluate_pending(
        &self,
        task_id: &str,
        plan: &mut ExecutionPlan,
        ready: &mut ReadyQueue,
    ) {
        loop {
            let mut changed = false;
            for idx in 0..plan.steps.len() {
                if plan.steps[idx].status != StepStatus::Pending {
                    continue;
                }
                let mut all_terminal = true;
                let mut dep_failed = false;
                let mut skipped_deps: Vec<String> = Vec::new();
                for dep in plan.steps[idx].dependencies.clone() {
                    let d = plan.index_of(&dep).expect("validated dependency");
                    match plan.steps[d].status {
                        StepStatus::Succeeded => {}
                        StepStatus::Skipped => skipped_deps.push(dep),
                        StepStatus::Failed | StepStatus::Cancelled => dep_failed = true,
                        _ => all_terminal = false,
                    }
                }
                if !all_terminal {
                    continue;
                }

                // Guards see a skipped dependency's result as literal null.
                let guard_ctx = guard_context(&plan.context, &skipped_deps);

                if let Some(expr) = plan.steps[idx].skip_if.clone() {
                    let guard = Guard::parse(&expr).expect("validated at construction");
                    if guard.evaluate(&guard_ctx) {
                        self.skip_step(task_id, plan, idx, "skip_if matched").await;
                        changed = true;
                        continue;
                    }
                }
                if dep_failed {
                    self.skip_step(task_id, plan, idx, "dependency failed").await;
                    changed = true;
                    continue;
                }
                if !skipped_deps.is_empty() {
                    // A skipped dependency counts as not-succeeded; only an
                    // explicit run_if that passes over the null result lets
                    // the dependent proceed.
                    let rescued = plan.steps[idx]
                        .run_if
                        .clone()
                        .map(|expr| {
                            Guard::parse(&expr)
                                .expect("validated at construction")
                                .evaluate(&guard_ctx)
                        })
                        .unwrap_or(false);
                    if !rescued {
                        self.skip_step(task_id, plan, idx, "dependency skipped").await;
                        changed = true;
                        continue;
                    }
                } else if let Some(expr) = plan.steps[idx].run_if.clone() {
                    let guard = Guard::parse(&expr).expect("validated at construction");
                    if !guard.evaluate(&guard_ctx) {
                        self.skip_step(task_id, plan, idx, "run_if not met").await;
                        changed = true;
                        continue;
                    }
                }

                if plan.steps[idx].transition(StepStatus::Ready).is_ok() {
                    self.metrics.steps_ready.fetch_add(1, Ordering::Relaxed);
                    self.metrics.queue_size.fetch_add(1, Ordering::Relaxed);
                    ready.push(idx, plan.steps[idx].priority);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    async fn skip_step(&self, task_id: &str, plan: &mut ExecutionPlan, idx: usize, reason: &str) {
        if plan.steps[idx].transition(StepStatus::Skipped).is_err() {
            return;
        }
        debug!(task_id = %task_id, step = %plan.steps[idx].step_id, reason, "step skipped");
        self.bus
            .publish(&Event::step(
                EventType::StepSkipped,
                task_id,
                plan.steps[idx].step_id.clone(),
                json!({ "reason": reason }),
            ))
            .await;
    }

    /// Cancel every non-terminal, non-running step. Running workers
    /// observe the token and report Cancelled on their own.
    async fn cancel_remaining(&self, task_id: &str, plan: &mut ExecutionPlan, reason: &str) {
        for idx in 0..plan.steps.len() {
            let status = plan.steps[idx].status;
            if status != StepStatus::Pending && status != StepStatus::Ready {
                continue;
            }
            if status == StepStatus::Ready {
                self.metrics.steps_ready.fetch_sub(1, Ordering::Relaxed);
            }
            if plan.steps[idx].transition(StepStatus::Cancelled).is_ok() {
                plan.steps[idx].error_kind = Some(ErrorKind::Cancelled);
                plan.steps[idx].error_message = Some(reason.to_string());
                self.bus
                    .publish(&Event::step(
                        EventType::StepCancelled,
                        task_id,
                        plan.steps[idx].step_id.clone(),
                        json!({ "reason": reason }),
                    ))
                    .await;
            }
        }
    }

    /// Mark a step running, render its input, and hand it to a worker.
    async fn dispatch(
        &self,
        task_id: &str,
        plan: &mut ExecutionPlan,
        idx: usize,
        tx: &mpsc::UnboundedSender<EngineMsg>,
        plan_cancel: &CancellationToken,
    ) {
        let skipped_deps: Vec<String> = plan.steps[idx]
            .dependencies
            .iter()
            .filter(|dep| {
                plan.index_of(dep)
                    .map(|d| plan.steps[d].status == StepStatus::Skipped)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        let render_ctx = guard_context(&plan.context, &skipped_deps);

        let step = &mut plan.steps[idx];
        if step.transition(StepStatus::Running).is_err() {
            return;
        }
        step.attempt += 1;
        self.metrics.steps_ready.fetch_sub(1, Ordering::Relaxed);
        self.metrics.steps_running.fetch_add(1, Ordering::Relaxed);

        let input = template::render(&step.input, &render_ctx);
        let attempt = step.attempt;
        let step_id = step.step_id.clone();
        let agent_id = step.agent_id.clone();
        let capability = step.capability.clone();
        let deadline = self.step_deadline(step);

        self.bus
            .publish(&Event::step(
                EventType::StepStarted,
                task_id,
                step_id.clone(),
                json!({
                    "attempt": attempt,
                    "agentId": agent_id,
                    "capability": capability,
                }),
            ))
            .await;

        let registry = self.registry.clone();
        let limiter = self.limiter.clone();
        let cancel = plan_cancel.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome =
                invoke_capability(&registry, &limiter, &agent_id, &capability, input, deadline, &cancel)
                    .await;
            // Receiver outliving workers is guaranteed by the scheduler
            // loop; a send error just means the plan already settled.
            let _ = tx.send(EngineMsg::Done {
                step_index: idx,
                outcome,
                duration: started.elapsed(),
            });
        });
    }

    /// Apply a worker's outcome. Returns the aborting error when the
    /// step's failure takes the whole plan down.
    #[allow(clippy::too_many_arguments)]
    async fn complete_step(
        &self,
        task_id: &str,
        plan: &mut ExecutionPlan,
        idx: usize,
        outcome: Result<Value, SwarmError>,
        tx: &mpsc::UnboundedSender<EngineMsg>,
        plan_cancel: &CancellationToken,
        backoff_pending: &mut usize,
        halted: bool,
    ) -> Option<(SwarmError, String)> {
        let step_id = plan.steps[idx].step_id.clone();
        match outcome {
            Ok(result) => {
                let step = &mut plan.steps[idx];
                if step.transition(StepStatus::Succeeded).is_err() {
                    return None;
                }
                step.result = Some(result.clone());
                let key = step.result_key();
                let attempt = step.attempt;
                plan.context.insert(key, result.clone());
                self.bus
                    .publish(&Event::step(
                        EventType::StepSucceeded,
                        task_id,
                        step_id,
                        json!({ "attempt": attempt, "result": result }),
                    ))
                    .await;
                None
            }
            Err(err) if err.kind == ErrorKind::Cancelled => {
                let step = &mut plan.steps[idx];
                if step.transition(StepStatus::Cancelled).is_ok() {
                    step.error_kind = Some(ErrorKind::Cancelled);
                    step.error_message = Some(err.message.clone());
                    self.bus
                        .publish(&Event::step(
                            EventType::StepCancelled,
                            task_id,
                            step_id,
                            json!({ "reason": err.message }),
                        ))
                        .await;
                }
                None
            }
            Err(err) => {
                let max_attempts = self.effective_max_attempts(&plan.steps[idx]);
                let attempt = plan.steps[idx].attempt;
                if err.is_retriable() && attempt < max_attempts && !halted {
                    let step = &mut plan.steps[idx];
                    if step.transition(StepStatus::Ready).is_err() {
                        return None;
                    }
                    step.error_kind = Some(err.kind);
                    step.error_message = Some(err.message.clone());
                    self.metrics.steps_ready.fetch_add(1, Ordering::Relaxed);
                    let base = self.backoff_base(step);
                    let wait = backoff_with_jitter(base, attempt - 1, seed_for(&step.step_id, attempt));
                    warn!(
                        task_id = %task_id,
                        step = %step.step_id,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        err = %err,
                        "step failed — retrying after backoff"
                    );
                    self.bus
                        .publish(&Event::step(
                            EventType::StepProgress,
                            task_id,
                            step_id,
                            json!({
                                "retrying": true,
                                "attempt": attempt,
                                "backoffMs": wait.as_millis() as u64,
                                "error": err.message,
                            }),
                        ))
                        .await;
                    *backoff_pending += 1;
                    let tx = tx.clone();
                    let cancel = plan_cancel.clone();
                    tokio::spawn(async move {
                        // Cancellation cuts the wait short; the scheduler
                        // drops the requeue for any step no longer ready.
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            _ = cancel.cancelled() => {}
                        }
                        let _ = tx.send(EngineMsg::Requeue { step_index: idx });
                    });
                    return None;
                }

                // Attempts exhausted (or the failure is fatal): policy time.
                match plan.steps[idx].on_failure {
                    OnFailure::Skip => {
                        let step = &mut plan.steps[idx];
                        if step.transition(StepStatus::Skipped).is_ok() {
                            step.error_kind = Some(err.kind);
                            step.error_message = Some(err.message.clone());
                            self.bus
                                .publish(&Event::step(
                                    EventType::StepSkipped,
                                    task_id,
                                    step_id,
                                    json!({ "reason": "on_failure=skip", "error": err.message }),
                                ))
                                .await;
                        }
                        None
                    }
                    OnFailure::Retry => {
                        self.fail_step(task_id, plan, idx, &err, false).await;
                        None
                    }
                    OnFailure::Abort => {
                        self.fail_step(task_id, plan, idx, &err, true).await;
                        Some((err, step_id))
                    }
                }
            }
        }
    }

    async fn fail_step(
        &self,
        task_id: &str,
        plan: &mut ExecutionPlan,
        idx: usize,
        err: &SwarmError,
        aborts: bool,
    ) {
        let step = &mut plan.steps[idx];
        if step.transition(StepStatus::Failed).is_err() {
            return;
        }
        step.error_kind = Some(err.kind);
        step.error_message = Some(err.message.clone());
        let attempt = step.attempt;
        let mut event = Event::step(
            EventType::StepFailed,
            task_id,
            step.step_id.clone(),
            json!({ "kind": err.kind, "message": err.message, "attempt": attempt }),
        );
        if aborts {
            event = event.aborting();
        }
        self.bus.publish(&event).await;
    }
}

/// Context view for guard evaluation and input rendering: the plan
/// context, with each skipped dependency's result pinned to literal null.
fn guard_context(context: &Map<String, Value>, skipped_deps: &[String]) -> Map<String, Value> {
    let mut ctx = context.clone();
    for dep in skipped_deps {
        ctx.insert(format!("{dep}_result"), Value::Null);
    }
    ctx
}

/// Resolve and invoke one agent capability under the rate limiter, with
/// the step deadline and cancellation applied around the call.
async fn invoke_capability(
    registry: &SharedRegistry,
    limiter: &SharedLimiter,
    agent_id: &str,
    capability: &str,
    input: Value,
    deadline: Duration,
    cancel: &CancellationToken,
) -> Result<Value, SwarmError> {
    let descriptor = registry
        .get(agent_id)
        .await
        .ok_or_else(|| SwarmError::not_found(format!("unknown agent {agent_id:?}")))?;
    if !descriptor.enabled {
        return Err(SwarmError::permission_denied(format!(
            "agent {agent_id:?} is disabled"
        )));
    }
    let kind = descriptor
        .capability(capability)
        .ok_or_else(|| {
            SwarmError::not_found(format!(
                "agent {agent_id:?} has no capability {capability:?}"
            ))
        })?
        .kind
        .clone();
    let handler = registry
        .handler(agent_id)
        .await
        .ok_or_else(|| SwarmError::not_found(format!("no handler for agent {agent_id:?}")))?;

    limiter
        .execute(cancel, || {
            let handler = handler.clone();
            let kind = kind.clone();
            let input = input.clone();
            let cancel = cancel.clone();
            async move {
                let ctx = InvokeContext {
                    deadline,
                    cancel: cancel.clone(),
                };
                tokio::select! {
                    out = tokio::time::timeout(deadline, handler.handle(&kind, input, ctx)) => {
                        match out {
                            Ok(result) => result,
                            Err(_) => Err(SwarmError::timeout(format!(
                                "step deadline of {} ms expired",
                                deadline.as_millis()
                            ))),
                        }
                    }
                    _ = cancel.cancelled() => Err(SwarmError::cancelled("step cancelled")),
                }
            }
        })
        .await
}
