//! End-to-end engine scenarios: dependency chains, parallel groups,
//! retries, aborts, and guard-driven skips, driven through the
//! orchestrator with the built-in and test agents.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use swarmd::agents::{AgentHandler, InvokeContext};
use swarmd::config::SwarmConfig;
use swarmd::error::{ErrorKind, SwarmError};
use swarmd::orchestrator::{TaskRequest, TaskStatus};
use swarmd::plan::StepStatus;
use swarmd::registry::{AgentDescriptor, Capability, CapabilityKind};
use swarmd::AppContext;

// ─── Helpers ──────────────────────────────────────────────────────────────────

async fn build_ctx() -> Arc<AppContext> {
    let mut config = SwarmConfig::default();
    // Tests drive many steps quickly; keep the limiter out of the way.
    config.rate_limit.max_per_interval = 10_000;
    AppContext::build(config).await.expect("context")
}

fn descriptor(agent_id: &str, capability: &str) -> AgentDescriptor {
    AgentDescriptor {
        agent_id: agent_id.to_string(),
        name: agent_id.to_string(),
        version: String::new(),
        category: Some("testing".to_string()),
        tags: vec![],
        capabilities: vec![Capability {
            name: capability.to_string(),
            kind: CapabilityKind::Custom(capability.to_string()),
            description: String::new(),
            input_schema: Value::Null,
            output_schema: Value::Null,
        }],
        enabled: true,
    }
}

/// Records invocation starts and tracks peak concurrency.
struct GaugeAgent {
    concurrent: AtomicUsize,
    peak: AtomicUsize,
    hold_ms: u64,
}

#[async_trait]
impl AgentHandler for GaugeAgent {
    async fn handle(
        &self,
        _kind: &CapabilityKind,
        _input: Value,
        _ctx: InvokeContext,
    ) -> Result<Value, SwarmError> {
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(self.hold_ms)).await;
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({ "ok": true }))
    }
}

async fn submit_and_wait(ctx: &Arc<AppContext>, plan: Value) -> swarmd::orchestrator::TaskExecution {
    let receipt = ctx
        .orchestrator
        .submit(TaskRequest {
            plan: Some(plan),
            ..Default::default()
        })
        .await
        .expect("submit");
    ctx.orchestrator
        .wait(&receipt.task_id)
        .await
        .expect("task snapshot")
}

fn count_events(events: &[Value], event_type: &str) -> usize {
    events
        .iter()
        .filter(|e| e["type"] == event_type)
        .count()
}

// ─── Scenario: linear chain ──────────────────────────────────────────────────

#[tokio::test]
async fn linear_chain_renders_upstream_result() {
    let ctx = build_ctx().await;
    let (sub, mut rx) = ctx.bus.attach("watcher", &[]).await;

    let task = submit_and_wait(
        &ctx,
        json!({
            "steps": [
                {"stepId": "A", "agentId": "echo", "capability": "chat",
                 "input": {"msg": "hi"}},
                {"stepId": "B", "agentId": "echo", "capability": "chat",
                 "input": {"msg": "{{A_result.echoed.msg}} world"},
                 "dependencies": ["A"]},
            ]
        }),
    )
    .await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(
        task.plan.context["A_result"],
        json!({"echoed": {"msg": "hi"}})
    );
    assert_eq!(
        task.plan.context["B_result"],
        json!({"echoed": {"msg": "hi world"}})
    );

    // Event stream: exactly one task_started, two step_started, two
    // step_succeeded, one task_completed — in that order per subscriber.
    let mut events = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        sub.on_drained(frame.bytes);
        events.push(serde_json::from_str::<Value>(&frame.json).unwrap());
    }
    assert_eq!(count_events(&events, "task_started"), 1);
    assert_eq!(count_events(&events, "step_started"), 2);
    assert_eq!(count_events(&events, "step_succeeded"), 2);
    assert_eq!(count_events(&events, "task_completed"), 1);

    let ordered: Vec<(&str, Option<&str>)> = events
        .iter()
        .filter(|e| {
            matches!(
                e["type"].as_str().unwrap_or(""),
                "task_started" | "step_started" | "step_succeeded" | "task_completed"
            )
        })
        .map(|e| (e["type"].as_str().unwrap(), e["stepId"].as_str()))
        .collect();
    assert_eq!(
        ordered,
        vec![
            ("task_started", None),
            ("step_started", Some("A")),
            ("step_succeeded", Some("A")),
            ("step_started", Some("B")),
            ("step_succeeded", Some("B")),
            ("task_completed", None),
        ]
    );
}

// ─── Scenario: parallel group ─────────────────────────────────────────────────

#[tokio::test]
async fn parallel_group_reaches_full_concurrency() {
    let ctx = build_ctx().await;
    let gauge = Arc::new(GaugeAgent {
        concurrent: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        hold_ms: 100,
    });
    ctx.registry
        .register(descriptor("gauge", "work"), gauge.clone(), true)
        .await
        .unwrap();

    let step = |id: &str| {
        json!({"stepId": id, "agentId": "gauge", "capability": "work",
               "parallelGroup": "g", "priority": 1})
    };
    let start = Instant::now();
    let task = submit_and_wait(&ctx, json!({"steps": [step("A"), step("B"), step("C")]})).await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 3, "all three ran at once");
    // Three 100 ms holds in parallel finish well under 3x serial time.
    assert!(start.elapsed() < Duration::from_millis(290));
}

#[tokio::test]
async fn ungrouped_steps_serialize() {
    let ctx = build_ctx().await;
    let gauge = Arc::new(GaugeAgent {
        concurrent: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        hold_ms: 40,
    });
    ctx.registry
        .register(descriptor("gauge", "work"), gauge.clone(), true)
        .await
        .unwrap();

    let step = |id: &str| json!({"stepId": id, "agentId": "gauge", "capability": "work"});
    let task = submit_and_wait(&ctx, json!({"steps": [step("A"), step("B"), step("C")]})).await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 1, "no-group steps run one at a time");
}

// ─── Scenario: retry then succeed ─────────────────────────────────────────────

#[tokio::test]
async fn transient_failures_retry_until_success() {
    let ctx = build_ctx().await;
    let (sub, mut rx) = ctx.bus.attach("watcher", &[]).await;

    let task = submit_and_wait(
        &ctx,
        json!({
            "steps": [{
                "stepId": "flappy",
                "agentId": "flaky",
                "capability": "fail",
                "input": {"key": "retry-test", "failures": 2},
                "maxAttempts": 3,
                "backoffBaseMs": 10,
            }]
        }),
    )
    .await;

    assert_eq!(task.status, TaskStatus::Completed);
    let step = &task.plan.steps[0];
    assert_eq!(step.status, StepStatus::Succeeded);
    assert_eq!(step.attempt, 3);
    assert_eq!(step.result, Some(json!({"attempts": 3})));

    let mut events = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        sub.on_drained(frame.bytes);
        events.push(serde_json::from_str::<Value>(&frame.json).unwrap());
    }
    assert_eq!(count_events(&events, "step_started"), 3);
    assert_eq!(count_events(&events, "step_succeeded"), 1);
    assert_eq!(count_events(&events, "step_progress"), 2, "one retry notice per backoff");
}

#[tokio::test]
async fn exhausted_retries_fail_the_step_but_not_the_plan() {
    let ctx = build_ctx().await;
    let task = submit_and_wait(
        &ctx,
        json!({
            "steps": [
                {"stepId": "doomed", "agentId": "flaky", "capability": "fail",
                 "input": {"key": "doomed", "failures": 99},
                 "maxAttempts": 2, "backoffBaseMs": 5},
                {"stepId": "bystander", "agentId": "echo", "capability": "chat",
                 "input": {"msg": "fine"}},
            ]
        }),
    )
    .await;

    // Partial failure still completes the plan.
    assert_eq!(task.status, TaskStatus::Completed);
    let doomed = task.plan.step("doomed").unwrap();
    assert_eq!(doomed.status, StepStatus::Failed);
    assert_eq!(doomed.attempt, 2);
    assert_eq!(doomed.error_kind, Some(ErrorKind::Transient));
    assert_eq!(
        task.plan.step("bystander").unwrap().status,
        StepStatus::Succeeded
    );
}

// ─── Scenario: abort on failure ───────────────────────────────────────────────

#[tokio::test]
async fn abort_failure_cancels_the_rest_of_the_plan() {
    let ctx = build_ctx().await;
    let (sub, mut rx) = ctx.bus.attach("watcher", &[]).await;

    let task = submit_and_wait(
        &ctx,
        json!({
            "steps": [
                {"stepId": "A", "agentId": "flaky", "capability": "fail",
                 "input": {"key": "abort-test", "failures": 99, "kind": "Fatal"},
                 "onFailure": "abort", "parallelGroup": "g"},
                {"stepId": "B", "agentId": "timer", "capability": "wait",
                 "input": {"ms": 5000}, "parallelGroup": "g"},
            ]
        }),
    )
    .await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_ref().unwrap().kind, ErrorKind::Fatal);
    assert_eq!(task.plan.step("A").unwrap().status, StepStatus::Failed);
    // B either never ran or was cancelled mid-flight; never succeeded.
    assert_eq!(task.plan.step("B").unwrap().status, StepStatus::Cancelled);

    let mut events = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        sub.on_drained(frame.bytes);
        events.push(serde_json::from_str::<Value>(&frame.json).unwrap());
    }
    let failed = events
        .iter()
        .find(|e| e["type"] == "task_failed")
        .expect("task_failed event");
    assert_eq!(failed["payload"]["kind"], "Fatal");
    assert_eq!(failed["payload"]["stepId"], "A");
}

// ─── Guards and skipped dependencies ──────────────────────────────────────────

#[tokio::test]
async fn skip_if_and_cascade_skip() {
    let ctx = build_ctx().await;
    let task = submit_and_wait(
        &ctx,
        json!({
            "context": {"dry_run": true},
            "steps": [
                {"stepId": "A", "agentId": "echo", "capability": "chat",
                 "skipIf": "dry_run == true", "input": {"msg": "never"}},
                {"stepId": "B", "agentId": "echo", "capability": "chat",
                 "dependencies": ["A"], "input": {"msg": "depends"}},
            ]
        }),
    )
    .await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.plan.step("A").unwrap().status, StepStatus::Skipped);
    // No guard rescues B, so the skip cascades.
    assert_eq!(task.plan.step("B").unwrap().status, StepStatus::Skipped);
}

#[tokio::test]
async fn run_if_rescues_dependent_of_skipped_step() {
    let ctx = build_ctx().await;
    let task = submit_and_wait(
        &ctx,
        json!({
            "context": {"dry_run": true},
            "steps": [
                {"stepId": "A", "agentId": "echo", "capability": "chat",
                 "skipIf": "dry_run", "input": {"msg": "never"}},
                {"stepId": "B", "agentId": "echo", "capability": "chat",
                 "dependencies": ["A"],
                 "runIf": "A_result == null",
                 "input": {"upstream": "{{A_result}}", "msg": "rescued"}},
            ]
        }),
    )
    .await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.plan.step("A").unwrap().status, StepStatus::Skipped);
    let b = task.plan.step("B").unwrap();
    assert_eq!(b.status, StepStatus::Succeeded);
    // The skipped dependency's result rendered as literal null.
    assert_eq!(
        b.result,
        Some(json!({"echoed": {"upstream": null, "msg": "rescued"}}))
    );
}

#[tokio::test]
async fn on_failure_skip_keeps_dependents_guarded() {
    let ctx = build_ctx().await;
    let task = submit_and_wait(
        &ctx,
        json!({
            "steps": [
                {"stepId": "A", "agentId": "flaky", "capability": "fail",
                 "input": {"key": "skip-policy", "failures": 99, "kind": "Fatal"},
                 "onFailure": "skip"},
                {"stepId": "B", "agentId": "echo", "capability": "chat",
                 "dependencies": ["A"], "input": {"msg": "after"}},
            ]
        }),
    )
    .await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.plan.step("A").unwrap().status, StepStatus::Skipped);
    assert_eq!(task.plan.step("B").unwrap().status, StepStatus::Skipped);
}

// ─── Cap and timeout ──────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrency_never_exceeds_max_parallel_steps() {
    let mut config = SwarmConfig::default();
    config.rate_limit.max_per_interval = 10_000;
    config.engine.max_parallel_steps = 2;
    let ctx = AppContext::build(config).await.unwrap();

    let gauge = Arc::new(GaugeAgent {
        concurrent: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        hold_ms: 30,
    });
    ctx.registry
        .register(descriptor("gauge", "work"), gauge.clone(), true)
        .await
        .unwrap();

    let steps: Vec<Value> = (0..6)
        .map(|i| {
            json!({"stepId": format!("s{i}"), "agentId": "gauge",
                   "capability": "work", "parallelGroup": "g"})
        })
        .collect();
    let task = submit_and_wait(&ctx, json!({ "steps": steps })).await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn step_deadline_produces_timeout_then_policy_applies() {
    let ctx = build_ctx().await;
    let task = submit_and_wait(
        &ctx,
        json!({
            "steps": [{
                "stepId": "slow",
                "agentId": "timer",
                "capability": "wait",
                "input": {"ms": 60000},
                "timeoutMs": 50,
                "maxAttempts": 1,
            }]
        }),
    )
    .await;

    assert_eq!(task.status, TaskStatus::Completed);
    let step = task.plan.step("slow").unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.error_kind, Some(ErrorKind::Timeout));
}
