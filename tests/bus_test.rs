//! Bus behavior under a real task load: per-subscriber event coverage
//! and the backpressure drop policy for a stalled subscriber.

use std::sync::Arc;

use serde_json::{json, Value};
use swarmd::bus::Frame;
use swarmd::config::SwarmConfig;
use swarmd::events::EventType;
use swarmd::orchestrator::{TaskRequest, TaskStatus};
use swarmd::AppContext;

async fn build_ctx_with_hwm(hwm: usize) -> Arc<AppContext> {
    let mut config = SwarmConfig::default();
    config.rate_limit.max_per_interval = 10_000;
    config.stream.max_buffered_bytes = hwm;
    AppContext::build(config).await.expect("context")
}

fn drain(sub: &swarmd::bus::Subscriber, rx: &mut tokio::sync::mpsc::Receiver<Frame>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        sub.on_drained(frame.bytes);
        out.push(serde_json::from_str(&frame.json).unwrap());
    }
    out
}

// ─── Event coverage ───────────────────────────────────────────────────────────

#[tokio::test]
async fn every_terminal_step_delivers_exactly_one_event() {
    let ctx = build_ctx_with_hwm(512 * 1024).await;
    let (sub, mut rx) = ctx.bus.attach("watcher", &[]).await;

    // One success, one failure (exhausted), one guard skip.
    let receipt = ctx
        .orchestrator
        .submit(TaskRequest {
            plan: Some(json!({
                "context": {"skip_me": true},
                "steps": [
                    {"stepId": "ok", "agentId": "echo", "capability": "chat",
                     "input": {"msg": "hello"}},
                    {"stepId": "bad", "agentId": "flaky", "capability": "fail",
                     "input": {"key": "coverage", "failures": 99},
                     "maxAttempts": 1},
                    {"stepId": "skipped", "agentId": "echo", "capability": "chat",
                     "skipIf": "skip_me"},
                ]
            })),
            ..Default::default()
        })
        .await
        .unwrap();
    let task = ctx.orchestrator.wait(&receipt.task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    let events = drain(&sub, &mut rx);
    let count = |ty: &str, step: &str| {
        events
            .iter()
            .filter(|e| e["type"] == ty && e["stepId"] == step)
            .count()
    };
    assert_eq!(count("step_succeeded", "ok"), 1);
    assert_eq!(count("step_failed", "bad"), 1);
    assert_eq!(count("step_skipped", "skipped"), 1);
    assert!(!sub.is_lagging());
}

#[tokio::test]
async fn late_subscriber_sees_nothing_from_earlier_tasks() {
    let ctx = build_ctx_with_hwm(512 * 1024).await;

    let receipt = ctx
        .orchestrator
        .submit(TaskRequest {
            plan: Some(json!({"steps": [
                {"stepId": "a", "agentId": "echo", "capability": "chat",
                 "input": {"msg": "early"}}
            ]})),
            ..Default::default()
        })
        .await
        .unwrap();
    ctx.orchestrator.wait(&receipt.task_id).await.unwrap();

    let (sub, mut rx) = ctx.bus.attach("latecomer", &[]).await;
    assert!(drain(&sub, &mut rx).is_empty());
}

// ─── Backpressure (stalled subscriber) ────────────────────────────────────────

#[tokio::test]
async fn stalled_subscriber_drops_progress_keeps_terminal() {
    // HWM small enough that a stalled subscriber overflows after the
    // very first frame.
    let ctx = build_ctx_with_hwm(150).await;
    let (sub, mut rx) = ctx.bus.attach("stalled", &[]).await;

    // Retries generate step_progress events; the stalled subscriber
    // must never see them queued past its mark.
    let receipt = ctx
        .orchestrator
        .submit(TaskRequest {
            plan: Some(json!({"steps": [
                {"stepId": "flappy", "agentId": "flaky", "capability": "fail",
                 "input": {"key": "stall", "failures": 3},
                 "maxAttempts": 5, "backoffBaseMs": 5}
            ]})),
            ..Default::default()
        })
        .await
        .unwrap();
    let task = ctx.orchestrator.wait(&receipt.task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    // Nothing was drained during the run (simulated network stall).
    let delivered = drain(&sub, &mut rx);
    let progress_delivered = delivered
        .iter()
        .filter(|e| e["type"] == "step_progress")
        .count();
    assert_eq!(progress_delivered, 0, "progress events dropped during stall");

    // The terminal event still reached the subscriber one way or the
    // other: delivered once the buffer allowed, or recorded as missed
    // with the subscriber marked lagging.
    let completed_delivered = delivered
        .iter()
        .any(|e| e["type"] == "task_completed");
    let missed = sub.take_missed();
    let completed_missed = missed
        .iter()
        .any(|m| m.event_type == EventType::TaskCompleted);
    assert!(
        completed_delivered || (completed_missed && sub.is_lagging()),
        "terminal event neither delivered nor recorded"
    );
    // Progress events are droppable — they never land in the missed ring.
    assert!(missed
        .iter()
        .all(|m| m.event_type != EventType::StepProgress));
}
