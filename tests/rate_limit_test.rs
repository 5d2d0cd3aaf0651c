//! Global rate limiting across concurrent tasks: one limiter serializes
//! agent invocations no matter how parallel the engine runs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use swarmd::agents::{AgentHandler, InvokeContext};
use swarmd::config::SwarmConfig;
use swarmd::error::SwarmError;
use swarmd::orchestrator::{TaskRequest, TaskStatus};
use swarmd::registry::{AgentDescriptor, Capability, CapabilityKind};
use swarmd::AppContext;

/// Records the instant each invocation begins.
struct TickAgent {
    starts: std::sync::Mutex<Vec<Instant>>,
}

#[async_trait]
impl AgentHandler for TickAgent {
    async fn handle(
        &self,
        _kind: &CapabilityKind,
        _input: Value,
        _ctx: InvokeContext,
    ) -> Result<Value, SwarmError> {
        self.starts.lock().unwrap().push(Instant::now());
        Ok(json!({ "ok": true }))
    }
}

#[tokio::test]
async fn limiter_spaces_step_starts_across_tasks() {
    let mut config = SwarmConfig::default();
    config.rate_limit.max_per_interval = 1;
    config.rate_limit.interval_ms = 100;
    let ctx = AppContext::build(config).await.unwrap();

    let tick = Arc::new(TickAgent {
        starts: std::sync::Mutex::new(Vec::new()),
    });
    ctx.registry
        .register(
            AgentDescriptor {
                agent_id: "tick".to_string(),
                name: "Tick".to_string(),
                version: String::new(),
                category: Some("testing".to_string()),
                tags: vec![],
                capabilities: vec![Capability {
                    name: "tick".to_string(),
                    kind: CapabilityKind::Custom("tick".to_string()),
                    description: String::new(),
                    input_schema: Value::Null,
                    output_schema: Value::Null,
                }],
                enabled: true,
            },
            tick.clone(),
            true,
        )
        .await
        .unwrap();

    let plan = |prefix: &str| {
        let steps: Vec<Value> = (0..5)
            .map(|i| {
                json!({"stepId": format!("{prefix}{i}"), "agentId": "tick",
                       "capability": "tick", "parallelGroup": "g", "priority": 1})
            })
            .collect();
        json!({ "steps": steps })
    };

    let started = Instant::now();
    let r1 = ctx
        .orchestrator
        .submit(TaskRequest {
            plan: Some(plan("a")),
            ..Default::default()
        })
        .await
        .unwrap();
    let r2 = ctx
        .orchestrator
        .submit(TaskRequest {
            plan: Some(plan("b")),
            ..Default::default()
        })
        .await
        .unwrap();

    let t1 = ctx.orchestrator.wait(&r1.task_id).await.unwrap();
    let t2 = ctx.orchestrator.wait(&r2.task_id).await.unwrap();
    assert_eq!(t1.status, TaskStatus::Completed);
    assert_eq!(t2.status, TaskStatus::Completed);

    let starts = tick.starts.lock().unwrap().clone();
    assert_eq!(starts.len(), 10);

    // One invocation per 100 ms window: consecutive starts are at least
    // one interval apart (small scheduling slack allowed).
    let mut sorted = starts.clone();
    sorted.sort();
    for pair in sorted.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(
            gap >= Duration::from_millis(90),
            "starts only {} ms apart",
            gap.as_millis()
        );
    }
    // Ten invocations through a 1-per-100ms bucket take at least ~900 ms.
    assert!(started.elapsed() >= Duration::from_millis(900));
}
