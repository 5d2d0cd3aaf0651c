// SPDX-License-Identifier: MIT
//! Agent invocation seam and built-in stub agents.
//!
//! Agents are opaque executors: the engine hands them a capability kind
//! and a rendered input value, and they return a result value. They never
//! mutate the plan context — the engine merges results after success.
//!
//! The built-ins (`echo`, `timer`, `flaky`) exist so the daemon is usable
//! and testable without any external agent processes. Domain agents
//! register through the same [`AgentHandler`] trait.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, SwarmError};
use crate::registry::{AgentDescriptor, AgentRegistry, Capability, CapabilityKind};

// ─── Invocation seam ──────────────────────────────────────────────────────────

/// Ambient context for one capability invocation.
#[derive(Debug, Clone)]
pub struct InvokeContext {
    /// Remaining budget for this invocation. The engine also enforces this
    /// externally; cooperative agents should stop producing on expiry.
    pub deadline: Duration,
    /// Fired on task cancellation or shutdown.
    pub cancel: CancellationToken,
}

/// One executable agent. Implementations must tolerate repeated inputs —
/// delivery is at-least-once under retry.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn handle(
        &self,
        kind: &CapabilityKind,
        input: Value,
        ctx: InvokeContext,
    ) -> Result<Value, SwarmError>;
}

// ─── echo ─────────────────────────────────────────────────────────────────────

/// Returns its input wrapped in an `echoed` envelope. Referentially
/// transparent; the canonical test agent.
pub struct EchoAgent;

#[async_trait]
impl AgentHandler for EchoAgent {
    async fn handle(
        &self,
        _kind: &CapabilityKind,
        input: Value,
        _ctx: InvokeContext,
    ) -> Result<Value, SwarmError> {
        Ok(json!({ "echoed": input }))
    }
}

// ─── timer ────────────────────────────────────────────────────────────────────

/// Sleeps for `input.ms` milliseconds, honoring cancellation.
pub struct TimerAgent;

#[async_trait]
impl AgentHandler for TimerAgent {
    async fn handle(
        &self,
        _kind: &CapabilityKind,
        input: Value,
        ctx: InvokeContext,
    ) -> Result<Value, SwarmError> {
        let ms = input.get("ms").and_then(Value::as_u64).unwrap_or(0);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                Ok(json!({ "slept_ms": ms }))
            }
            _ = ctx.cancel.cancelled() => {
                Err(SwarmError::cancelled("timer interrupted"))
            }
        }
    }
}

// ─── flaky ────────────────────────────────────────────────────────────────────

/// Fails a scripted number of times per key, then succeeds.
///
/// Input: `{key, failures, kind?, message?}` — the first `failures`
/// invocations for `key` fail with `kind` (default `Transient`); later
/// invocations return `{attempts: n}`. Used to exercise retry policy.
pub struct FlakyAgent {
    counters: Mutex<HashMap<String, u32>>,
}

impl FlakyAgent {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for FlakyAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentHandler for FlakyAgent {
    async fn handle(
        &self,
        _kind: &CapabilityKind,
        input: Value,
        _ctx: InvokeContext,
    ) -> Result<Value, SwarmError> {
        let key = input
            .get("key")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();
        let failures = input.get("failures").and_then(Value::as_u64).unwrap_or(0) as u32;
        let mut counters = self.counters.lock().await;
        let n = counters.entry(key).or_insert(0);
        *n += 1;
        if *n <= failures {
            let kind = input
                .get("kind")
                .and_then(Value::as_str)
                .map(|s| match s {
                    "Fatal" => ErrorKind::Fatal,
                    "Timeout" => ErrorKind::Timeout,
                    "RateLimited" => ErrorKind::RateLimited,
                    _ => ErrorKind::Transient,
                })
                .unwrap_or(ErrorKind::Transient);
            let message = input
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("scripted failure")
                .to_string();
            return Err(SwarmError::new(kind, message));
        }
        Ok(json!({ "attempts": *n }))
    }
}

// ─── Built-in wiring ──────────────────────────────────────────────────────────

fn capability(name: &str, kind: CapabilityKind, description: &str) -> Capability {
    Capability {
        name: name.to_string(),
        kind,
        description: description.to_string(),
        input_schema: json!({ "type": "object" }),
        output_schema: json!({ "type": "object" }),
    }
}

/// Descriptors + handlers for the built-in agents.
pub fn builtin_agents() -> Vec<(AgentDescriptor, Arc<dyn AgentHandler>)> {
    vec![
        (
            AgentDescriptor {
                agent_id: "echo".to_string(),
                name: "Echo".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                category: Some("testing".to_string()),
                tags: vec!["builtin".to_string(), "chat".to_string()],
                capabilities: vec![capability(
                    "chat",
                    CapabilityKind::Chat,
                    "Echo the input back in an `echoed` envelope",
                )],
                enabled: true,
            },
            Arc::new(EchoAgent),
        ),
        (
            AgentDescriptor {
                agent_id: "timer".to_string(),
                name: "Timer".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                category: Some("testing".to_string()),
                tags: vec!["builtin".to_string()],
                capabilities: vec![capability(
                    "wait",
                    CapabilityKind::Custom("wait".to_string()),
                    "Sleep for `ms` milliseconds",
                )],
                enabled: true,
            },
            Arc::new(TimerAgent),
        ),
        (
            AgentDescriptor {
                agent_id: "flaky".to_string(),
                name: "Flaky".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                category: Some("testing".to_string()),
                tags: vec!["builtin".to_string()],
                capabilities: vec![capability(
                    "fail",
                    CapabilityKind::Custom("fail".to_string()),
                    "Fail a scripted number of times, then succeed",
                )],
                enabled: true,
            },
            Arc::new(FlakyAgent::new()),
        ),
    ]
}

/// Register the built-in agents; called from `serve` and `run` wiring.
pub async fn register_builtins(registry: &AgentRegistry) -> Result<(), SwarmError> {
    for (desc, handler) in builtin_agents() {
        registry.register(desc, handler, true).await?;
    }
    Ok(())
}
