//! Query and command dispatch for stream clients.
//!
//! Handled off the broadcast path: each connection task calls in here and
//! writes the correlated `query_result` / `command_result` frame straight
//! back to its own socket.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::bus::Subscriber;
use crate::error::SwarmError;
use crate::events::{Event, EventType};
use crate::orchestrator::{CancelOutcome, TaskRequest};
use crate::registry::AgentFilter;
use crate::AppContext;

// ─── Inbound frames ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct QueryData {
    #[serde(default)]
    pub id: Value,
    pub kind: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Deserialize)]
pub struct CommandData {
    #[serde(default)]
    pub id: Value,
    pub action: String,
    #[serde(default)]
    pub args: Value,
}

/// Client → server message.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Subscribe {
        #[serde(default)]
        channels: Vec<String>,
    },
    Unsubscribe {
        #[serde(default)]
        channels: Vec<String>,
    },
    Query {
        data: QueryData,
    },
    Command {
        data: CommandData,
    },
}

// ─── Queries ──────────────────────────────────────────────────────────────────

fn str_arg(args: &Value, key: &str) -> Result<String, SwarmError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SwarmError::invalid(format!("missing argument {key:?}")))
}

pub async fn dispatch_query(
    ctx: &AppContext,
    subscriber: &Subscriber,
    kind: &str,
    args: &Value,
) -> Result<Value, SwarmError> {
    match kind {
        "task" => {
            let task_id = str_arg(args, "taskId")?;
            let task = ctx
                .orchestrator
                .get(&task_id)
                .await
                .ok_or_else(|| SwarmError::not_found(format!("unknown task {task_id:?}")))?;
            Ok(serde_json::to_value(task).unwrap_or_default())
        }
        "tasks" => Ok(serde_json::to_value(ctx.orchestrator.list_active().await)
            .unwrap_or_default()),
        "history" => {
            let n = args.get("n").and_then(Value::as_u64).unwrap_or(20) as usize;
            Ok(serde_json::to_value(ctx.orchestrator.history(n).await).unwrap_or_default())
        }
        "agents" => {
            let filter = AgentFilter {
                category: args
                    .get("category")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                tag: args.get("tag").and_then(Value::as_str).map(str::to_string),
                enabled_only: args
                    .get("enabledOnly")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                text: args.get("text").and_then(Value::as_str).map(str::to_string),
            };
            Ok(serde_json::to_value(ctx.registry.list(&filter).await).unwrap_or_default())
        }
        "missed" => Ok(serde_json::to_value(subscriber.take_missed()).unwrap_or_default()),
        "metrics" => Ok(ctx.metrics.snapshot()),
        other => Err(SwarmError::invalid(format!("unknown query kind {other:?}"))),
    }
}

// ─── Commands ─────────────────────────────────────────────────────────────────

pub async fn dispatch_command(
    ctx: &AppContext,
    action: &str,
    args: &Value,
) -> Result<Value, SwarmError> {
    match action {
        "submit" => {
            let request: TaskRequest = serde_json::from_value(args.clone())
                .map_err(|e| SwarmError::invalid(format!("malformed task request: {e}")))?;
            let receipt = ctx.orchestrator.submit(request).await?;
            Ok(serde_json::to_value(receipt).unwrap_or_default())
        }
        "cancel" => {
            let task_id = str_arg(args, "taskId")?;
            let outcome = ctx.orchestrator.cancel(&task_id).await;
            match outcome {
                CancelOutcome::NotFound => {
                    Err(SwarmError::not_found(format!("unknown task {task_id:?}")))
                }
                CancelOutcome::Cancelled => Ok(json!({ "cancelled": true })),
                CancelOutcome::AlreadyTerminal => Ok(json!({ "cancelled": false })),
            }
        }
        "agent.enable" | "agent.disable" => {
            let agent_id = str_arg(args, "agentId")?;
            let enabled = action == "agent.enable";
            if ctx.registry.set_enabled(&agent_id, enabled).await {
                Ok(json!({ "agentId": agent_id, "enabled": enabled }))
            } else {
                Err(SwarmError::not_found(format!("unknown agent {agent_id:?}")))
            }
        }
        "configure" => {
            let requested = args
                .get("broadcastMs")
                .and_then(Value::as_u64)
                .ok_or_else(|| SwarmError::invalid("missing argument \"broadcastMs\""))?;
            let applied = ctx.bus.set_broadcast_ms(requested);
            ctx.bus
                .publish(&Event::bare(
                    EventType::ConfigUpdated,
                    json!({ "broadcastMs": applied }),
                ))
                .await;
            Ok(json!({ "broadcastMs": applied }))
        }
        other => Err(SwarmError::invalid(format!("unknown command {other:?}"))),
    }
}
