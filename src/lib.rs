pub mod agents;
pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod http;
pub mod limiter;
pub mod metrics;
pub mod orchestrator;
pub mod plan;
pub mod planner;
pub mod registry;
pub mod stream;

use std::sync::Arc;

use config::SwarmConfig;
use engine::ParallelExecutionEngine;
use limiter::{RateLimiter, SharedLimiter};
use metrics::{SharedMetrics, SwarmMetrics};
use orchestrator::{SharedOrchestrator, TaskOrchestrator};
use planner::StubPlanner;
use registry::{AgentRegistry, SharedRegistry};

use crate::bus::{ProgressBus, SharedBus};
use crate::events::{Event, EventType};

/// Shared application state passed to every transport handler and
/// background task.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<SwarmConfig>,
    pub registry: SharedRegistry,
    pub bus: SharedBus,
    pub limiter: SharedLimiter,
    pub engine: Arc<ParallelExecutionEngine>,
    pub orchestrator: SharedOrchestrator,
    pub metrics: SharedMetrics,
    pub started_at: std::time::Instant,
}

impl AppContext {
    /// Wire the full component graph: registry (with built-in agents),
    /// rate limiter (retry hook pointed at the bus), engine, and
    /// orchestrator with the stub planner.
    pub async fn build(config: SwarmConfig) -> Result<Arc<Self>, error::SwarmError> {
        let config = Arc::new(config);
        let metrics: SharedMetrics = Arc::new(SwarmMetrics::new());
        let registry: SharedRegistry = Arc::new(AgentRegistry::new());
        agents::register_builtins(&registry).await?;

        let bus: SharedBus = Arc::new(ProgressBus::new(
            config.stream.max_buffered_bytes,
            config.stream.broadcast_ms,
            metrics.clone(),
        ));

        let limiter: SharedLimiter = Arc::new(RateLimiter::new(
            &config.rate_limit,
            config.engine.max_retries,
            config.engine.retry_base_ms,
        ));
        {
            let bus = bus.clone();
            limiter.set_retry_hook(Arc::new(move |attempt, wait_ms| {
                let bus = bus.clone();
                tokio::spawn(async move {
                    bus.publish(&Event::bare(
                        EventType::RateLimitedRetry,
                        serde_json::json!({ "attempt": attempt, "waitMs": wait_ms }),
                    ))
                    .await;
                });
            }));
        }

        let engine = Arc::new(ParallelExecutionEngine::new(
            config.engine.clone(),
            registry.clone(),
            limiter.clone(),
            bus.clone(),
            metrics.clone(),
        ));

        let planner = Arc::new(StubPlanner::new(registry.clone()));
        let orchestrator: SharedOrchestrator = Arc::new(TaskOrchestrator::new(
            registry.clone(),
            planner,
            engine.clone(),
            bus.clone(),
            metrics.clone(),
            config.history_size,
        ));

        Ok(Arc::new(Self {
            config,
            registry,
            bus,
            limiter,
            engine,
            orchestrator,
            metrics,
            started_at: std::time::Instant::now(),
        }))
    }
}
