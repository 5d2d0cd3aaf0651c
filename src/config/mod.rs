use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_MAX_PARALLEL_STEPS: usize = 10;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_MS: u64 = 250;
const DEFAULT_STEP_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_RATE_MAX_PER_INTERVAL: u32 = 10;
const DEFAULT_RATE_INTERVAL_MS: u64 = 1_000;
const DEFAULT_STREAM_PORT: u16 = 4800;
const DEFAULT_STREAM_HOST: &str = "127.0.0.1";
const DEFAULT_BROADCAST_MS: u64 = 1_000;
/// Floor for the metrics broadcast cadence.
const MIN_BROADCAST_MS: u64 = 250;
const DEFAULT_MAX_BUFFERED_BYTES: usize = 512 * 1024;
const DEFAULT_METRICS_PORT: u16 = 4801;
const DEFAULT_HISTORY_SIZE: usize = 100;

// ─── TOML config file ─────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
struct RateLimitToml {
    /// Token bucket size (requests per interval).
    max_per_interval: Option<u32>,
    /// Token bucket window in milliseconds.
    interval_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct StreamToml {
    /// Bind port for the WebSocket push channel.
    port: Option<u16>,
    /// Bind host for the WebSocket push channel.
    host: Option<String>,
    /// Shared bearer token required by `/stream`. Empty disables auth.
    token: Option<String>,
    /// Metrics broadcast cadence in milliseconds (floor: 250).
    broadcast_ms: Option<u64>,
    /// Per-subscriber backpressure high-water mark in bytes.
    max_buffered_bytes: Option<usize>,
}

#[derive(Deserialize, Default)]
struct MetricsToml {
    /// Bind port for the HTTP health/metrics surface.
    port: Option<u16>,
}

/// `swarmd.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    max_parallel_steps: Option<usize>,
    max_retries: Option<u32>,
    retry_base_ms: Option<u64>,
    step_timeout_ms: Option<u64>,
    history_size: Option<usize>,
    /// Log level filter string, e.g. "debug", "info,swarmd=trace".
    log: Option<String>,
    rate_limit: Option<RateLimitToml>,
    stream: Option<StreamToml>,
    metrics: Option<MetricsToml>,
}

fn load_toml(path: &Path) -> Option<TomlConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config file — using defaults");
            None
        }
    }
}

// ─── SwarmConfig ──────────────────────────────────────────────────────────────

/// Engine knobs, resolved from all layers.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker-pool size: upper bound on concurrently running steps.
    pub max_parallel_steps: usize,
    /// Global ceiling over any per-step `max_attempts`.
    pub max_retries: u32,
    /// Default backoff base when a step does not specify one.
    pub retry_base_ms: u64,
    /// Fallback per-step deadline; the shorter of this and the step's
    /// own `timeout_ms` wins.
    pub step_timeout_ms: u64,
}

/// Token-bucket rate limiter knobs.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_per_interval: u32,
    pub interval_ms: u64,
}

/// Streaming push channel knobs.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub port: u16,
    pub host: String,
    /// Shared bearer token. Empty string disables auth (not recommended).
    pub token: String,
    pub broadcast_ms: u64,
    pub max_buffered_bytes: usize,
}

/// Fully resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub engine: EngineConfig,
    pub rate_limit: RateLimitConfig,
    pub stream: StreamConfig,
    pub metrics_port: u16,
    /// In-memory task history ring length.
    pub history_size: usize,
    pub log: String,
}

/// CLI/env overrides collected by clap in `main.rs`.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub stream_port: Option<u16>,
    pub metrics_port: Option<u16>,
    pub stream_token: Option<String>,
    pub max_parallel_steps: Option<usize>,
    pub log: Option<String>,
}

impl SwarmConfig {
    /// Build config from CLI/env overrides + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file (default `swarmd.toml` in the working directory)
    ///   3. Built-in defaults
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> Self {
        let toml = config_path
            .map(Path::to_path_buf)
            .or_else(|| Some(PathBuf::from("swarmd.toml")))
            .and_then(|p| load_toml(&p))
            .unwrap_or_default();

        let rate = toml.rate_limit.unwrap_or_default();
        let stream = toml.stream.unwrap_or_default();
        let metrics = toml.metrics.unwrap_or_default();

        let broadcast_ms = stream
            .broadcast_ms
            .unwrap_or(DEFAULT_BROADCAST_MS)
            .max(MIN_BROADCAST_MS);

        Self {
            engine: EngineConfig {
                max_parallel_steps: overrides
                    .max_parallel_steps
                    .or(toml.max_parallel_steps)
                    .unwrap_or(DEFAULT_MAX_PARALLEL_STEPS)
                    .max(1),
                max_retries: toml.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
                retry_base_ms: toml.retry_base_ms.unwrap_or(DEFAULT_RETRY_BASE_MS),
                step_timeout_ms: toml.step_timeout_ms.unwrap_or(DEFAULT_STEP_TIMEOUT_MS),
            },
            rate_limit: RateLimitConfig {
                max_per_interval: rate
                    .max_per_interval
                    .unwrap_or(DEFAULT_RATE_MAX_PER_INTERVAL)
                    .max(1),
                interval_ms: rate.interval_ms.unwrap_or(DEFAULT_RATE_INTERVAL_MS).max(1),
            },
            stream: StreamConfig {
                port: overrides
                    .stream_port
                    .or(stream.port)
                    .unwrap_or(DEFAULT_STREAM_PORT),
                host: stream
                    .host
                    .unwrap_or_else(|| DEFAULT_STREAM_HOST.to_string()),
                token: overrides.stream_token.or(stream.token).unwrap_or_default(),
                broadcast_ms,
                max_buffered_bytes: stream
                    .max_buffered_bytes
                    .unwrap_or(DEFAULT_MAX_BUFFERED_BYTES),
            },
            metrics_port: overrides
                .metrics_port
                .or(metrics.port)
                .unwrap_or(DEFAULT_METRICS_PORT),
            history_size: toml.history_size.unwrap_or(DEFAULT_HISTORY_SIZE).max(1),
            log: overrides.log.or(toml.log).unwrap_or_else(|| "info".to_string()),
        }
    }
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self::load(Some(Path::new("/nonexistent")), ConfigOverrides::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_when_no_file() {
        let cfg = SwarmConfig::default();
        assert_eq!(cfg.engine.max_parallel_steps, 10);
        assert_eq!(cfg.engine.max_retries, 3);
        assert_eq!(cfg.stream.port, DEFAULT_STREAM_PORT);
        assert_eq!(cfg.stream.max_buffered_bytes, 512 * 1024);
        assert_eq!(cfg.history_size, 100);
        assert!(cfg.stream.token.is_empty());
    }

    #[test]
    fn toml_layer_applies_under_cli() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"
max_parallel_steps = 4
retry_base_ms = 50

[rate_limit]
max_per_interval = 2
interval_ms = 100

[stream]
port = 9000
token = "s3cret"
broadcast_ms = 100

[metrics]
port = 9001
"#
        )
        .unwrap();

        let cfg = SwarmConfig::load(
            Some(f.path()),
            ConfigOverrides {
                stream_port: Some(9100),
                ..Default::default()
            },
        );
        // CLI wins over TOML.
        assert_eq!(cfg.stream.port, 9100);
        // TOML wins over defaults.
        assert_eq!(cfg.engine.max_parallel_steps, 4);
        assert_eq!(cfg.engine.retry_base_ms, 50);
        assert_eq!(cfg.rate_limit.max_per_interval, 2);
        assert_eq!(cfg.rate_limit.interval_ms, 100);
        assert_eq!(cfg.stream.token, "s3cret");
        assert_eq!(cfg.metrics_port, 9001);
        // Broadcast cadence is floored at 250 ms.
        assert_eq!(cfg.stream.broadcast_ms, 250);
    }

    #[test]
    fn malformed_toml_falls_back_to_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "max_parallel_steps = \"not a number\"").unwrap();
        let cfg = SwarmConfig::load(Some(f.path()), ConfigOverrides::default());
        assert_eq!(cfg.engine.max_parallel_steps, 10);
    }
}
