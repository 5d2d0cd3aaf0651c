use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use swarmd::config::{ConfigOverrides, SwarmConfig};
use swarmd::error::{exit_code_for, ErrorKind};
use swarmd::orchestrator::{TaskRequest, TaskStatus};
use swarmd::plan::ExecutionPlan;
use swarmd::AppContext;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "swarmd",
    about = "swarmd — agent-to-agent task execution daemon",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the TOML config file (default: ./swarmd.toml)
    #[arg(long, env = "SWARMD_CONFIG")]
    config: Option<PathBuf>,

    /// WebSocket stream port
    #[arg(long, env = "SWARMD_STREAM_PORT")]
    stream_port: Option<u16>,

    /// HTTP health/metrics port
    #[arg(long, env = "SWARMD_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Shared bearer token required on /stream (empty disables auth)
    #[arg(long, env = "SWARMD_STREAM_TOKEN")]
    stream_token: Option<String>,

    /// Worker pool size (concurrently running steps)
    #[arg(long, env = "SWARMD_MAX_PARALLEL")]
    max_parallel: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SWARMD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "SWARMD_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Suppress progress and informational output.
    ///
    /// Errors are still printed to stderr. Use when piping output.
    #[arg(long, short = 'q', global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon (default when no subcommand given).
    ///
    /// Runs the stream server, the metrics server, and the bus timers in
    /// the foreground until SIGTERM/Ctrl-C.
    ///
    /// Examples:
    ///   swarmd serve
    ///   swarmd
    Serve,
    /// Execute a plan file in-process against the built-in agents.
    ///
    /// Exit code mirrors the task outcome: 0 completed (skipped steps
    /// allowed), 1 failed, 2 cancelled, 3 invalid plan.
    ///
    /// Examples:
    ///   swarmd run --plan plan.json
    ///   swarmd run --plan plan.json --context ctx.json
    Run {
        /// Plan document (JSON)
        #[arg(long)]
        plan: PathBuf,
        /// Initial plan context (JSON object)
        #[arg(long)]
        context: Option<PathBuf>,
    },
    /// Validate a plan file without executing anything.
    ///
    /// Checks ids, dependencies (dangling refs, cycles), guard
    /// expressions, and retry policy. Exit 3 on an invalid plan.
    ///
    /// Examples:
    ///   swarmd validate --plan plan.json
    Validate {
        /// Plan document (JSON)
        #[arg(long)]
        plan: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    let overrides = ConfigOverrides {
        stream_port: args.stream_port,
        metrics_port: args.metrics_port,
        stream_token: args.stream_token.clone(),
        max_parallel_steps: args.max_parallel,
        log: if args.quiet {
            Some("error".to_string())
        } else {
            args.log.clone()
        },
    };
    let config = SwarmConfig::load(args.config.as_deref(), overrides);
    let _log_guard = setup_logging(&config.log, args.log_file.as_deref());

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(config).await,
        Command::Run { plan, context } => run_plan(config, &plan, context.as_deref(), args.quiet).await,
        Command::Validate { plan } => validate_plan(&plan, args.quiet),
    }
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// If the log directory cannot be created, falls back to stdout-only
/// logging with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("swarmd.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .compact()
                .init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    }
}

/// Returns a future that resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C; elsewhere Ctrl-C only.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

// ── swarmd serve ──────────────────────────────────────────────────────────────

async fn run_server(config: SwarmConfig) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "swarmd starting");
    if config.stream.token.is_empty() {
        warn!("no stream token configured — /stream is open to any local client");
    }

    let ctx = AppContext::build(config)
        .await
        .context("failed to wire components")?;
    info!(
        stream_port = ctx.config.stream.port,
        metrics_port = ctx.config.metrics_port,
        max_parallel = ctx.config.engine.max_parallel_steps,
        agents = ctx.registry.len().await,
        "config loaded"
    );

    let cancel = CancellationToken::new();

    let http_task = {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = swarmd::http::run(ctx, cancel).await {
                warn!(err = %e, "metrics server exited with error");
            }
        })
    };
    let bus_task = {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            ctx.bus.run(cancel).await;
        })
    };
    let stream_task = {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = swarmd::stream::run(ctx, cancel).await {
                warn!(err = %e, "stream server exited with error");
            }
        })
    };

    shutdown_signal().await;
    info!("shutdown signal received — draining");

    // Shutdown sequence: refuse new tasks and cancel active ones, emit
    // the final bus event, then stop the transports and timers.
    ctx.orchestrator.drain().await;
    ctx.bus.shutdown().await;
    cancel.cancel();

    let _ = tokio::join!(http_task, bus_task, stream_task);
    info!("swarmd stopped");
    Ok(())
}

// ── swarmd run / validate ─────────────────────────────────────────────────────

fn read_json(path: &std::path::Path) -> Result<serde_json::Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid JSON in {}", path.display()))
}

async fn run_plan(
    config: SwarmConfig,
    plan_path: &std::path::Path,
    context_path: Option<&std::path::Path>,
    quiet: bool,
) -> Result<()> {
    let plan_doc = read_json(plan_path)?;
    let context = match context_path {
        Some(p) => read_json(p)?
            .as_object()
            .cloned()
            .context("context file must hold a JSON object")?,
        None => Default::default(),
    };

    let ctx = AppContext::build(config)
        .await
        .context("failed to wire components")?;

    let receipt = match ctx
        .orchestrator
        .submit(TaskRequest {
            plan: Some(plan_doc),
            context: Some(context),
            ..Default::default()
        })
        .await
    {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{}: {}", e.kind, e.message);
            std::process::exit(exit_code_for(Some(e.kind)));
        }
    };

    let task = ctx
        .orchestrator
        .wait(&receipt.task_id)
        .await
        .context("task vanished before completing")?;

    if !quiet {
        println!("{}", serde_json::to_string_pretty(&task)?);
    }

    let code = match task.status {
        TaskStatus::Completed => 0,
        TaskStatus::Cancelled => exit_code_for(Some(ErrorKind::Cancelled)),
        _ => exit_code_for(Some(task.error.map(|e| e.kind).unwrap_or(ErrorKind::Fatal))),
    };
    std::process::exit(code);
}

fn validate_plan(plan_path: &std::path::Path, quiet: bool) -> Result<()> {
    let doc = read_json(plan_path)?;
    match ExecutionPlan::from_value(doc) {
        Ok(plan) => {
            if !quiet {
                println!("plan {} valid: {} steps", plan.plan_id, plan.steps.len());
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{}: {}", e.kind, e.message);
            std::process::exit(exit_code_for(Some(e.kind)));
        }
    }
}
