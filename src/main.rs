#![forbid(unsafe_code)]

//! `agent-bridge` — Slack agent execution bridge binary.
//!
//! Bootstraps configuration, discovers task directories, loads the session
//! store, and runs the Slack Socket Mode integration until shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_bridge::auth::Allowlist;
use agent_bridge::files::FileHandler;
use agent_bridge::runner::{PermissionMode, Runner};
use agent_bridge::session::SessionStore;
use agent_bridge::slack::{BotState, SlackService};
use agent_bridge::tasks::TaskRegistry;
use agent_bridge::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Json,
    Console,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "agent-bridge", about = "Slack agent execution bridge", version, long_about = None)]
struct Cli {
    /// Slack bot token (xoxb-...).
    #[arg(long, env = "SLACK_BOT_TOKEN")]
    slack_bot_token: String,

    /// Slack app token for Socket Mode (xapp-...).
    #[arg(long, env = "SLACK_APP_TOKEN")]
    slack_app_token: String,

    /// Comma-separated list of allowed Slack user IDs.
    #[arg(long, env = "ALLOWED_USERS", value_delimiter = ',')]
    allowed_users: Vec<String>,

    /// Path to the session store JSON file.
    #[arg(long, env = "SESSION_STORE_PATH", default_value = "sessions.json")]
    session_store_path: PathBuf,

    /// Base path to search for agent task directories.
    #[arg(long, env = "AGENTS_PATH", default_value = ".")]
    agents_path: PathBuf,

    /// Timeout for agent execution (e.g. 90s, 30m, 2h).
    #[arg(long, env = "CLOD_TIMEOUT", default_value = "30m", value_parser = parse_duration)]
    clod_timeout: Duration,

    /// Permission mode forwarded to the agent.
    #[arg(long, env = "PERMISSION_MODE", value_enum, default_value_t = PermissionMode::Default)]
    permission_mode: PermissionMode,

    /// Agent prompt file copied into each runtime workspace.
    #[arg(long, env = "AGENTS_PROMPT_PATH")]
    agents_prompt_path: Option<PathBuf>,

    /// Log level.
    #[arg(long = "log.level", env = "LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Log output format.
    #[arg(long = "log.format", env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    /// Time to wait for graceful shutdown before forcing exit.
    #[arg(long, env = "GRACEFUL_SHUTDOWN_TTL", default_value = "30s", value_parser = parse_duration)]
    graceful_shutdown_ttl: Duration,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_level, args.log_format)?;
    info!("agent-bridge bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Build components ────────────────────────────────
    let auth = Allowlist::new(args.allowed_users.into_iter().filter(|id| !id.is_empty()));
    if auth.is_empty() {
        warn!("allowlist is empty; every user will be rejected");
    }

    let tasks = TaskRegistry::discover(&args.agents_path)?;
    info!(tasks = ?tasks.list(), "discovered tasks");

    let sessions = Arc::new(SessionStore::load(&args.session_store_path)?);
    info!(
        session_count = sessions.count(),
        path = %args.session_store_path.display(),
        "loaded sessions from storage"
    );

    let runner = Runner::new(
        args.clod_timeout,
        args.permission_mode,
        args.agents_prompt_path,
    );

    let slack = Arc::new(SlackService::new(
        &args.slack_bot_token,
        &args.slack_app_token,
    )?);
    let files = FileHandler::new(Arc::clone(&slack));

    let state = Arc::new(BotState {
        auth,
        tasks,
        sessions: Arc::clone(&sessions),
        runner,
        slack: Arc::clone(&slack),
        files,
        live_tasks: dashmap::DashMap::new(),
        pending_permissions: dashmap::DashMap::new(),
    });

    // ── Start Socket Mode ───────────────────────────────
    let socket_task = slack.start_socket_mode(Arc::clone(&state));
    info!("socket mode started");

    // ── Wait for first shutdown signal ──────────────────
    shutdown_signal().await;
    warn!(
        ttl_secs = args.graceful_shutdown_ttl.as_secs(),
        "shutting down gracefully (send again to force)"
    );

    // Spawn a background listener for a second signal (force-exit).
    tokio::spawn(async {
        shutdown_signal().await;
        error!("second shutdown signal received — forcing exit");
        std::process::exit(1);
    });

    // Cancel every live task; each pump finishes and persists its session.
    for entry in state.live_tasks.iter() {
        entry.value().cancel();
    }

    let drained = tokio::time::timeout(args.graceful_shutdown_ttl, async {
        while !state.live_tasks.is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    if drained.is_err() {
        error!(
            elapsed_secs = args.graceful_shutdown_ttl.as_secs(),
            "graceful shutdown timeout: forcing exit"
        );
        std::process::exit(1);
    }

    socket_task.abort();

    // ── Save sessions before exit ───────────────────────
    if let Err(err) = sessions.save() {
        error!(%err, "failed to save sessions");
        return Err(err);
    }

    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(level: LogLevel, format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));
    let subscriber = fmt().with_env_filter(env_filter);

    match format {
        LogFormat::Console => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}

/// Parse a duration flag: bare seconds or `ms`/`s`/`m`/`h` suffixes.
fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (value, unit) = raw.split_at(split);
    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid duration: {raw:?}"))?;

    match unit {
        "" | "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(format!("invalid duration unit: {unit:?}")),
    }
}
