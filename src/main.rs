//! Transcribe Relay service binary.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};
use transcribe_relay::config::{DEFAULT_WORKER_BASE_URL, DEFAULT_WORKER_WS_URL};
use transcribe_relay::server::{router, AppState};
use transcribe_relay::{Config, Database, EventChannel, Orchestrator, WorkerClient};

#[derive(Parser, Debug)]
#[command(name = "transcribe-relay")]
#[command(about = "Orchestration relay for a transcription and risk-analysis worker")]
#[command(version)]
struct Args {
    /// Address for the relay's own HTTP API
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Base URL of the worker backend
    #[arg(long, default_value = DEFAULT_WORKER_BASE_URL)]
    worker_url: String,

    /// WebSocket URL of the worker's push feed
    #[arg(long, default_value = DEFAULT_WORKER_WS_URL)]
    worker_ws_url: String,

    /// Path to the SQLite database file
    #[arg(long, default_value = "transcribe-relay.db")]
    db: PathBuf,

    /// Submission timeout in seconds
    #[arg(long, default_value_t = 30)]
    submit_timeout: u64,

    /// Transient transport failures tolerated per polling loop
    #[arg(long, default_value_t = 5)]
    poll_retry_budget: u32,

    /// Push-channel reconnect attempts before degrading to polling only
    #[arg(long, default_value_t = 10)]
    ws_max_reconnects: u32,

    /// Log level
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.as_filter())),
        )
        .init();

    info!(
        version = transcribe_relay::VERSION,
        worker = %args.worker_url,
        "starting transcribe-relay"
    );

    let config = Config {
        worker_base_url: args.worker_url.clone(),
        worker_ws_url: args.worker_ws_url.clone(),
        submit_timeout: Duration::from_secs(args.submit_timeout),
        poll_retry_budget: args.poll_retry_budget,
        ws_max_reconnects: args.ws_max_reconnects,
        ..Config::default()
    };

    let db = Database::open(&args.db)
        .await
        .with_context(|| format!("opening database at {}", args.db.display()))?;

    let client = WorkerClient::new(&config.worker_base_url).context("building worker client")?;

    let events = Arc::new(EventChannel::new(
        config.worker_ws_url.clone(),
        config.ws_max_reconnects,
        config.ws_keepalive,
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Push-channel supervisor; the service stays up in polling-only mode
    // if it degrades.
    let channel = events.clone();
    let channel_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move {
        if let Err(err) = channel.run(channel_shutdown).await {
            error!("event channel supervisor exited: {err}");
        }
    });

    let orchestrator = Arc::new(Orchestrator::new(
        db.clone(),
        client.clone(),
        events.clone(),
        config,
    ));

    // Settles terminal push events for jobs with no live watcher
    // (cancelled, exhausted, or inherited from a previous process).
    orchestrator.spawn_event_settler();

    let resumed = orchestrator
        .resume_tracking()
        .await
        .context("resuming in-flight jobs")?;
    if resumed > 0 {
        info!(resumed, "respawned watchers for in-flight jobs");
    }

    let app = router(AppState {
        db: db.clone(),
        orchestrator: orchestrator.clone(),
        client,
    });

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    info!(listen = %args.listen, "relay API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving relay API")?;

    info!("shutting down");
    let _ = shutdown_tx.send(());
    orchestrator.abort_watchers();
    db.close().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => error!("could not install SIGTERM handler: {err}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received terminate signal"),
    }
}
