use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use deckd::auth::{StaticToken, TokenProvider};
use deckd::backend::HttpTaskBackend;
use deckd::config::{LogConfig, SyncConfig};
use deckd::notify::LogSink;
use deckd::pipeline::Pipeline;
use deckd::retry::RetryConfig;

#[derive(Parser)]
#[command(
    name = "deckd",
    about = "TaskDeck live-sync engine — streams agent activity and task mutations into local state",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config.toml
    #[arg(long, env = "DECKD_CONFIG")]
    config: Option<PathBuf>,

    /// WebSocket push stream URL (overrides config)
    #[arg(long, env = "DECKD_STREAM_URL")]
    stream_url: Option<String>,

    /// REST API base URL (overrides config)
    #[arg(long, env = "DECKD_API_URL")]
    api_url: Option<String>,

    /// Bearer token for the push stream and the REST API
    #[arg(long, env = "DECKD_TOKEN")]
    token: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "DECKD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "DECKD_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sync engine in the foreground (default when no subcommand given).
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config =
        SyncConfig::load(args.config.as_deref()).context("failed to load config")?;
    if let Some(url) = args.stream_url {
        config.stream_url = url;
    }
    if let Some(url) = args.api_url {
        config.api_base_url = url;
    }
    if let Some(level) = args.log {
        config.log.level = Some(level);
    }
    if let Some(path) = args.log_file {
        config.log.file = Some(path);
    }

    // Keep the guard alive for the process lifetime; dropping it would
    // stop the background log writer.
    let _log_guard = init_tracing(&config.log);
    if let Some(path) = &args.config {
        info!(path = %path.display(), "config loaded");
    }

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, args.token).await,
    }
}

async fn serve(config: SyncConfig, token: String) -> Result<()> {
    info!(stream = %config.stream_url, api = %config.api_base_url, "starting deckd");

    let token: Arc<dyn TokenProvider> = Arc::new(StaticToken(token));
    let backend = Arc::new(
        HttpTaskBackend::new(
            config.api_base_url.clone(),
            token.clone(),
            RetryConfig::default(),
        )
        .context("failed to build backend client")?,
    );
    let (pipeline, _views, stop) = Pipeline::new(&config, token, backend, Arc::new(LogSink));

    let run = tokio::spawn(pipeline.run());

    make_shutdown_future().await;
    info!("shutdown signal received — stopping sync pipeline");
    stop.stop();

    run.await.context("pipeline task failed")??;
    Ok(())
}

fn init_tracing(log: &LogConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(log.level.as_deref().unwrap_or("info"))
    });

    match &log.file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "deckd.log".to_string());
            let appender = tracing_appender::rolling::daily(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false);
            if log.json {
                builder.json().init();
            } else {
                builder.init();
            }
            Some(guard)
        }
        None => {
            let builder = tracing_subscriber::fmt().with_env_filter(filter);
            if log.json {
                builder.json().init();
            } else {
                builder.init();
            }
            None
        }
    }
}

/// Returns a future that resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C.
/// On other platforms we listen for Ctrl-C only.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(err = %e, "failed to register SIGTERM handler");
                tokio::signal::ctrl_c().await.ok();
                return;
            }
        };
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
