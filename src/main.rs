use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use warden::cli::{self, Cli, Commands};
use warden::config::{AppConfig, LoggingConfig};
use warden::coordination::{install_signal_handlers, ShutdownSignal};
use warden::services;
use warden::supervisor::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let config = AppConfig::load_from(&args.config_dir)
        .with_context(|| format!("loading configuration from {}", args.config_dir))?;

    match args.command.clone().unwrap_or(Commands::Run) {
        Commands::CheckConfig => cli::check_config(&config),
        Commands::Audit { venue, apply } => {
            init_console_only();
            cli::check_config_quiet(&config)?;
            let engine = Engine::build(config).await?;
            cli::run_audit(&engine, venue, apply, args.json).await
        }
        Commands::Status { venue, all } => {
            init_console_only();
            let engine = Engine::build(config).await?;
            cli::run_status(&engine, venue, all, args.json).await
        }
        Commands::Run => {
            let _guard = init_logging(&config.logging);
            run(config).await
        }
    }
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    cli::check_config_quiet(&config)?;

    let status_server = config.status_server.clone();
    let engine = Arc::new(Engine::build(config).await?);
    engine.start().await?;
    install_signal_handlers(engine.shutdown_handle());
    info!(venues = ?engine.venues(), "Warden running");

    let server = if status_server.enabled {
        let engine = engine.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = services::serve(engine, status_server.port).await {
                error!("Status server stopped: {}", e);
            }
        }))
    } else {
        None
    };

    engine.wait_for_shutdown_request().await;
    info!("Shutdown requested, draining venue loops");
    if let Err(e) = engine.shutdown(ShutdownSignal::Graceful).await {
        warn!("Shutdown incomplete: {}", e);
    }
    if let Some(server) = server {
        let _ = server.await;
    }
    info!("Warden stopped");
    Ok(())
}

/// Console plus optional daily rolling file; the returned guard flushes the file writer on drop
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn", config.level)));

    let console = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .boxed()
    };

    let (file, guard) = match config.directory.as_deref().and_then(writable_dir) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "warden.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();
    guard
}

// rolling::daily panics when the first file cannot be created
fn writable_dir(dir: &str) -> Option<&str> {
    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!("Warning: could not create log directory {} ({}), file logging disabled", dir, e);
        return None;
    }
    let probe = std::path::Path::new(dir).join(".warden_write_test");
    match std::fs::OpenOptions::new().create(true).append(true).open(&probe) {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            Some(dir)
        }
        Err(e) => {
            eprintln!("Warning: could not write to log directory {} ({}), file logging disabled", dir, e);
            None
        }
    }
}

fn init_console_only() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .try_init();
}
