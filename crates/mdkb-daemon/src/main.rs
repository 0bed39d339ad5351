//! mdkb-daemon: keeps the markdown index in sync and serves queries
//!
//! Runs in the foreground; use a service manager to background it.

use anyhow::{Context, Result};
use clap::Parser;
use mdkb_daemon::config::{load_layers, Config, DaemonConfig, IndexConfig, LogConfig, StoreConfig};
use mdkb_daemon::{Coordinator, CoordinatorLimits, Server, ServerOptions, Settings};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mdkb-daemon")]
#[command(about = "mdkb daemon - watches a markdown directory and serves semantic search")]
#[command(version)]
struct Args {
    /// Directory of documents to index
    #[arg(long)]
    root: Option<PathBuf>,

    /// Config file (default: the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Socket path
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Database path
    #[arg(long)]
    db: Option<PathBuf>,

    /// Log level or filter directive (RUST_LOG takes precedence)
    #[arg(long)]
    log_level: Option<String>,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    /// Command-line flags as the last configuration layer
    fn config_layer(&self) -> Config {
        Config {
            index: Some(IndexConfig {
                root: self.root.clone(),
                extensions: None,
            }),
            store: Some(StoreConfig {
                path: self.db.clone(),
                timeout_secs: None,
            }),
            daemon: Some(DaemonConfig {
                socket: self.socket.clone(),
                ..Default::default()
            }),
            log: Some(LogConfig {
                level: self.log_level.clone(),
            }),
            ..Default::default()
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_layers(args.config.as_deref(), |key| std::env::var(key).ok())?
        .merge(args.config_layer());
    let settings = Settings::resolve(config)?;

    init_logging(&settings, args.log_file.as_ref())?;
    tracing::info!("mdkb-daemon starting (pid: {})", std::process::id());

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    let result = rt.block_on(async_main(&settings));
    if let Err(e) = &result {
        tracing::error!("{:#}", e);
    }
    result
}

fn init_logging(settings: &Settings, log_file: Option<&PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .with_context(|| format!("Invalid log level {:?}", settings.log_level))?;

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

async fn async_main(settings: &Settings) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    tracing::info!(
        "Indexing {} ({}) into {}",
        settings.root.display(),
        settings.extensions.join(", "),
        settings.db_path.display()
    );

    let reconciler = Arc::new(settings.open_reconciler()?);
    let coordinator = Arc::new(Coordinator::new(reconciler, CoordinatorLimits::from(settings)));
    coordinator.probe_embedding().await?;

    let server = Server::new(
        &settings.socket_path,
        Arc::clone(&coordinator),
        ServerOptions::from(settings),
    )?;

    tokio::select! {
        result = server.run() => {
            result?;
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, shutting down");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, shutting down");
        }
        _ = sighup.recv() => {
            tracing::info!("Received SIGHUP, shutting down");
        }
    }

    std::fs::remove_file(&settings.socket_path).ok();

    tracing::info!("mdkb-daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["mdkb-daemon"]);
        assert!(args.root.is_none());
        assert!(args.socket.is_none());
        assert!(args.db.is_none());
        assert!(args.config.is_none());
    }

    #[test]
    fn test_args_custom_paths() {
        let args = Args::parse_from([
            "mdkb-daemon",
            "--root",
            "/notes",
            "--socket",
            "/tmp/custom.sock",
            "--db",
            "/tmp/custom.db",
        ]);

        assert_eq!(args.root.as_deref(), Some(Path::new("/notes")));
        assert_eq!(args.socket.as_deref(), Some(Path::new("/tmp/custom.sock")));
        assert_eq!(args.db.as_deref(), Some(Path::new("/tmp/custom.db")));
    }

    #[test]
    fn test_cli_layer_overrides_file_layer() {
        let file = Config {
            index: Some(IndexConfig {
                root: Some(PathBuf::from("/from-file")),
                extensions: Some(vec!["md".to_string(), "txt".to_string()]),
            }),
            ..Default::default()
        };
        let args = Args::parse_from(["mdkb-daemon", "--root", "/from-cli"]);

        let merged = file.merge(args.config_layer());
        let index = merged.index.unwrap();
        assert_eq!(index.root.as_deref(), Some(Path::new("/from-cli")));
        // Unset flags leave lower layers alone
        assert_eq!(index.extensions.map(|e| e.len()), Some(2));
    }
}
