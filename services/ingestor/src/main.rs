// ingestor: Field telemetry ingestion service.
//
// Keeps a live broker subscription for one sensor, backfills from the storage
// query endpoint on a schedule, and serves the ingestion/read HTTP surface.

use clap::{Arg, ArgAction, Command};
use ingestor::config::{DEFAULT_CONFIG_PATH, load_config_from_path};
use ingestor::runtime;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "ingestor starting");

    let matches = Command::new("Field Telemetry: Ingestor")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Ingests sensor uplinks from a broker subscription and a storage endpoint")
        .arg(
            Arg::new("config")
                .long("config")
                .help("Path to the TOML config file")
                .value_name("path")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("once")
                .long("once")
                .help("Run a single backfill poll and exit")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let Some(config_path) = matches.get_one::<PathBuf>("config") else {
        eprintln!("FATAL: --config requires a path argument");
        std::process::exit(1);
    };

    let cfg = match load_config_from_path(config_path) {
        Ok(cfg) => {
            info!(
                application_id = %cfg.device.application_id,
                device_id = %cfg.device.device_id,
                broker_enabled = cfg.broker.enabled,
                storage_enabled = cfg.storage.enabled,
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if matches.get_flag("once") {
        match runtime::run_once(&cfg).await {
            Ok(report) => {
                info!(
                    records = report.records,
                    inserted = report.inserted,
                    duplicate = report.duplicate,
                    rejected = report.rejected,
                    "one-shot poll complete"
                );
                return;
            }
            Err(e) => {
                eprintln!("FATAL: one-shot poll failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    let listener = match TcpListener::bind(&cfg.http.bind).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("FATAL: failed to bind {}: {}", cfg.http.bind, e);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut engine = tokio::spawn(runtime::run(cfg, listener, shutdown_rx));

    // Startup failures end the engine before any signal arrives.
    let finished_early = tokio::select! {
        _ = wait_for_signal() => None,
        result = &mut engine => Some(result),
    };
    let result = match finished_early {
        Some(result) => result,
        None => {
            shutdown_tx.send(true).ok();
            engine.await
        }
    };

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            eprintln!("FATAL: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "engine task panicked");
            std::process::exit(1);
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                tokio::signal::ctrl_c().await.ok();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("shutdown: SIGINT received"),
            _ = sigterm.recv() => info!("shutdown: SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown: Ctrl-C received");
    }
}
