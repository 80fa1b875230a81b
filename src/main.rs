use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tapsrv::collector::{report_suffix, SlaveCollector};
use tapsrv::config::{load_config, SubMode};
use tapsrv::coordinator::StoreCoordinator;
use tapsrv::listener;
use tapsrv::storage::StorageManager;

#[derive(Parser, Debug)]
#[command(name = "tapsrv", about = "Passive Modbus RTU capture over TCP gateways")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,

    /// Log filter, e.g. "info" or "tapsrv=debug"
    #[arg(long, env = "TAPSRV_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_level))
        .init();

    let cfg = load_config(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    cfg.validate().context("invalid configuration")?;
    if args.validate {
        info!("configuration ok ({} gateways)", cfg.gateways.len());
        return Ok(());
    }

    info!(
        mode = ?cfg.mode,
        sub_mode = ?cfg.sub_mode,
        gateways = cfg.gateways.len(),
        "starting capture"
    );

    let cancel = CancellationToken::new();

    // Store sub-mode needs working storage and a completable barrier
    // up front; failing late would silently capture without storing.
    let (storage, coordinator) = match cfg.sub_mode {
        SubMode::Store => {
            let storage = Arc::new(StorageManager::new(&cfg.storage)?);
            let coordinator = Arc::new(StoreCoordinator::new(
                &cfg,
                Arc::clone(&storage),
                cancel.clone(),
            )?);
            info!(
                destinations = storage.destination_count(),
                "store sub-mode armed"
            );
            (Some(storage), Some(coordinator))
        }
        SubMode::Test => (None, None),
    };

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    if cfg.sub_mode == SubMode::Test && cfg.test_duration_seconds > 0 {
        let cancel = cancel.clone();
        let secs = cfg.test_duration_seconds;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    info!("test duration reached ({secs}s), shutting down");
                    cancel.cancel();
                }
            }
        });
    }

    let collector = Arc::new(SlaveCollector::new());
    let mut tasks = JoinSet::new();
    for mut gateway in cfg.gateways.clone() {
        if cfg.test_only_valid_crc {
            gateway.skip_invalid_crc = true;
        }
        tasks.spawn(listener::run_gateway(
            cancel.clone(),
            gateway,
            cfg.sub_mode,
            Arc::clone(&collector),
            storage.clone(),
            coordinator.clone(),
        ));
    }
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!("listener task failed: {e}");
        }
    }

    let report_path = PathBuf::from("report").join(format!(
        "slave_ids_detected{}.txt",
        report_suffix(&args.config)
    ));
    match collector.write_report(&report_path) {
        Ok(()) => info!("{} written", report_path.display()),
        Err(e) => warn!("failed to write slave report: {e}"),
    }

    info!("shutdown complete");
    Ok(())
}
