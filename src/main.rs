use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use campaign_dispatch::{config, db, mailer, scheduler, worker};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let mailer = mailer::from_config(&cfg.mail)?;
    let opts = cfg.worker_options();

    // Dispatch workers
    let workers = worker::run_pool(
        cfg.dispatch.workers,
        &pool,
        mailer,
        &opts,
        cfg.poll_interval(),
    );

    // Scheduled campaign scan
    let scan = tokio::spawn(scheduler::run(
        pool.clone(),
        Duration::from_secs(cfg.dispatch.scan_interval_seconds),
        cfg.dispatch.scan_chunk_size,
    ));

    info!(
        workers = cfg.dispatch.workers,
        scan_interval_seconds = cfg.dispatch.scan_interval_seconds,
        "campaign dispatcher running"
    );
    tokio::signal::ctrl_c().await?;
    warn!("shutdown requested; leased tasks become claimable again after their lease");

    scan.abort();
    for handle in workers {
        handle.abort();
    }
    pool.close().await;
    Ok(())
}
