use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use campaign_dispatch::{config, db, mailer, scheduler, worker};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Dispatch every due scheduled campaign once and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Also run the dispatch workers until no task is due
    #[arg(long)]
    drain: bool,
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

    let report = scheduler::dispatch_scheduled_campaigns(&pool, cfg.dispatch.scan_chunk_size).await?;
    info!(
        claimed = report.claimed,
        enqueued = report.enqueued,
        skipped = report.skipped,
        errored = report.errored,
        "scan complete"
    );

    if args.drain {
        let mailer = mailer::from_config(&cfg.mail)?;
        worker::drain(&pool, mailer, &cfg.worker_options(), cfg.dispatch.workers).await?;
        let remaining = db::queue::count_pending(&pool).await?;
        info!(remaining, "queue drained; remaining tasks are in backoff");
    }

    pool.close().await;
    Ok(())
}
