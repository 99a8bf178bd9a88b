mod cli;
mod logging;
mod shutdown;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use photoflow_batch::{
    AppState, BatchCoordinator, BatchLimits, DlqAdmin, JobStore, ProgressBroadcaster, router,
};
use photoflow_engine::{
    Analyzer, DlqInspector, HealthChecker, ObjectStore, Processor, Publisher, WorkerPool,
};
use photoflow_exiftool::ExifTool;
use photoflow_vision::{ModelSelector, OpenRouterClient, VisionApi};

use crate::cli::Cli;
use crate::shutdown::{ShutdownEvent, spawn_signal_handler};

/// Terminal batch jobs are kept for this long after completion.
const JOB_RETENTION: Duration = Duration::from_secs(24 * 3600);
/// Sweep cadence for evicting old terminal jobs.
const JOB_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, &cli.log_format)?;
    info!(version = env!("CARGO_PKG_VERSION"), "photoflow starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Object store first; nothing works without the buckets.
    let store = Arc::new(ObjectStore::connect(cli.storage()));
    store
        .ensure_buckets()
        .await
        .context("prepare object-store buckets")?;

    let exiftool = ExifTool::new(cli.exiftool_binary.clone(), cli.exiftool_timeout());
    match exiftool.version().await {
        Ok(version) => info!(version, "exiftool available"),
        Err(err) => warn!("exiftool probe failed, embeds will fail until it appears: {err}"),
    }

    let vision: Arc<dyn VisionApi> =
        Arc::new(OpenRouterClient::new(cli.openrouter()).context("build vision client")?);
    let selector = Arc::new(ModelSelector::start(
        vision.clone(),
        cli.model_check_interval(),
        cli.fallback_model(),
    ));

    // Publishers, one connection per role.
    let upload_publisher = Arc::new(
        Publisher::connect(cli.pipeline_queue(&cli.upload_queue))
            .await
            .context("connect upload publisher")?,
    );
    let metadata_publisher = Arc::new(
        Publisher::connect(cli.pipeline_queue(&cli.metadata_queue))
            .await
            .context("connect metadata publisher")?,
    );
    let processed_publisher = Arc::new(
        Publisher::connect(cli.pipeline_queue(&cli.processed_queue))
            .await
            .context("connect processed publisher")?,
    );

    // Worker pools.
    let worker_config = cli.workers();
    let analyzer = Arc::new(Analyzer::new(
        store.clone(),
        vision.clone(),
        selector.clone(),
        metadata_publisher.clone(),
        worker_config.clone(),
    ));
    let analyzer_pool = WorkerPool::start(
        "analyzer",
        cli.pipeline_queue(&cli.upload_queue),
        worker_config.concurrency,
        shutdown_rx.clone(),
        analyzer,
    )
    .await
    .context("start analyzer pool")?;

    let processor = Arc::new(Processor::new(
        store.clone(),
        exiftool.clone(),
        processed_publisher.clone(),
        cli.exiftool_temp_dir.clone(),
        worker_config.clone(),
    ));
    let processor_pool = WorkerPool::start(
        "processor",
        cli.pipeline_queue(&cli.metadata_queue),
        worker_config.concurrency,
        shutdown_rx.clone(),
        processor,
    )
    .await
    .context("start processor pool")?;

    // Batch coordination.
    let jobs = Arc::new(JobStore::new());
    let progress = Arc::new(ProgressBroadcaster::new());
    let coordinator = Arc::new(
        BatchCoordinator::new(
            jobs.clone(),
            progress.clone(),
            store.clone(),
            upload_publisher.clone(),
            BatchLimits::default(),
            shutdown_rx.clone(),
        )
        .context("build batch coordinator")?,
    );
    let batch_pool = WorkerPool::start(
        "batch",
        cli.pipeline_queue(&cli.processed_queue),
        1,
        shutdown_rx.clone(),
        coordinator.clone(),
    )
    .await
    .context("start batch consumer")?;

    spawn_job_sweeper(jobs.clone(), shutdown_rx.clone());

    // Admin + health surfaces.
    let dlq_admin = Arc::new(DlqAdmin::new(
        DlqInspector::connect(cli.dlq())
            .await
            .context("connect dlq inspector")?,
        cli.upload_queue.clone(),
    ));
    let health = Arc::new(HealthChecker::new(
        metadata_publisher.clone(),
        store.clone(),
        exiftool.clone(),
        vec![
            analyzer_pool.health(),
            processor_pool.health(),
            batch_pool.health(),
        ],
    ));

    let app = router(AppState {
        coordinator,
        jobs: jobs.clone(),
        progress,
        dlq: dlq_admin,
        health,
    });
    let listener = tokio::net::TcpListener::bind(&cli.server_addr)
        .await
        .with_context(|| format!("bind {}", cli.server_addr))?;
    info!(addr = %cli.server_addr, "http surface listening");

    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        let shutdown = async move {
            while server_shutdown.changed().await.is_ok() {
                if *server_shutdown.borrow() {
                    break;
                }
            }
        };
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!("http server exited with error: {err}");
        }
    });

    // Signals: first one drains, second one exits hard.
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_signal_handler(signal_tx);

    match signal_rx.recv().await {
        Some(ShutdownEvent::Graceful) | None => {
            info!("shutdown requested, draining in-flight work");
        }
        Some(ShutdownEvent::Immediate) => std::process::exit(130),
    }
    let _ = shutdown_tx.send(true);

    let drain = async {
        analyzer_pool.join().await;
        processor_pool.join().await;
        batch_pool.join().await;
        selector.stop().await;
        let cancelled = jobs.cancel_open_jobs();
        if cancelled > 0 {
            info!(cancelled, "cancelled open batch jobs");
        }
        upload_publisher.close().await;
        metadata_publisher.close().await;
        processed_publisher.close().await;
        let _ = server.await;
    };

    tokio::select! {
        _ = drain => info!("shutdown complete"),
        event = signal_rx.recv() => {
            if matches!(event, Some(ShutdownEvent::Immediate)) {
                warn!("second signal, exiting immediately");
                std::process::exit(130);
            }
        }
    }

    Ok(())
}

fn spawn_job_sweeper(jobs: Arc<JobStore>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(JOB_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.reset();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    jobs.sweep_terminal(JOB_RETENTION);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });
}
