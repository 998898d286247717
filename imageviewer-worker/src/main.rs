//! # imageviewer worker
//!
//! Runs the ingestion pipeline: queue consumers for scanning and artifact
//! generation, dead-letter recovery on startup, and the periodic stuck-job
//! reconciler. In the embedded single-node mode the broker and (optionally)
//! the store live in-process; pointing `store.database_url` at PostgreSQL
//! switches persistence without touching the pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use imageviewer_config::WorkerConfig;
use imageviewer_core::archive::ArchiveService;
use imageviewer_core::broker::MessageBroker;
use imageviewer_core::broker::memory::MemoryBroker;
use imageviewer_core::broker::publish_message;
use imageviewer_core::cache::CacheFolderSelector;
use imageviewer_core::consumer::ConsumerRegistry;
use imageviewer_core::jobs::StuckJobReconciler;
use imageviewer_core::media::MediaDecoder;
use imageviewer_core::media::decoder::StandardMediaDecoder;
use imageviewer_core::pipeline::{
    BatchedCacheWorker, BatchedThumbnailWorker, BulkOperationWorker, CollectionCreationWorker,
    ImageProcessingWorker, LibraryScanWorker, ScanWorker,
};
use imageviewer_core::recovery::DlqRecovery;
use imageviewer_core::store::memory::MemoryStore;
use imageviewer_core::store::postgres::PostgresStore;
use imageviewer_core::store::{CacheFolderStore, CollectionStore, JobStore};
use imageviewer_model::{
    BackgroundJob, CacheFolder, JobType, LibraryId, LibraryScanMessage, MessageOrigin, MessageType,
};

#[derive(Debug, Parser)]
#[command(name = "imageviewer-worker", about = "imageviewer ingestion worker")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the consumers until interrupted.
    Serve,
    /// Queue a library scan, process it to completion, then exit.
    ScanLibrary {
        /// Library root to scan for collections.
        path: PathBuf,
        /// Materialize direct-reference entries instead of generating
        /// artifacts.
        #[arg(long)]
        direct: bool,
        /// Force a rescan of collections that already exist.
        #[arg(long)]
        overwrite: bool,
        /// Re-queue collections whose artifact lists are incomplete.
        #[arg(long)]
        resume: bool,
    },
}

struct Stores {
    collections: Arc<dyn CollectionStore>,
    cache_folders: Arc<dyn CacheFolderStore>,
    jobs: Arc<dyn JobStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = WorkerConfig::load(args.config.as_deref()).context("loading configuration")?;

    let stores = build_stores(&config).await?;
    ensure_cache_roots(&config, &stores.cache_folders).await?;
    check_tools(&config).await;

    let broker: Arc<dyn MessageBroker> = Arc::new(MemoryBroker::new());
    let decoder: Arc<dyn MediaDecoder> = Arc::new(StandardMediaDecoder::new(
        config.tools.ffprobe_path.clone(),
        config.tools.ffmpeg_path.clone(),
    ));
    let archives = Arc::new(ArchiveService::new(
        config.tools.sevenzip_path.clone(),
        config.tools.unrar_path.clone(),
    ));
    let selector = CacheFolderSelector::new(stores.cache_folders.clone());

    let thumbnail_worker = BatchedThumbnailWorker::new(
        stores.collections.clone(),
        stores.jobs.clone(),
        archives.clone(),
        decoder.clone(),
        selector.clone(),
        config.thumbnail.clone(),
        config.limits.clone(),
        config.batching.clone(),
    );
    let cache_worker = BatchedCacheWorker::new(
        stores.collections.clone(),
        stores.jobs.clone(),
        archives.clone(),
        decoder.clone(),
        selector.clone(),
        config.cache.clone(),
        config.limits.clone(),
        config.batching.clone(),
    );

    let mut registry = ConsumerRegistry::new();
    registry.register(Arc::new(ScanWorker::new(
        stores.collections.clone(),
        stores.jobs.clone(),
        broker.clone(),
        archives.clone(),
        decoder.clone(),
        selector.clone(),
        config.thumbnail.clone(),
        config.cache.clone(),
    )));
    registry.register(Arc::new(ImageProcessingWorker::new(
        stores.collections.clone(),
        stores.jobs.clone(),
        broker.clone(),
        archives.clone(),
        decoder.clone(),
        selector.clone(),
        config.thumbnail.clone(),
        config.cache.clone(),
        config.limits.clone(),
    )));
    registry.register(Arc::new(thumbnail_worker.clone()));
    registry.register(Arc::new(cache_worker.clone()));
    registry.register(Arc::new(LibraryScanWorker::new(
        stores.collections.clone(),
        stores.jobs.clone(),
        broker.clone(),
    )));
    registry.register(Arc::new(BulkOperationWorker::new(
        stores.collections.clone(),
        stores.jobs.clone(),
        broker.clone(),
        config.thumbnail.clone(),
        config.cache.clone(),
    )));
    registry.register(Arc::new(CollectionCreationWorker::new(
        stores.collections.clone(),
        stores.jobs.clone(),
        broker.clone(),
    )));

    registry
        .declare_queues(broker.as_ref(), &config.broker)
        .await
        .context("declaring queues")?;

    // Restore anything a previous run dead-lettered before taking new work.
    DlqRecovery::new(broker.clone())
        .run()
        .await
        .context("dead-letter recovery")?;

    let shutdown = CancellationToken::new();
    let consumers = registry.spawn_consumers(
        broker.clone(),
        config.broker.prefetch_count,
        shutdown.clone(),
    );

    let reconciler = Arc::new(StuckJobReconciler::new(
        stores.jobs.clone(),
        stores.collections.clone(),
    ));
    let reconciler_task = tokio::spawn(reconciler.run(shutdown.clone()));

    let thumbnail_flusher = {
        let worker = thumbnail_worker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run_flusher(shutdown).await })
    };
    let cache_flusher = {
        let worker = cache_worker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run_flusher(shutdown).await })
    };

    match args.command {
        Command::Serve => {
            info!("worker running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutdown requested");
        }
        Command::ScanLibrary {
            path,
            direct,
            overwrite,
            resume,
        } => {
            run_library_scan(broker.as_ref(), stores.jobs.as_ref(), &path, direct, overwrite, resume)
                .await?;
        }
    }

    shutdown.cancel();
    thumbnail_worker.dispose().await;
    cache_worker.dispose().await;
    for task in consumers {
        let _ = task.await;
    }
    let _ = reconciler_task.await;
    thumbnail_flusher.abort();
    cache_flusher.abort();
    info!("worker stopped");
    Ok(())
}

async fn build_stores(config: &WorkerConfig) -> anyhow::Result<Stores> {
    match &config.store.database_url {
        Some(url) => {
            let store = Arc::new(
                PostgresStore::connect(url, config.store.max_connections.unwrap_or(8))
                    .await
                    .context("connecting to postgres")?,
            );
            Ok(Stores {
                collections: store.clone(),
                cache_folders: store.clone(),
                jobs: store,
            })
        }
        None => {
            info!("no database configured; using the in-memory store");
            let store = Arc::new(MemoryStore::new());
            Ok(Stores {
                collections: store.clone(),
                cache_folders: store.clone(),
                jobs: store,
            })
        }
    }
}

/// Create the configured cache roots on disk and register them in the
/// store. With nothing configured, a single local root keeps the embedded
/// mode usable.
async fn ensure_cache_roots(
    config: &WorkerConfig,
    cache_folders: &Arc<dyn CacheFolderStore>,
) -> anyhow::Result<()> {
    let mut roots = config.cache_roots.clone();
    if roots.is_empty() {
        warn!("no cache roots configured; defaulting to ./imageviewer-cache");
        roots.push(imageviewer_config::CacheRootConfig {
            name: "default".to_string(),
            path: PathBuf::from("./imageviewer-cache"),
            active: true,
        });
    }
    for root in roots {
        tokio::fs::create_dir_all(&root.path)
            .await
            .with_context(|| format!("creating cache root {}", root.path.display()))?;
        if cache_folders.find_by_name(&root.name).await?.is_none() {
            let mut folder =
                CacheFolder::new(&root.name, root.path.to_string_lossy().into_owned());
            folder.is_active = root.active;
            cache_folders.insert(&folder).await?;
            info!(name = %root.name, path = %root.path.display(), "registered cache root");
        }
    }
    Ok(())
}

/// Missing tools only degrade the paths that need them; report, don't fail.
async fn check_tools(config: &WorkerConfig) {
    for (name, path) in [
        ("ffprobe", &config.tools.ffprobe_path),
        ("ffmpeg", &config.tools.ffmpeg_path),
        ("7z", &config.tools.sevenzip_path),
        ("unrar", &config.tools.unrar_path),
    ] {
        let found = tokio::process::Command::new(path)
            .arg("-h")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .is_ok();
        if !found {
            warn!(tool = name, path = %path.display(), "external tool not runnable");
        }
    }
}

async fn run_library_scan(
    broker: &dyn MessageBroker,
    jobs: &dyn JobStore,
    path: &Path,
    direct: bool,
    overwrite: bool,
    resume: bool,
) -> anyhow::Result<()> {
    let library_id = LibraryId::new();
    let mut job = BackgroundJob::new(JobType::LibraryScan);
    job.library_id = Some(library_id);
    jobs.create_job(&job).await?;

    let message = LibraryScanMessage {
        library_id,
        library_path: path.to_string_lossy().into_owned(),
        include_subfolders: false,
        overwrite_existing: overwrite,
        resume_incomplete: resume,
        use_direct_file_access: direct,
        job_run_id: job.id,
        origin: MessageOrigin::system("worker-cli"),
    };
    publish_message(broker, MessageType::LibraryScan, &message).await?;
    info!(path = %path.display(), job_id = %job.id, "library scan queued");

    // Wait for the pipeline to drain: no unfinished jobs and no queued
    // messages across two consecutive checks.
    let mut settled = 0;
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let unfinished = jobs
            .list_unfinished_jobs(
                &[
                    JobType::LibraryScan,
                    JobType::CollectionScan,
                    JobType::ResumeCollection,
                    JobType::CollectionCreation,
                    JobType::BulkOperation,
                ],
                1,
            )
            .await?;
        let mut queued = 0;
        for message_type in MessageType::ALL {
            queued += broker.queue_depth(message_type.routing_key()).await?;
            queued += broker.in_flight(message_type.routing_key()).await?;
        }
        if unfinished.is_empty() && queued == 0 {
            settled += 1;
            if settled >= 2 {
                break;
            }
        } else {
            settled = 0;
        }
    }
    info!("library scan finished");
    Ok(())
}
