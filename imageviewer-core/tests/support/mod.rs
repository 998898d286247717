//! Shared wiring for pipeline integration tests: in-memory broker and
//! store, the real image decoder, and a temporary cache root.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use imageviewer_config::WorkerConfig;
use imageviewer_core::archive::ArchiveService;
use imageviewer_core::broker::MessageBroker;
use imageviewer_core::broker::memory::MemoryBroker;
use imageviewer_core::cache::CacheFolderSelector;
use imageviewer_core::consumer::ConsumerRegistry;
use imageviewer_core::media::MediaDecoder;
use imageviewer_core::media::decoder::StandardMediaDecoder;
use imageviewer_core::pipeline::{
    BatchedCacheWorker, BatchedThumbnailWorker, BulkOperationWorker, ImageProcessingWorker,
    LibraryScanWorker, ScanWorker,
};
use imageviewer_core::store::memory::MemoryStore;
use imageviewer_core::store::{CacheFolderStore, CollectionStore, JobStore};
use imageviewer_model::{BackgroundJob, CacheFolder, JobId};

pub struct TestPipeline {
    pub broker: Arc<dyn MessageBroker>,
    pub store: Arc<MemoryStore>,
    pub cache_root: PathBuf,
    pub thumbnail_worker: BatchedThumbnailWorker,
    pub cache_worker: BatchedCacheWorker,
    shutdown: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    _tempdir: tempfile::TempDir,
}

impl TestPipeline {
    pub async fn start(config: WorkerConfig) -> Self {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let cache_root = tempdir.path().join("cache-root");
        tokio::fs::create_dir_all(&cache_root).await.expect("cache root");

        let store = Arc::new(MemoryStore::new());
        let collections: Arc<dyn CollectionStore> = store.clone();
        let jobs: Arc<dyn JobStore> = store.clone();
        let cache_folders: Arc<dyn CacheFolderStore> = store.clone();

        let folder = CacheFolder::new("test-root", cache_root.to_string_lossy().into_owned());
        cache_folders.insert(&folder).await.expect("cache folder");

        let broker: Arc<dyn MessageBroker> = Arc::new(MemoryBroker::new());
        let decoder: Arc<dyn MediaDecoder> = Arc::new(StandardMediaDecoder::default());
        let archives = Arc::new(ArchiveService::new(
            PathBuf::from("7z"),
            PathBuf::from("unrar"),
        ));
        let selector = CacheFolderSelector::new(cache_folders.clone());

        let thumbnail_worker = BatchedThumbnailWorker::new(
            collections.clone(),
            jobs.clone(),
            archives.clone(),
            decoder.clone(),
            selector.clone(),
            config.thumbnail.clone(),
            config.limits.clone(),
            config.batching.clone(),
        );
        let cache_worker = BatchedCacheWorker::new(
            collections.clone(),
            jobs.clone(),
            archives.clone(),
            decoder.clone(),
            selector.clone(),
            config.cache.clone(),
            config.limits.clone(),
            config.batching.clone(),
        );

        let mut registry = ConsumerRegistry::new();
        registry.register(Arc::new(ScanWorker::new(
            collections.clone(),
            jobs.clone(),
            broker.clone(),
            archives.clone(),
            decoder.clone(),
            selector.clone(),
            config.thumbnail.clone(),
            config.cache.clone(),
        )));
        registry.register(Arc::new(ImageProcessingWorker::new(
            collections.clone(),
            jobs.clone(),
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
            collections.clone(),
            jobs.clone(),
            broker.clone(),
        )));
        registry.register(Arc::new(BulkOperationWorker::new(
            collections.clone(),
            jobs.clone(),
            broker.clone(),
            config.thumbnail.clone(),
            config.cache.clone(),
        )));

        registry
            .declare_queues(broker.as_ref(), &config.broker)
            .await
            .expect("declare queues");

        let shutdown = CancellationToken::new();
        let mut tasks =
            registry.spawn_consumers(broker.clone(), config.broker.prefetch_count, shutdown.clone());
        tasks.push({
            let worker = thumbnail_worker.clone();
            let token = shutdown.clone();
            tokio::spawn(async move { worker.run_flusher(token).await })
        });
        tasks.push({
            let worker = cache_worker.clone();
            let token = shutdown.clone();
            tokio::spawn(async move { worker.run_flusher(token).await })
        });

        Self {
            broker,
            store,
            cache_root,
            thumbnail_worker,
            cache_worker,
            shutdown,
            tasks,
            _tempdir: tempdir,
        }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        self.thumbnail_worker.dispose().await;
        self.cache_worker.dispose().await;
        for task in self.tasks {
            let _ = task.await;
        }
    }

    pub async fn wait_for_job(&self, job_id: JobId, timeout: Duration) -> BackgroundJob {
        let jobs: Arc<dyn JobStore> = self.store.clone();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(job) = jobs.get_job(job_id).await.expect("get job") {
                if job.status.is_terminal() {
                    return job;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {job_id} did not finish within {timeout:?}"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// A small but real JPEG on disk.
pub fn write_jpeg(path: &Path, width: u32, height: u32) {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    image::DynamicImage::ImageRgb8(img)
        .save_with_format(path, image::ImageFormat::Jpeg)
        .expect("write jpeg");
}

pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x * y) % 256) as u8])
    });
    let mut cursor = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut cursor, image::ImageFormat::Jpeg)
        .expect("encode jpeg");
    cursor.into_inner()
}

pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).expect("create zip");
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    for (name, bytes) in entries {
        writer.start_file(*name, options).expect("start zip entry");
        writer.write_all(bytes).expect("write zip entry");
    }
    writer.finish().expect("finish zip");
}
