//! Collection scanning: enumerate media, then either materialize
//! direct-reference entries or fan out per-image processing messages.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use imageviewer_config::{CacheConfig, ThumbnailConfig};
use imageviewer_model::{
    ArchiveEntry, ArtifactEntry, ArtifactKind, Collection, CollectionScanMessage, CollectionType,
    FileProcessingJobState, ImageEntry, ImageId, ImageProcessingMessage, JobStatus, MessageOrigin,
    MessageType, SourceFileType, StageKind, media_types,
};

use super::{cache_settings, thumbnail_settings};
use crate::archive::ArchiveService;
use crate::broker::{Delivery, MessageBroker, publish_message};
use crate::cache::CacheFolderSelector;
use crate::consumer::MessageHandler;
use crate::error::Result;
use crate::jobs::JobProgressTracker;
use crate::jobs::tracker::stage_for_kind;
use crate::media::MediaDecoder;
use crate::store::{CollectionStore, JobStore};

/// One media file discovered during enumeration.
#[derive(Debug, Clone)]
struct DiscoveredFile {
    filename: String,
    relative_path: String,
    entry: ArchiveEntry,
    file_type: SourceFileType,
    file_size: u64,
    is_video: bool,
}

#[derive(Clone)]
pub struct ScanWorker {
    collections: Arc<dyn CollectionStore>,
    jobs: Arc<dyn JobStore>,
    tracker: JobProgressTracker,
    broker: Arc<dyn MessageBroker>,
    archives: Arc<ArchiveService>,
    decoder: Arc<dyn MediaDecoder>,
    selector: CacheFolderSelector,
    thumbnail_config: ThumbnailConfig,
    cache_config: CacheConfig,
}

impl std::fmt::Debug for ScanWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanWorker").finish_non_exhaustive()
    }
}

impl ScanWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        collections: Arc<dyn CollectionStore>,
        jobs: Arc<dyn JobStore>,
        broker: Arc<dyn MessageBroker>,
        archives: Arc<ArchiveService>,
        decoder: Arc<dyn MediaDecoder>,
        selector: CacheFolderSelector,
        thumbnail_config: ThumbnailConfig,
        cache_config: CacheConfig,
    ) -> Self {
        let tracker = JobProgressTracker::new(jobs.clone());
        Self {
            collections,
            jobs,
            tracker,
            broker,
            archives,
            decoder,
            selector,
            thumbnail_config,
            cache_config,
        }
    }

    pub async fn handle_scan(&self, message: &CollectionScanMessage) -> Result<()> {
        let Some(collection) = self.collections.get(message.collection_id).await? else {
            warn!(collection_id = %message.collection_id, "scan for missing collection");
            self.jobs
                .set_job_status(
                    message.job_id,
                    JobStatus::Failed,
                    Some(format!("collection {} not found", message.collection_id)),
                )
                .await?;
            return Ok(());
        };

        self.jobs
            .set_job_status(message.job_id, JobStatus::Running, None)
            .await?;

        match self.scan_collection(message, &collection).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_poison() => {
                // Retrying cannot enumerate a source that is broken; fail
                // the job with the cause and swallow the message.
                self.jobs
                    .set_job_status(message.job_id, JobStatus::Failed, Some(e.to_string()))
                    .await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn scan_collection(
        &self,
        message: &CollectionScanMessage,
        collection: &Collection,
    ) -> Result<()> {
        if message.force_rescan {
            info!(collection_id = %collection.id, "force rescan: clearing image arrays");
            self.collections.clear_image_arrays(collection.id).await?;
        }

        let files = match collection.collection_type {
            CollectionType::Folder => self.enumerate_folder(&collection.path).await?,
            CollectionType::Archive => self.enumerate_archive(&collection.path).await?,
        };
        let total = files.len() as u64;
        self.tracker
            .stage_running(message.job_id, StageKind::Scan, total)
            .await?;

        // Videos are never re-encoded, so their presence switches the scan
        // to direct access without touching the persisted setting.
        let has_video = files.iter().any(|file| file.is_video);
        let wants_direct = message.use_direct_file_access || has_video;
        let direct = wants_direct && collection.collection_type == CollectionType::Folder;
        if wants_direct && !direct {
            warn!(
                collection_id = %collection.id,
                "direct access is only valid for folder collections; queueing instead"
            );
        }

        info!(
            collection_id = %collection.id,
            files = files.len(),
            direct,
            "scan enumerated collection"
        );

        if direct {
            self.scan_direct(message, collection, files).await
        } else {
            self.scan_queued(message, collection, files).await
        }
    }

    /// Top-level enumeration only. Nested directories are not descended
    /// into and archive files are skipped outright; both are collections of
    /// their own.
    async fn enumerate_folder(&self, path: &str) -> Result<Vec<DiscoveredFile>> {
        let root = Path::new(path);
        let mut entries = tokio::fs::read_dir(root).await?;
        let mut files = Vec::new();
        while let Some(dir_entry) = entries.next_entry().await? {
            if !dir_entry.file_type().await?.is_file() {
                continue;
            }
            let filename = dir_entry.file_name().to_string_lossy().into_owned();
            if filename.starts_with("._") {
                continue;
            }
            if media_types::is_archive_file(&filename) || !media_types::is_media_file(&filename) {
                continue;
            }
            let metadata = dir_entry.metadata().await?;
            let entry = ArchiveEntry::for_regular_file(root, &filename)?;
            files.push(DiscoveredFile {
                is_video: media_types::is_video_file(&filename),
                relative_path: filename.clone(),
                entry,
                file_type: SourceFileType::RegularFile,
                file_size: metadata.len(),
                filename,
            });
        }
        Ok(files)
    }

    async fn enumerate_archive(&self, path: &str) -> Result<Vec<DiscoveredFile>> {
        let archive_path = Path::new(path);
        let members = self.archives.enumerate_members(archive_path).await?;
        let mut files = Vec::new();
        for member in members {
            let filename = member
                .entry_path
                .rsplit(['/', '\\'])
                .next()
                .unwrap_or(member.entry_path.as_str())
                .to_string();
            if !media_types::is_media_file(&filename) {
                continue;
            }
            let entry = ArchiveEntry::for_archive_member(archive_path, &member.entry_path)?
                .with_sizes(member.compressed_size, member.uncompressed_size);
            files.push(DiscoveredFile {
                is_video: media_types::is_video_file(&filename),
                relative_path: member.entry_path.clone(),
                entry,
                file_type: SourceFileType::ArchiveMember,
                file_size: member.uncompressed_size.unwrap_or(0),
                filename,
            });
        }
        Ok(files)
    }

    /// Queued mode: one image-processing message per file; image entries are
    /// written by the processing worker, not here.
    async fn scan_queued(
        &self,
        message: &CollectionScanMessage,
        collection: &Collection,
        files: Vec<DiscoveredFile>,
    ) -> Result<()> {
        let total = files.len() as u64;

        if files.is_empty() {
            // Nothing downstream will ever advance these stages.
            self.tracker
                .stage_completed(message.job_id, StageKind::Scan, 0, 0, None)
                .await?;
            self.tracker
                .stage_completed(message.job_id, StageKind::Thumbnail, 0, 0, None)
                .await?;
            self.tracker
                .stage_completed(message.job_id, StageKind::Cache, 0, 0, None)
                .await?;
            self.tracker.try_finalize_job(message.job_id).await?;
            return Ok(());
        }

        for (kind, settings) in [
            (
                ArtifactKind::Thumbnail,
                thumbnail_settings(&self.thumbnail_config),
            ),
            (ArtifactKind::Cache, cache_settings(&self.cache_config)),
        ] {
            let state = FileProcessingJobState::new(
                message.job_id,
                collection.id,
                kind,
                total,
                settings,
            );
            self.jobs.create_job_state(&state).await?;
            self.tracker
                .stage_pending(message.job_id, stage_for_kind(kind), total)
                .await?;
        }

        for file in &files {
            let processing = ImageProcessingMessage {
                image_id: ImageId::new(),
                collection_id: collection.id,
                archive_entry: file.entry.clone(),
                image_format: extension_of(&file.filename),
                width: None,
                height: None,
                file_size: Some(file.file_size),
                generate_thumbnail: true,
                optimize_image: true,
                scan_job_id: message.job_id,
                origin: MessageOrigin::system("scan-worker"),
            };
            publish_message(self.broker.as_ref(), MessageType::ImageProcessing, &processing)
                .await?;
        }

        self.tracker
            .stage_completed(message.job_id, StageKind::Scan, total, total, None)
            .await?;
        Ok(())
    }

    /// Direct mode: image, thumbnail, and cache entries all point at the
    /// originals; only video files get a generated static thumbnail.
    async fn scan_direct(
        &self,
        message: &CollectionScanMessage,
        collection: &Collection,
        files: Vec<DiscoveredFile>,
    ) -> Result<()> {
        let total = files.len() as u64;
        let folder = self.selector.assign(collection.id).await?;
        let root = Path::new(&folder.path);

        // Re-read after any force-rescan clear so a repeated scan skips
        // what is already ingested instead of appending it again.
        let current = self
            .collections
            .get(collection.id)
            .await?
            .unwrap_or_else(|| collection.clone());
        let existing_paths: std::collections::HashSet<&str> = current
            .images
            .iter()
            .filter(|image| !image.deleted)
            .map(|image| image.relative_path.as_str())
            .collect();

        let mut thumbnails = Vec::new();
        let mut cache_entries = Vec::new();
        let mut thumbnail_dir_ready = false;
        let mut written_bytes: u64 = 0;
        let mut written_files: u64 = 0;

        for file in &files {
            if existing_paths.contains(file.relative_path.as_str()) {
                continue;
            }
            let source_path = file.entry.container_path();
            let (width, height) = self.probe_source(file, &source_path).await;

            let mut image = ImageEntry::new(
                file.filename.clone(),
                file.relative_path.clone(),
                file.file_type,
            );
            image.archive_entry = Some(file.entry.clone());
            image.file_size = file.file_size;
            image.width = width;
            image.height = height;
            image.format = extension_of(&file.filename).to_ascii_uppercase();
            let image_id = image.id;
            self.collections.append_image(collection.id, &image).await?;

            let source_display = source_path.to_string_lossy().into_owned();

            if file.is_video {
                match self
                    .generate_video_thumbnail(
                        collection,
                        root,
                        &mut thumbnail_dir_ready,
                        file,
                        image_id,
                    )
                    .await
                {
                    Ok(entry) => {
                        written_bytes += entry.file_size;
                        written_files += 1;
                        thumbnails.push(entry);
                    }
                    Err(e) => {
                        // The image and cache entries still land; a later
                        // rescan retries the missing thumbnail.
                        warn!(
                            collection_id = %collection.id,
                            file = %file.filename,
                            "video thumbnail generation failed: {e}"
                        );
                    }
                }
            } else {
                thumbnails.push(ArtifactEntry::direct_reference(
                    image_id,
                    source_display.clone(),
                    width,
                    height,
                    file.file_size,
                    extension_of(&file.filename).to_ascii_uppercase(),
                ));
            }

            cache_entries.push(ArtifactEntry::direct_reference(
                image_id,
                source_display,
                width,
                height,
                file.file_size,
                extension_of(&file.filename).to_ascii_uppercase(),
            ));
        }

        self.collections
            .append_artifacts(collection.id, ArtifactKind::Thumbnail, &thumbnails)
            .await?;
        self.collections
            .append_artifacts(collection.id, ArtifactKind::Cache, &cache_entries)
            .await?;

        if written_files > 0 {
            self.selector
                .store()
                .record_usage(folder.id, written_bytes as i64, written_files as i64)
                .await?;
            self.selector
                .store()
                .add_cached_collection(folder.id, collection.id)
                .await?;
        }

        // Stage counts come from what is actually materialized, which
        // covers both fresh appends and entries a previous run left behind.
        let materialized = self
            .collections
            .get(collection.id)
            .await?
            .unwrap_or_else(|| collection.clone());
        let thumbnail_count = (materialized.thumbnails.len() as u64).min(total);
        let cache_count = (materialized.cache_images.len() as u64).min(total);

        self.tracker
            .stage_completed(message.job_id, StageKind::Scan, total, total, None)
            .await?;
        let thumbnail_message = (thumbnail_count < total)
            .then(|| format!("{} video thumbnails failed", total - thumbnail_count));
        self.tracker
            .stage_completed(
                message.job_id,
                StageKind::Thumbnail,
                thumbnail_count,
                total,
                thumbnail_message,
            )
            .await?;
        self.tracker
            .stage_completed(message.job_id, StageKind::Cache, cache_count, total, None)
            .await?;
        self.tracker.try_finalize_job(message.job_id).await?;
        Ok(())
    }

    async fn probe_source(&self, file: &DiscoveredFile, source_path: &Path) -> (u32, u32) {
        let probed = if file.is_video {
            self.decoder.probe_video_dimensions(source_path).await
        } else {
            self.decoder.probe_file_dimensions(source_path).await
        };
        match probed {
            Ok(dimensions) => dimensions,
            Err(e) => {
                warn!(file = %file.filename, "dimension probe failed: {e}");
                (0, 0)
            }
        }
    }

    async fn generate_video_thumbnail(
        &self,
        collection: &Collection,
        root: &Path,
        dir_ready: &mut bool,
        file: &DiscoveredFile,
        image_id: ImageId,
    ) -> Result<ArtifactEntry> {
        let width = self.thumbnail_config.width;
        let height = self.thumbnail_config.height;
        let artifact = self
            .decoder
            .video_thumbnail(&file.entry.container_path(), width, height)
            .await?;
        let path = CacheFolderSelector::thumbnail_file_path(
            root,
            collection.id,
            &file.filename,
            width,
            height,
            "jpg",
        );
        if !*dir_ready {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            *dir_ready = true;
        }
        tokio::fs::write(&path, &artifact.bytes).await?;
        Ok(ArtifactEntry::generated(
            image_id,
            path.to_string_lossy().into_owned(),
            width,
            height,
            artifact.bytes.len() as u64,
            artifact.format,
            self.thumbnail_config.quality,
        ))
    }
}

fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .map(|extension| extension.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

#[async_trait]
impl MessageHandler for ScanWorker {
    fn message_type(&self) -> MessageType {
        MessageType::CollectionScan
    }

    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        let message: CollectionScanMessage = delivery.envelope.decode()?;
        self.handle_scan(&message).await
    }
}
