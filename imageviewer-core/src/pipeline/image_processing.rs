//! Per-image metadata extraction and thumbnail/cache fan-out.
//!
//! Creates the image entry in the collection, then emits one thumbnail and
//! one cache message. The cache message carries a pre-determined path so
//! every image of a collection converges on one cache root no matter which
//! worker picks it up.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use imageviewer_config::{CacheConfig, LimitsConfig, ThumbnailConfig};
use imageviewer_model::{
    ArtifactEntry, ArtifactKind, CacheGenerationMessage, FileProcessingJobState, ImageEntry,
    ImageProcessingMessage, MessageOrigin, MessageType, ProcessingErrorKind,
    ThumbnailGenerationMessage, media_types,
};

use super::{cache_settings, output_format_from_config};
use crate::archive::ArchiveService;
use crate::broker::{Delivery, MessageBroker, publish_message};
use crate::cache::CacheFolderSelector;
use crate::cache::selector::artifact_extension;
use crate::consumer::MessageHandler;
use crate::error::{PipelineError, Result};
use crate::jobs::JobProgressTracker;
use crate::jobs::tracker::stage_for_kind;
use crate::media::MediaDecoder;
use crate::store::{CollectionStore, JobStateDelta, JobStore};

#[derive(Clone)]
pub struct ImageProcessingWorker {
    collections: Arc<dyn CollectionStore>,
    jobs: Arc<dyn JobStore>,
    tracker: JobProgressTracker,
    broker: Arc<dyn MessageBroker>,
    archives: Arc<ArchiveService>,
    decoder: Arc<dyn MediaDecoder>,
    selector: CacheFolderSelector,
    thumbnail_config: ThumbnailConfig,
    cache_config: CacheConfig,
    limits: LimitsConfig,
}

impl std::fmt::Debug for ImageProcessingWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageProcessingWorker").finish_non_exhaustive()
    }
}

impl ImageProcessingWorker {
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
        limits: LimitsConfig,
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
            limits,
        }
    }

    pub async fn handle_image(&self, message: &ImageProcessingMessage) -> Result<()> {
        match self.process(message).await {
            Ok(()) => Ok(()),
            Err(e) => match e.processing_error_kind() {
                Some(kind) => {
                    warn!(
                        image_id = %message.image_id,
                        source = %message.archive_entry,
                        "image processing failed terminally: {e}"
                    );
                    self.record_terminal_failure(message, kind, &e.to_string())
                        .await?;
                    Err(e)
                }
                None => Err(e),
            },
        }
    }

    async fn process(&self, message: &ImageProcessingMessage) -> Result<()> {
        let entry = &message.archive_entry;
        let is_video = media_types::is_video_file(&entry.entry_name);

        let file_size = match message.file_size {
            Some(size) => size,
            None => self.archives.source_size(entry).await?,
        };
        let limit = if entry.is_archive_member() {
            self.limits.max_zip_entry_size_bytes
        } else {
            self.limits.max_image_size_bytes
        };
        if file_size > limit {
            return Err(PipelineError::SourceTooLarge {
                size: file_size,
                limit,
            });
        }

        let collection = self
            .collections
            .get(message.collection_id)
            .await?
            .ok_or_else(|| {
                PipelineError::NotFound(format!("collection {}", message.collection_id))
            })?;

        // Rescans resolve to the already-ingested entry instead of growing
        // the image list.
        let image_id = match collection
            .images
            .iter()
            .find(|image| image.relative_path == entry.entry_path && !image.deleted)
        {
            Some(existing) => existing.id,
            None => {
                let (width, height) = match (message.width, message.height) {
                    (Some(width), Some(height)) => (width, height),
                    _ if is_video => (0, 0),
                    _ => {
                        let bytes = self.archives.read_source(entry).await?;
                        self.decoder.probe_dimensions(&bytes).await?
                    }
                };
                let mut image = ImageEntry::new(
                    entry.entry_name.clone(),
                    entry.entry_path.clone(),
                    entry.file_type,
                );
                image.id = message.image_id;
                image.archive_entry = Some(entry.clone());
                image.file_size = file_size;
                image.width = width;
                image.height = height;
                image.format = message.image_format.to_ascii_uppercase();
                self.collections
                    .append_image(message.collection_id, &image)
                    .await?;
                image.id
            }
        };

        let thumbnail_state = self
            .find_state(message, ArtifactKind::Thumbnail)
            .await?;
        let cache_state = self.find_state(message, ArtifactKind::Cache).await?;

        if message.generate_thumbnail {
            let thumbnail = ThumbnailGenerationMessage {
                image_id,
                collection_id: message.collection_id,
                archive_entry: entry.clone(),
                thumbnail_width: self.thumbnail_config.width,
                thumbnail_height: self.thumbnail_config.height,
                job_id: thumbnail_state.id,
                scan_job_id: message.scan_job_id,
                origin: MessageOrigin::system("image-processing-worker"),
            };
            publish_message(
                self.broker.as_ref(),
                MessageType::ThumbnailGeneration,
                &thumbnail,
            )
            .await?;
        }

        let cache_format = output_format_from_config(&self.cache_config.format);
        let folder = self.selector.assign(message.collection_id).await?;
        let extension = artifact_extension(cache_format, &entry.entry_name);
        let cache_path = CacheFolderSelector::cache_file_path(
            Path::new(&folder.path),
            message.collection_id,
            image_id,
            self.cache_config.width,
            self.cache_config.height,
            &extension,
        );
        let cache = CacheGenerationMessage {
            image_id,
            collection_id: message.collection_id,
            archive_entry: entry.clone(),
            cache_path: Some(cache_path.to_string_lossy().into_owned()),
            cache_width: self.cache_config.width,
            cache_height: self.cache_config.height,
            quality: self.cache_config.quality,
            format: cache_format,
            preserve_original: self.cache_config.preserve_original,
            force_regenerate: false,
            job_id: cache_state.id,
            scan_job_id: message.scan_job_id,
            origin: MessageOrigin::system("image-processing-worker"),
        };
        publish_message(self.broker.as_ref(), MessageType::CacheGeneration, &cache).await?;
        Ok(())
    }

    async fn find_state(
        &self,
        message: &ImageProcessingMessage,
        kind: ArtifactKind,
    ) -> Result<FileProcessingJobState> {
        self.jobs
            .find_job_state(message.scan_job_id, message.collection_id, kind)
            .await?
            .ok_or_else(|| {
                PipelineError::Internal(format!(
                    "no {kind} job state for collection {} under job {}",
                    message.collection_id, message.scan_job_id
                ))
            })
    }

    /// Terminal failure: the image entry still lands (zero-dimensioned) so
    /// the dummy artifact entries have something to reference, and both job
    /// states advance so the stages can close.
    async fn record_terminal_failure(
        &self,
        message: &ImageProcessingMessage,
        kind: ProcessingErrorKind,
        error_text: &str,
    ) -> Result<()> {
        let entry = &message.archive_entry;
        let mut image = ImageEntry::new(
            entry.entry_name.clone(),
            entry.entry_path.clone(),
            entry.file_type,
        );
        image.id = message.image_id;
        image.archive_entry = Some(entry.clone());
        image.file_size = message.file_size.unwrap_or(0);
        image.format = message.image_format.to_ascii_uppercase();
        self.collections
            .append_image(message.collection_id, &image)
            .await?;

        let cache_defaults = cache_settings(&self.cache_config);
        for (artifact_kind, dummy, width, height) in [
            (
                ArtifactKind::Thumbnail,
                kind != ProcessingErrorKind::SourceTooLarge,
                self.thumbnail_config.width,
                self.thumbnail_config.height,
            ),
            (
                ArtifactKind::Cache,
                true,
                cache_defaults.width,
                cache_defaults.height,
            ),
        ] {
            let Some(state) = self
                .jobs
                .find_job_state(message.scan_job_id, message.collection_id, artifact_kind)
                .await?
            else {
                continue;
            };
            if dummy {
                let dummy_entry =
                    ArtifactEntry::dummy(message.image_id, width, height, kind, error_text);
                self.collections
                    .append_artifacts(
                        message.collection_id,
                        artifact_kind,
                        std::slice::from_ref(&dummy_entry),
                    )
                    .await?;
            }
            let counters = self
                .jobs
                .increment_job_state(
                    state.id,
                    JobStateDelta::Failed {
                        kind: Some(kind),
                        dummy,
                    },
                )
                .await?;
            self.tracker
                .advance_stage(message.scan_job_id, stage_for_kind(artifact_kind), 1)
                .await?;
            self.tracker
                .apply_job_state_counters(state.id, counters)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for ImageProcessingWorker {
    fn message_type(&self) -> MessageType {
        MessageType::ImageProcessing
    }

    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        let message: ImageProcessingMessage = delivery.envelope.decode()?;
        self.handle_image(&message).await
    }
}
