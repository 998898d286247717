//! Bulk operations over sets of collections.
//!
//! Rescans republish scan messages; regeneration publishes thumbnail or
//! cache messages directly for the images whose artifacts are missing, each
//! collection under its own resume job so the reconciler covers it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use imageviewer_config::{CacheConfig, ThumbnailConfig};
use imageviewer_model::{
    ArtifactKind, BackgroundJob, BulkOperationMessage, BulkOperationType, CacheGenerationMessage,
    Collection, CollectionScanMessage, FileProcessingJobState, JobStatus, JobType, MessageOrigin,
    MessageType, StageKind, ThumbnailGenerationMessage,
};

use super::{cache_settings, output_format_from_config, thumbnail_settings};
use crate::broker::{Delivery, MessageBroker, publish_message};
use crate::consumer::MessageHandler;
use crate::error::Result;
use crate::jobs::JobProgressTracker;
use crate::jobs::tracker::stage_for_kind;
use crate::store::{CollectionStore, JobStore};

#[derive(Clone)]
pub struct BulkOperationWorker {
    collections: Arc<dyn CollectionStore>,
    jobs: Arc<dyn JobStore>,
    tracker: JobProgressTracker,
    broker: Arc<dyn MessageBroker>,
    thumbnail_config: ThumbnailConfig,
    cache_config: CacheConfig,
}

impl std::fmt::Debug for BulkOperationWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkOperationWorker").finish_non_exhaustive()
    }
}

impl BulkOperationWorker {
    pub fn new(
        collections: Arc<dyn CollectionStore>,
        jobs: Arc<dyn JobStore>,
        broker: Arc<dyn MessageBroker>,
        thumbnail_config: ThumbnailConfig,
        cache_config: CacheConfig,
    ) -> Self {
        let tracker = JobProgressTracker::new(jobs.clone());
        Self {
            collections,
            jobs,
            tracker,
            broker,
            thumbnail_config,
            cache_config,
        }
    }

    pub async fn handle_bulk(&self, message: &BulkOperationMessage) -> Result<()> {
        self.jobs
            .set_job_status(message.job_id, JobStatus::Running, None)
            .await?;

        let mut handled: u64 = 0;
        for collection_id in &message.collection_ids {
            let Some(collection) = self.collections.get(*collection_id).await? else {
                warn!(%collection_id, "bulk operation references missing collection");
                continue;
            };
            match message.operation_type {
                BulkOperationType::Rescan => self.queue_rescan(message, &collection).await?,
                BulkOperationType::RegenerateThumbnails => {
                    self.queue_regeneration(message, &collection, ArtifactKind::Thumbnail)
                        .await?;
                }
                BulkOperationType::RegenerateCache => {
                    self.queue_regeneration(message, &collection, ArtifactKind::Cache)
                        .await?;
                }
            }
            handled += 1;
        }

        info!(
            job_id = %message.job_id,
            operation = ?message.operation_type,
            handled, "bulk operation fanned out"
        );
        self.jobs
            .set_job_status(
                message.job_id,
                JobStatus::Completed,
                Some(format!("dispatched {handled} collections")),
            )
            .await?;
        Ok(())
    }

    async fn queue_rescan(
        &self,
        message: &BulkOperationMessage,
        collection: &Collection,
    ) -> Result<()> {
        let job = BackgroundJob::for_collection(JobType::CollectionScan, collection.id);
        self.jobs.create_job(&job).await?;
        let scan = CollectionScanMessage {
            collection_id: collection.id,
            collection_path: collection.path.clone(),
            collection_type: collection.collection_type,
            force_rescan: true,
            use_direct_file_access: collection.use_direct_access,
            job_id: job.id,
            origin: MessageOrigin::system("bulk-operation-worker"),
        };
        publish_message(self.broker.as_ref(), MessageType::CollectionScan, &scan).await
    }

    /// Publish generation messages for every image missing its artifact at
    /// the configured dimensions, under a fresh resume job.
    async fn queue_regeneration(
        &self,
        message: &BulkOperationMessage,
        collection: &Collection,
        kind: ArtifactKind,
    ) -> Result<()> {
        let force = message
            .parameters
            .get("force")
            .is_some_and(|value| value == "true");
        let (settings, width, height) = match kind {
            ArtifactKind::Thumbnail => {
                let settings = thumbnail_settings(&self.thumbnail_config);
                (settings, settings.width, settings.height)
            }
            ArtifactKind::Cache => {
                let settings = cache_settings(&self.cache_config);
                (settings, settings.width, settings.height)
            }
        };

        let missing: Vec<_> = collection
            .images
            .iter()
            .filter(|image| !image.deleted)
            .filter(|image| {
                if force {
                    return true;
                }
                match kind {
                    ArtifactKind::Thumbnail => !collection.has_thumbnail(image.id, width, height),
                    ArtifactKind::Cache => !collection.has_cache_entry(image.id, width, height),
                }
            })
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let job = BackgroundJob::for_collection(JobType::ResumeCollection, collection.id);
        self.jobs.create_job(&job).await?;
        let total = missing.len() as u64;
        let state =
            FileProcessingJobState::new(job.id, collection.id, kind, total, settings);
        self.jobs.create_job_state(&state).await?;

        // Only the regenerated stage is open; the others are closed upfront
        // so the job can finalize.
        for stage in [StageKind::Scan, StageKind::Thumbnail, StageKind::Cache] {
            if stage == stage_for_kind(kind) {
                self.tracker.stage_pending(job.id, stage, total).await?;
            } else {
                self.tracker.stage_completed(job.id, stage, 0, 0, None).await?;
            }
        }

        for image in missing {
            let Some(entry) = image.archive_entry.clone() else {
                warn!(image_id = %image.id, "image entry has no source address; skipping");
                continue;
            };
            match kind {
                ArtifactKind::Thumbnail => {
                    let thumbnail = ThumbnailGenerationMessage {
                        image_id: image.id,
                        collection_id: collection.id,
                        archive_entry: entry,
                        thumbnail_width: width,
                        thumbnail_height: height,
                        job_id: state.id,
                        scan_job_id: job.id,
                        origin: MessageOrigin::system("bulk-operation-worker"),
                    };
                    publish_message(
                        self.broker.as_ref(),
                        MessageType::ThumbnailGeneration,
                        &thumbnail,
                    )
                    .await?;
                }
                ArtifactKind::Cache => {
                    let cache = CacheGenerationMessage {
                        image_id: image.id,
                        collection_id: collection.id,
                        archive_entry: entry,
                        cache_path: None,
                        cache_width: width,
                        cache_height: height,
                        quality: self.cache_config.quality,
                        format: output_format_from_config(&self.cache_config.format),
                        preserve_original: self.cache_config.preserve_original,
                        force_regenerate: force,
                        job_id: state.id,
                        scan_job_id: job.id,
                        origin: MessageOrigin::system("bulk-operation-worker"),
                    };
                    publish_message(self.broker.as_ref(), MessageType::CacheGeneration, &cache)
                        .await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for BulkOperationWorker {
    fn message_type(&self) -> MessageType {
        MessageType::BulkOperation
    }

    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        let message: BulkOperationMessage = delivery.envelope.decode()?;
        self.handle_bulk(&message).await
    }
}
