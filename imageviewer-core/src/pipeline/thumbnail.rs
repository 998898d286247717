//! Batched thumbnail generation.
//!
//! Messages accumulate into one batch per collection; a batch is processed
//! when it fills or when the periodic flusher finds it older than the
//! timeout. Processing happens fully in memory first, then on disk, then as
//! one atomic store append, so a failed commit never leaves partial state
//! visible in the data store. Only orphan files on disk are possible, and
//! the resume path re-attaches those without re-encoding.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use imageviewer_config::{BatchingConfig, LimitsConfig, ThumbnailConfig};
use imageviewer_model::{
    ArtifactEntry, ArtifactKind, Collection, CollectionId, ImageId, JobStatus, MessageType,
    OutputFormat, ProcessingErrorKind, ThumbnailGenerationMessage, media_types,
};

use super::batch::BatchQueue;
use super::{InFlight, output_format_from_config};
use crate::archive::ArchiveService;
use crate::broker::Delivery;
use crate::cache::CacheFolderSelector;
use crate::cache::selector::artifact_extension;
use crate::consumer::MessageHandler;
use crate::error::Result;
use crate::jobs::JobProgressTracker;
use crate::jobs::tracker::stage_for_kind;
use crate::media::{MediaDecoder, is_animated_webp};
use crate::store::{CollectionStore, JobStateDelta, JobStore};

const FLUSH_SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// What the in-memory pass decided for one message.
enum Planned {
    /// Fresh artifact: write to disk and append to the collection.
    Write {
        entry: ArtifactEntry,
        path: PathBuf,
        bytes: Vec<u8>,
    },
    /// Survived on disk from an interrupted run; append without re-encoding.
    ReAdd { entry: ArtifactEntry },
    /// Listed in the collection but missing on disk; rewrite the file only.
    Rewrite { path: PathBuf, bytes: Vec<u8> },
    /// Already terminally materialized; counts as skipped work.
    Skipped,
    /// Repeated within this batch; nothing to do and no counters to move.
    Duplicate,
    Failed {
        kind: ProcessingErrorKind,
        message: String,
        dummy: Option<ArtifactEntry>,
    },
}

struct Inner {
    collections: Arc<dyn CollectionStore>,
    jobs: Arc<dyn JobStore>,
    tracker: JobProgressTracker,
    archives: Arc<ArchiveService>,
    decoder: Arc<dyn MediaDecoder>,
    selector: CacheFolderSelector,
    thumbnail_config: ThumbnailConfig,
    limits: LimitsConfig,
    batching: BatchingConfig,
    batches: BatchQueue<ThumbnailGenerationMessage>,
    collection_locks: DashMap<CollectionId, Arc<tokio::sync::Mutex<()>>>,
    in_flight: Arc<InFlight>,
}

#[derive(Clone)]
pub struct BatchedThumbnailWorker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BatchedThumbnailWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchedThumbnailWorker").finish_non_exhaustive()
    }
}

impl BatchedThumbnailWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        collections: Arc<dyn CollectionStore>,
        jobs: Arc<dyn JobStore>,
        archives: Arc<ArchiveService>,
        decoder: Arc<dyn MediaDecoder>,
        selector: CacheFolderSelector,
        thumbnail_config: ThumbnailConfig,
        limits: LimitsConfig,
        batching: BatchingConfig,
    ) -> Self {
        let tracker = JobProgressTracker::new(jobs.clone());
        let batches = BatchQueue::new(
            batching.max_batch_size,
            Duration::from_secs(batching.batch_timeout_seconds),
        );
        Self {
            inner: Arc::new(Inner {
                collections,
                jobs,
                tracker,
                archives,
                decoder,
                selector,
                thumbnail_config,
                limits,
                batching,
                batches,
                collection_locks: DashMap::new(),
                in_flight: Arc::new(InFlight::default()),
            }),
        }
    }

    /// Periodic flusher; the only driver of time-based batch processing.
    pub async fn run_flusher(&self, shutdown: CancellationToken) {
        let mut ticker = interval(FLUSH_SCAN_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }
            for (collection_id, messages) in self.inner.batches.take_expired() {
                self.spawn_batch(collection_id, messages);
            }
        }
    }

    /// Shutdown drain: claim every open batch and wait, bounded, for the
    /// in-flight ones.
    pub async fn dispose(&self) {
        let remaining = self.inner.batches.drain_all();
        if !remaining.is_empty() {
            info!(batches = remaining.len(), "draining thumbnail batches on shutdown");
        }
        for (collection_id, messages) in remaining {
            self.inner.process_batch(collection_id, messages).await;
        }
        let drain = Duration::from_secs(self.inner.batching.shutdown_drain_seconds);
        if !self.inner.in_flight.wait_idle(drain).await {
            warn!("thumbnail batch drain timed out");
        }
    }

    fn spawn_batch(&self, collection_id: CollectionId, messages: Vec<ThumbnailGenerationMessage>) {
        let inner = self.inner.clone();
        let guard = inner.in_flight.begin();
        tokio::spawn(async move {
            inner.process_batch(collection_id, messages).await;
            drop(guard);
        });
    }
}

impl Inner {
    /// At most one batch per collection processes at a time; later batches
    /// for the same collection queue up behind this lock.
    async fn process_batch(&self, collection_id: CollectionId, messages: Vec<ThumbnailGenerationMessage>) {
        let lock = self
            .collection_locks
            .entry(collection_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let count = messages.len();
        if let Err(e) = self.process_batch_inner(collection_id, messages).await {
            error!(
                %collection_id,
                count, "thumbnail batch failed: {e}; reconciliation will recover progress"
            );
        }
    }

    async fn process_batch_inner(
        &self,
        collection_id: CollectionId,
        messages: Vec<ThumbnailGenerationMessage>,
    ) -> Result<()> {
        let Some(collection) = self.collections.get(collection_id).await? else {
            warn!(%collection_id, "thumbnail batch for missing collection");
            for message in &messages {
                self.record_progress(
                    message,
                    JobStateDelta::Failed {
                        kind: Some(ProcessingErrorKind::FileNotFound),
                        dummy: false,
                    },
                )
                .await?;
            }
            return Ok(());
        };

        let states: HashSet<_> = messages.iter().map(|message| message.job_id).collect();
        for state_id in states {
            self.jobs
                .set_job_state_status(state_id, JobStatus::Running)
                .await?;
        }

        let folder = self.selector.assign(collection_id).await?;
        let root = PathBuf::from(&folder.path);

        // In-memory pass.
        let mut seen: HashSet<(ImageId, u32, u32)> = HashSet::new();
        let mut planned = Vec::with_capacity(messages.len());
        for message in messages {
            let plan = self
                .plan_message(&collection, &root, &mut seen, &message)
                .await;
            planned.push((message, plan));
        }

        // Disk pass: one directory creation, then the writes.
        let mut dir_ready = false;
        for (_, plan) in &planned {
            let (path, bytes) = match plan {
                Planned::Write { path, bytes, .. } => (path, bytes),
                Planned::Rewrite { path, bytes } => (path, bytes),
                _ => continue,
            };
            if !dir_ready {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                dir_ready = true;
            }
            tokio::fs::write(path, bytes).await?;
        }

        // Commit pass: every appended entry of this batch becomes visible in
        // the collection in one write.
        let entries: Vec<ArtifactEntry> = planned
            .iter()
            .filter_map(|(_, plan)| match plan {
                Planned::Write { entry, .. } => Some(entry.clone()),
                Planned::ReAdd { entry } => Some(entry.clone()),
                Planned::Failed { dummy, .. } => dummy.clone(),
                _ => None,
            })
            .collect();
        self.collections
            .append_artifacts(collection_id, ArtifactKind::Thumbnail, &entries)
            .await?;
        debug!(
            %collection_id,
            committed = entries.len(),
            "thumbnail batch committed"
        );

        // Progress pass: failures advance the stage too, so it can close.
        for (message, plan) in planned {
            match plan {
                Planned::Write { entry, .. } => {
                    self.record_progress(
                        &message,
                        JobStateDelta::Completed {
                            bytes: entry.file_size,
                        },
                    )
                    .await?;
                }
                Planned::ReAdd { .. } | Planned::Rewrite { .. } | Planned::Skipped => {
                    self.record_progress(&message, JobStateDelta::Skipped).await?;
                }
                Planned::Duplicate => {}
                Planned::Failed { kind, message: why, dummy } => {
                    debug!(image_id = %message.image_id, %kind, why, "thumbnail failed");
                    self.record_progress(
                        &message,
                        JobStateDelta::Failed {
                            kind: Some(kind),
                            dummy: dummy.is_some(),
                        },
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn plan_message(
        &self,
        collection: &Collection,
        root: &Path,
        seen: &mut HashSet<(ImageId, u32, u32)>,
        message: &ThumbnailGenerationMessage,
    ) -> Planned {
        let width = message.thumbnail_width;
        let height = message.thumbnail_height;
        if !seen.insert((message.image_id, width, height)) {
            return Planned::Duplicate;
        }

        let format = output_format_from_config(&self.thumbnail_config.format);
        let extension = artifact_extension(format, &message.archive_entry.entry_name);
        let target_path = CacheFolderSelector::thumbnail_file_path(
            root,
            collection.id,
            &message.archive_entry.entry_name,
            width,
            height,
            &extension,
        );

        if let Some(existing) = collection
            .thumbnails
            .iter()
            .find(|entry| entry.image_id == message.image_id && entry.width == width && entry.height == height)
        {
            if existing.is_dummy {
                return Planned::Skipped;
            }
            if !existing.path.is_empty()
                && tokio::fs::try_exists(&existing.path).await.unwrap_or(false)
            {
                return Planned::Skipped;
            }
            // Listed but the file vanished: regenerate bytes without a
            // second list entry. The key already has one, so a failure here
            // must not append a dummy next to it either.
            return match self.produce_bytes(message, format, width, height, false).await {
                Ok((bytes, _)) => Planned::Rewrite {
                    path: PathBuf::from(if existing.path.is_empty() {
                        target_path.to_string_lossy().into_owned()
                    } else {
                        existing.path.clone()
                    }),
                    bytes,
                },
                Err(plan) => plan,
            };
        }

        // Resume-incomplete: the artifact survived on disk after the list
        // was cleared; re-attach it as-is.
        if let Ok(metadata) = tokio::fs::metadata(&target_path).await {
            let entry = ArtifactEntry::generated(
                message.image_id,
                target_path.to_string_lossy().into_owned(),
                width,
                height,
                metadata.len(),
                extension.to_ascii_uppercase(),
                self.thumbnail_config.quality,
            );
            return Planned::ReAdd { entry };
        }

        match self.produce_bytes(message, format, width, height, true).await {
            Ok((bytes, format_tag)) => {
                let entry = ArtifactEntry::generated(
                    message.image_id,
                    target_path.to_string_lossy().into_owned(),
                    width,
                    height,
                    bytes.len() as u64,
                    format_tag,
                    self.thumbnail_config.quality,
                );
                Planned::Write {
                    entry,
                    path: target_path,
                    bytes,
                }
            }
            Err(plan) => plan,
        }
    }

    /// Extract and encode one thumbnail, or classify why it cannot be done.
    /// `with_dummy` is off when the key already has a list entry.
    async fn produce_bytes(
        &self,
        message: &ThumbnailGenerationMessage,
        format: OutputFormat,
        width: u32,
        height: u32,
        with_dummy: bool,
    ) -> std::result::Result<(Vec<u8>, String), Planned> {
        let entry = &message.archive_entry;
        let failed = |kind: ProcessingErrorKind, why: String| {
            // Thumbnails only dummy for poison sources; size-cap failures
            // stay visible through the job state alone.
            let dummy = (with_dummy && kind != ProcessingErrorKind::SourceTooLarge).then(|| {
                ArtifactEntry::dummy(message.image_id, width, height, kind, why.clone())
            });
            Planned::Failed {
                kind,
                message: why,
                dummy,
            }
        };

        let limit = if entry.is_archive_member() {
            self.limits.max_zip_entry_size_bytes
        } else {
            self.limits.max_image_size_bytes
        };
        let size = match self.archives.source_size(entry).await {
            Ok(size) => size,
            Err(e) => {
                let kind = e
                    .processing_error_kind()
                    .unwrap_or(ProcessingErrorKind::FileNotFound);
                return Err(failed(kind, e.to_string()));
            }
        };
        if size > limit {
            return Err(failed(
                ProcessingErrorKind::SourceTooLarge,
                format!("source is {size} bytes, limit {limit}"),
            ));
        }

        let bytes = match self.archives.read_source(entry).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let kind = e
                    .processing_error_kind()
                    .unwrap_or(ProcessingErrorKind::FileNotFound);
                return Err(failed(kind, e.to_string()));
            }
        };

        let pass_through = format == OutputFormat::Original
            || media_types::is_animated_format(&entry.entry_name)
            || is_animated_webp(&bytes);
        if pass_through {
            let tag = artifact_extension(OutputFormat::Original, &entry.entry_name)
                .to_ascii_uppercase();
            return Ok((bytes, tag));
        }

        match self
            .decoder
            .resize(
                bytes,
                crate::media::ResizeSpec {
                    width,
                    height,
                    format,
                    quality: self.thumbnail_config.quality,
                },
            )
            .await
        {
            Ok(artifact) => Ok((artifact.bytes, artifact.format)),
            Err(e) => {
                let kind = e
                    .processing_error_kind()
                    .unwrap_or(ProcessingErrorKind::DecoderFailure);
                Err(failed(kind, e.to_string()))
            }
        }
    }

    async fn record_progress(
        &self,
        message: &ThumbnailGenerationMessage,
        delta: JobStateDelta,
    ) -> Result<()> {
        let counters = self.jobs.increment_job_state(message.job_id, delta).await?;
        self.tracker
            .advance_stage(
                message.scan_job_id,
                stage_for_kind(ArtifactKind::Thumbnail),
                1,
            )
            .await?;
        self.tracker
            .apply_job_state_counters(message.job_id, counters)
            .await
    }
}

#[async_trait]
impl MessageHandler for BatchedThumbnailWorker {
    fn message_type(&self) -> MessageType {
        MessageType::ThumbnailGeneration
    }

    /// Adding to the batch is the whole delivery; the broker acks on
    /// return, and per-image outcomes are accounted through job states when
    /// the batch processes.
    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        let message: ThumbnailGenerationMessage = delivery.envelope.decode()?;
        let collection_id = message.collection_id;
        if let Some(batch) = self.inner.batches.add(collection_id, message) {
            self.spawn_batch(collection_id, batch);
        }
        Ok(())
    }
}
