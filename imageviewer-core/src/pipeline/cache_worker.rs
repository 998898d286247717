//! Batched cache rendition generation.
//!
//! Same shape as the thumbnail consumer, with two additions: a smart-quality
//! pass that never encodes above what the source bytes justify, and cache
//! folder size accounting through atomic store increments after each disk
//! write.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use imageviewer_config::{BatchingConfig, CacheConfig, LimitsConfig};
use imageviewer_model::{
    ArtifactEntry, ArtifactKind, CacheGenerationMessage, Collection, CollectionId, ImageId,
    JobStatus, MessageType, OutputFormat, ProcessingErrorKind, media_types,
};

use super::batch::BatchQueue;
use super::quality::decide_quality;
use super::InFlight;
use crate::archive::ArchiveService;
use crate::broker::Delivery;
use crate::cache::CacheFolderSelector;
use crate::cache::selector::artifact_extension;
use crate::consumer::MessageHandler;
use crate::error::Result;
use crate::jobs::JobProgressTracker;
use crate::jobs::tracker::stage_for_kind;
use crate::media::{MediaDecoder, ResizeSpec, is_animated_webp};
use crate::store::{CollectionStore, JobStateDelta, JobStore};

const FLUSH_SCAN_INTERVAL: Duration = Duration::from_secs(5);

enum Planned {
    Write {
        entry: ArtifactEntry,
        path: PathBuf,
        bytes: Vec<u8>,
        /// Entry this write supersedes (forced regeneration); it is removed
        /// from the list before the batch append so the
        /// `(image_id, width, height)` key stays unique.
        replaced: Option<ArtifactEntry>,
    },
    ReAdd {
        entry: ArtifactEntry,
    },
    /// Listed in the collection but missing on disk; rewrite the file
    /// without a second list entry.
    Rewrite {
        path: PathBuf,
        bytes: Vec<u8>,
        previous_size: u64,
    },
    /// Already terminally materialized; counts as skipped work.
    Skipped,
    /// Repeated within this batch; no counters move.
    Duplicate,
    Failed {
        kind: ProcessingErrorKind,
        message: String,
        /// Absent when the list already holds an entry for the key; the
        /// failure is then recorded through the job state alone.
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
    cache_config: CacheConfig,
    limits: LimitsConfig,
    batching: BatchingConfig,
    batches: BatchQueue<CacheGenerationMessage>,
    collection_locks: DashMap<CollectionId, Arc<tokio::sync::Mutex<()>>>,
    in_flight: Arc<InFlight>,
}

#[derive(Clone)]
pub struct BatchedCacheWorker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BatchedCacheWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchedCacheWorker").finish_non_exhaustive()
    }
}

impl BatchedCacheWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        collections: Arc<dyn CollectionStore>,
        jobs: Arc<dyn JobStore>,
        archives: Arc<ArchiveService>,
        decoder: Arc<dyn MediaDecoder>,
        selector: CacheFolderSelector,
        cache_config: CacheConfig,
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
                cache_config,
                limits,
                batching,
                batches,
                collection_locks: DashMap::new(),
                in_flight: Arc::new(InFlight::default()),
            }),
        }
    }

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

    pub async fn dispose(&self) {
        let remaining = self.inner.batches.drain_all();
        if !remaining.is_empty() {
            info!(batches = remaining.len(), "draining cache batches on shutdown");
        }
        for (collection_id, messages) in remaining {
            self.inner.process_batch(collection_id, messages).await;
        }
        let drain = Duration::from_secs(self.inner.batching.shutdown_drain_seconds);
        if !self.inner.in_flight.wait_idle(drain).await {
            warn!("cache batch drain timed out");
        }
    }

    fn spawn_batch(&self, collection_id: CollectionId, messages: Vec<CacheGenerationMessage>) {
        let inner = self.inner.clone();
        let guard = inner.in_flight.begin();
        tokio::spawn(async move {
            inner.process_batch(collection_id, messages).await;
            drop(guard);
        });
    }
}

impl Inner {
    async fn process_batch(&self, collection_id: CollectionId, messages: Vec<CacheGenerationMessage>) {
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
                count, "cache batch failed: {e}; reconciliation will recover progress"
            );
        }
    }

    async fn process_batch_inner(
        &self,
        collection_id: CollectionId,
        messages: Vec<CacheGenerationMessage>,
    ) -> Result<()> {
        let Some(collection) = self.collections.get(collection_id).await? else {
            warn!(%collection_id, "cache batch for missing collection");
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

        let mut seen: HashSet<(ImageId, u32, u32)> = HashSet::new();
        let mut planned = Vec::with_capacity(messages.len());
        for message in messages {
            let plan = self
                .plan_message(&collection, &root, &mut seen, &message)
                .await;
            planned.push((message, plan));
        }

        // Disk pass with per-write size accounting against the owning
        // folder; each accounting call is one atomic increment. Overwrites
        // of a superseded or vanished file contribute only the size delta,
        // never a second file count.
        let mut dir_ready = false;
        let mut wrote_any = false;
        for (_, plan) in &planned {
            let (path, bytes) = match plan {
                Planned::Write { path, bytes, .. } => (path, bytes),
                Planned::Rewrite { path, bytes, .. } => (path, bytes),
                _ => continue,
            };
            if !dir_ready {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                dir_ready = true;
            }
            tokio::fs::write(path, bytes).await?;

            let (bytes_delta, files_delta) = match plan {
                Planned::Rewrite { previous_size, .. } => {
                    (bytes.len() as i64 - *previous_size as i64, 0)
                }
                Planned::Write {
                    replaced: Some(old),
                    ..
                } if old.is_generated => {
                    // Regenerating over an accounted file; if the path
                    // moved, the old file goes with its bytes.
                    if old.path != path.to_string_lossy() {
                        let _ = tokio::fs::remove_file(&old.path).await;
                    }
                    (bytes.len() as i64 - old.file_size as i64, 0)
                }
                _ => (bytes.len() as i64, 1),
            };
            self.selector
                .store()
                .record_usage(folder.id, bytes_delta, files_delta)
                .await?;
            wrote_any = true;
        }
        if wrote_any {
            self.selector
                .store()
                .add_cached_collection(folder.id, collection_id)
                .await?;
        }

        // Superseded entries leave the list before the batch append so the
        // (image_id, width, height) key never appears twice.
        for (_, plan) in &planned {
            if let Planned::Write {
                replaced: Some(old),
                ..
            } = plan
            {
                self.collections
                    .remove_artifact(
                        collection_id,
                        ArtifactKind::Cache,
                        old.image_id,
                        old.width,
                        old.height,
                    )
                    .await?;
            }
        }

        let entries: Vec<ArtifactEntry> = planned
            .iter()
            .filter_map(|(_, plan)| match plan {
                Planned::Write { entry, .. } => Some(entry.clone()),
                Planned::ReAdd { entry } => Some(entry.clone()),
                Planned::Failed { dummy, .. } => dummy.clone(),
                Planned::Rewrite { .. } | Planned::Skipped | Planned::Duplicate => None,
            })
            .collect();
        self.collections
            .append_artifacts(collection_id, ArtifactKind::Cache, &entries)
            .await?;
        debug!(%collection_id, committed = entries.len(), "cache batch committed");

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
                    debug!(image_id = %message.image_id, %kind, why, "cache rendition failed");
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
        root: &std::path::Path,
        seen: &mut HashSet<(ImageId, u32, u32)>,
        message: &CacheGenerationMessage,
    ) -> Planned {
        let width = message.cache_width;
        let height = message.cache_height;
        if !seen.insert((message.image_id, width, height)) {
            return Planned::Duplicate;
        }

        let existing = collection
            .cache_images
            .iter()
            .find(|entry| {
                entry.image_id == message.image_id
                    && entry.width == width
                    && entry.height == height
            })
            .cloned();

        let extension = artifact_extension(message.format, &message.archive_entry.entry_name);
        let target_path = match &message.cache_path {
            Some(path) => PathBuf::from(path),
            None => CacheFolderSelector::cache_file_path(
                root,
                collection.id,
                message.image_id,
                width,
                height,
                &extension,
            ),
        };

        if let Some(existing) = &existing {
            if !message.force_regenerate {
                if existing.is_dummy
                    || (!existing.path.is_empty()
                        && tokio::fs::try_exists(&existing.path).await.unwrap_or(false))
                {
                    return Planned::Skipped;
                }
                // Listed but the file vanished: regenerate the bytes without
                // a second list entry. The key already has one; failures go
                // through the job state alone.
                return match self.produce_bytes(message, width, height, false).await {
                    Ok((bytes, _, _)) => Planned::Rewrite {
                        path: if existing.path.is_empty() {
                            target_path
                        } else {
                            PathBuf::from(&existing.path)
                        },
                        bytes,
                        previous_size: existing.file_size,
                    },
                    Err(plan) => plan,
                };
            }
        }

        if !message.force_regenerate {
            if let Ok(metadata) = tokio::fs::metadata(&target_path).await {
                let entry = ArtifactEntry::generated(
                    message.image_id,
                    target_path.to_string_lossy().into_owned(),
                    width,
                    height,
                    metadata.len(),
                    extension.to_ascii_uppercase(),
                    message.quality,
                );
                return Planned::ReAdd { entry };
            }
        }

        // A failure while an entry for the key is listed must not add a
        // dummy next to it.
        let with_dummy = existing.is_none();
        match self.produce_bytes(message, width, height, with_dummy).await {
            Ok((bytes, format_tag, quality)) => {
                let entry = ArtifactEntry::generated(
                    message.image_id,
                    target_path.to_string_lossy().into_owned(),
                    width,
                    height,
                    bytes.len() as u64,
                    format_tag,
                    quality,
                );
                Planned::Write {
                    entry,
                    path: target_path,
                    bytes,
                    replaced: existing,
                }
            }
            Err(plan) => plan,
        }
    }

    /// Extract, pick the effective quality, and encode one cache rendition.
    /// `with_dummy` controls whether a terminal failure leaves a dummy entry
    /// for dashboards; regeneration of an already-listed key turns it off.
    async fn produce_bytes(
        &self,
        message: &CacheGenerationMessage,
        width: u32,
        height: u32,
        with_dummy: bool,
    ) -> std::result::Result<(Vec<u8>, String, u8), Planned> {
        let entry = &message.archive_entry;
        let failed = |kind: ProcessingErrorKind, why: String| Planned::Failed {
            kind,
            dummy: with_dummy
                .then(|| ArtifactEntry::dummy(message.image_id, width, height, kind, why.clone())),
            message: why,
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

        let pass_through = message.preserve_original
            || message.format == OutputFormat::Original
            || media_types::is_animated_format(&entry.entry_name)
            || is_animated_webp(&bytes);
        if pass_through {
            let tag = artifact_extension(OutputFormat::Original, &entry.entry_name)
                .to_ascii_uppercase();
            return Ok((bytes, tag, 100));
        }

        let (source_width, source_height) = match self.decoder.probe_dimensions(&bytes).await {
            Ok(dimensions) => dimensions,
            Err(e) => {
                let kind = e
                    .processing_error_kind()
                    .unwrap_or(ProcessingErrorKind::DecoderFailure);
                return Err(failed(kind, e.to_string()));
            }
        };

        let decision = decide_quality(
            message.quality,
            size,
            source_width,
            source_height,
            width,
            height,
        );
        let (target_width, target_height) = if decision.resize {
            (width, height)
        } else {
            // Source fits inside the target; keep its pixels untouched.
            (source_width, source_height)
        };

        match self
            .decoder
            .resize(
                bytes,
                ResizeSpec {
                    width: target_width,
                    height: target_height,
                    format: message.format,
                    quality: decision.quality,
                },
            )
            .await
        {
            Ok(artifact) => Ok((artifact.bytes, artifact.format, decision.quality)),
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
        message: &CacheGenerationMessage,
        delta: JobStateDelta,
    ) -> Result<()> {
        let counters = self.jobs.increment_job_state(message.job_id, delta).await?;
        self.tracker
            .advance_stage(message.scan_job_id, stage_for_kind(ArtifactKind::Cache), 1)
            .await?;
        self.tracker
            .apply_job_state_counters(message.job_id, counters)
            .await
    }
}

#[async_trait]
impl MessageHandler for BatchedCacheWorker {
    fn message_type(&self) -> MessageType {
        MessageType::CacheGeneration
    }

    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        let message: CacheGenerationMessage = delivery.envelope.decode()?;
        let collection_id = message.collection_id;
        if let Some(batch) = self.inner.batches.add(collection_id, message) {
            self.spawn_batch(collection_id, batch);
        }
        Ok(())
    }
}
