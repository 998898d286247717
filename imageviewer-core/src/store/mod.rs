//! Data-store ports.
//!
//! Counter updates use the store's native increment operations and list
//! appends are single atomic writes; race windows between concurrent workers
//! on the same collection are closed by these contracts, never by external
//! locks. Two implementations ship: [`memory`] for tests and the embedded
//! mode, [`postgres`] for deployments.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use imageviewer_model::{
    ArtifactEntry, ArtifactKind, BackgroundJob, CacheFolder, CacheFolderId, Collection,
    CollectionId, FileProcessingJobState, ImageEntry, ImageId, JobId, JobStateCounters,
    JobStateId, JobStatus, JobType, ProcessingErrorKind, StageKind, StageStatus,
};

use crate::error::Result;

/// Partial update applied to one stage of a background job; unset fields are
/// left alone. Applied as an upsert so a stage can be initialized and
/// updated through the same call.
#[derive(Debug, Clone, Default)]
pub struct StageUpdate {
    pub status: Option<StageStatus>,
    pub total_items: Option<u64>,
    pub completed_items: Option<u64>,
    pub message: Option<String>,
}

impl StageUpdate {
    pub fn status(status: StageStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn running(total_items: u64) -> Self {
        Self {
            status: Some(StageStatus::Running),
            total_items: Some(total_items),
            ..Default::default()
        }
    }

    pub fn completed(completed_items: u64, total_items: u64) -> Self {
        Self {
            status: Some(StageStatus::Completed),
            total_items: Some(total_items),
            completed_items: Some(completed_items),
            ..Default::default()
        }
    }
}

/// One atomic mutation of a job state's counters.
#[derive(Debug, Clone, Copy)]
pub enum JobStateDelta {
    Completed {
        bytes: u64,
    },
    Skipped,
    Failed {
        kind: Option<ProcessingErrorKind>,
        /// Whether a dummy artifact entry was appended for this failure.
        dummy: bool,
    },
}

#[async_trait]
pub trait CollectionStore: Send + Sync {
    async fn insert(&self, collection: &Collection) -> Result<()>;

    async fn get(&self, id: CollectionId) -> Result<Option<Collection>>;

    async fn find_by_path(&self, path: &str) -> Result<Option<Collection>>;

    /// Single-write append of one image entry.
    async fn append_image(&self, id: CollectionId, image: &ImageEntry) -> Result<()>;

    /// Single-write append of a whole batch of artifact entries; all entries
    /// become visible together or not at all.
    async fn append_artifacts(
        &self,
        id: CollectionId,
        kind: ArtifactKind,
        entries: &[ArtifactEntry],
    ) -> Result<()>;

    /// Single-write removal of the entry keyed by `(image_id, width,
    /// height)`, returning it. Regeneration drops the superseded entry
    /// through this before appending its replacement, keeping the key
    /// unique per list.
    async fn remove_artifact(
        &self,
        id: CollectionId,
        kind: ArtifactKind,
        image_id: ImageId,
        width: u32,
        height: u32,
    ) -> Result<Option<ArtifactEntry>>;

    /// Forced-rescan reset of the `images`, `thumbnails`, and `cache_images`
    /// lists.
    async fn clear_image_arrays(&self, id: CollectionId) -> Result<()>;
}

#[async_trait]
pub trait CacheFolderStore: Send + Sync {
    async fn insert(&self, folder: &CacheFolder) -> Result<()>;

    async fn get(&self, id: CacheFolderId) -> Result<Option<CacheFolder>>;

    async fn find_by_name(&self, name: &str) -> Result<Option<CacheFolder>>;

    async fn list_active(&self) -> Result<Vec<CacheFolder>>;

    /// Atomic increment of `current_size_bytes` and `total_files`.
    async fn record_usage(&self, id: CacheFolderId, bytes: i64, files: i64) -> Result<()>;

    /// Set-insert of a collection into `cached_collections`.
    async fn add_cached_collection(
        &self,
        id: CacheFolderId,
        collection_id: CollectionId,
    ) -> Result<()>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: &BackgroundJob) -> Result<()>;

    async fn get_job(&self, id: JobId) -> Result<Option<BackgroundJob>>;

    /// Jobs of the given types still `Pending` or `Running`, oldest first.
    async fn list_unfinished_jobs(
        &self,
        job_types: &[JobType],
        limit: u32,
    ) -> Result<Vec<BackgroundJob>>;

    async fn set_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        message: Option<String>,
    ) -> Result<()>;

    /// Fold per-collection outcome statistics into the parent job.
    async fn record_job_outcome(
        &self,
        id: JobId,
        success_count: u64,
        error_count: u64,
        error_summary: &std::collections::HashMap<ProcessingErrorKind, u64>,
    ) -> Result<()>;

    async fn update_stage(&self, id: JobId, stage: StageKind, update: StageUpdate) -> Result<()>;

    /// Atomic bump of a stage's `completed_items`, clamped to the stage
    /// total. Returns the new value.
    async fn increment_stage_completed(
        &self,
        id: JobId,
        stage: StageKind,
        delta: u64,
    ) -> Result<u64>;

    async fn create_job_state(&self, state: &FileProcessingJobState) -> Result<()>;

    async fn get_job_state(&self, id: JobStateId) -> Result<Option<FileProcessingJobState>>;

    async fn find_job_state(
        &self,
        job_id: JobId,
        collection_id: CollectionId,
        kind: ArtifactKind,
    ) -> Result<Option<FileProcessingJobState>>;

    /// Transition a job state that is not already terminal. Returns whether
    /// the transition happened, so exactly one of several racing finalizers
    /// rolls results up into the parent job.
    async fn set_job_state_status(&self, id: JobStateId, status: JobStatus) -> Result<bool>;

    /// Atomic counter mutation returning the counters it produced, so
    /// completion can be detected without racing a second read.
    async fn increment_job_state(
        &self,
        id: JobStateId,
        delta: JobStateDelta,
    ) -> Result<JobStateCounters>;
}
