//! Fine-grained per-file progress accounting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::artifact::{ArtifactKind, ArtifactSettings, ProcessingErrorKind};
use crate::ids::{CollectionId, JobId, JobStateId};
use crate::job::JobStatus;

/// Per-collection, per-artifact-kind counters driving completion detection.
///
/// `completed + failed + skipped` never exceeds `total_images`, and once
/// `total_images` is set it never decreases. All increments go through the
/// store's atomic counter operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileProcessingJobState {
    pub id: JobStateId,
    /// The driving background job.
    pub job_id: JobId,
    pub collection_id: CollectionId,
    pub kind: ArtifactKind,
    pub status: JobStatus,
    pub total_images: u64,
    #[serde(default)]
    pub completed_images: u64,
    #[serde(default)]
    pub failed_images: u64,
    #[serde(default)]
    pub skipped_images: u64,
    #[serde(default)]
    pub dummy_entry_count: u64,
    #[serde(default)]
    pub error_summary: HashMap<ProcessingErrorKind, u64>,
    /// Snapshot of the generation settings this job runs with.
    pub settings: ArtifactSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl FileProcessingJobState {
    pub fn new(
        job_id: JobId,
        collection_id: CollectionId,
        kind: ArtifactKind,
        total_images: u64,
        settings: ArtifactSettings,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobStateId::new(),
            job_id,
            collection_id,
            kind,
            status: JobStatus::Pending,
            total_images,
            completed_images: 0,
            failed_images: 0,
            skipped_images: 0,
            dummy_entry_count: 0,
            error_summary: HashMap::new(),
            settings,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Every image has reached a terminal outcome.
    pub fn is_finished(&self) -> bool {
        self.completed_images + self.failed_images + self.skipped_images >= self.total_images
    }
}

/// Counter snapshot returned by atomic job-state increments, so callers can
/// detect completion from the values they themselves produced instead of
/// racing a second read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStateCounters {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub dummy_entries: u64,
}

impl JobStateCounters {
    pub fn is_finished(&self) -> bool {
        self.completed + self.failed + self.skipped >= self.total
    }
}
