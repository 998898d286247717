//! Background jobs and their three named stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::artifact::ProcessingErrorKind;
use crate::ids::{CollectionId, JobId, LibraryId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    CollectionScan,
    ResumeCollection,
    CollectionCreation,
    LibraryScan,
    BulkOperation,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::CollectionScan => "collection-scan",
            JobType::ResumeCollection => "resume-collection",
            JobType::CollectionCreation => "collection-creation",
            JobType::LibraryScan => "library-scan",
            JobType::BulkOperation => "bulk-operation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    CompletedWithErrors,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::CompletedWithErrors
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageKind {
    Scan,
    Thumbnail,
    Cache,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Scan => "scan",
            StageKind::Thumbnail => "thumbnail",
            StageKind::Cache => "cache",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Progress counters for one named phase of a job. `completed_items` never
/// exceeds `total_items`; a `Completed` stage has the two equal unless the
/// stage was closed early with an explicit message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStage {
    pub status: StageStatus,
    pub total_items: u64,
    pub completed_items: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Default for JobStage {
    fn default() -> Self {
        Self {
            status: StageStatus::Pending,
            total_items: 0,
            completed_items: 0,
            started_at: None,
            completed_at: None,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStages {
    #[serde(default)]
    pub scan: JobStage,
    #[serde(default)]
    pub thumbnail: JobStage,
    #[serde(default)]
    pub cache: JobStage,
}

impl JobStages {
    pub fn get(&self, kind: StageKind) -> &JobStage {
        match kind {
            StageKind::Scan => &self.scan,
            StageKind::Thumbnail => &self.thumbnail,
            StageKind::Cache => &self.cache,
        }
    }

    pub fn get_mut(&mut self, kind: StageKind) -> &mut JobStage {
        match kind {
            StageKind::Scan => &mut self.scan,
            StageKind::Thumbnail => &mut self.thumbnail,
            StageKind::Cache => &mut self.cache,
        }
    }

    pub fn all_completed(&self) -> bool {
        [&self.scan, &self.thumbnail, &self.cache]
            .iter()
            .all(|stage| stage.status == StageStatus::Completed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundJob {
    pub id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<CollectionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_id: Option<LibraryId>,
    #[serde(default)]
    pub stages: JobStages,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub error_summary: HashMap<ProcessingErrorKind, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl BackgroundJob {
    pub fn new(job_type: JobType) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            job_type,
            status: JobStatus::Pending,
            collection_id: None,
            library_id: None,
            stages: JobStages::default(),
            success_count: 0,
            error_count: 0,
            error_summary: HashMap::new(),
            message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn for_collection(job_type: JobType, collection_id: CollectionId) -> Self {
        let mut job = Self::new(job_type);
        job.collection_id = Some(collection_id);
        job
    }
}
