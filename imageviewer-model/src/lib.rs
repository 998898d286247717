//! Shared data model for the imageviewer ingestion pipeline.
//!
//! Everything that crosses a process or adapter boundary lives here: the
//! collection documents persisted by the data store, the per-file archive
//! addressing, background job bookkeeping, and the JSON message envelopes
//! exchanged over the broker.

pub mod archive;
pub mod artifact;
pub mod cache_folder;
pub mod collection;
pub mod error;
pub mod ids;
pub mod job;
pub mod job_state;
pub mod media_types;
pub mod message;

pub use archive::ArchiveEntry;
pub use artifact::{ArtifactEntry, ArtifactKind, ArtifactSettings, OutputFormat, ProcessingErrorKind};
pub use cache_folder::CacheFolder;
pub use collection::{Collection, CollectionType, ImageEntry, SourceFileType};
pub use error::ModelError;
pub use ids::{CacheFolderId, CollectionId, ImageId, JobId, JobStateId, LibraryId};
pub use job::{BackgroundJob, JobStage, JobStages, JobStatus, JobType, StageKind, StageStatus};
pub use job_state::{FileProcessingJobState, JobStateCounters};
pub use message::{
    BulkOperationMessage, BulkOperationType, CacheGenerationMessage, CollectionCreationMessage,
    CollectionScanMessage, DLQ_QUEUE, ImageProcessingMessage, LibraryScanMessage, MessageOrigin,
    MessageType, ThumbnailGenerationMessage,
};
