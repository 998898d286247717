//! Core ingestion pipeline for imageviewer.
//!
//! Everything here sits between three external collaborators, each consumed
//! through a port: the message broker, the data store, and the media
//! decoder. The pipeline itself is the staged job model (scan → thumbnail →
//! cache) with batched artifact consumers, dead-letter recovery, and a
//! stuck-job reconciler.

pub mod archive;
pub mod broker;
pub mod cache;
pub mod consumer;
pub mod error;
pub mod jobs;
pub mod media;
pub mod pipeline;
pub mod recovery;
pub mod store;

pub use archive::{ArchiveFormat, ArchiveService};
pub use broker::{Delivery, Envelope, MessageBroker, QueueBinding, QueueConsumer};
pub use cache::CacheFolderSelector;
pub use consumer::{ConsumerRegistry, MessageHandler};
pub use error::{PipelineError, Result};
pub use jobs::{JobProgressTracker, StuckJobReconciler};
pub use media::{EncodedArtifact, MediaDecoder, ResizeSpec};
pub use pipeline::{
    BatchedCacheWorker, BatchedThumbnailWorker, BulkOperationWorker, CollectionCreationWorker,
    ImageProcessingWorker, LibraryScanWorker, ScanWorker,
};
pub use recovery::DlqRecovery;
