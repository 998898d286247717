use imageviewer_model::{ModelError, ProcessingErrorKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("decoder failure: {0}")]
    Decode(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("corrupted archive: {0}")]
    CorruptedArchive(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("source is {size} bytes, above the configured limit of {limit}")]
    SourceTooLarge { size: u64, limit: u64 },

    #[error("path too long: {0}")]
    PathTooLong(String),

    #[error("no active cache folder is configured")]
    NoActiveCacheFolder,

    #[error("external tool failed: {0}")]
    Tool(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Terminal per-source classification. `Some(kind)` means retrying the
    /// message cannot succeed: the consumer acknowledges it and the failure
    /// is recorded against the image. `None` means transient: nack with
    /// requeue and let the broker redeliver.
    pub fn processing_error_kind(&self) -> Option<ProcessingErrorKind> {
        match self {
            PipelineError::Decode(_) => Some(ProcessingErrorKind::DecoderFailure),
            PipelineError::UnsupportedFormat(_) => Some(ProcessingErrorKind::UnsupportedFormat),
            PipelineError::CorruptedArchive(_) => Some(ProcessingErrorKind::CorruptedArchive),
            PipelineError::NotFound(_) => Some(ProcessingErrorKind::FileNotFound),
            PipelineError::SourceTooLarge { .. } => Some(ProcessingErrorKind::SourceTooLarge),
            PipelineError::PathTooLong(_) => Some(ProcessingErrorKind::PathTooLong),
            // A missing or broken external tool fails the same way on every
            // redelivery.
            PipelineError::Tool(_) => Some(ProcessingErrorKind::DecoderFailure),
            PipelineError::Io(inner) => match inner.kind() {
                std::io::ErrorKind::NotFound => Some(ProcessingErrorKind::FileNotFound),
                std::io::ErrorKind::PermissionDenied => Some(ProcessingErrorKind::Unauthorized),
                _ => None,
            },
            // Malformed payloads and unencodable paths fail identically on
            // every redelivery.
            PipelineError::Serialization(_) => Some(ProcessingErrorKind::BadImageFormat),
            PipelineError::Model(_) => Some(ProcessingErrorKind::BadImageFormat),
            _ => None,
        }
    }

    pub fn is_poison(&self) -> bool {
        self.processing_error_kind().is_some()
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
