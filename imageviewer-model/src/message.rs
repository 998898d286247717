//! JSON message envelopes and the fixed message-type table.
//!
//! Every envelope is self-describing: it names its type in the broker
//! headers, carries the collection id, the image id when applicable, the
//! target dimensions, and both the driving background job id and the
//! per-file job-state id. Wire format is JSON with camelCase keys.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::archive::ArchiveEntry;
use crate::artifact::OutputFormat;
use crate::collection::CollectionType;
use crate::error::ModelError;
use crate::ids::{CollectionId, ImageId, JobId, JobStateId, LibraryId};

/// The closed set of message types, their routing keys, and the queues they
/// originate from. Queue name equals routing key throughout; dead-letter
/// recovery republishes by looking a type up in this same table, so the two
/// can never drift apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    CollectionScan,
    CollectionCreation,
    ImageProcessing,
    ThumbnailGeneration,
    CacheGeneration,
    BulkOperation,
    LibraryScan,
}

/// The dead-letter queue every work queue is bound to.
pub const DLQ_QUEUE: &str = "imageviewer.dlq";

impl MessageType {
    pub const ALL: &[MessageType] = &[
        MessageType::CollectionScan,
        MessageType::CollectionCreation,
        MessageType::ImageProcessing,
        MessageType::ThumbnailGeneration,
        MessageType::CacheGeneration,
        MessageType::BulkOperation,
        MessageType::LibraryScan,
    ];

    pub fn routing_key(&self) -> &'static str {
        match self {
            MessageType::CollectionScan => "collection.scan",
            MessageType::CollectionCreation => "collection.creation",
            MessageType::ImageProcessing => "image.processing",
            MessageType::ThumbnailGeneration => "thumbnail.generation",
            MessageType::CacheGeneration => "cache.generation",
            MessageType::BulkOperation => "bulk.operation",
            MessageType::LibraryScan => "library_scan_queue",
        }
    }

    /// The value carried in the `MessageType` broker header.
    pub fn header_value(&self) -> &'static str {
        match self {
            MessageType::CollectionScan => "CollectionScan",
            MessageType::CollectionCreation => "CollectionCreation",
            MessageType::ImageProcessing => "ImageProcessing",
            MessageType::ThumbnailGeneration => "ThumbnailGeneration",
            MessageType::CacheGeneration => "CacheGeneration",
            MessageType::BulkOperation => "BulkOperation",
            MessageType::LibraryScan => "LibraryScan",
        }
    }

    pub fn from_header_value(value: &str) -> Result<Self, ModelError> {
        Self::ALL
            .iter()
            .copied()
            .find(|message_type| message_type.header_value() == value)
            .ok_or_else(|| ModelError::UnknownMessageType(value.to_string()))
    }

    pub fn from_routing_key(key: &str) -> Result<Self, ModelError> {
        Self::ALL
            .iter()
            .copied()
            .find(|message_type| message_type.routing_key() == key)
            .ok_or_else(|| ModelError::UnknownRoutingKey(key.to_string()))
    }
}

/// Who queued a message; carried on every envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageOrigin {
    pub created_by: String,
    pub created_by_system: String,
}

impl MessageOrigin {
    pub fn system(component: impl Into<String>) -> Self {
        Self {
            created_by: "system".to_string(),
            created_by_system: component.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionScanMessage {
    pub collection_id: CollectionId,
    pub collection_path: String,
    pub collection_type: CollectionType,
    pub force_rescan: bool,
    pub use_direct_file_access: bool,
    pub job_id: JobId,
    #[serde(flatten)]
    pub origin: MessageOrigin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionCreationMessage {
    pub name: String,
    pub path: String,
    pub collection_type: CollectionType,
    pub use_direct_file_access: bool,
    pub force_rescan: bool,
    pub job_id: JobId,
    #[serde(flatten)]
    pub origin: MessageOrigin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageProcessingMessage {
    pub image_id: ImageId,
    pub collection_id: CollectionId,
    pub archive_entry: ArchiveEntry,
    pub image_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    pub generate_thumbnail: bool,
    pub optimize_image: bool,
    /// The driving scan job.
    pub scan_job_id: JobId,
    #[serde(flatten)]
    pub origin: MessageOrigin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailGenerationMessage {
    pub image_id: ImageId,
    pub collection_id: CollectionId,
    pub archive_entry: ArchiveEntry,
    pub thumbnail_width: u32,
    pub thumbnail_height: u32,
    /// The per-file job state tracking this collection's thumbnail progress.
    pub job_id: JobStateId,
    /// The parent background job.
    pub scan_job_id: JobId,
    #[serde(flatten)]
    pub origin: MessageOrigin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheGenerationMessage {
    pub image_id: ImageId,
    pub collection_id: CollectionId,
    pub archive_entry: ArchiveEntry,
    /// Pre-determined cache file path so all images of one collection land
    /// on the same cache root regardless of which worker processes them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_path: Option<String>,
    pub cache_width: u32,
    pub cache_height: u32,
    pub quality: u8,
    pub format: OutputFormat,
    pub preserve_original: bool,
    pub force_regenerate: bool,
    /// The per-file job state tracking this collection's cache progress.
    pub job_id: JobStateId,
    /// The parent background job.
    pub scan_job_id: JobId,
    #[serde(flatten)]
    pub origin: MessageOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BulkOperationType {
    Rescan,
    RegenerateThumbnails,
    RegenerateCache,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkOperationMessage {
    pub operation_type: BulkOperationType,
    pub collection_ids: Vec<CollectionId>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    pub job_id: JobId,
    #[serde(flatten)]
    pub origin: MessageOrigin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryScanMessage {
    pub library_id: LibraryId,
    pub library_path: String,
    pub include_subfolders: bool,
    pub overwrite_existing: bool,
    pub resume_incomplete: bool,
    pub use_direct_file_access: bool,
    pub job_run_id: JobId,
    #[serde(flatten)]
    pub origin: MessageOrigin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_table_round_trips() {
        for message_type in MessageType::ALL {
            let key = message_type.routing_key();
            assert_eq!(MessageType::from_routing_key(key).unwrap(), *message_type);
            let header = message_type.header_value();
            assert_eq!(MessageType::from_header_value(header).unwrap(), *message_type);
        }
        assert!(MessageType::from_routing_key("no.such.queue").is_err());
    }

    #[test]
    fn envelopes_use_camel_case_keys() {
        let message = ThumbnailGenerationMessage {
            image_id: ImageId::new(),
            collection_id: CollectionId::new(),
            archive_entry: ArchiveEntry::for_regular_file("/photos", "a.jpg").unwrap(),
            thumbnail_width: 300,
            thumbnail_height: 300,
            job_id: JobStateId::new(),
            scan_job_id: JobId::new(),
            origin: MessageOrigin::system("scan-worker"),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert!(value.get("thumbnailWidth").is_some());
        assert!(value.get("scanJobId").is_some());
        assert!(value.get("createdBySystem").is_some());
        assert!(value.get("thumbnail_width").is_none());
    }
}
