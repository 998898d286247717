//! Collection documents and the image entries appended to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::archive::ArchiveEntry;
use crate::artifact::ArtifactEntry;
use crate::ids::{CollectionId, ImageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CollectionType {
    /// A directory scanned one level deep; nested archives become their own
    /// collections.
    Folder,
    /// A single compressed archive whose members form the collection.
    Archive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceFileType {
    RegularFile,
    /// The file is itself an archive.
    ArchiveFile,
    /// The file lives inside an archive.
    ArchiveMember,
}

/// One discovered media file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageEntry {
    pub id: ImageId,
    pub filename: String,
    /// Relative to the collection root; the in-archive path for archive
    /// collections.
    pub relative_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_entry: Option<ArchiveEntry>,
    pub file_type: SourceFileType,
    pub file_size: u64,
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ImageEntry {
    pub fn new(
        filename: impl Into<String>,
        relative_path: impl Into<String>,
        file_type: SourceFileType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ImageId::new(),
            filename: filename.into(),
            relative_path: relative_path.into(),
            archive_entry: None,
            file_type,
            file_size: 0,
            width: 0,
            height: 0,
            format: String::new(),
            created_at: now,
            updated_at: now,
            deleted: false,
            metadata: None,
        }
    }
}

/// A grouping of media discovered under one path. The three arrays are
/// append-mostly; `thumbnails` and `cache_images` reference `images` by
/// `imageId` and are only cleared together during a forced rescan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub id: CollectionId,
    pub name: String,
    pub path: String,
    pub collection_type: CollectionType,
    /// Persisted operator preference; a scan may behave as if this were set
    /// (videos force it) without mutating it.
    #[serde(default)]
    pub use_direct_access: bool,
    #[serde(default)]
    pub images: Vec<ImageEntry>,
    #[serde(default)]
    pub thumbnails: Vec<ArtifactEntry>,
    #[serde(default)]
    pub cache_images: Vec<ArtifactEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Collection {
    pub fn new(name: impl Into<String>, path: impl Into<String>, kind: CollectionType) -> Self {
        let now = Utc::now();
        Self {
            id: CollectionId::new(),
            name: name.into(),
            path: path.into(),
            collection_type: kind,
            use_direct_access: false,
            images: Vec::new(),
            thumbnails: Vec::new(),
            cache_images: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn find_image(&self, id: ImageId) -> Option<&ImageEntry> {
        self.images.iter().find(|image| image.id == id)
    }

    pub fn has_thumbnail(&self, id: ImageId, width: u32, height: u32) -> bool {
        self.thumbnails
            .iter()
            .any(|entry| entry.image_id == id && entry.width == width && entry.height == height)
    }

    pub fn has_cache_entry(&self, id: ImageId, width: u32, height: u32) -> bool {
        self.cache_images
            .iter()
            .any(|entry| entry.image_id == id && entry.width == width && entry.height == height)
    }
}
