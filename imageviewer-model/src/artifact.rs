//! Derived artifacts: thumbnails and cache renditions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ImageId;

/// The two artifact lists a collection maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArtifactKind {
    Thumbnail,
    Cache,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Thumbnail => "thumbnail",
            ArtifactKind::Cache => "cache",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal per-source failure kinds. A message failing with one of these is
/// acknowledged instead of requeued; retrying cannot succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessingErrorKind {
    DecoderFailure,
    FileNotFound,
    UnsupportedFormat,
    CorruptedArchive,
    PathTooLong,
    Unauthorized,
    BadImageFormat,
    SourceTooLarge,
}

impl std::fmt::Display for ProcessingErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ProcessingErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingErrorKind::DecoderFailure => "decoder-failure",
            ProcessingErrorKind::FileNotFound => "file-not-found",
            ProcessingErrorKind::UnsupportedFormat => "unsupported-format",
            ProcessingErrorKind::CorruptedArchive => "corrupted-archive",
            ProcessingErrorKind::PathTooLong => "path-too-long",
            ProcessingErrorKind::Unauthorized => "unauthorized",
            ProcessingErrorKind::BadImageFormat => "bad-image-format",
            ProcessingErrorKind::SourceTooLarge => "source-too-large",
        }
    }
}

/// Encoded output selection for generated artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Png,
    Webp,
    /// Keep the source bytes and extension; used for animated formats and
    /// videos that are never re-encoded.
    Original,
}

impl OutputFormat {
    /// File extension for the encoded output. `Original` callers must derive
    /// the extension from the source filename instead.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            OutputFormat::Jpeg => Some("jpg"),
            OutputFormat::Png => Some("png"),
            OutputFormat::Webp => Some("webp"),
            OutputFormat::Original => None,
        }
    }
}

/// Snapshot of the generation settings a job ran with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSettings {
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
    pub quality: u8,
    #[serde(default)]
    pub preserve_original: bool,
}

/// One element of a collection's `thumbnails` or `cache_images` list.
///
/// `(image_id, width, height)` is unique per list. Direct-reference entries
/// carry the original file's path and `is_generated == false`. Dummy entries
/// mark a terminal failure: `is_dummy` implies `!is_valid && !is_generated`
/// and an error message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactEntry {
    pub image_id: ImageId,
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub file_size: u64,
    pub format: String,
    pub quality: u8,
    pub is_generated: bool,
    pub is_valid: bool,
    #[serde(default)]
    pub is_dummy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ProcessingErrorKind>,
    #[serde(default)]
    pub access_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ArtifactEntry {
    pub fn generated(
        image_id: ImageId,
        path: impl Into<String>,
        width: u32,
        height: u32,
        file_size: u64,
        format: impl Into<String>,
        quality: u8,
    ) -> Self {
        let now = Utc::now();
        Self {
            image_id,
            path: path.into(),
            width,
            height,
            file_size,
            format: format.into(),
            quality,
            is_generated: true,
            is_valid: true,
            is_dummy: false,
            error_message: None,
            error_kind: None,
            access_count: 0,
            last_accessed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// An entry whose path points at the original source; no bytes were
    /// produced.
    pub fn direct_reference(
        image_id: ImageId,
        source_path: impl Into<String>,
        width: u32,
        height: u32,
        file_size: u64,
        format: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            image_id,
            path: source_path.into(),
            width,
            height,
            file_size,
            format: format.into(),
            quality: 100,
            is_generated: false,
            is_valid: true,
            is_dummy: false,
            error_message: None,
            error_kind: None,
            access_count: 0,
            last_accessed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A terminal-failure marker so progress accounting can complete.
    pub fn dummy(
        image_id: ImageId,
        width: u32,
        height: u32,
        kind: ProcessingErrorKind,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            image_id,
            path: String::new(),
            width,
            height,
            file_size: 0,
            format: String::new(),
            quality: 0,
            is_generated: false,
            is_valid: false,
            is_dummy: true,
            error_message: Some(message.into()),
            error_kind: Some(kind),
            access_count: 0,
            last_accessed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummy_entries_are_invalid_and_not_generated() {
        let entry = ArtifactEntry::dummy(
            ImageId::new(),
            300,
            300,
            ProcessingErrorKind::DecoderFailure,
            "truncated jpeg",
        );
        assert!(entry.is_dummy);
        assert!(!entry.is_valid);
        assert!(!entry.is_generated);
        assert!(entry.error_message.is_some());
        assert_eq!(entry.error_kind, Some(ProcessingErrorKind::DecoderFailure));
    }

    #[test]
    fn error_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&ProcessingErrorKind::BadImageFormat).unwrap();
        assert_eq!(json, "\"bad-image-format\"");
    }
}
