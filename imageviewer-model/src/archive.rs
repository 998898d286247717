//! Uniform addressing of media files inside and outside archives.
//!
//! A single [`ArchiveEntry`] value describes either a regular file on disk
//! (the "archive path" is then the containing directory) or a member of a
//! compressed archive. The display form is `archivePath::entryName`; the
//! `::` separator is illegal in both Windows and Unix filenames, which makes
//! the encoding reversible without any escaping.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::collection::SourceFileType;
use crate::error::ModelError;

/// The reserved separator between the container path and the entry name.
pub const DISPLAY_SEPARATOR: &str = "::";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveEntry {
    /// Filesystem path of the archive, or the directory of a regular file.
    pub archive_path: String,
    /// Entry filename (basename).
    pub entry_name: String,
    /// Full path of the entry inside the archive; equals `entry_name` for
    /// regular files and flat archives.
    pub entry_path: String,
    pub file_type: SourceFileType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncompressed_size: Option<u64>,
}

impl ArchiveEntry {
    /// Address a regular file given its containing directory and filename.
    pub fn for_regular_file(
        directory: impl AsRef<Path>,
        filename: &str,
    ) -> Result<Self, ModelError> {
        let directory = directory.as_ref().to_string_lossy().into_owned();
        validate_component(&directory)?;
        validate_component(filename)?;
        Ok(Self {
            archive_path: directory,
            entry_name: filename.to_string(),
            entry_path: filename.to_string(),
            file_type: SourceFileType::RegularFile,
            compressed_size: None,
            uncompressed_size: None,
        })
    }

    /// Address a member of a compressed archive.
    pub fn for_archive_member(
        archive_path: impl AsRef<Path>,
        entry_path: &str,
    ) -> Result<Self, ModelError> {
        let archive_path = archive_path.as_ref().to_string_lossy().into_owned();
        validate_component(&archive_path)?;
        validate_component(entry_path)?;
        let entry_name = entry_path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(entry_path)
            .to_string();
        Ok(Self {
            archive_path,
            entry_name,
            entry_path: entry_path.to_string(),
            file_type: SourceFileType::ArchiveMember,
            compressed_size: None,
            uncompressed_size: None,
        })
    }

    pub fn with_sizes(mut self, compressed: Option<u64>, uncompressed: Option<u64>) -> Self {
        self.compressed_size = compressed;
        self.uncompressed_size = uncompressed;
        self
    }

    pub fn is_archive_member(&self) -> bool {
        self.file_type == SourceFileType::ArchiveMember
    }

    /// Absolute path of the source: the file itself for regular files, the
    /// containing archive for members.
    pub fn container_path(&self) -> PathBuf {
        match self.file_type {
            SourceFileType::ArchiveMember => PathBuf::from(&self.archive_path),
            _ => Path::new(&self.archive_path).join(&self.entry_name),
        }
    }

    /// The lossless display form, `archivePath::entryPath`.
    pub fn display_path(&self) -> String {
        format!("{}{}{}", self.archive_path, DISPLAY_SEPARATOR, self.entry_path)
    }

    /// Inverse of [`ArchiveEntry::display_path`]. Returns `None` unless the
    /// input splits into exactly two non-empty parts; callers must not invent
    /// defaults for unparseable paths.
    pub fn parse_display_path(display: &str) -> Option<Self> {
        let mut parts = display.split(DISPLAY_SEPARATOR);
        let archive_path = parts.next()?;
        let entry_path = parts.next()?;
        if parts.next().is_some() || archive_path.is_empty() || entry_path.is_empty() {
            return None;
        }
        Self::for_archive_member(archive_path, entry_path).ok()
    }
}

impl std::fmt::Display for ArchiveEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_path())
    }
}

fn validate_component(component: &str) -> Result<(), ModelError> {
    if component.contains(DISPLAY_SEPARATOR) {
        return Err(ModelError::ReservedSeparator(component.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_path_round_trips() {
        let entry = ArchiveEntry::for_archive_member("/data/comics/vol1.cbz", "pages/001.jpg")
            .expect("valid components");
        let display = entry.display_path();
        assert_eq!(display, "/data/comics/vol1.cbz::pages/001.jpg");

        let parsed = ArchiveEntry::parse_display_path(&display).expect("round trip");
        assert_eq!(parsed.archive_path, entry.archive_path);
        assert_eq!(parsed.entry_path, entry.entry_path);
        assert_eq!(parsed.entry_name, "001.jpg");
        assert!(parsed.is_archive_member());
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!(ArchiveEntry::parse_display_path("no-separator").is_none());
        assert!(ArchiveEntry::parse_display_path("a::b::c").is_none());
        assert!(ArchiveEntry::parse_display_path("::entry").is_none());
        assert!(ArchiveEntry::parse_display_path("archive::").is_none());
        // Legacy '#' separators are malformed input, not an alternate syntax.
        assert!(ArchiveEntry::parse_display_path("/data/a.zip#001.jpg").is_none());
    }

    #[test]
    fn constructors_reject_reserved_separator() {
        assert!(ArchiveEntry::for_archive_member("/data/a::b.zip", "x.jpg").is_err());
        assert!(ArchiveEntry::for_archive_member("/data/a.zip", "x::y.jpg").is_err());
        assert!(ArchiveEntry::for_regular_file("/photos", "we::ird.png").is_err());
    }

    #[test]
    fn regular_file_container_path_joins_directory_and_name() {
        let entry = ArchiveEntry::for_regular_file("/photos/trip", "beach.jpg").unwrap();
        assert!(!entry.is_archive_member());
        assert_eq!(entry.container_path(), PathBuf::from("/photos/trip/beach.jpg"));
    }
}
