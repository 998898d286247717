//! Compressed-archive access.
//!
//! Format variants sit behind the [`ArchiveReader`] capability (enumerate,
//! open an entry, query an entry's uncompressed size); callers never branch
//! on the concrete format. Zip-family and tar archives are read in-process,
//! 7z and rar through their command-line tools.

mod cli;
mod tar_reader;
mod zip_reader;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use imageviewer_model::ArchiveEntry;

use crate::error::{PipelineError, Result};

pub use cli::{SevenZipCliReader, UnrarCliReader};
pub use tar_reader::TarArchiveReader;
pub use zip_reader::ZipArchiveReader;

/// One member as reported by archive enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMemberInfo {
    pub entry_path: String,
    pub compressed_size: Option<u64>,
    pub uncompressed_size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    SevenZ,
    Rar,
    Tar,
    Cbz,
    Cbr,
}

impl ArchiveFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "zip" => Some(ArchiveFormat::Zip),
            "7z" => Some(ArchiveFormat::SevenZ),
            "rar" => Some(ArchiveFormat::Rar),
            "tar" => Some(ArchiveFormat::Tar),
            "cbz" => Some(ArchiveFormat::Cbz),
            "cbr" => Some(ArchiveFormat::Cbr),
            _ => None,
        }
    }
}

#[async_trait]
pub trait ArchiveReader: Send + Sync {
    async fn enumerate(&self, archive_path: &Path) -> Result<Vec<ArchiveMemberInfo>>;

    async fn open_entry(&self, archive_path: &Path, entry_path: &str) -> Result<Vec<u8>>;

    async fn uncompressed_size(&self, archive_path: &Path, entry_path: &str) -> Result<u64> {
        self.enumerate(archive_path)
            .await?
            .into_iter()
            .find(|member| member.entry_path == entry_path)
            .and_then(|member| member.uncompressed_size)
            .ok_or_else(|| {
                PipelineError::NotFound(format!(
                    "{} in {}",
                    entry_path,
                    archive_path.display()
                ))
            })
    }
}

/// macOS zip tooling litters archives with resource-fork mirrors; neither
/// the `__MACOSX` tree nor `._` AppleDouble files are media.
pub fn is_metadata_entry(entry_path: &str) -> bool {
    entry_path
        .split(['/', '\\'])
        .any(|component| component == "__MACOSX" || component.starts_with("._"))
}

/// Uniform byte access to media sources, inside archives or not.
#[derive(Debug, Clone)]
pub struct ArchiveService {
    sevenzip_path: PathBuf,
    unrar_path: PathBuf,
}

impl ArchiveService {
    pub fn new(sevenzip_path: PathBuf, unrar_path: PathBuf) -> Self {
        Self {
            sevenzip_path,
            unrar_path,
        }
    }

    fn reader_for(&self, archive_path: &Path) -> Result<Arc<dyn ArchiveReader>> {
        let format = ArchiveFormat::from_path(archive_path).ok_or_else(|| {
            PipelineError::UnsupportedFormat(format!(
                "not a recognized archive: {}",
                archive_path.display()
            ))
        })?;
        Ok(match format {
            ArchiveFormat::Zip | ArchiveFormat::Cbz => Arc::new(ZipArchiveReader),
            ArchiveFormat::Tar => Arc::new(TarArchiveReader),
            ArchiveFormat::SevenZ => {
                Arc::new(SevenZipCliReader::new(self.sevenzip_path.clone()))
            }
            ArchiveFormat::Rar | ArchiveFormat::Cbr => {
                Arc::new(UnrarCliReader::new(self.unrar_path.clone()))
            }
        })
    }

    /// File members of the archive, metadata entries filtered out.
    pub async fn enumerate_members(&self, archive_path: &Path) -> Result<Vec<ArchiveMemberInfo>> {
        let members = self.reader_for(archive_path)?.enumerate(archive_path).await?;
        Ok(members
            .into_iter()
            .filter(|member| !is_metadata_entry(&member.entry_path))
            .collect())
    }

    pub async fn read_member(&self, entry: &ArchiveEntry) -> Result<Vec<u8>> {
        let archive_path = Path::new(&entry.archive_path);
        self.reader_for(archive_path)?
            .open_entry(archive_path, &entry.entry_path)
            .await
    }

    /// Uncompressed size of a member, preferring the size captured at scan
    /// time over re-opening the archive.
    pub async fn member_size(&self, entry: &ArchiveEntry) -> Result<u64> {
        if let Some(size) = entry.uncompressed_size {
            return Ok(size);
        }
        let archive_path = Path::new(&entry.archive_path);
        self.reader_for(archive_path)?
            .uncompressed_size(archive_path, &entry.entry_path)
            .await
    }

    /// Size of whatever the entry addresses, member or regular file.
    pub async fn source_size(&self, entry: &ArchiveEntry) -> Result<u64> {
        if entry.is_archive_member() {
            self.member_size(entry).await
        } else {
            Ok(tokio::fs::metadata(entry.container_path()).await?.len())
        }
    }

    /// Bytes of whatever the entry addresses, member or regular file.
    pub async fn read_source(&self, entry: &ArchiveEntry) -> Result<Vec<u8>> {
        if entry.is_archive_member() {
            self.read_member(entry).await
        } else {
            Ok(tokio::fs::read(entry.container_path()).await?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, bytes) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn metadata_entries_are_recognized() {
        assert!(is_metadata_entry("__MACOSX/._foo.jpg"));
        assert!(is_metadata_entry("pages/__MACOSX/bar.jpg"));
        assert!(is_metadata_entry("._cover.jpg"));
        assert!(!is_metadata_entry("pages/001.jpg"));
    }

    #[tokio::test]
    async fn zip_enumeration_filters_macos_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("book.cbz");
        write_zip(
            &archive_path,
            &[
                ("foo.jpg", b"fake image".as_slice()),
                ("__MACOSX/._foo.jpg", b"resource fork".as_slice()),
            ],
        );

        let service = ArchiveService::new(PathBuf::from("7z"), PathBuf::from("unrar"));
        let members = service.enumerate_members(&archive_path).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].entry_path, "foo.jpg");
        assert_eq!(members[0].uncompressed_size, Some(10));
    }

    #[tokio::test]
    async fn read_source_handles_members_and_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("a.zip");
        write_zip(&archive_path, &[("img.png", b"png bytes".as_slice())]);
        std::fs::write(dir.path().join("plain.jpg"), b"plain bytes").unwrap();

        let service = ArchiveService::new(PathBuf::from("7z"), PathBuf::from("unrar"));

        let member = ArchiveEntry::for_archive_member(&archive_path, "img.png").unwrap();
        assert_eq!(service.read_source(&member).await.unwrap(), b"png bytes");
        assert_eq!(service.source_size(&member).await.unwrap(), 9);

        let regular = ArchiveEntry::for_regular_file(dir.path(), "plain.jpg").unwrap();
        assert_eq!(service.read_source(&regular).await.unwrap(), b"plain bytes");
        assert_eq!(service.source_size(&regular).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn missing_member_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("a.zip");
        write_zip(&archive_path, &[("img.png", b"x".as_slice())]);

        let service = ArchiveService::new(PathBuf::from("7z"), PathBuf::from("unrar"));
        let entry = ArchiveEntry::for_archive_member(&archive_path, "missing.png").unwrap();
        let err = service.read_member(&entry).await.unwrap_err();
        assert!(err.is_poison());
    }
}
