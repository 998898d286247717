//! Zip/cbz access via the `zip` crate; all work in blocking threads.

use std::io::Read;
use std::path::Path;

use async_trait::async_trait;
use zip::ZipArchive;
use zip::result::ZipError;

use super::{ArchiveMemberInfo, ArchiveReader};
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct ZipArchiveReader;

fn zip_error(archive_path: &Path, err: ZipError) -> PipelineError {
    match err {
        ZipError::Io(io) => PipelineError::Io(io),
        ZipError::FileNotFound => {
            PipelineError::NotFound(format!("entry in {}", archive_path.display()))
        }
        other => PipelineError::CorruptedArchive(format!("{}: {other}", archive_path.display())),
    }
}

#[async_trait]
impl ArchiveReader for ZipArchiveReader {
    async fn enumerate(&self, archive_path: &Path) -> Result<Vec<ArchiveMemberInfo>> {
        let archive_path = archive_path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&archive_path)?;
            let mut archive =
                ZipArchive::new(file).map_err(|err| zip_error(&archive_path, err))?;
            let mut members = Vec::with_capacity(archive.len());
            for index in 0..archive.len() {
                let entry = archive
                    .by_index(index)
                    .map_err(|err| zip_error(&archive_path, err))?;
                if entry.is_dir() {
                    continue;
                }
                members.push(ArchiveMemberInfo {
                    entry_path: entry.name().to_string(),
                    compressed_size: Some(entry.compressed_size()),
                    uncompressed_size: Some(entry.size()),
                });
            }
            Ok(members)
        })
        .await
        .map_err(|err| PipelineError::Internal(format!("zip enumerate task failed: {err}")))?
    }

    async fn open_entry(&self, archive_path: &Path, entry_path: &str) -> Result<Vec<u8>> {
        let archive_path = archive_path.to_path_buf();
        let entry_path = entry_path.to_string();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&archive_path)?;
            let mut archive =
                ZipArchive::new(file).map_err(|err| zip_error(&archive_path, err))?;
            let mut entry = archive
                .by_name(&entry_path)
                .map_err(|err| zip_error(&archive_path, err))?;
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes)?;
            Ok(bytes)
        })
        .await
        .map_err(|err| PipelineError::Internal(format!("zip read task failed: {err}")))?
    }

    async fn uncompressed_size(&self, archive_path: &Path, entry_path: &str) -> Result<u64> {
        let archive_path = archive_path.to_path_buf();
        let entry_path = entry_path.to_string();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&archive_path)?;
            let mut archive =
                ZipArchive::new(file).map_err(|err| zip_error(&archive_path, err))?;
            let entry = archive
                .by_name(&entry_path)
                .map_err(|err| zip_error(&archive_path, err))?;
            Ok(entry.size())
        })
        .await
        .map_err(|err| PipelineError::Internal(format!("zip stat task failed: {err}")))?
    }
}
