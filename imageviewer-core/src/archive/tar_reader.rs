//! Tar access. Tar has no central directory, so entry lookup is a linear
//! walk; collections stored as tar are rare enough that this stays simple.

use std::io::Read;
use std::path::Path;

use async_trait::async_trait;

use super::{ArchiveMemberInfo, ArchiveReader};
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct TarArchiveReader;

#[async_trait]
impl ArchiveReader for TarArchiveReader {
    async fn enumerate(&self, archive_path: &Path) -> Result<Vec<ArchiveMemberInfo>> {
        let archive_path = archive_path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&archive_path)?;
            let mut archive = tar::Archive::new(file);
            let mut members = Vec::new();
            for entry in archive.entries()? {
                let entry = entry?;
                if !entry.header().entry_type().is_file() {
                    continue;
                }
                let entry_path = entry.path()?.to_string_lossy().into_owned();
                members.push(ArchiveMemberInfo {
                    entry_path,
                    compressed_size: None,
                    uncompressed_size: Some(entry.size()),
                });
            }
            Ok(members)
        })
        .await
        .map_err(|err| PipelineError::Internal(format!("tar enumerate task failed: {err}")))?
    }

    async fn open_entry(&self, archive_path: &Path, entry_path: &str) -> Result<Vec<u8>> {
        let archive_path = archive_path.to_path_buf();
        let entry_path = entry_path.to_string();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&archive_path)?;
            let mut archive = tar::Archive::new(file);
            for entry in archive.entries()? {
                let mut entry = entry?;
                if entry.path()?.to_string_lossy() == entry_path.as_str() {
                    let mut bytes = Vec::with_capacity(entry.size() as usize);
                    entry.read_to_end(&mut bytes)?;
                    return Ok(bytes);
                }
            }
            Err(PipelineError::NotFound(format!(
                "{} in {}",
                entry_path,
                archive_path.display()
            )))
        })
        .await
        .map_err(|err| PipelineError::Internal(format!("tar read task failed: {err}")))?
    }
}
