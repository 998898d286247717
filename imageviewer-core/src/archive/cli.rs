//! 7z and rar access through their command-line tools.
//!
//! No maintained pure-Rust reader covers these formats' full feature range,
//! so the readers drive `7z`/`unrar` the same way the transcoding path
//! drives ffmpeg. Extraction streams the member to stdout; size caps are
//! enforced by callers before extraction, using the listing sizes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use super::{ArchiveMemberInfo, ArchiveReader};
use crate::error::{PipelineError, Result};

async fn run_tool(binary: &Path, args: &[&str], archive_path: &Path) -> Result<Vec<u8>> {
    let output = Command::new(binary)
        .args(args)
        .output()
        .await
        .map_err(|err| {
            PipelineError::Tool(format!("failed to run {}: {err}", binary.display()))
        })?;
    if !output.status.success() {
        return Err(PipelineError::CorruptedArchive(format!(
            "{} failed for {}: {}",
            binary.display(),
            archive_path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output.stdout)
}

#[derive(Debug, Clone)]
pub struct SevenZipCliReader {
    binary: PathBuf,
}

impl SevenZipCliReader {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

/// Parse `7z l -ba -slt` output: one `Key = Value` block per entry,
/// blank-line separated.
fn parse_sevenzip_listing(listing: &str) -> Vec<ArchiveMemberInfo> {
    let mut members = Vec::new();
    let mut path: Option<String> = None;
    let mut size: Option<u64> = None;
    let mut packed: Option<u64> = None;
    let mut is_dir = false;

    let mut flush =
        |path: &mut Option<String>, size: &mut Option<u64>, packed: &mut Option<u64>, is_dir: &mut bool| {
            if let Some(entry_path) = path.take() {
                if !*is_dir {
                    members.push(ArchiveMemberInfo {
                        entry_path,
                        compressed_size: packed.take(),
                        uncompressed_size: size.take(),
                    });
                }
            }
            *size = None;
            *packed = None;
            *is_dir = false;
        };

    for line in listing.lines() {
        let line = line.trim();
        if line.is_empty() {
            flush(&mut path, &mut size, &mut packed, &mut is_dir);
            continue;
        }
        let Some((key, value)) = line.split_once(" = ") else {
            continue;
        };
        match key {
            "Path" => {
                flush(&mut path, &mut size, &mut packed, &mut is_dir);
                path = Some(value.replace('\\', "/"));
            }
            "Size" => size = value.parse().ok(),
            "Packed Size" => packed = value.parse().ok(),
            "Attributes" => is_dir = value.contains('D'),
            "Folder" => is_dir = is_dir || value == "+",
            _ => {}
        }
    }
    flush(&mut path, &mut size, &mut packed, &mut is_dir);
    members
}

#[async_trait]
impl ArchiveReader for SevenZipCliReader {
    async fn enumerate(&self, archive_path: &Path) -> Result<Vec<ArchiveMemberInfo>> {
        let path_arg = archive_path.to_string_lossy();
        let stdout = run_tool(
            &self.binary,
            &["l", "-ba", "-slt", path_arg.as_ref()],
            archive_path,
        )
        .await?;
        Ok(parse_sevenzip_listing(&String::from_utf8_lossy(&stdout)))
    }

    async fn open_entry(&self, archive_path: &Path, entry_path: &str) -> Result<Vec<u8>> {
        let path_arg = archive_path.to_string_lossy();
        let bytes = run_tool(
            &self.binary,
            &["e", "-so", path_arg.as_ref(), entry_path],
            archive_path,
        )
        .await?;
        if bytes.is_empty() {
            return Err(PipelineError::NotFound(format!(
                "{} in {}",
                entry_path,
                archive_path.display()
            )));
        }
        Ok(bytes)
    }
}

#[derive(Debug, Clone)]
pub struct UnrarCliReader {
    binary: PathBuf,
}

impl UnrarCliReader {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

/// Parse `unrar lt -idq` output: indented `Key: Value` blocks, one per
/// entry, starting at `Name:`.
fn parse_unrar_listing(listing: &str) -> Vec<ArchiveMemberInfo> {
    let mut members = Vec::new();
    let mut name: Option<String> = None;
    let mut size: Option<u64> = None;
    let mut packed: Option<u64> = None;
    let mut is_file = true;

    let mut flush = |name: &mut Option<String>,
                     size: &mut Option<u64>,
                     packed: &mut Option<u64>,
                     is_file: &mut bool| {
        if let Some(entry_path) = name.take() {
            if *is_file {
                members.push(ArchiveMemberInfo {
                    entry_path,
                    compressed_size: packed.take(),
                    uncompressed_size: size.take(),
                });
            }
        }
        *size = None;
        *packed = None;
        *is_file = true;
    };

    for line in listing.lines() {
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Name" => {
                flush(&mut name, &mut size, &mut packed, &mut is_file);
                name = Some(value.replace('\\', "/"));
            }
            "Type" => is_file = value == "File",
            "Size" => size = value.parse().ok(),
            "Packed size" => packed = value.parse().ok(),
            _ => {}
        }
    }
    flush(&mut name, &mut size, &mut packed, &mut is_file);
    members
}

#[async_trait]
impl ArchiveReader for UnrarCliReader {
    async fn enumerate(&self, archive_path: &Path) -> Result<Vec<ArchiveMemberInfo>> {
        let path_arg = archive_path.to_string_lossy();
        let stdout = run_tool(
            &self.binary,
            &["lt", "-idq", path_arg.as_ref()],
            archive_path,
        )
        .await?;
        Ok(parse_unrar_listing(&String::from_utf8_lossy(&stdout)))
    }

    async fn open_entry(&self, archive_path: &Path, entry_path: &str) -> Result<Vec<u8>> {
        let path_arg = archive_path.to_string_lossy();
        let bytes = run_tool(
            &self.binary,
            &["p", "-inul", path_arg.as_ref(), entry_path],
            archive_path,
        )
        .await?;
        if bytes.is_empty() {
            return Err(PipelineError::NotFound(format!(
                "{} in {}",
                entry_path,
                archive_path.display()
            )));
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sevenzip_listing_parses_blocks_and_skips_directories() {
        let listing = "\
Path = pages
Folder = +
Attributes = D_ drwxr-xr-x

Path = pages\\001.jpg
Size = 52311
Packed Size = 51899
Attributes = A_ -rw-r--r--

Path = cover.png
Size = 1024
Packed Size = 900
Attributes = A_ -rw-r--r--
";
        let members = parse_sevenzip_listing(listing);
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].entry_path, "pages/001.jpg");
        assert_eq!(members[0].uncompressed_size, Some(52311));
        assert_eq!(members[0].compressed_size, Some(51899));
        assert_eq!(members[1].entry_path, "cover.png");
    }

    #[test]
    fn unrar_listing_parses_blocks_and_skips_directories() {
        let listing = "\
        Name: pages
        Type: Directory

        Name: pages/001.jpg
        Type: File
        Size: 52311
        Packed size: 51899

        Name: cover.png
        Type: File
        Size: 1024
        Packed size: 900
";
        let members = parse_unrar_listing(listing);
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].entry_path, "pages/001.jpg");
        assert_eq!(members[0].uncompressed_size, Some(52311));
        assert_eq!(members[1].entry_path, "cover.png");
    }
}
