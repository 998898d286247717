//! ffprobe/ffmpeg subprocess helpers.

use std::path::Path;

use tokio::process::Command;
use tracing::debug;

use crate::error::{PipelineError, Result};

pub async fn probe_dimensions(ffprobe_path: &Path, source: &Path) -> Result<(u32, u32)> {
    let output = Command::new(ffprobe_path)
        .arg("-v")
        .arg("error")
        .arg("-select_streams")
        .arg("v:0")
        .arg("-show_entries")
        .arg("stream=width,height")
        .arg("-of")
        .arg("csv=s=x:p=0")
        .arg(source.as_os_str())
        .output()
        .await?;

    if !output.status.success() {
        return Err(PipelineError::Decode(format!(
            "ffprobe failed for {}: {}",
            source.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout.lines().next().unwrap_or_default().trim();
    let (width, height) = line
        .split_once('x')
        .ok_or_else(|| PipelineError::Decode(format!("unparseable ffprobe output: {line:?}")))?;
    let width = width
        .parse::<u32>()
        .map_err(|_| PipelineError::Decode(format!("unparseable ffprobe width: {width:?}")))?;
    let height = height
        .parse::<u32>()
        .map_err(|_| PipelineError::Decode(format!("unparseable ffprobe height: {height:?}")))?;
    Ok((width, height))
}

/// Grab one frame a few seconds in, scaled to fit the bounds, as JPEG bytes
/// on stdout. Falls back to the first frame for clips shorter than the seek
/// offset.
pub async fn extract_frame(
    ffmpeg_path: &Path,
    source: &Path,
    width: u32,
    height: u32,
) -> Result<Vec<u8>> {
    for seek_seconds in ["3", "0"] {
        let output = Command::new(ffmpeg_path)
            .arg("-v")
            .arg("error")
            .arg("-ss")
            .arg(seek_seconds)
            .arg("-i")
            .arg(source.as_os_str())
            .arg("-frames:v")
            .arg("1")
            .arg("-vf")
            .arg(format!(
                "scale={width}:{height}:force_original_aspect_ratio=decrease"
            ))
            .arg("-f")
            .arg("image2pipe")
            .arg("-c:v")
            .arg("mjpeg")
            .arg("-q:v")
            .arg("4")
            .arg("pipe:1")
            .output()
            .await?;

        if output.status.success() && !output.stdout.is_empty() {
            return Ok(output.stdout);
        }
        debug!(
            source = %source.display(),
            seek_seconds,
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "frame extraction attempt produced no output"
        );
    }

    Err(PipelineError::Decode(format!(
        "ffmpeg produced no frame for {}",
        source.display()
    )))
}
