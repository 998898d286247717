//! Media decoding and encoding.
//!
//! Still images go through the `image` crate in blocking worker threads;
//! video probing and frame extraction shell out to `ffprobe`/`ffmpeg`, which
//! keeps the worker free of native codec linkage.

pub mod decoder;
pub mod video;

use async_trait::async_trait;
use std::path::Path;

use imageviewer_model::OutputFormat;

use crate::error::Result;

/// Target of one resize/encode operation.
#[derive(Debug, Clone, Copy)]
pub struct ResizeSpec {
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
    pub quality: u8,
}

/// Encoded output bytes with their actual dimensions.
#[derive(Debug, Clone)]
pub struct EncodedArtifact {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Upper-cased format tag as stored on artifact entries, e.g. `JPEG`.
    pub format: String,
}

#[async_trait]
pub trait MediaDecoder: Send + Sync {
    /// Image dimensions from in-memory bytes; reads only the header.
    async fn probe_dimensions(&self, bytes: &[u8]) -> Result<(u32, u32)>;

    /// Image dimensions straight from a file without loading it whole.
    async fn probe_file_dimensions(&self, path: &Path) -> Result<(u32, u32)>;

    /// Decode, scale to fit within the spec bounds (never upscaling), and
    /// re-encode.
    async fn resize(&self, bytes: Vec<u8>, spec: ResizeSpec) -> Result<EncodedArtifact>;

    /// Video dimensions via ffprobe.
    async fn probe_video_dimensions(&self, path: &Path) -> Result<(u32, u32)>;

    /// A single still frame from a video, scaled to fit within the given
    /// bounds and encoded as JPEG.
    async fn video_thumbnail(&self, path: &Path, width: u32, height: u32)
    -> Result<EncodedArtifact>;
}

/// Byte-level animation sniff complementing the filename check: animated
/// WebP files carry an `ANIM` chunk in the RIFF header area.
pub fn is_animated_webp(bytes: &[u8]) -> bool {
    if bytes.len() < 16 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WEBP" {
        return false;
    }
    bytes[..bytes.len().min(256)]
        .windows(4)
        .any(|window| window == b"ANIM")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn animated_webp_sniff_requires_riff_and_anim() {
        let mut animated = Vec::new();
        animated.extend_from_slice(b"RIFF");
        animated.extend_from_slice(&[0u8; 4]);
        animated.extend_from_slice(b"WEBPVP8X");
        animated.extend_from_slice(&[0u8; 8]);
        animated.extend_from_slice(b"ANIM");
        assert!(is_animated_webp(&animated));

        let mut still = animated.clone();
        let anim_at = still.len() - 4;
        still[anim_at..].copy_from_slice(b"VP8L");
        assert!(!is_animated_webp(&still));

        assert!(!is_animated_webp(b"\xff\xd8\xff\xe0 not riff at all"));
    }
}
