//! The standard decoder: `image` crate for stills, ffprobe/ffmpeg
//! subprocesses for video.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::{GenericImageView, ImageReader, imageops::FilterType};

use imageviewer_model::OutputFormat;

use super::video;
use super::{EncodedArtifact, MediaDecoder, ResizeSpec};
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone)]
pub struct StandardMediaDecoder {
    ffprobe_path: PathBuf,
    ffmpeg_path: PathBuf,
}

impl StandardMediaDecoder {
    pub fn new(ffprobe_path: PathBuf, ffmpeg_path: PathBuf) -> Self {
        Self {
            ffprobe_path,
            ffmpeg_path,
        }
    }
}

impl Default for StandardMediaDecoder {
    fn default() -> Self {
        Self::new(PathBuf::from("ffprobe"), PathBuf::from("ffmpeg"))
    }
}

fn decode_error(err: image::ImageError) -> PipelineError {
    match err {
        image::ImageError::Unsupported(inner) => {
            PipelineError::UnsupportedFormat(inner.to_string())
        }
        other => PipelineError::Decode(other.to_string()),
    }
}

fn encode(img: &image::DynamicImage, spec: ResizeSpec) -> Result<EncodedArtifact> {
    let (width, height) = img.dimensions();
    let mut cursor = Cursor::new(Vec::new());
    let format = match spec.format {
        OutputFormat::Jpeg => {
            // JPEG has no alpha channel; flatten first.
            let rgb = image::DynamicImage::ImageRgb8(img.to_rgb8());
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
                &mut cursor,
                spec.quality.clamp(1, 100),
            );
            rgb.write_with_encoder(encoder).map_err(decode_error)?;
            "JPEG"
        }
        OutputFormat::Png => {
            img.write_to(&mut cursor, image::ImageFormat::Png)
                .map_err(decode_error)?;
            "PNG"
        }
        OutputFormat::Webp => {
            img.write_to(&mut cursor, image::ImageFormat::WebP)
                .map_err(decode_error)?;
            "WEBP"
        }
        OutputFormat::Original => {
            return Err(PipelineError::Internal(
                "pass-through sources are copied, not re-encoded".into(),
            ));
        }
    };
    Ok(EncodedArtifact {
        bytes: cursor.into_inner(),
        width,
        height,
        format: format.to_string(),
    })
}

#[async_trait]
impl MediaDecoder for StandardMediaDecoder {
    async fn probe_dimensions(&self, bytes: &[u8]) -> Result<(u32, u32)> {
        ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(PipelineError::Io)?
            .into_dimensions()
            .map_err(decode_error)
    }

    async fn probe_file_dimensions(&self, path: &Path) -> Result<(u32, u32)> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            ImageReader::open(&path)
                .map_err(PipelineError::Io)?
                .with_guessed_format()
                .map_err(PipelineError::Io)?
                .into_dimensions()
                .map_err(decode_error)
        })
        .await
        .map_err(|err| PipelineError::Internal(format!("probe task failed: {err}")))?
    }

    async fn resize(&self, bytes: Vec<u8>, spec: ResizeSpec) -> Result<EncodedArtifact> {
        tokio::task::spawn_blocking(move || {
            let img = image::load_from_memory(&bytes).map_err(decode_error)?;
            let (source_width, source_height) = img.dimensions();
            let scaled = if source_width > spec.width || source_height > spec.height {
                img.resize(spec.width, spec.height, FilterType::Lanczos3)
            } else {
                img
            };
            encode(&scaled, spec)
        })
        .await
        .map_err(|err| PipelineError::Internal(format!("resize task failed: {err}")))?
    }

    async fn probe_video_dimensions(&self, path: &Path) -> Result<(u32, u32)> {
        video::probe_dimensions(&self.ffprobe_path, path).await
    }

    async fn video_thumbnail(
        &self,
        path: &Path,
        width: u32,
        height: u32,
    ) -> Result<EncodedArtifact> {
        let bytes = video::extract_frame(&self.ffmpeg_path, path, width, height).await?;
        let (actual_width, actual_height) = self.probe_dimensions(&bytes).await?;
        Ok(EncodedArtifact {
            bytes,
            width: actual_width,
            height: actual_height,
            format: "JPEG".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkerboard_png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_fn(width, height, |x, y| {
            if (x / 8 + y / 8) % 2 == 0 {
                image::Rgb([250, 240, 220])
            } else {
                image::Rgb([40, 40, 60])
            }
        });
        let mut cursor = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut cursor, image::ImageFormat::Png)
            .unwrap();
        cursor.into_inner()
    }

    #[tokio::test]
    async fn probe_reads_dimensions_without_full_decode() {
        let decoder = StandardMediaDecoder::default();
        let bytes = checkerboard_png(640, 480);
        assert_eq!(decoder.probe_dimensions(&bytes).await.unwrap(), (640, 480));
    }

    #[tokio::test]
    async fn resize_fits_within_bounds_preserving_aspect() {
        let decoder = StandardMediaDecoder::default();
        let bytes = checkerboard_png(640, 480);
        let artifact = decoder
            .resize(
                bytes,
                ResizeSpec {
                    width: 300,
                    height: 300,
                    format: OutputFormat::Jpeg,
                    quality: 80,
                },
            )
            .await
            .unwrap();
        assert_eq!(artifact.format, "JPEG");
        assert!(artifact.width <= 300 && artifact.height <= 300);
        // 4:3 source scaled into a square box keeps the wide edge at the cap.
        assert_eq!(artifact.width, 300);
    }

    #[tokio::test]
    async fn resize_never_upscales() {
        let decoder = StandardMediaDecoder::default();
        let bytes = checkerboard_png(100, 80);
        let artifact = decoder
            .resize(
                bytes,
                ResizeSpec {
                    width: 1000,
                    height: 1000,
                    format: OutputFormat::Png,
                    quality: 100,
                },
            )
            .await
            .unwrap();
        assert_eq!((artifact.width, artifact.height), (100, 80));
    }

    #[tokio::test]
    async fn truncated_bytes_are_a_decode_failure() {
        let decoder = StandardMediaDecoder::default();
        let mut bytes = checkerboard_png(64, 64);
        bytes.truncate(20);
        let err = decoder
            .resize(
                bytes,
                ResizeSpec {
                    width: 32,
                    height: 32,
                    format: OutputFormat::Jpeg,
                    quality: 80,
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_poison());
    }
}
