//! The staged ingestion pipeline: scan, per-image processing, and the
//! batched thumbnail/cache consumers.

pub mod batch;
pub mod bulk;
pub mod cache_worker;
pub mod collection_creation;
pub mod image_processing;
pub mod library_scan;
pub mod quality;
pub mod scan;
pub mod thumbnail;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use imageviewer_config::{CacheConfig, ThumbnailConfig};
use imageviewer_model::{ArtifactSettings, OutputFormat};

pub use bulk::BulkOperationWorker;
pub use cache_worker::BatchedCacheWorker;
pub use collection_creation::CollectionCreationWorker;
pub use image_processing::ImageProcessingWorker;
pub use library_scan::LibraryScanWorker;
pub use scan::ScanWorker;
pub use thumbnail::BatchedThumbnailWorker;

/// Validated config strings (`jpeg` | `png` | `webp` | `original`) to the
/// typed output format; anything unexpected falls back to JPEG.
pub(crate) fn output_format_from_config(format: &str) -> OutputFormat {
    match format {
        "png" => OutputFormat::Png,
        "webp" => OutputFormat::Webp,
        "original" => OutputFormat::Original,
        _ => OutputFormat::Jpeg,
    }
}

pub(crate) fn thumbnail_settings(config: &ThumbnailConfig) -> ArtifactSettings {
    ArtifactSettings {
        width: config.width,
        height: config.height,
        format: output_format_from_config(&config.format),
        quality: config.quality,
        preserve_original: false,
    }
}

pub(crate) fn cache_settings(config: &CacheConfig) -> ArtifactSettings {
    ArtifactSettings {
        width: config.width,
        height: config.height,
        format: output_format_from_config(&config.format),
        quality: config.quality,
        preserve_original: config.preserve_original,
    }
}

/// Counts batches being processed so shutdown can drain with a bound.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    count: AtomicUsize,
    notify: Notify,
}

impl InFlight {
    pub fn begin(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            inflight: Arc::clone(self),
        }
    }

    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.count.load(Ordering::SeqCst) > 0 {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(remaining.min(Duration::from_millis(100))) => {}
            }
        }
        true
    }
}

#[derive(Debug)]
pub(crate) struct InFlightGuard {
    inflight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inflight.count.fetch_sub(1, Ordering::SeqCst);
        self.inflight.notify.notify_waiters();
    }
}
