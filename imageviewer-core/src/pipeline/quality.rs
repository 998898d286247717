//! Source-aware quality selection for cache renditions.
//!
//! Re-encoding a heavily compressed source at high quality only burns disk;
//! the heuristic estimates what the source bytes actually carry from its
//! bytes-per-pixel ratio and never encodes above that.

/// Estimated encode quality the source itself justifies.
pub fn estimate_source_quality(file_size: u64, width: u32, height: u32) -> u8 {
    let pixels = u64::from(width) * u64::from(height);
    if pixels == 0 {
        return 100;
    }
    let bytes_per_pixel = file_size as f64 / pixels as f64;
    if bytes_per_pixel >= 2.0 {
        95
    } else if bytes_per_pixel >= 1.0 {
        85
    } else if bytes_per_pixel >= 0.5 {
        75
    } else {
        60
    }
}

/// What the cache encoder should actually do for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityDecision {
    pub quality: u8,
    /// False when the source fits inside the target in both dimensions;
    /// upscaling is never worth the bytes.
    pub resize: bool,
}

pub fn decide_quality(
    requested_quality: u8,
    file_size: u64,
    source_width: u32,
    source_height: u32,
    target_width: u32,
    target_height: u32,
) -> QualityDecision {
    if source_width < target_width && source_height < target_height {
        return QualityDecision {
            quality: 100,
            resize: false,
        };
    }
    let estimated = estimate_source_quality(file_size, source_width, source_height);
    QualityDecision {
        quality: requested_quality.min(estimated),
        resize: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_maps_bytes_per_pixel_bands() {
        // 100x100 = 10_000 px
        assert_eq!(estimate_source_quality(20_000, 100, 100), 95); // 2.0
        assert_eq!(estimate_source_quality(15_000, 100, 100), 85); // 1.5
        assert_eq!(estimate_source_quality(6_000, 100, 100), 75); // 0.6
        assert_eq!(estimate_source_quality(4_000, 100, 100), 60); // 0.4
    }

    #[test]
    fn heavily_compressed_source_clamps_requested_quality() {
        // 400x400 at 16 000 bytes is 0.1 bytes per pixel.
        let decision = decide_quality(95, 16_000, 400, 400, 1920, 1080);
        assert_eq!(decision, QualityDecision { quality: 60, resize: true });
    }

    #[test]
    fn adjusted_quality_never_exceeds_requested() {
        for requested in [10u8, 60, 75, 85, 95, 100] {
            for file_size in [1_000u64, 100_000, 10_000_000, 100_000_000] {
                let decision = decide_quality(requested, file_size, 4000, 3000, 1920, 1080);
                assert!(decision.quality <= requested);
            }
        }
    }

    #[test]
    fn small_sources_bypass_resizing_at_full_quality() {
        let decision = decide_quality(85, 50_000, 800, 600, 1920, 1080);
        assert_eq!(decision, QualityDecision { quality: 100, resize: false });

        // Equal in one dimension still counts as not-smaller.
        let edge = decide_quality(85, 50_000, 1920, 600, 1920, 1080);
        assert!(edge.resize);
    }

    #[test]
    fn unknown_dimensions_do_not_clamp() {
        assert_eq!(estimate_source_quality(5_000, 0, 0), 100);
    }
}
