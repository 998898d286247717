//! The fixed, closed sets of recognized media and archive extensions.

pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "tiff", "webp", "svg",
];

pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "avi", "mov", "wmv", "mkv", "flv", "webm", "m4v", "3gp", "mpg", "mpeg",
];

pub const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "7z", "rar", "tar", "cbz", "cbr"];

/// Formats that are copied through unmodified instead of re-encoded. Video
/// formats are included: a cache rendition of a video is always the original
/// bytes.
pub const ANIMATED_EXTENSIONS: &[&str] = &["gif", "apng"];

fn extension_of(filename: &str) -> Option<String> {
    std::path::Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

fn has_extension_in(filename: &str, set: &[&str]) -> bool {
    extension_of(filename).is_some_and(|ext| set.contains(&ext.as_str()))
}

pub fn is_image_file(filename: &str) -> bool {
    has_extension_in(filename, IMAGE_EXTENSIONS)
}

pub fn is_video_file(filename: &str) -> bool {
    has_extension_in(filename, VIDEO_EXTENSIONS)
}

pub fn is_archive_file(filename: &str) -> bool {
    has_extension_in(filename, ARCHIVE_EXTENSIONS)
}

pub fn is_media_file(filename: &str) -> bool {
    is_image_file(filename) || is_video_file(filename)
}

/// Filename-level animation check. Animated WebP cannot be told apart from
/// still WebP by name alone; the decoder sniffs the RIFF header for that.
pub fn is_animated_format(filename: &str) -> bool {
    has_extension_in(filename, ANIMATED_EXTENSIONS) || is_video_file(filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_sets_are_case_insensitive() {
        assert!(is_image_file("Holiday.JPG"));
        assert!(is_video_file("clip.MKV"));
        assert!(is_archive_file("book.CbZ"));
        assert!(!is_media_file("notes.txt"));
    }

    #[test]
    fn animated_check_covers_gif_and_video() {
        assert!(is_animated_format("banner.gif"));
        assert!(is_animated_format("loop.apng"));
        assert!(is_animated_format("trailer.mp4"));
        assert!(!is_animated_format("photo.jpeg"));
    }
}
