//! Deterministic collection → cache-root assignment and artifact paths.
//!
//! Hashing the collection id's string form (raw UUID bytes clustered badly
//! in practice) through SHA-256 keeps the assignment stable across
//! processes, restarts, and store rebuilds: the active folder set is sorted
//! by id before indexing, so the same collection lands on the same root as
//! long as that set is unchanged.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use imageviewer_model::{CacheFolder, CollectionId, ImageId, OutputFormat};

use crate::error::{PipelineError, Result};
use crate::store::CacheFolderStore;

#[derive(Clone)]
pub struct CacheFolderSelector {
    folders: Arc<dyn CacheFolderStore>,
}

impl std::fmt::Debug for CacheFolderSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFolderSelector").finish_non_exhaustive()
    }
}

impl CacheFolderSelector {
    pub fn new(folders: Arc<dyn CacheFolderStore>) -> Self {
        Self { folders }
    }

    pub fn store(&self) -> &Arc<dyn CacheFolderStore> {
        &self.folders
    }

    /// The one active cache folder this collection belongs to.
    pub async fn assign(&self, collection_id: CollectionId) -> Result<CacheFolder> {
        let mut active = self.folders.list_active().await?;
        if active.is_empty() {
            return Err(PipelineError::NoActiveCacheFolder);
        }
        active.sort_by_key(|folder| folder.id);
        let index = (hash_collection_id(collection_id) % active.len() as u64) as usize;
        Ok(active.swap_remove(index))
    }

    /// `{root}/cache/{collectionId}/{imageId}_cache_{w}x{h}.{ext}`
    pub fn cache_file_path(
        root: &Path,
        collection_id: CollectionId,
        image_id: ImageId,
        width: u32,
        height: u32,
        extension: &str,
    ) -> PathBuf {
        root.join("cache")
            .join(collection_id.to_string())
            .join(format!("{image_id}_cache_{width}x{height}.{extension}"))
    }

    /// `{root}/thumbnails/{collectionId}/{filenameNoExt}_{w}x{h}.{ext}`
    pub fn thumbnail_file_path(
        root: &Path,
        collection_id: CollectionId,
        source_filename: &str,
        width: u32,
        height: u32,
        extension: &str,
    ) -> PathBuf {
        let stem = Path::new(source_filename)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| source_filename.to_string());
        root.join("thumbnails")
            .join(collection_id.to_string())
            .join(format!("{stem}_{width}x{height}.{extension}"))
    }
}

fn hash_collection_id(collection_id: CollectionId) -> u64 {
    let digest = Sha256::digest(collection_id.to_string().as_bytes());
    digest
        .iter()
        .take(8)
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
}

/// Extension for an artifact: the declared output format's, or the source
/// extension for pass-through (animated and video) sources.
pub fn artifact_extension(format: OutputFormat, source_filename: &str) -> String {
    match format.extension() {
        Some(extension) => extension.to_string(),
        None => Path::new(source_filename)
            .extension()
            .map(|extension| extension.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_else(|| "bin".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    async fn selector_with_roots(names: &[&str]) -> (CacheFolderSelector, Vec<CacheFolder>) {
        let store = Arc::new(MemoryStore::new());
        let mut folders = Vec::new();
        for name in names {
            let folder = CacheFolder::new(*name, format!("/cache/{name}"));
            CacheFolderStore::insert(store.as_ref(), &folder).await.unwrap();
            folders.push(folder);
        }
        (CacheFolderSelector::new(store), folders)
    }

    #[tokio::test]
    async fn assignment_is_stable_for_a_fixed_folder_set() {
        let (selector, _) = selector_with_roots(&["a", "b", "c"]).await;
        let collection_id = CollectionId::new();
        let first = selector.assign(collection_id).await.unwrap();
        for _ in 0..10 {
            let again = selector.assign(collection_id).await.unwrap();
            assert_eq!(again.id, first.id);
        }
    }

    #[tokio::test]
    async fn assignment_spreads_across_folders() {
        let (selector, _) = selector_with_roots(&["a", "b", "c", "d"]).await;
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            let folder = selector.assign(CollectionId::new()).await.unwrap();
            seen.insert(folder.id);
        }
        assert!(seen.len() > 1, "hashing must not cluster on one folder");
    }

    #[tokio::test]
    async fn no_active_folder_is_an_error() {
        let (selector, _) = selector_with_roots(&[]).await;
        assert!(matches!(
            selector.assign(CollectionId::new()).await,
            Err(PipelineError::NoActiveCacheFolder)
        ));
    }

    #[test]
    fn artifact_paths_follow_the_layout() {
        let collection_id = CollectionId::new();
        let image_id = ImageId::new();
        let cache = CacheFolderSelector::cache_file_path(
            Path::new("/roots/main"),
            collection_id,
            image_id,
            1920,
            1080,
            "jpg",
        );
        assert_eq!(
            cache,
            PathBuf::from(format!(
                "/roots/main/cache/{collection_id}/{image_id}_cache_1920x1080.jpg"
            ))
        );

        let thumb = CacheFolderSelector::thumbnail_file_path(
            Path::new("/roots/main"),
            collection_id,
            "cover page.png",
            300,
            300,
            "jpg",
        );
        assert_eq!(
            thumb,
            PathBuf::from(format!(
                "/roots/main/thumbnails/{collection_id}/cover page_300x300.jpg"
            ))
        );
    }

    #[test]
    fn pass_through_keeps_the_source_extension() {
        assert_eq!(artifact_extension(OutputFormat::Jpeg, "a.png"), "jpg");
        assert_eq!(artifact_extension(OutputFormat::Original, "loop.GIF"), "gif");
        assert_eq!(artifact_extension(OutputFormat::Original, "clip.mp4"), "mp4");
    }
}
