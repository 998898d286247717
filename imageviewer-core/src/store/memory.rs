//! In-memory store backing tests and the embedded single-node mode.
//!
//! Atomicity falls out of holding the map lock for the duration of each
//! mutation; no lock is ever held across an await point.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use imageviewer_model::{
    ArtifactEntry, ArtifactKind, BackgroundJob, CacheFolder, CacheFolderId, Collection,
    CollectionId, FileProcessingJobState, ImageEntry, ImageId, JobId, JobStateCounters,
    JobStateId, JobStatus, JobType, ProcessingErrorKind, StageKind, StageStatus,
};

use super::{CacheFolderStore, CollectionStore, JobStateDelta, JobStore, StageUpdate};
use crate::error::{PipelineError, Result};

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<CollectionId, Collection>>,
    cache_folders: Mutex<HashMap<CacheFolderId, CacheFolder>>,
    jobs: Mutex<HashMap<JobId, BackgroundJob>>,
    job_states: Mutex<HashMap<JobStateId, FileProcessingJobState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_collection<T>(
        &self,
        id: CollectionId,
        mutate: impl FnOnce(&mut Collection) -> T,
    ) -> Result<T> {
        let mut collections = self.collections.lock().expect("store lock poisoned");
        let collection = collections
            .get_mut(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("collection {id}")))?;
        let value = mutate(collection);
        collection.updated_at = Utc::now();
        Ok(value)
    }

    fn with_job<T>(
        &self,
        id: JobId,
        mutate: impl FnOnce(&mut BackgroundJob) -> T,
    ) -> Result<T> {
        let mut jobs = self.jobs.lock().expect("store lock poisoned");
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("job {id}")))?;
        let value = mutate(job);
        job.updated_at = Utc::now();
        Ok(value)
    }
}

#[async_trait]
impl CollectionStore for MemoryStore {
    async fn insert(&self, collection: &Collection) -> Result<()> {
        self.collections
            .lock()
            .expect("store lock poisoned")
            .insert(collection.id, collection.clone());
        Ok(())
    }

    async fn get(&self, id: CollectionId) -> Result<Option<Collection>> {
        Ok(self
            .collections
            .lock()
            .expect("store lock poisoned")
            .get(&id)
            .cloned())
    }

    async fn find_by_path(&self, path: &str) -> Result<Option<Collection>> {
        Ok(self
            .collections
            .lock()
            .expect("store lock poisoned")
            .values()
            .find(|collection| collection.path == path)
            .cloned())
    }

    async fn append_image(&self, id: CollectionId, image: &ImageEntry) -> Result<()> {
        self.with_collection(id, |collection| collection.images.push(image.clone()))
    }

    async fn append_artifacts(
        &self,
        id: CollectionId,
        kind: ArtifactKind,
        entries: &[ArtifactEntry],
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.with_collection(id, |collection| {
            let list = match kind {
                ArtifactKind::Thumbnail => &mut collection.thumbnails,
                ArtifactKind::Cache => &mut collection.cache_images,
            };
            list.extend_from_slice(entries);
        })
    }

    async fn remove_artifact(
        &self,
        id: CollectionId,
        kind: ArtifactKind,
        image_id: ImageId,
        width: u32,
        height: u32,
    ) -> Result<Option<ArtifactEntry>> {
        self.with_collection(id, |collection| {
            let list = match kind {
                ArtifactKind::Thumbnail => &mut collection.thumbnails,
                ArtifactKind::Cache => &mut collection.cache_images,
            };
            let position = list.iter().position(|entry| {
                entry.image_id == image_id && entry.width == width && entry.height == height
            });
            position.map(|index| list.remove(index))
        })
    }

    async fn clear_image_arrays(&self, id: CollectionId) -> Result<()> {
        self.with_collection(id, |collection| {
            collection.images.clear();
            collection.thumbnails.clear();
            collection.cache_images.clear();
        })
    }
}

#[async_trait]
impl CacheFolderStore for MemoryStore {
    async fn insert(&self, folder: &CacheFolder) -> Result<()> {
        self.cache_folders
            .lock()
            .expect("store lock poisoned")
            .insert(folder.id, folder.clone());
        Ok(())
    }

    async fn get(&self, id: CacheFolderId) -> Result<Option<CacheFolder>> {
        Ok(self
            .cache_folders
            .lock()
            .expect("store lock poisoned")
            .get(&id)
            .cloned())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<CacheFolder>> {
        Ok(self
            .cache_folders
            .lock()
            .expect("store lock poisoned")
            .values()
            .find(|folder| folder.name == name)
            .cloned())
    }

    async fn list_active(&self) -> Result<Vec<CacheFolder>> {
        Ok(self
            .cache_folders
            .lock()
            .expect("store lock poisoned")
            .values()
            .filter(|folder| folder.is_active)
            .cloned()
            .collect())
    }

    async fn record_usage(&self, id: CacheFolderId, bytes: i64, files: i64) -> Result<()> {
        let mut folders = self.cache_folders.lock().expect("store lock poisoned");
        let folder = folders
            .get_mut(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("cache folder {id}")))?;
        folder.current_size_bytes = folder.current_size_bytes.saturating_add_signed(bytes);
        folder.total_files = folder.total_files.saturating_add_signed(files);
        folder.updated_at = Utc::now();
        Ok(())
    }

    async fn add_cached_collection(
        &self,
        id: CacheFolderId,
        collection_id: CollectionId,
    ) -> Result<()> {
        let mut folders = self.cache_folders.lock().expect("store lock poisoned");
        let folder = folders
            .get_mut(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("cache folder {id}")))?;
        folder.cached_collections.insert(collection_id);
        folder.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, job: &BackgroundJob) -> Result<()> {
        self.jobs
            .lock()
            .expect("store lock poisoned")
            .insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<BackgroundJob>> {
        Ok(self
            .jobs
            .lock()
            .expect("store lock poisoned")
            .get(&id)
            .cloned())
    }

    async fn list_unfinished_jobs(
        &self,
        job_types: &[JobType],
        limit: u32,
    ) -> Result<Vec<BackgroundJob>> {
        let jobs = self.jobs.lock().expect("store lock poisoned");
        let mut unfinished: Vec<BackgroundJob> = jobs
            .values()
            .filter(|job| job_types.contains(&job.job_type))
            .filter(|job| matches!(job.status, JobStatus::Pending | JobStatus::Running))
            .cloned()
            .collect();
        unfinished.sort_by_key(|job| job.created_at);
        unfinished.truncate(limit as usize);
        Ok(unfinished)
    }

    async fn set_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        message: Option<String>,
    ) -> Result<()> {
        self.with_job(id, |job| {
            job.status = status;
            if message.is_some() {
                job.message = message;
            }
            match status {
                JobStatus::Running if job.started_at.is_none() => {
                    job.started_at = Some(Utc::now());
                }
                status if status.is_terminal() => {
                    job.completed_at = Some(Utc::now());
                }
                _ => {}
            }
        })
    }

    async fn record_job_outcome(
        &self,
        id: JobId,
        success_count: u64,
        error_count: u64,
        error_summary: &HashMap<ProcessingErrorKind, u64>,
    ) -> Result<()> {
        self.with_job(id, |job| {
            job.success_count += success_count;
            job.error_count += error_count;
            for (kind, count) in error_summary {
                *job.error_summary.entry(*kind).or_insert(0) += count;
            }
        })
    }

    async fn update_stage(&self, id: JobId, stage: StageKind, update: StageUpdate) -> Result<()> {
        self.with_job(id, |job| {
            let entry = job.stages.get_mut(stage);
            if let Some(total) = update.total_items {
                entry.total_items = entry.total_items.max(total);
            }
            if let Some(completed) = update.completed_items {
                entry.completed_items = completed.min(entry.total_items);
            }
            if let Some(message) = update.message {
                entry.message = Some(message);
            }
            if let Some(status) = update.status {
                entry.status = status;
                match status {
                    StageStatus::Running if entry.started_at.is_none() => {
                        entry.started_at = Some(Utc::now());
                    }
                    StageStatus::Completed | StageStatus::Failed => {
                        entry.completed_at = Some(Utc::now());
                    }
                    _ => {}
                }
            }
        })
    }

    async fn increment_stage_completed(
        &self,
        id: JobId,
        stage: StageKind,
        delta: u64,
    ) -> Result<u64> {
        self.with_job(id, |job| {
            let entry = job.stages.get_mut(stage);
            entry.completed_items = (entry.completed_items + delta).min(entry.total_items);
            entry.completed_items
        })
    }

    async fn create_job_state(&self, state: &FileProcessingJobState) -> Result<()> {
        self.job_states
            .lock()
            .expect("store lock poisoned")
            .insert(state.id, state.clone());
        Ok(())
    }

    async fn get_job_state(&self, id: JobStateId) -> Result<Option<FileProcessingJobState>> {
        Ok(self
            .job_states
            .lock()
            .expect("store lock poisoned")
            .get(&id)
            .cloned())
    }

    async fn find_job_state(
        &self,
        job_id: JobId,
        collection_id: CollectionId,
        kind: ArtifactKind,
    ) -> Result<Option<FileProcessingJobState>> {
        Ok(self
            .job_states
            .lock()
            .expect("store lock poisoned")
            .values()
            .find(|state| {
                state.job_id == job_id
                    && state.collection_id == collection_id
                    && state.kind == kind
            })
            .cloned())
    }

    async fn set_job_state_status(&self, id: JobStateId, status: JobStatus) -> Result<bool> {
        let mut states = self.job_states.lock().expect("store lock poisoned");
        let state = states
            .get_mut(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("job state {id}")))?;
        if state.status.is_terminal() || state.status == status {
            return Ok(false);
        }
        state.status = status;
        state.updated_at = Utc::now();
        if status.is_terminal() {
            state.completed_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn increment_job_state(
        &self,
        id: JobStateId,
        delta: JobStateDelta,
    ) -> Result<JobStateCounters> {
        let mut states = self.job_states.lock().expect("store lock poisoned");
        let state = states
            .get_mut(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("job state {id}")))?;
        // A finished state ignores further increments: anything arriving now
        // is a duplicate delivery, and counters never exceed the total.
        if state.is_finished() {
            return Ok(JobStateCounters {
                total: state.total_images,
                completed: state.completed_images,
                failed: state.failed_images,
                skipped: state.skipped_images,
                dummy_entries: state.dummy_entry_count,
            });
        }
        match delta {
            JobStateDelta::Completed { .. } => state.completed_images += 1,
            JobStateDelta::Skipped => state.skipped_images += 1,
            JobStateDelta::Failed { kind, dummy } => {
                state.failed_images += 1;
                if dummy {
                    state.dummy_entry_count += 1;
                }
                if let Some(kind) = kind {
                    *state.error_summary.entry(kind).or_insert(0) += 1;
                }
            }
        }
        state.updated_at = Utc::now();
        Ok(JobStateCounters {
            total: state.total_images,
            completed: state.completed_images,
            failed: state.failed_images,
            skipped: state.skipped_images,
            dummy_entries: state.dummy_entry_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imageviewer_model::{ArtifactSettings, CollectionType, OutputFormat};

    fn settings() -> ArtifactSettings {
        ArtifactSettings {
            width: 300,
            height: 300,
            format: OutputFormat::Jpeg,
            quality: 85,
            preserve_original: false,
        }
    }

    #[tokio::test]
    async fn artifact_append_is_all_or_nothing_per_call() {
        let store = MemoryStore::new();
        let collection = Collection::new("c", "/data/c", CollectionType::Folder);
        let id = collection.id;
        CollectionStore::insert(&store, &collection).await.unwrap();

        let entries: Vec<ArtifactEntry> = (0..3)
            .map(|i| {
                ArtifactEntry::generated(
                    imageviewer_model::ImageId::new(),
                    format!("/cache/{i}.jpg"),
                    300,
                    300,
                    1000,
                    "JPEG",
                    85,
                )
            })
            .collect();
        store
            .append_artifacts(id, ArtifactKind::Thumbnail, &entries)
            .await
            .unwrap();

        let loaded = CollectionStore::get(&store, id).await.unwrap().unwrap();
        assert_eq!(loaded.thumbnails.len(), 3);
        assert!(loaded.cache_images.is_empty());
    }

    #[tokio::test]
    async fn remove_artifact_drops_exactly_the_keyed_entry() {
        let store = MemoryStore::new();
        let collection = Collection::new("c", "/data/c", CollectionType::Folder);
        let id = collection.id;
        CollectionStore::insert(&store, &collection).await.unwrap();

        let image_id = ImageId::new();
        let keyed = ArtifactEntry::generated(image_id, "/cache/a.jpg", 1920, 1080, 500, "JPEG", 85);
        let other = ArtifactEntry::generated(image_id, "/cache/b.jpg", 300, 300, 100, "JPEG", 85);
        store
            .append_artifacts(id, ArtifactKind::Cache, &[keyed.clone(), other])
            .await
            .unwrap();

        let removed = store
            .remove_artifact(id, ArtifactKind::Cache, image_id, 1920, 1080)
            .await
            .unwrap()
            .expect("entry existed");
        assert_eq!(removed.path, keyed.path);
        assert_eq!(removed.file_size, 500);

        let loaded = CollectionStore::get(&store, id).await.unwrap().unwrap();
        assert_eq!(loaded.cache_images.len(), 1);
        assert_eq!(loaded.cache_images[0].width, 300);

        // Second removal of the same key finds nothing.
        assert!(
            store
                .remove_artifact(id, ArtifactKind::Cache, image_id, 1920, 1080)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn job_state_counters_accumulate_atomically() {
        let store = MemoryStore::new();
        let state = FileProcessingJobState::new(
            JobId::new(),
            CollectionId::new(),
            ArtifactKind::Thumbnail,
            3,
            settings(),
        );
        let id = state.id;
        store.create_job_state(&state).await.unwrap();

        store
            .increment_job_state(id, JobStateDelta::Completed { bytes: 10 })
            .await
            .unwrap();
        store
            .increment_job_state(id, JobStateDelta::Skipped)
            .await
            .unwrap();
        let counters = store
            .increment_job_state(
                id,
                JobStateDelta::Failed {
                    kind: Some(ProcessingErrorKind::DecoderFailure),
                    dummy: true,
                },
            )
            .await
            .unwrap();

        assert!(counters.is_finished());
        assert_eq!(counters.completed, 1);
        assert_eq!(counters.failed, 1);
        assert_eq!(counters.skipped, 1);
        assert_eq!(counters.dummy_entries, 1);
        assert!(counters.completed + counters.failed + counters.skipped <= counters.total);
    }

    #[tokio::test]
    async fn stage_increment_clamps_to_total() {
        let store = MemoryStore::new();
        let job = BackgroundJob::new(JobType::CollectionScan);
        let id = job.id;
        store.create_job(&job).await.unwrap();
        store
            .update_stage(id, StageKind::Thumbnail, StageUpdate::running(2))
            .await
            .unwrap();

        assert_eq!(
            store
                .increment_stage_completed(id, StageKind::Thumbnail, 5)
                .await
                .unwrap(),
            2
        );
    }
}
