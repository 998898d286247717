//! Library scanning: fan a library root out into per-collection scan jobs.
//!
//! Each top-level media directory becomes a folder collection and each
//! archive file becomes an archive collection, every one driven by its own
//! background job. The library job itself only tracks the fan-out.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use imageviewer_model::{
    BackgroundJob, Collection, CollectionScanMessage, CollectionType, JobStatus, JobType,
    LibraryScanMessage, MessageOrigin, MessageType, StageKind, media_types,
};

use crate::broker::{Delivery, MessageBroker, publish_message};
use crate::consumer::MessageHandler;
use crate::error::Result;
use crate::jobs::JobProgressTracker;
use crate::store::{CollectionStore, JobStore};

#[derive(Clone)]
pub struct LibraryScanWorker {
    collections: Arc<dyn CollectionStore>,
    jobs: Arc<dyn JobStore>,
    tracker: JobProgressTracker,
    broker: Arc<dyn MessageBroker>,
}

impl std::fmt::Debug for LibraryScanWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryScanWorker").finish_non_exhaustive()
    }
}

impl LibraryScanWorker {
    pub fn new(
        collections: Arc<dyn CollectionStore>,
        jobs: Arc<dyn JobStore>,
        broker: Arc<dyn MessageBroker>,
    ) -> Self {
        let tracker = JobProgressTracker::new(jobs.clone());
        Self {
            collections,
            jobs,
            tracker,
            broker,
        }
    }

    pub async fn handle_library_scan(&self, message: &LibraryScanMessage) -> Result<()> {
        if message.include_subfolders {
            // Collections are scanned one level deep by design; recursive
            // discovery contradicts that and is refused loudly instead of
            // resolved silently.
            warn!(
                library_id = %message.library_id,
                "library scan requested includeSubfolders; rejecting as a configuration error"
            );
            self.jobs
                .set_job_status(
                    message.job_run_id,
                    JobStatus::Failed,
                    Some(
                        "includeSubfolders conflicts with top-level collection scanning; \
                         flatten the library layout or disable the option"
                            .to_string(),
                    ),
                )
                .await?;
            return Ok(());
        }

        self.jobs
            .set_job_status(message.job_run_id, JobStatus::Running, None)
            .await?;

        let root = Path::new(&message.library_path);
        let mut entries = tokio::fs::read_dir(root).await?;
        let mut queued: u64 = 0;
        while let Some(dir_entry) = entries.next_entry().await? {
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let file_type = dir_entry.file_type().await?;
            let candidate = if file_type.is_dir() {
                Some(CollectionType::Folder)
            } else if file_type.is_file() && media_types::is_archive_file(&name) {
                Some(CollectionType::Archive)
            } else {
                None
            };
            let Some(collection_type) = candidate else {
                continue;
            };

            let path = dir_entry.path().to_string_lossy().into_owned();
            if self
                .queue_collection(message, &name, &path, collection_type)
                .await?
            {
                queued += 1;
            }
        }

        info!(
            library_id = %message.library_id,
            queued, "library scan fanned out collections"
        );
        self.tracker
            .stage_completed(message.job_run_id, StageKind::Scan, queued, queued, None)
            .await?;
        self.jobs
            .set_job_status(
                message.job_run_id,
                JobStatus::Completed,
                Some(format!("queued {queued} collection scans")),
            )
            .await?;
        Ok(())
    }

    /// Returns whether a scan was queued for this path.
    async fn queue_collection(
        &self,
        message: &LibraryScanMessage,
        name: &str,
        path: &str,
        collection_type: CollectionType,
    ) -> Result<bool> {
        let existing = self.collections.find_by_path(path).await?;
        let (collection, force_rescan, job_type) = match existing {
            Some(collection) => {
                if message.overwrite_existing {
                    (collection, true, JobType::CollectionScan)
                } else if message.resume_incomplete {
                    let unfinished = collection.thumbnails.len() < collection.images.len()
                        || collection.cache_images.len() < collection.images.len()
                        || collection.images.is_empty();
                    if !unfinished {
                        return Ok(false);
                    }
                    (collection, false, JobType::ResumeCollection)
                } else {
                    return Ok(false);
                }
            }
            None => {
                let mut collection = Collection::new(name, path, collection_type);
                collection.use_direct_access = message.use_direct_file_access;
                self.collections.insert(&collection).await?;
                (collection, false, JobType::CollectionScan)
            }
        };

        let mut job = BackgroundJob::for_collection(job_type, collection.id);
        job.library_id = Some(message.library_id);
        self.jobs.create_job(&job).await?;

        let scan = CollectionScanMessage {
            collection_id: collection.id,
            collection_path: collection.path.clone(),
            collection_type: collection.collection_type,
            force_rescan,
            use_direct_file_access: message.use_direct_file_access
                || collection.use_direct_access,
            job_id: job.id,
            origin: MessageOrigin::system("library-scan-worker"),
        };
        publish_message(self.broker.as_ref(), MessageType::CollectionScan, &scan).await?;
        Ok(true)
    }
}

#[async_trait]
impl MessageHandler for LibraryScanWorker {
    fn message_type(&self) -> MessageType {
        MessageType::LibraryScan
    }

    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        let message: LibraryScanMessage = delivery.envelope.decode()?;
        self.handle_library_scan(&message).await
    }
}
