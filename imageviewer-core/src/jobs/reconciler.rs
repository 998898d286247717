//! Periodic resynchronization of job counters against store ground truth.
//!
//! Consumers are the primary source of progress in the happy path; this loop
//! is the authoritative healer for crashes and lost stage updates. It
//! compares each pending job's stage counters against what the collection
//! actually materialized and closes stages the counters lost track of.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use imageviewer_model::{BackgroundJob, JobType, StageKind, StageStatus};

use super::tracker::JobProgressTracker;
use crate::error::Result;
use crate::store::{CollectionStore, JobStore, StageUpdate};

const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);
const JOB_BATCH_LIMIT: u32 = 500;
const RECONCILED_JOB_TYPES: &[JobType] = &[JobType::CollectionScan, JobType::ResumeCollection];

pub struct StuckJobReconciler {
    jobs: Arc<dyn JobStore>,
    collections: Arc<dyn CollectionStore>,
    tracker: JobProgressTracker,
}

impl std::fmt::Debug for StuckJobReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StuckJobReconciler").finish_non_exhaustive()
    }
}

impl StuckJobReconciler {
    pub fn new(jobs: Arc<dyn JobStore>, collections: Arc<dyn CollectionStore>) -> Self {
        let tracker = JobProgressTracker::new(jobs.clone());
        Self {
            jobs,
            collections,
            tracker,
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("starting stuck-job reconciler");
        let mut ticker = interval(RECONCILE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }
            match self.reconcile_once().await {
                Ok(0) => {}
                Ok(updated) => debug!(updated, "reconciled stuck jobs"),
                Err(e) => error!("job reconciliation pass failed: {e}"),
            }
        }
        info!("stuck-job reconciler stopped");
    }

    /// One pass over pending scan jobs. Returns how many jobs were touched.
    pub async fn reconcile_once(&self) -> Result<u32> {
        let jobs = self
            .jobs
            .list_unfinished_jobs(RECONCILED_JOB_TYPES, JOB_BATCH_LIMIT)
            .await?;
        let mut updated = 0;
        for job in jobs {
            match self.reconcile_job(&job).await {
                Ok(true) => updated += 1,
                Ok(false) => {}
                Err(e) => error!(job_id = %job.id, "failed to reconcile job: {e}"),
            }
        }
        Ok(updated)
    }

    async fn reconcile_job(&self, job: &BackgroundJob) -> Result<bool> {
        let mut touched = false;

        if let Some(collection_id) = job.collection_id {
            let Some(collection) = self.collections.get(collection_id).await? else {
                return Ok(false);
            };
            for (stage_kind, actual) in [
                (StageKind::Thumbnail, collection.thumbnails.len() as u64),
                (StageKind::Cache, collection.cache_images.len() as u64),
            ] {
                let stage = job.stages.get(stage_kind);
                if stage.total_items == 0 {
                    continue;
                }
                if actual >= stage.total_items {
                    if stage.status != StageStatus::Completed {
                        let completed = actual.max(stage.completed_items);
                        debug!(
                            job_id = %job.id,
                            stage = %stage_kind,
                            actual,
                            expected = stage.total_items,
                            "closing stage from materialized artifacts"
                        );
                        self.tracker
                            .stage_completed(
                                job.id,
                                stage_kind,
                                completed,
                                stage.total_items.max(completed),
                                Some("reconciled against store".to_string()),
                            )
                            .await?;
                        touched = true;
                    }
                } else if actual > stage.completed_items {
                    self.jobs
                        .update_stage(
                            job.id,
                            stage_kind,
                            StageUpdate {
                                completed_items: Some(actual.max(stage.completed_items)),
                                ..Default::default()
                            },
                        )
                        .await?;
                    touched = true;
                }
            }
        } else {
            // No collection to compare against; close any stage whose own
            // counters already add up.
            for stage_kind in [StageKind::Scan, StageKind::Thumbnail, StageKind::Cache] {
                let stage = job.stages.get(stage_kind);
                if stage.total_items > 0
                    && stage.completed_items >= stage.total_items
                    && stage.status != StageStatus::Completed
                {
                    self.tracker
                        .stage_completed(
                            job.id,
                            stage_kind,
                            stage.completed_items,
                            stage.total_items,
                            Some("reconciled from stage counters".to_string()),
                        )
                        .await?;
                    touched = true;
                }
            }
        }

        if touched {
            self.tracker.try_finalize_job(job.id).await?;
        }
        Ok(touched)
    }
}
