//! Stage and job-state progress plumbing shared by every worker.

use std::sync::Arc;

use tracing::{debug, info};

use imageviewer_model::{
    ArtifactKind, JobId, JobStateCounters, JobStateId, JobStatus, StageKind, StageStatus,
};

use crate::error::Result;
use crate::store::{JobStore, StageUpdate};

pub fn stage_for_kind(kind: ArtifactKind) -> StageKind {
    match kind {
        ArtifactKind::Thumbnail => StageKind::Thumbnail,
        ArtifactKind::Cache => StageKind::Cache,
    }
}

#[derive(Clone)]
pub struct JobProgressTracker {
    jobs: Arc<dyn JobStore>,
}

impl std::fmt::Debug for JobProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobProgressTracker").finish_non_exhaustive()
    }
}

impl JobProgressTracker {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self { jobs }
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    pub async fn stage_pending(&self, job_id: JobId, stage: StageKind, total: u64) -> Result<()> {
        self.jobs
            .update_stage(
                job_id,
                stage,
                StageUpdate {
                    status: Some(StageStatus::Pending),
                    total_items: Some(total),
                    ..Default::default()
                },
            )
            .await
    }

    pub async fn stage_running(&self, job_id: JobId, stage: StageKind, total: u64) -> Result<()> {
        self.jobs
            .update_stage(job_id, stage, StageUpdate::running(total))
            .await
    }

    pub async fn stage_completed(
        &self,
        job_id: JobId,
        stage: StageKind,
        completed: u64,
        total: u64,
        message: Option<String>,
    ) -> Result<()> {
        self.jobs
            .update_stage(
                job_id,
                stage,
                StageUpdate {
                    status: Some(StageStatus::Completed),
                    total_items: Some(total),
                    completed_items: Some(completed),
                    message,
                },
            )
            .await
    }

    /// Bump a stage counter; failures advance it too so the stage can close.
    pub async fn advance_stage(&self, job_id: JobId, stage: StageKind, delta: u64) -> Result<u64> {
        self.jobs.increment_stage_completed(job_id, stage, delta).await
    }

    /// React to fresh job-state counters: when every image has reached a
    /// terminal outcome, close the job state, close its stage, roll error
    /// statistics up into the parent job, and finalize the parent once all
    /// three stages are done. Exactly one caller wins the close.
    pub async fn apply_job_state_counters(
        &self,
        state_id: JobStateId,
        counters: JobStateCounters,
    ) -> Result<()> {
        if !counters.is_finished() {
            return Ok(());
        }
        if !self
            .jobs
            .set_job_state_status(state_id, JobStatus::Completed)
            .await?
        {
            debug!(%state_id, "job state already finalized");
            return Ok(());
        }
        let Some(state) = self.jobs.get_job_state(state_id).await? else {
            return Ok(());
        };

        let stage = stage_for_kind(state.kind);
        self.jobs
            .update_stage(state.job_id, stage, StageUpdate::status(StageStatus::Completed))
            .await?;

        let success_count = counters.completed.saturating_sub(counters.dummy_entries);
        self.jobs
            .record_job_outcome(
                state.job_id,
                success_count,
                counters.dummy_entries,
                &state.error_summary,
            )
            .await?;
        info!(
            job_id = %state.job_id,
            collection_id = %state.collection_id,
            kind = %state.kind,
            completed = counters.completed,
            failed = counters.failed,
            skipped = counters.skipped,
            "processing job state finished"
        );

        self.try_finalize_job(state.job_id).await
    }

    /// Close the parent job once every stage has completed. `Completed`
    /// when no dummy entries were recorded, `CompletedWithErrors` otherwise.
    pub async fn try_finalize_job(&self, job_id: JobId) -> Result<()> {
        let Some(job) = self.jobs.get_job(job_id).await? else {
            return Ok(());
        };
        if job.status.is_terminal() || !job.stages.all_completed() {
            return Ok(());
        }
        let status = if job.error_count > 0 {
            JobStatus::CompletedWithErrors
        } else {
            JobStatus::Completed
        };
        self.jobs.set_job_status(job_id, status, None).await?;
        info!(%job_id, ?status, "background job finished");
        Ok(())
    }
}
