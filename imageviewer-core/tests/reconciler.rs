//! Stuck-job reconciliation against store ground truth.

use std::sync::Arc;

use imageviewer_core::jobs::StuckJobReconciler;
use imageviewer_core::store::memory::MemoryStore;
use imageviewer_core::store::{CollectionStore, JobStore, StageUpdate};
use imageviewer_model::{
    ArtifactEntry, ArtifactKind, BackgroundJob, Collection, CollectionType, ImageId, JobStatus,
    JobType, StageKind, StageStatus,
};

fn artifact(image_id: ImageId) -> ArtifactEntry {
    ArtifactEntry::generated(image_id, "/cache/x.jpg", 300, 300, 1000, "JPEG", 85)
}

async fn seed_job_with_artifacts(
    store: &Arc<MemoryStore>,
    artifact_count: usize,
    stage_total: u64,
    stage_completed: u64,
) -> (BackgroundJob, Collection) {
    let collections: Arc<dyn CollectionStore> = store.clone();
    let jobs: Arc<dyn JobStore> = store.clone();

    let collection = Collection::new("c", "/data/c", CollectionType::Folder);
    collections.insert(&collection).await.unwrap();
    let entries: Vec<ArtifactEntry> = (0..artifact_count).map(|_| artifact(ImageId::new())).collect();
    collections
        .append_artifacts(collection.id, ArtifactKind::Thumbnail, &entries)
        .await
        .unwrap();
    collections
        .append_artifacts(collection.id, ArtifactKind::Cache, &entries)
        .await
        .unwrap();

    let job = BackgroundJob::for_collection(JobType::CollectionScan, collection.id);
    jobs.create_job(&job).await.unwrap();
    jobs.set_job_status(job.id, JobStatus::Running, None).await.unwrap();
    jobs.update_stage(
        job.id,
        StageKind::Scan,
        StageUpdate::completed(stage_total, stage_total),
    )
    .await
    .unwrap();
    for stage in [StageKind::Thumbnail, StageKind::Cache] {
        jobs.update_stage(
            job.id,
            stage,
            StageUpdate {
                status: Some(StageStatus::Running),
                total_items: Some(stage_total),
                completed_items: Some(stage_completed),
                message: None,
            },
        )
        .await
        .unwrap();
    }
    (job, collection)
}

#[tokio::test]
async fn closes_stages_whose_artifacts_are_fully_materialized() {
    let store = Arc::new(MemoryStore::new());
    // Counters say 1 of 3; the store actually has all 3 artifacts.
    let (job, _collection) = seed_job_with_artifacts(&store, 3, 3, 1).await;

    let reconciler = StuckJobReconciler::new(store.clone(), store.clone());
    let touched = reconciler.reconcile_once().await.unwrap();
    assert_eq!(touched, 1);

    let jobs: Arc<dyn JobStore> = store.clone();
    let healed = jobs.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(healed.stages.thumbnail.status, StageStatus::Completed);
    assert_eq!(healed.stages.thumbnail.completed_items, 3);
    assert_eq!(healed.stages.cache.status, StageStatus::Completed);
    assert_eq!(healed.status, JobStatus::Completed, "job finalized");
}

#[tokio::test]
async fn advances_lagging_counters_without_closing_incomplete_stages() {
    let store = Arc::new(MemoryStore::new());
    // 2 of 3 artifacts exist; counters think none do.
    let (job, _collection) = seed_job_with_artifacts(&store, 2, 3, 0).await;

    let reconciler = StuckJobReconciler::new(store.clone(), store.clone());
    assert_eq!(reconciler.reconcile_once().await.unwrap(), 1);

    let jobs: Arc<dyn JobStore> = store.clone();
    let healed = jobs.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(healed.stages.thumbnail.status, StageStatus::Running);
    assert_eq!(healed.stages.thumbnail.completed_items, 2);
    assert_eq!(healed.status, JobStatus::Running);
}

#[tokio::test]
async fn jobs_without_collections_close_from_their_own_counters() {
    let store = Arc::new(MemoryStore::new());
    let jobs: Arc<dyn JobStore> = store.clone();

    let job = BackgroundJob::new(JobType::ResumeCollection);
    jobs.create_job(&job).await.unwrap();
    jobs.set_job_status(job.id, JobStatus::Running, None).await.unwrap();
    for stage in [StageKind::Scan, StageKind::Thumbnail, StageKind::Cache] {
        jobs.update_stage(
            job.id,
            stage,
            StageUpdate {
                status: Some(StageStatus::Running),
                total_items: Some(4),
                completed_items: Some(4),
                message: None,
            },
        )
        .await
        .unwrap();
    }

    let reconciler = StuckJobReconciler::new(store.clone(), store.clone());
    assert_eq!(reconciler.reconcile_once().await.unwrap(), 1);

    let healed = jobs.get_job(job.id).await.unwrap().unwrap();
    assert!(healed.stages.all_completed());
    assert_eq!(healed.status, JobStatus::Completed);
}

#[tokio::test]
async fn terminal_jobs_are_left_alone() {
    let store = Arc::new(MemoryStore::new());
    let (job, _collection) = seed_job_with_artifacts(&store, 3, 3, 3).await;
    let jobs: Arc<dyn JobStore> = store.clone();
    jobs.set_job_status(job.id, JobStatus::Completed, None).await.unwrap();

    let reconciler = StuckJobReconciler::new(store.clone(), store.clone());
    assert_eq!(reconciler.reconcile_once().await.unwrap(), 0);
}
