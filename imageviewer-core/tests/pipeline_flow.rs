//! End-to-end pipeline runs over the in-memory broker and store with real
//! files on disk.

mod support;

use std::sync::Arc;
use std::time::Duration;

use imageviewer_config::WorkerConfig;
use imageviewer_core::broker::publish_message;
use imageviewer_core::store::{CacheFolderStore, CollectionStore, JobStore};
use imageviewer_model::{
    BackgroundJob, BulkOperationMessage, BulkOperationType, Collection, CollectionScanMessage,
    CollectionType, JobStatus, JobType, MessageOrigin, MessageType, StageStatus,
};

use support::{TestPipeline, jpeg_bytes, write_jpeg, write_zip};

const WAIT: Duration = Duration::from_secs(30);

fn test_config(max_batch_size: usize) -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.batching.max_batch_size = max_batch_size;
    config.batching.batch_timeout_seconds = 1;
    config
}

async fn scan_collection(
    pipeline: &TestPipeline,
    collection: &Collection,
    use_direct: bool,
) -> BackgroundJob {
    let collections: Arc<dyn CollectionStore> = pipeline.store.clone();
    let jobs: Arc<dyn JobStore> = pipeline.store.clone();
    collections.insert(collection).await.unwrap();

    let job = BackgroundJob::for_collection(JobType::CollectionScan, collection.id);
    jobs.create_job(&job).await.unwrap();

    let message = CollectionScanMessage {
        collection_id: collection.id,
        collection_path: collection.path.clone(),
        collection_type: collection.collection_type,
        force_rescan: false,
        use_direct_file_access: use_direct,
        job_id: job.id,
        origin: MessageOrigin::system("test"),
    };
    publish_message(pipeline.broker.as_ref(), MessageType::CollectionScan, &message)
        .await
        .unwrap();
    job
}

#[tokio::test]
async fn folder_of_three_jpegs_completes_every_stage() {
    let pipeline = TestPipeline::start(test_config(3)).await;
    let source_dir = pipeline.cache_root.parent().unwrap().join("photos");
    tokio::fs::create_dir_all(&source_dir).await.unwrap();
    for name in ["a.jpg", "b.jpg", "c.jpg"] {
        write_jpeg(&source_dir.join(name), 640, 480);
    }

    let collection = Collection::new(
        "photos",
        source_dir.to_string_lossy().into_owned(),
        CollectionType::Folder,
    );
    let collection_id = collection.id;
    let job = scan_collection(&pipeline, &collection, false).await;
    let finished = pipeline.wait_for_job(job.id, WAIT).await;

    assert_eq!(finished.status, JobStatus::Completed, "{finished:?}");
    for stage in [
        &finished.stages.scan,
        &finished.stages.thumbnail,
        &finished.stages.cache,
    ] {
        assert_eq!(stage.status, StageStatus::Completed);
        assert_eq!(stage.total_items, 3);
        assert_eq!(stage.completed_items, 3);
    }

    let collections: Arc<dyn CollectionStore> = pipeline.store.clone();
    let stored = collections.get(collection_id).await.unwrap().unwrap();
    assert_eq!(stored.images.len(), 3);
    assert_eq!(stored.thumbnails.len(), 3);
    assert_eq!(stored.cache_images.len(), 3);
    for entry in &stored.thumbnails {
        assert!(entry.is_generated && entry.is_valid && !entry.is_dummy);
        assert!(
            tokio::fs::try_exists(&entry.path).await.unwrap(),
            "thumbnail file missing: {}",
            entry.path
        );
    }
    for entry in &stored.cache_images {
        assert!(entry.is_valid);
        assert!(tokio::fs::try_exists(&entry.path).await.unwrap());
    }

    pipeline.stop().await;
}

#[tokio::test]
async fn macos_metadata_entries_are_filtered_from_archives() {
    let pipeline = TestPipeline::start(test_config(1)).await;
    let archive_path = pipeline.cache_root.parent().unwrap().join("book.cbz");
    let image = jpeg_bytes(320, 240);
    write_zip(
        &archive_path,
        &[
            ("foo.jpg", image.as_slice()),
            ("__MACOSX/._foo.jpg", b"not an image".as_slice()),
        ],
    );

    let collection = Collection::new(
        "book",
        archive_path.to_string_lossy().into_owned(),
        CollectionType::Archive,
    );
    let collection_id = collection.id;
    let job = scan_collection(&pipeline, &collection, false).await;
    let finished = pipeline.wait_for_job(job.id, WAIT).await;

    assert_eq!(finished.status, JobStatus::Completed, "{finished:?}");
    let collections: Arc<dyn CollectionStore> = pipeline.store.clone();
    let stored = collections.get(collection_id).await.unwrap().unwrap();
    assert_eq!(stored.images.len(), 1);
    assert_eq!(stored.images[0].filename, "foo.jpg");
    assert_eq!(stored.thumbnails.len(), 1);
    assert_eq!(stored.cache_images.len(), 1);

    pipeline.stop().await;
}

#[tokio::test]
async fn oversized_archive_member_fails_without_decoding() {
    let mut config = test_config(1);
    // Far below the size of the member we create.
    config.limits.max_zip_entry_size_bytes = 64;
    let pipeline = TestPipeline::start(config).await;

    let archive_path = pipeline.cache_root.parent().unwrap().join("huge.zip");
    let image = jpeg_bytes(640, 480);
    write_zip(&archive_path, &[("huge.jpg", image.as_slice())]);

    let collection = Collection::new(
        "huge",
        archive_path.to_string_lossy().into_owned(),
        CollectionType::Archive,
    );
    let collection_id = collection.id;
    let job = scan_collection(&pipeline, &collection, false).await;
    let finished = pipeline.wait_for_job(job.id, WAIT).await;

    // The cache side records a terminal dummy entry; the job closes with
    // the error statistics rolled up.
    assert_eq!(finished.status, JobStatus::CompletedWithErrors, "{finished:?}");

    let jobs: Arc<dyn JobStore> = pipeline.store.clone();
    for kind in [
        imageviewer_model::ArtifactKind::Thumbnail,
        imageviewer_model::ArtifactKind::Cache,
    ] {
        let state = jobs
            .find_job_state(finished.id, collection_id, kind)
            .await
            .unwrap()
            .expect("job state exists");
        assert_eq!(state.total_images, 1);
        assert_eq!(state.failed_images, 1, "{kind}: {state:?}");
        assert_eq!(state.completed_images, 0);
        assert_eq!(state.status, JobStatus::Completed);
        assert!(state.completed_images + state.failed_images >= state.total_images);
    }

    let collections: Arc<dyn CollectionStore> = pipeline.store.clone();
    let stored = collections.get(collection_id).await.unwrap().unwrap();
    // No decode happened: nothing generated, only the cache dummy marker.
    assert!(stored.thumbnails.iter().all(|entry| !entry.is_generated));
    assert_eq!(stored.cache_images.len(), 1);
    assert!(stored.cache_images[0].is_dummy);

    pipeline.stop().await;
}

#[tokio::test]
async fn direct_access_folder_materializes_direct_references() {
    let pipeline = TestPipeline::start(test_config(10)).await;
    let source_dir = pipeline.cache_root.parent().unwrap().join("direct");
    tokio::fs::create_dir_all(&source_dir).await.unwrap();
    write_jpeg(&source_dir.join("one.jpg"), 800, 600);
    write_jpeg(&source_dir.join("two.jpg"), 1024, 768);

    let collection = Collection::new(
        "direct",
        source_dir.to_string_lossy().into_owned(),
        CollectionType::Folder,
    );
    let collection_id = collection.id;
    let job = scan_collection(&pipeline, &collection, true).await;
    let finished = pipeline.wait_for_job(job.id, WAIT).await;

    assert_eq!(finished.status, JobStatus::Completed, "{finished:?}");
    let collections: Arc<dyn CollectionStore> = pipeline.store.clone();
    let stored = collections.get(collection_id).await.unwrap().unwrap();
    assert_eq!(stored.images.len(), 2);
    assert_eq!(stored.thumbnails.len(), 2);
    assert_eq!(stored.cache_images.len(), 2);
    for entry in stored.thumbnails.iter().chain(stored.cache_images.iter()) {
        assert!(!entry.is_generated, "direct entries reference the originals");
        assert!(entry.path.ends_with(".jpg"));
        assert!(tokio::fs::try_exists(&entry.path).await.unwrap());
    }
    // Probed dimensions land on the image entries.
    assert!(stored.images.iter().any(|image| image.width == 800));
    assert!(stored.images.iter().any(|image| image.width == 1024));

    pipeline.stop().await;
}

/// Wait until no tracked job is unfinished and every queue is drained,
/// confirmed across two consecutive checks.
async fn wait_until_idle(pipeline: &TestPipeline) {
    let jobs: Arc<dyn JobStore> = pipeline.store.clone();
    let deadline = tokio::time::Instant::now() + WAIT;
    let mut settled = 0;
    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let unfinished = jobs
            .list_unfinished_jobs(
                &[
                    JobType::CollectionScan,
                    JobType::ResumeCollection,
                    JobType::BulkOperation,
                ],
                1,
            )
            .await
            .unwrap();
        let mut queued = 0;
        for message_type in MessageType::ALL {
            queued += pipeline
                .broker
                .queue_depth(message_type.routing_key())
                .await
                .unwrap();
            queued += pipeline
                .broker
                .in_flight(message_type.routing_key())
                .await
                .unwrap();
        }
        if unfinished.is_empty() && queued == 0 {
            settled += 1;
            if settled >= 2 {
                return;
            }
        } else {
            settled = 0;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "pipeline did not go idle within {WAIT:?}"
        );
    }
}

#[tokio::test]
async fn forced_cache_regeneration_replaces_entries_without_duplicates() {
    let pipeline = TestPipeline::start(test_config(2)).await;
    let source_dir = pipeline.cache_root.parent().unwrap().join("regen");
    tokio::fs::create_dir_all(&source_dir).await.unwrap();
    write_jpeg(&source_dir.join("a.jpg"), 640, 480);
    write_jpeg(&source_dir.join("b.jpg"), 640, 480);

    let collection = Collection::new(
        "regen",
        source_dir.to_string_lossy().into_owned(),
        CollectionType::Folder,
    );
    let collection_id = collection.id;
    let job = scan_collection(&pipeline, &collection, false).await;
    pipeline.wait_for_job(job.id, WAIT).await;

    let collections: Arc<dyn CollectionStore> = pipeline.store.clone();
    let cache_folders: Arc<dyn CacheFolderStore> = pipeline.store.clone();
    let jobs: Arc<dyn JobStore> = pipeline.store.clone();

    let before = collections.get(collection_id).await.unwrap().unwrap();
    assert_eq!(before.cache_images.len(), 2);
    let folder_before = cache_folders.list_active().await.unwrap().remove(0);

    // Force-regenerate the cache twice; the list and the folder counters
    // must not grow either time.
    for _ in 0..2 {
        let bulk_job = BackgroundJob::new(JobType::BulkOperation);
        jobs.create_job(&bulk_job).await.unwrap();
        let bulk = BulkOperationMessage {
            operation_type: BulkOperationType::RegenerateCache,
            collection_ids: vec![collection_id],
            parameters: std::collections::HashMap::from([(
                "force".to_string(),
                "true".to_string(),
            )]),
            job_id: bulk_job.id,
            origin: MessageOrigin::system("test"),
        };
        publish_message(pipeline.broker.as_ref(), MessageType::BulkOperation, &bulk)
            .await
            .unwrap();
        wait_until_idle(&pipeline).await;
    }

    let after = collections.get(collection_id).await.unwrap().unwrap();
    assert_eq!(after.cache_images.len(), 2, "no duplicate cache entries");
    let mut keys: Vec<_> = after
        .cache_images
        .iter()
        .map(|entry| (entry.image_id, entry.width, entry.height))
        .collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 2, "(image_id, width, height) stays unique");
    for entry in &after.cache_images {
        assert!(entry.is_generated && !entry.is_dummy);
        assert!(tokio::fs::try_exists(&entry.path).await.unwrap());
        assert!(
            entry.created_at > before.cache_images[0].created_at,
            "entries were replaced, not kept"
        );
    }

    // Overwrites contribute size deltas, never a second file count.
    let folder_after = cache_folders.list_active().await.unwrap().remove(0);
    assert_eq!(folder_after.total_files, folder_before.total_files);
    assert_eq!(
        folder_after.current_size_bytes,
        after
            .cache_images
            .iter()
            .map(|entry| entry.file_size)
            .sum::<u64>()
    );

    pipeline.stop().await;
}

#[tokio::test]
async fn redelivered_thumbnail_messages_append_nothing_new() {
    let pipeline = TestPipeline::start(test_config(2)).await;
    let source_dir = pipeline.cache_root.parent().unwrap().join("idem");
    tokio::fs::create_dir_all(&source_dir).await.unwrap();
    write_jpeg(&source_dir.join("a.jpg"), 320, 240);
    write_jpeg(&source_dir.join("b.jpg"), 320, 240);

    let collection = Collection::new(
        "idem",
        source_dir.to_string_lossy().into_owned(),
        CollectionType::Folder,
    );
    let collection_id = collection.id;
    let job = scan_collection(&pipeline, &collection, false).await;
    pipeline.wait_for_job(job.id, WAIT).await;

    let collections: Arc<dyn CollectionStore> = pipeline.store.clone();
    let before = collections.get(collection_id).await.unwrap().unwrap();
    assert_eq!(before.thumbnails.len(), 2);

    // Re-run the whole scan under a fresh job: everything already exists in
    // the lists and on disk, so nothing is appended twice.
    let jobs: Arc<dyn JobStore> = pipeline.store.clone();
    let rescan = BackgroundJob::for_collection(JobType::CollectionScan, collection_id);
    jobs.create_job(&rescan).await.unwrap();
    let message = CollectionScanMessage {
        collection_id,
        collection_path: before.path.clone(),
        collection_type: before.collection_type,
        force_rescan: false,
        use_direct_file_access: false,
        job_id: rescan.id,
        origin: MessageOrigin::system("test"),
    };
    publish_message(pipeline.broker.as_ref(), MessageType::CollectionScan, &message)
        .await
        .unwrap();
    pipeline.wait_for_job(rescan.id, WAIT).await;

    let after = collections.get(collection_id).await.unwrap().unwrap();
    assert_eq!(after.thumbnails.len(), 2, "no duplicate artifact entries");
    assert_eq!(after.cache_images.len(), 2);

    pipeline.stop().await;
}
