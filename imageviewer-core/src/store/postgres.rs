//! PostgreSQL store.
//!
//! Collection image and artifact lists live in JSONB columns so one `||`
//! concatenation appends a whole batch atomically; every counter moves
//! through a native SQL increment, never read-modify-write.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use imageviewer_model::{
    ArtifactEntry, ArtifactKind, BackgroundJob, CacheFolder, CacheFolderId, Collection,
    CollectionId, FileProcessingJobState, ImageEntry, ImageId, JobId, JobStages,
    JobStateCounters, JobStateId, JobStatus, JobType, ProcessingErrorKind, StageKind,
    StageStatus,
};

use super::{CacheFolderStore, CollectionStore, JobStateDelta, JobStore, StageUpdate};
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| PipelineError::Internal(format!("migration failed: {e}")))?;
        info!("connected to postgres store");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::CompletedWithErrors => "completedWithErrors",
    }
}

fn parse_status(value: &str) -> Result<JobStatus> {
    Ok(match value {
        "pending" => JobStatus::Pending,
        "running" => JobStatus::Running,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "completedWithErrors" => JobStatus::CompletedWithErrors,
        other => {
            return Err(PipelineError::Internal(format!(
                "unknown job status in store: {other}"
            )));
        }
    })
}

fn stage_status_str(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Pending => "pending",
        StageStatus::Running => "running",
        StageStatus::Completed => "completed",
        StageStatus::Failed => "failed",
    }
}

fn parse_stage_status(value: &str) -> Result<StageStatus> {
    Ok(match value {
        "pending" => StageStatus::Pending,
        "running" => StageStatus::Running,
        "completed" => StageStatus::Completed,
        "failed" => StageStatus::Failed,
        other => {
            return Err(PipelineError::Internal(format!(
                "unknown stage status in store: {other}"
            )));
        }
    })
}

fn job_type_str(job_type: JobType) -> &'static str {
    job_type.as_str()
}

fn parse_job_type(value: &str) -> Result<JobType> {
    Ok(match value {
        "collection-scan" => JobType::CollectionScan,
        "resume-collection" => JobType::ResumeCollection,
        "collection-creation" => JobType::CollectionCreation,
        "library-scan" => JobType::LibraryScan,
        "bulk-operation" => JobType::BulkOperation,
        other => {
            return Err(PipelineError::Internal(format!(
                "unknown job type in store: {other}"
            )));
        }
    })
}

fn artifact_list_column(kind: ArtifactKind) -> &'static str {
    match kind {
        ArtifactKind::Thumbnail => "thumbnails",
        ArtifactKind::Cache => "cache_images",
    }
}

fn error_summary_from_value(
    value: serde_json::Value,
) -> Result<HashMap<ProcessingErrorKind, u64>> {
    Ok(serde_json::from_value(value)?)
}

fn collection_from_row(row: &PgRow) -> Result<Collection> {
    let collection_type: String = row.try_get("collection_type")?;
    let collection_type = match collection_type.as_str() {
        "folder" => imageviewer_model::CollectionType::Folder,
        "archive" => imageviewer_model::CollectionType::Archive,
        other => {
            return Err(PipelineError::Internal(format!(
                "unknown collection type in store: {other}"
            )));
        }
    };
    Ok(Collection {
        id: CollectionId::from(row.try_get::<uuid::Uuid, _>("id")?),
        name: row.try_get("name")?,
        path: row.try_get("path")?,
        collection_type,
        use_direct_access: row.try_get("use_direct_access")?,
        images: serde_json::from_value(row.try_get::<serde_json::Value, _>("images")?)?,
        thumbnails: serde_json::from_value(row.try_get::<serde_json::Value, _>("thumbnails")?)?,
        cache_images: serde_json::from_value(row.try_get::<serde_json::Value, _>("cache_images")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn cache_folder_from_row(row: &PgRow) -> Result<CacheFolder> {
    Ok(CacheFolder {
        id: CacheFolderId::from(row.try_get::<uuid::Uuid, _>("id")?),
        name: row.try_get("name")?,
        path: row.try_get("path")?,
        is_active: row.try_get("is_active")?,
        current_size_bytes: row.try_get::<i64, _>("current_size_bytes")?.max(0) as u64,
        total_files: row.try_get::<i64, _>("total_files")?.max(0) as u64,
        cached_collections: serde_json::from_value(
            row.try_get::<serde_json::Value, _>("cached_collections")?,
        )?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn job_from_row(row: &PgRow, stages: JobStages) -> Result<BackgroundJob> {
    Ok(BackgroundJob {
        id: JobId::from(row.try_get::<uuid::Uuid, _>("id")?),
        job_type: parse_job_type(&row.try_get::<String, _>("job_type")?)?,
        status: parse_status(&row.try_get::<String, _>("status")?)?,
        collection_id: row
            .try_get::<Option<uuid::Uuid>, _>("collection_id")?
            .map(CollectionId::from),
        library_id: row
            .try_get::<Option<uuid::Uuid>, _>("library_id")?
            .map(imageviewer_model::LibraryId::from),
        stages,
        success_count: row.try_get::<i64, _>("success_count")?.max(0) as u64,
        error_count: row.try_get::<i64, _>("error_count")?.max(0) as u64,
        error_summary: error_summary_from_value(
            row.try_get::<serde_json::Value, _>("error_summary")?,
        )?,
        message: row.try_get("message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn apply_stage_row(stages: &mut JobStages, row: &PgRow) -> Result<()> {
    let name: String = row.try_get("stage")?;
    let kind = match name.as_str() {
        "scan" => StageKind::Scan,
        "thumbnail" => StageKind::Thumbnail,
        "cache" => StageKind::Cache,
        other => {
            return Err(PipelineError::Internal(format!(
                "unknown stage name in store: {other}"
            )));
        }
    };
    let stage = stages.get_mut(kind);
    stage.status = parse_stage_status(&row.try_get::<String, _>("status")?)?;
    stage.total_items = row.try_get::<i64, _>("total_items")?.max(0) as u64;
    stage.completed_items = row.try_get::<i64, _>("completed_items")?.max(0) as u64;
    stage.message = row.try_get("message")?;
    stage.started_at = row.try_get::<Option<DateTime<Utc>>, _>("started_at")?;
    stage.completed_at = row.try_get::<Option<DateTime<Utc>>, _>("completed_at")?;
    Ok(())
}

fn job_state_from_row(row: &PgRow) -> Result<FileProcessingJobState> {
    let kind = match row.try_get::<String, _>("kind")?.as_str() {
        "thumbnail" => ArtifactKind::Thumbnail,
        "cache" => ArtifactKind::Cache,
        other => {
            return Err(PipelineError::Internal(format!(
                "unknown artifact kind in store: {other}"
            )));
        }
    };
    Ok(FileProcessingJobState {
        id: JobStateId::from(row.try_get::<uuid::Uuid, _>("id")?),
        job_id: JobId::from(row.try_get::<uuid::Uuid, _>("job_id")?),
        collection_id: CollectionId::from(row.try_get::<uuid::Uuid, _>("collection_id")?),
        kind,
        status: parse_status(&row.try_get::<String, _>("status")?)?,
        total_images: row.try_get::<i64, _>("total_images")?.max(0) as u64,
        completed_images: row.try_get::<i64, _>("completed_images")?.max(0) as u64,
        failed_images: row.try_get::<i64, _>("failed_images")?.max(0) as u64,
        skipped_images: row.try_get::<i64, _>("skipped_images")?.max(0) as u64,
        dummy_entry_count: row.try_get::<i64, _>("dummy_entry_count")?.max(0) as u64,
        error_summary: error_summary_from_value(
            row.try_get::<serde_json::Value, _>("error_summary")?,
        )?,
        settings: serde_json::from_value(row.try_get::<serde_json::Value, _>("settings")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[async_trait]
impl CollectionStore for PostgresStore {
    async fn insert(&self, collection: &Collection) -> Result<()> {
        let collection_type = match collection.collection_type {
            imageviewer_model::CollectionType::Folder => "folder",
            imageviewer_model::CollectionType::Archive => "archive",
        };
        sqlx::query(
            r#"
            INSERT INTO collections
                (id, name, path, collection_type, use_direct_access,
                 images, thumbnails, cache_images, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(collection.id.to_uuid())
        .bind(&collection.name)
        .bind(&collection.path)
        .bind(collection_type)
        .bind(collection.use_direct_access)
        .bind(serde_json::to_value(&collection.images)?)
        .bind(serde_json::to_value(&collection.thumbnails)?)
        .bind(serde_json::to_value(&collection.cache_images)?)
        .bind(collection.created_at)
        .bind(collection.updated_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get(&self, id: CollectionId) -> Result<Option<Collection>> {
        let row = sqlx::query("SELECT * FROM collections WHERE id = $1")
            .bind(id.to_uuid())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(collection_from_row).transpose()
    }

    async fn find_by_path(&self, path: &str) -> Result<Option<Collection>> {
        let row = sqlx::query("SELECT * FROM collections WHERE path = $1")
            .bind(path)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(collection_from_row).transpose()
    }

    async fn append_image(&self, id: CollectionId, image: &ImageEntry) -> Result<()> {
        let appended = serde_json::to_value(std::slice::from_ref(image))?;
        let result = sqlx::query(
            "UPDATE collections SET images = images || $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id.to_uuid())
        .bind(appended)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::NotFound(format!("collection {id}")));
        }
        Ok(())
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
        let column = artifact_list_column(kind);
        let appended = serde_json::to_value(entries)?;
        let query = format!(
            "UPDATE collections SET {column} = {column} || $2, updated_at = NOW() WHERE id = $1"
        );
        let result = sqlx::query(&query)
            .bind(id.to_uuid())
            .bind(appended)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::NotFound(format!("collection {id}")));
        }
        Ok(())
    }

    async fn remove_artifact(
        &self,
        id: CollectionId,
        kind: ArtifactKind,
        image_id: ImageId,
        width: u32,
        height: u32,
    ) -> Result<Option<ArtifactEntry>> {
        let column = artifact_list_column(kind);
        // The CTE reads the pre-update row, so the removed element comes
        // back from the same statement that filters it out.
        let query = format!(
            r#"
            WITH removed AS (
                SELECT entry
                FROM collections, jsonb_array_elements(collections.{column}) AS entry
                WHERE collections.id = $1
                  AND entry ->> 'imageId' = $2
                  AND (entry ->> 'width')::bigint = $3
                  AND (entry ->> 'height')::bigint = $4
                LIMIT 1
            )
            UPDATE collections
            SET {column} = (
                    SELECT COALESCE(jsonb_agg(entry), '[]'::jsonb)
                    FROM jsonb_array_elements(collections.{column}) AS entry
                    WHERE NOT (entry ->> 'imageId' = $2
                           AND (entry ->> 'width')::bigint = $3
                           AND (entry ->> 'height')::bigint = $4)
                ),
                updated_at = NOW()
            WHERE id = $1
            RETURNING (SELECT removed.entry FROM removed)
            "#
        );
        let row = sqlx::query(&query)
            .bind(id.to_uuid())
            .bind(image_id.to_string())
            .bind(i64::from(width))
            .bind(i64::from(height))
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("collection {id}")))?;
        row.try_get::<Option<serde_json::Value>, _>(0)?
            .map(|value| serde_json::from_value(value).map_err(PipelineError::from))
            .transpose()
    }

    async fn clear_image_arrays(&self, id: CollectionId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE collections
            SET images = '[]'::jsonb,
                thumbnails = '[]'::jsonb,
                cache_images = '[]'::jsonb,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.to_uuid())
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::NotFound(format!("collection {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheFolderStore for PostgresStore {
    async fn insert(&self, folder: &CacheFolder) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_folders
                (id, name, path, is_active, current_size_bytes, total_files,
                 cached_collections, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(folder.id.to_uuid())
        .bind(&folder.name)
        .bind(&folder.path)
        .bind(folder.is_active)
        .bind(folder.current_size_bytes as i64)
        .bind(folder.total_files as i64)
        .bind(serde_json::to_value(&folder.cached_collections)?)
        .bind(folder.created_at)
        .bind(folder.updated_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get(&self, id: CacheFolderId) -> Result<Option<CacheFolder>> {
        let row = sqlx::query("SELECT * FROM cache_folders WHERE id = $1")
            .bind(id.to_uuid())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(cache_folder_from_row).transpose()
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<CacheFolder>> {
        let row = sqlx::query("SELECT * FROM cache_folders WHERE name = $1")
            .bind(name)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(cache_folder_from_row).transpose()
    }

    async fn list_active(&self) -> Result<Vec<CacheFolder>> {
        let rows = sqlx::query("SELECT * FROM cache_folders WHERE is_active = TRUE")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(cache_folder_from_row).collect()
    }

    async fn record_usage(&self, id: CacheFolderId, bytes: i64, files: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE cache_folders
            SET current_size_bytes = GREATEST(0, current_size_bytes + $2),
                total_files = GREATEST(0, total_files + $3),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.to_uuid())
        .bind(bytes)
        .bind(files)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::NotFound(format!("cache folder {id}")));
        }
        Ok(())
    }

    async fn add_cached_collection(
        &self,
        id: CacheFolderId,
        collection_id: CollectionId,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE cache_folders
            SET cached_collections = CASE
                    WHEN cached_collections @> to_jsonb($2::text)
                    THEN cached_collections
                    ELSE cached_collections || to_jsonb($2::text)
                END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.to_uuid())
        .bind(collection_id.to_string())
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::NotFound(format!("cache folder {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn create_job(&self, job: &BackgroundJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO background_jobs
                (id, job_type, status, collection_id, library_id,
                 success_count, error_count, error_summary, message,
                 created_at, updated_at, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(job.id.to_uuid())
        .bind(job_type_str(job.job_type))
        .bind(status_str(job.status))
        .bind(job.collection_id.map(|id| id.to_uuid()))
        .bind(job.library_id.map(|id| id.to_uuid()))
        .bind(job.success_count as i64)
        .bind(job.error_count as i64)
        .bind(serde_json::to_value(&job.error_summary)?)
        .bind(&job.message)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<BackgroundJob>> {
        let Some(row) = sqlx::query("SELECT * FROM background_jobs WHERE id = $1")
            .bind(id.to_uuid())
            .fetch_optional(self.pool())
            .await?
        else {
            return Ok(None);
        };

        let mut stages = JobStages::default();
        let stage_rows = sqlx::query("SELECT * FROM job_stages WHERE job_id = $1")
            .bind(id.to_uuid())
            .fetch_all(self.pool())
            .await?;
        for stage_row in &stage_rows {
            apply_stage_row(&mut stages, stage_row)?;
        }
        Ok(Some(job_from_row(&row, stages)?))
    }

    async fn list_unfinished_jobs(
        &self,
        job_types: &[JobType],
        limit: u32,
    ) -> Result<Vec<BackgroundJob>> {
        let type_names: Vec<String> = job_types
            .iter()
            .map(|job_type| job_type_str(*job_type).to_string())
            .collect();
        let rows = sqlx::query(
            r#"
            SELECT * FROM background_jobs
            WHERE job_type = ANY($1) AND status IN ('pending', 'running')
            ORDER BY created_at
            LIMIT $2
            "#,
        )
        .bind(&type_names)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;

        let job_ids: Vec<uuid::Uuid> = rows
            .iter()
            .map(|row| row.try_get::<uuid::Uuid, _>("id"))
            .collect::<std::result::Result<_, _>>()?;
        let stage_rows = sqlx::query("SELECT * FROM job_stages WHERE job_id = ANY($1)")
            .bind(&job_ids)
            .fetch_all(self.pool())
            .await?;

        let mut stages_by_job: HashMap<uuid::Uuid, JobStages> = HashMap::new();
        for stage_row in &stage_rows {
            let job_id: uuid::Uuid = stage_row.try_get("job_id")?;
            apply_stage_row(stages_by_job.entry(job_id).or_default(), stage_row)?;
        }

        rows.iter()
            .map(|row| {
                let job_id: uuid::Uuid = row.try_get("id")?;
                let stages = stages_by_job.remove(&job_id).unwrap_or_default();
                job_from_row(row, stages)
            })
            .collect()
    }

    async fn set_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        message: Option<String>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE background_jobs
            SET status = $2,
                message = COALESCE($3, message),
                started_at = CASE
                    WHEN $2 = 'running' AND started_at IS NULL THEN NOW()
                    ELSE started_at
                END,
                completed_at = CASE
                    WHEN $2 IN ('completed', 'failed', 'completedWithErrors') THEN NOW()
                    ELSE completed_at
                END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.to_uuid())
        .bind(status_str(status))
        .bind(message)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    async fn record_job_outcome(
        &self,
        id: JobId,
        success_count: u64,
        error_count: u64,
        error_summary: &HashMap<ProcessingErrorKind, u64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE background_jobs
            SET success_count = success_count + $2,
                error_count = error_count + $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.to_uuid())
        .bind(success_count as i64)
        .bind(error_count as i64)
        .execute(self.pool())
        .await?;

        for (kind, count) in error_summary {
            sqlx::query(
                r#"
                UPDATE background_jobs
                SET error_summary = jsonb_set(
                        COALESCE(error_summary, '{}'::jsonb),
                        ARRAY[$2],
                        to_jsonb(COALESCE((error_summary ->> $2)::bigint, 0) + $3)
                    ),
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id.to_uuid())
            .bind(kind.as_str())
            .bind(*count as i64)
            .execute(self.pool())
            .await?;
        }
        Ok(())
    }

    async fn update_stage(&self, id: JobId, stage: StageKind, update: StageUpdate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_stages
                (job_id, stage, status, total_items, completed_items, message,
                 started_at, completed_at)
            VALUES ($1, $2, COALESCE($3, 'pending'), COALESCE($4, 0), COALESCE($5, 0), $6,
                    CASE WHEN $3 = 'running' THEN NOW() END,
                    CASE WHEN $3 IN ('completed', 'failed') THEN NOW() END)
            ON CONFLICT (job_id, stage) DO UPDATE SET
                status = COALESCE($3, job_stages.status),
                total_items = GREATEST(job_stages.total_items, COALESCE($4, 0)),
                completed_items = LEAST(
                    COALESCE($5, job_stages.completed_items),
                    GREATEST(job_stages.total_items, COALESCE($4, 0))
                ),
                message = COALESCE($6, job_stages.message),
                started_at = CASE
                    WHEN $3 = 'running' AND job_stages.started_at IS NULL THEN NOW()
                    ELSE job_stages.started_at
                END,
                completed_at = CASE
                    WHEN $3 IN ('completed', 'failed') THEN NOW()
                    ELSE job_stages.completed_at
                END
            "#,
        )
        .bind(id.to_uuid())
        .bind(stage.as_str())
        .bind(update.status.map(stage_status_str))
        .bind(update.total_items.map(|value| value as i64))
        .bind(update.completed_items.map(|value| value as i64))
        .bind(update.message)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn increment_stage_completed(
        &self,
        id: JobId,
        stage: StageKind,
        delta: u64,
    ) -> Result<u64> {
        let row = sqlx::query(
            r#"
            UPDATE job_stages
            SET completed_items = LEAST(total_items, completed_items + $3)
            WHERE job_id = $1 AND stage = $2
            RETURNING completed_items
            "#,
        )
        .bind(id.to_uuid())
        .bind(stage.as_str())
        .bind(delta as i64)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("stage {stage} of job {id}")))?;
        Ok(row.try_get::<i64, _>("completed_items")?.max(0) as u64)
    }

    async fn create_job_state(&self, state: &FileProcessingJobState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_states
                (id, job_id, collection_id, kind, status, total_images,
                 completed_images, failed_images, skipped_images, dummy_entry_count,
                 error_summary, settings, created_at, updated_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(state.id.to_uuid())
        .bind(state.job_id.to_uuid())
        .bind(state.collection_id.to_uuid())
        .bind(state.kind.as_str())
        .bind(status_str(state.status))
        .bind(state.total_images as i64)
        .bind(state.completed_images as i64)
        .bind(state.failed_images as i64)
        .bind(state.skipped_images as i64)
        .bind(state.dummy_entry_count as i64)
        .bind(serde_json::to_value(&state.error_summary)?)
        .bind(serde_json::to_value(state.settings)?)
        .bind(state.created_at)
        .bind(state.updated_at)
        .bind(state.completed_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get_job_state(&self, id: JobStateId) -> Result<Option<FileProcessingJobState>> {
        let row = sqlx::query("SELECT * FROM job_states WHERE id = $1")
            .bind(id.to_uuid())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(job_state_from_row).transpose()
    }

    async fn find_job_state(
        &self,
        job_id: JobId,
        collection_id: CollectionId,
        kind: ArtifactKind,
    ) -> Result<Option<FileProcessingJobState>> {
        let row = sqlx::query(
            "SELECT * FROM job_states WHERE job_id = $1 AND collection_id = $2 AND kind = $3",
        )
        .bind(job_id.to_uuid())
        .bind(collection_id.to_uuid())
        .bind(kind.as_str())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(job_state_from_row).transpose()
    }

    async fn set_job_state_status(&self, id: JobStateId, status: JobStatus) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_states
            SET status = $2,
                completed_at = CASE
                    WHEN $2 IN ('completed', 'failed', 'completedWithErrors') THEN NOW()
                    ELSE completed_at
                END,
                updated_at = NOW()
            WHERE id = $1
              AND status <> $2
              AND status NOT IN ('completed', 'failed', 'completedWithErrors')
            "#,
        )
        .bind(id.to_uuid())
        .bind(status_str(status))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn increment_job_state(
        &self,
        id: JobStateId,
        delta: JobStateDelta,
    ) -> Result<JobStateCounters> {
        let (completed, skipped, failed, dummy, error_kind) = match delta {
            JobStateDelta::Completed { .. } => (1i64, 0i64, 0i64, 0i64, None),
            JobStateDelta::Skipped => (0, 1, 0, 0, None),
            JobStateDelta::Failed { kind, dummy } => {
                (0, 0, 1, i64::from(dummy), kind.map(|kind| kind.as_str()))
            }
        };
        // The counter guard keeps finished states inert: duplicate
        // deliveries cannot push the sum past the total.
        let row = sqlx::query(
            r#"
            UPDATE job_states
            SET completed_images = completed_images + $2,
                skipped_images = skipped_images + $3,
                failed_images = failed_images + $4,
                dummy_entry_count = dummy_entry_count + $5,
                error_summary = CASE
                    WHEN $6::text IS NULL THEN error_summary
                    ELSE jsonb_set(
                        COALESCE(error_summary, '{}'::jsonb),
                        ARRAY[$6::text],
                        to_jsonb(COALESCE((error_summary ->> $6::text)::bigint, 0) + 1)
                    )
                END,
                updated_at = NOW()
            WHERE id = $1
              AND completed_images + failed_images + skipped_images < total_images
            RETURNING total_images, completed_images, failed_images, skipped_images,
                      dummy_entry_count
            "#,
        )
        .bind(id.to_uuid())
        .bind(completed)
        .bind(skipped)
        .bind(failed)
        .bind(dummy)
        .bind(error_kind)
        .fetch_optional(self.pool())
        .await?;

        let row = match row {
            Some(row) => row,
            None => sqlx::query(
                r#"
                SELECT total_images, completed_images, failed_images, skipped_images,
                       dummy_entry_count
                FROM job_states
                WHERE id = $1
                "#,
            )
            .bind(id.to_uuid())
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("job state {id}")))?,
        };

        Ok(JobStateCounters {
            total: row.try_get::<i64, _>("total_images")?.max(0) as u64,
            completed: row.try_get::<i64, _>("completed_images")?.max(0) as u64,
            failed: row.try_get::<i64, _>("failed_images")?.max(0) as u64,
            skipped: row.try_get::<i64, _>("skipped_images")?.max(0) as u64,
            dummy_entries: row.try_get::<i64, _>("dummy_entry_count")?.max(0) as u64,
        })
    }
}
