use carelink_core::chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use carelink_core::domain::job::{IdempotencyKey, Job, JobId, JobStatus, JobType};

use super::decode::{
    encode_json, parse_json, parse_millis, parse_optional_timestamp, parse_timestamp, parse_u32,
    parse_u64,
};
use super::{JobCounts, JobRepository, RepositoryError};
use crate::DbPool;

const JOB_COLUMNS: &str = "id,
    idempotency_key,
    job_type,
    payload_json,
    payload_hash,
    status,
    attempts,
    max_attempts,
    next_attempt_at_ms,
    claimed_at_ms,
    last_error,
    result_json,
    created_at,
    completed_at";

pub struct SqlJobRepository {
    pool: DbPool,
}

impl SqlJobRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl JobRepository for SqlJobRepository {
    async fn insert_if_absent(&self, job: Job) -> Result<Job, RepositoryError> {
        let payload_json = encode_json("payload_json", &job.payload)?;
        let result_json =
            job.result.as_ref().map(|value| encode_json("result_json", value)).transpose()?;

        sqlx::query(
            "INSERT INTO job (
                id,
                idempotency_key,
                job_type,
                payload_json,
                payload_hash,
                status,
                attempts,
                max_attempts,
                next_attempt_at_ms,
                claimed_at_ms,
                last_error,
                result_json,
                created_at,
                completed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(idempotency_key) DO NOTHING",
        )
        .bind(&job.id.0)
        .bind(&job.idempotency_key.0)
        .bind(job.job_type.as_str())
        .bind(payload_json)
        .bind(&job.payload_hash)
        .bind(job.status.as_str())
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_attempts))
        .bind(job.next_attempt_at.timestamp_millis())
        .bind(job.claimed_at.map(|value| value.timestamp_millis()))
        .bind(job.last_error.as_deref())
        .bind(result_json)
        .bind(job.created_at.to_rfc3339())
        .bind(job.completed_at.map(|value| value.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        self.find_by_key(&job.idempotency_key).await?.ok_or_else(|| {
            RepositoryError::Decode(format!(
                "job for key `{}` missing after insert",
                job.idempotency_key
            ))
        })
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM job WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(job_from_row).transpose()
    }

    async fn find_by_key(&self, key: &IdempotencyKey) -> Result<Option<Job>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM job WHERE idempotency_key = ?"))
            .bind(&key.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(job_from_row).transpose()
    }

    async fn claim_next(
        &self,
        job_type: Option<JobType>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, RepositoryError> {
        let now_ms = now.timestamp_millis();
        let type_filter = job_type.map(|value| value.as_str());

        // One statement: SQLite takes the write lock before evaluating the
        // subquery, so concurrent claimers serialize on it.
        let row = sqlx::query(&format!(
            "UPDATE job
             SET status = 'processing',
                 attempts = attempts + 1,
                 claimed_at_ms = ?
             WHERE seq = (
                 SELECT seq FROM job
                 WHERE status = 'pending'
                   AND next_attempt_at_ms <= ?
                   AND (? IS NULL OR job_type = ?)
                 ORDER BY next_attempt_at_ms ASC, seq ASC
                 LIMIT 1
             )
             AND status = 'pending'
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(now_ms)
        .bind(now_ms)
        .bind(type_filter)
        .bind(type_filter)
        .fetch_optional(&self.pool)
        .await?;

        row.map(job_from_row).transpose()
    }

    async fn update_if_current(
        &self,
        job: &Job,
        expected_status: JobStatus,
        expected_attempts: u32,
    ) -> Result<bool, RepositoryError> {
        let result_json =
            job.result.as_ref().map(|value| encode_json("result_json", value)).transpose()?;

        let outcome = sqlx::query(
            "UPDATE job
             SET status = ?,
                 attempts = ?,
                 max_attempts = ?,
                 next_attempt_at_ms = ?,
                 claimed_at_ms = ?,
                 last_error = ?,
                 result_json = ?,
                 completed_at = ?
             WHERE id = ? AND status = ? AND attempts = ?",
        )
        .bind(job.status.as_str())
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_attempts))
        .bind(job.next_attempt_at.timestamp_millis())
        .bind(job.claimed_at.map(|value| value.timestamp_millis()))
        .bind(job.last_error.as_deref())
        .bind(result_json)
        .bind(job.completed_at.map(|value| value.to_rfc3339()))
        .bind(&job.id.0)
        .bind(expected_status.as_str())
        .bind(i64::from(expected_attempts))
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() == 1)
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: u32,
    ) -> Result<Vec<Job>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM job WHERE status = ? ORDER BY seq ASC LIMIT ?"
        ))
        .bind(status.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(job_from_row).collect()
    }

    async fn list_claimed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM job
             WHERE status = 'processing' AND claimed_at_ms < ?
             ORDER BY seq ASC"
        ))
        .bind(cutoff.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(job_from_row).collect()
    }

    async fn counts(&self) -> Result<JobCounts, RepositoryError> {
        let rows = sqlx::query(
            "SELECT status, job_type, COUNT(*) AS count
             FROM job
             GROUP BY status, job_type
             ORDER BY status, job_type",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_status_and_type = Vec::with_capacity(rows.len());
        for row in rows {
            let status_raw = row.try_get::<String, _>("status")?;
            let status = JobStatus::parse(&status_raw).ok_or_else(|| {
                RepositoryError::Decode(format!("unknown job status `{status_raw}`"))
            })?;
            let type_raw = row.try_get::<String, _>("job_type")?;
            let job_type = JobType::parse(&type_raw)
                .ok_or_else(|| RepositoryError::Decode(format!("unknown job type `{type_raw}`")))?;
            let count = parse_u64("count", row.try_get("count")?)?;
            by_status_and_type.push((status, job_type, count));
        }

        let oldest = sqlx::query(
            "SELECT created_at FROM job WHERE status = 'pending' ORDER BY seq ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row.try_get::<String, _>("created_at"))
        .transpose()?
        .map(|value| parse_timestamp("created_at", value))
        .transpose()?;

        Ok(JobCounts { by_status_and_type, oldest_pending_created_at: oldest })
    }
}

fn job_from_row(row: SqliteRow) -> Result<Job, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown job status `{status_raw}`")))?;
    let type_raw = row.try_get::<String, _>("job_type")?;
    let job_type = JobType::parse(&type_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown job type `{type_raw}`")))?;
    let payload_raw = row.try_get::<String, _>("payload_json")?;
    let result = row
        .try_get::<Option<String>, _>("result_json")?
        .map(|value| parse_json("result_json", &value))
        .transpose()?;

    Ok(Job {
        id: JobId(row.try_get("id")?),
        idempotency_key: IdempotencyKey(row.try_get("idempotency_key")?),
        job_type,
        payload: parse_json("payload_json", &payload_raw)?,
        payload_hash: row.try_get("payload_hash")?,
        status,
        attempts: parse_u32("attempts", row.try_get("attempts")?)?,
        max_attempts: parse_u32("max_attempts", row.try_get("max_attempts")?)?,
        next_attempt_at: parse_millis("next_attempt_at_ms", row.try_get("next_attempt_at_ms")?)?,
        claimed_at: row
            .try_get::<Option<i64>, _>("claimed_at_ms")?
            .map(|value| parse_millis("claimed_at_ms", value))
            .transpose()?,
        last_error: row.try_get("last_error")?,
        result,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
    })
}
