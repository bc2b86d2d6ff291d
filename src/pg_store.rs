//! Postgres-backed store.

use crate::errors::StoreError;
use crate::schema::{
    Checkpoint, Embedding, Evaluation, EvaluationStatus, Job, JobStatus, Phase, Transcript,
};
use crate::store::{
    EvaluationStore, JobStore, NewAudit, NewEvaluation, NewIteration, NewJob,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use tracing::instrument;
use uuid::Uuid;

/// Apply the bundled migrations.
pub async fn setup_database(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// [`JobStore`] and [`EvaluationStore`] over a Postgres connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Stored checkpoint shape; JSON columns are decoded into their typed value
/// objects at this boundary only.
#[derive(Debug, FromRow)]
struct CheckpointRow {
    evaluation_id: Uuid,
    current_phase: Phase,
    transcript: Value,
    embedding_inicial: Option<Value>,
    embedding_confronto: Option<Value>,
    divergence: Option<f64>,
    diagnosis: Option<String>,
    retry_count: i32,
    last_retry_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
}

impl TryFrom<CheckpointRow> for Checkpoint {
    type Error = StoreError;

    fn try_from(row: CheckpointRow) -> Result<Self, StoreError> {
        let transcript: Transcript = serde_json::from_value(row.transcript)
            .map_err(|err| StoreError::Corrupt(format!("checkpoint transcript: {err}")))?;
        let decode_embedding = |value: Option<Value>, name: &str| -> Result<Option<Embedding>, StoreError> {
            value
                .map(|value| {
                    serde_json::from_value(value)
                        .map_err(|err| StoreError::Corrupt(format!("checkpoint {name}: {err}")))
                })
                .transpose()
        };

        Ok(Checkpoint {
            evaluation_id: row.evaluation_id,
            current_phase: row.current_phase,
            transcript,
            embedding_inicial: decode_embedding(row.embedding_inicial, "embedding_inicial")?,
            embedding_confronto: decode_embedding(row.embedding_confronto, "embedding_confronto")?,
            divergence: row.divergence,
            diagnosis: row.diagnosis,
            retry_count: row.retry_count,
            last_retry_at: row.last_retry_at,
            next_retry_at: row.next_retry_at,
        })
    }
}

fn encode_json<T: serde::Serialize>(value: &T, name: &str) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|err| StoreError::Corrupt(format!("{name}: {err}")))
}

#[async_trait]
impl JobStore for PgStore {
    #[instrument(name = "store.enqueue_job", skip(self, job), fields(job_type = %job.job_type))]
    async fn enqueue_job(&self, job: NewJob) -> Result<Option<i64>, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO jobs (tenant_id, job_type, payload, scheduled_for, idempotency_key)
            VALUES ($1, $2, $3, COALESCE($4, NOW()), $5)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING id
            ",
        )
        .bind(&job.tenant_id)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.scheduled_for)
        .bind(&job.idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id)
    }

    async fn claim_next_job(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let job = sqlx::query_as::<_, Job>(
            r"
            UPDATE jobs
            SET status = $2, updated_at = NOW()
            WHERE id = (
                SELECT id FROM jobs
                WHERE scheduled_for <= $1
                  AND (status = $3 OR (status = $4 AND attempt_count < max_attempts))
                ORDER BY id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, tenant_id, job_type, payload, status, attempt_count, max_attempts,
                      last_error, scheduled_for, created_at, updated_at, idempotency_key
            ",
        )
        .bind(now)
        .bind(JobStatus::Processing)
        .bind(JobStatus::Pending)
        .bind(JobStatus::Failed)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn defer_job(&self, job_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE jobs SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(job_id)
            .bind(JobStatus::Pending)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn is_job_applied(&self, job_id: i64) -> Result<bool, StoreError> {
        let applied = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM processed_jobs WHERE job_id = $1)",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(applied)
    }

    async fn complete_job_applied(&self, job_id: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO processed_jobs (job_id) VALUES ($1) ON CONFLICT (job_id) DO NOTHING")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE jobs SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(job_id)
            .bind(JobStatus::Completed)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn force_complete_job(&self, job_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE jobs SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(job_id)
            .bind(JobStatus::Completed)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail_job(&self, job_id: i64, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE jobs
            SET status = $2, attempt_count = attempt_count + 1, last_error = $3, updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(job_id)
        .bind(JobStatus::Failed)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dead_letter_job(&self, job_id: i64, error: &str) -> Result<(), StoreError> {
        // Pinning max_attempts to the new attempt count makes the row
        // permanently ineligible while keeping it for inspection.
        sqlx::query(
            r"
            UPDATE jobs
            SET status = $2,
                attempt_count = attempt_count + 1,
                max_attempts = attempt_count + 1,
                last_error = $3,
                updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(job_id)
        .bind(JobStatus::Failed)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reclaim_stale_jobs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE jobs
            SET status = $2, updated_at = NOW()
            WHERE status = $3 AND updated_at < $1
            ",
        )
        .bind(cutoff)
        .bind(JobStatus::Pending)
        .bind(JobStatus::Processing)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl EvaluationStore for PgStore {
    async fn create_evaluation(&self, evaluation: NewEvaluation) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO evaluations (id, tenant_id, user_id, base_prompt, status)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(evaluation.id)
        .bind(&evaluation.tenant_id)
        .bind(evaluation.user_id)
        .bind(&evaluation.base_prompt)
        .bind(EvaluationStatus::Pending)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_evaluation(&self, id: Uuid) -> Result<Evaluation, StoreError> {
        sqlx::query_as::<_, Evaluation>(
            r"
            SELECT id, tenant_id, user_id, base_prompt, status, retry_count, error_message,
                   created_at, updated_at
            FROM evaluations
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("evaluation"))
    }

    async fn set_evaluation_status(
        &self,
        id: Uuid,
        status: EvaluationStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE evaluations SET status = $2, error_message = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_checkpoint(&self, evaluation_id: Uuid) -> Result<Option<Checkpoint>, StoreError> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            r"
            SELECT evaluation_id, current_phase, transcript, embedding_inicial,
                   embedding_confronto, divergence, diagnosis, retry_count,
                   last_retry_at, next_retry_at
            FROM evaluation_checkpoints
            WHERE evaluation_id = $1
            ",
        )
        .bind(evaluation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Checkpoint::try_from).transpose()
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let transcript = encode_json(&checkpoint.transcript, "checkpoint transcript")?;
        let embedding_inicial = checkpoint
            .embedding_inicial
            .as_ref()
            .map(|embedding| encode_json(embedding, "checkpoint embedding_inicial"))
            .transpose()?;
        let embedding_confronto = checkpoint
            .embedding_confronto
            .as_ref()
            .map(|embedding| encode_json(embedding, "checkpoint embedding_confronto"))
            .transpose()?;

        sqlx::query(
            r"
            INSERT INTO evaluation_checkpoints
                (evaluation_id, current_phase, transcript, embedding_inicial,
                 embedding_confronto, divergence, diagnosis, retry_count,
                 last_retry_at, next_retry_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (evaluation_id) DO UPDATE SET
                current_phase = EXCLUDED.current_phase,
                transcript = EXCLUDED.transcript,
                embedding_inicial = EXCLUDED.embedding_inicial,
                embedding_confronto = EXCLUDED.embedding_confronto,
                divergence = EXCLUDED.divergence,
                diagnosis = EXCLUDED.diagnosis,
                retry_count = EXCLUDED.retry_count,
                last_retry_at = EXCLUDED.last_retry_at,
                next_retry_at = EXCLUDED.next_retry_at
            ",
        )
        .bind(checkpoint.evaluation_id)
        .bind(checkpoint.current_phase)
        .bind(transcript)
        .bind(embedding_inicial)
        .bind(embedding_confronto)
        .bind(checkpoint.divergence)
        .bind(&checkpoint.diagnosis)
        .bind(checkpoint.retry_count)
        .bind(checkpoint.last_retry_at)
        .bind(checkpoint.next_retry_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn schedule_checkpoint_retry(
        &self,
        evaluation_id: Uuid,
        next_retry_at: DateTime<Utc>,
    ) -> Result<i32, StoreError> {
        let mut tx = self.pool.begin().await?;

        let retry_count = sqlx::query_scalar::<_, i32>(
            r"
            UPDATE evaluation_checkpoints
            SET retry_count = retry_count + 1, last_retry_at = NOW(), next_retry_at = $2
            WHERE evaluation_id = $1
            RETURNING retry_count
            ",
        )
        .bind(evaluation_id)
        .bind(next_retry_at)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound("evaluation checkpoint"))?;

        sqlx::query("UPDATE evaluations SET retry_count = $2, updated_at = NOW() WHERE id = $1")
            .bind(evaluation_id)
            .bind(retry_count)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(retry_count)
    }

    async fn clear_checkpoint_retry(&self, evaluation_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            UPDATE evaluation_checkpoints
            SET retry_count = 0, last_retry_at = NULL, next_retry_at = NULL
            WHERE evaluation_id = $1
            ",
        )
        .bind(evaluation_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE evaluations SET retry_count = 0, updated_at = NOW() WHERE id = $1")
            .bind(evaluation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn append_iteration(&self, iteration: NewIteration) -> Result<(), StoreError> {
        let embedding = iteration
            .embedding
            .as_ref()
            .map(|embedding| encode_json(embedding, "iteration embedding"))
            .transpose()?;

        sqlx::query(
            r"
            INSERT INTO evaluation_iterations (id, evaluation_id, phase, response, embedding)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(Uuid::new_v4())
        .bind(iteration.evaluation_id)
        .bind(iteration.phase)
        .bind(&iteration.response)
        .bind(embedding)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_audit(&self, audit: NewAudit) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO evaluation_audits (id, evaluation_id, divergence, diagnosis)
            VALUES ($1, $2, $3, $4)
            ",
        )
        .bind(Uuid::new_v4())
        .bind(audit.evaluation_id)
        .bind(audit.divergence)
        .bind(&audit.diagnosis)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn evaluations_due_for_retry(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Evaluation>, StoreError> {
        let evaluations = sqlx::query_as::<_, Evaluation>(
            r"
            SELECT e.id, e.tenant_id, e.user_id, e.base_prompt, e.status, e.retry_count,
                   e.error_message, e.created_at, e.updated_at
            FROM evaluations e
            JOIN evaluation_checkpoints c ON c.evaluation_id = e.id
            WHERE (e.status = $2 OR e.status = $3)
              AND c.next_retry_at IS NOT NULL
              AND c.next_retry_at <= $1
            ORDER BY c.next_retry_at
            ",
        )
        .bind(now)
        .bind(EvaluationStatus::Processing)
        .bind(EvaluationStatus::Retrying)
        .fetch_all(&self.pool)
        .await?;

        Ok(evaluations)
    }
}
