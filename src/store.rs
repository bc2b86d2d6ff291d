//! Persistence seams for the job queue and the evaluation protocol.
//!
//! Both traits are implemented by [`crate::PgStore`] for production and by
//! [`crate::MemoryStore`] for embedding and tests.

use crate::errors::StoreError;
use crate::schema::{
    Checkpoint, Embedding, Evaluation, EvaluationStatus, Job, Phase,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// A job about to be enqueued.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Owning tenant, if any.
    pub tenant_id: Option<String>,
    /// Category tag.
    pub job_type: String,
    /// Opaque payload.
    pub payload: Value,
    /// Earliest eligibility; `None` means immediately.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Optional unique key; a duplicate key makes the enqueue a no-op.
    pub idempotency_key: Option<String>,
}

impl NewJob {
    /// A job of the given category, eligible immediately.
    pub fn new(job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            tenant_id: None,
            job_type: job_type.into(),
            payload,
            scheduled_for: None,
            idempotency_key: None,
        }
    }
}

/// An evaluation about to be created.
#[derive(Debug, Clone)]
pub struct NewEvaluation {
    /// Caller-assigned identifier.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// Owning user.
    pub user_id: i64,
    /// The prompt to interrogate the model about.
    pub base_prompt: String,
}

/// One model response to append to an evaluation's audit trail.
#[derive(Debug, Clone)]
pub struct NewIteration {
    /// The owning evaluation.
    pub evaluation_id: Uuid,
    /// Phase that produced the response.
    pub phase: Phase,
    /// The response text.
    pub response: String,
    /// Embedding of the response, if the phase computed one.
    pub embedding: Option<Embedding>,
}

/// The terminal audit record of an evaluation.
#[derive(Debug, Clone)]
pub struct NewAudit {
    /// The owning evaluation.
    pub evaluation_id: Uuid,
    /// Final divergence score.
    pub divergence: f64,
    /// Final diagnosis label.
    pub diagnosis: String,
}

/// Durable table of pending/failed/completed work items plus the idempotency
/// ledger.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Enqueue a job. Returns `None` when an identical idempotency key
    /// already exists.
    async fn enqueue_job(&self, job: NewJob) -> Result<Option<i64>, StoreError>;

    /// Atomically claim the next eligible job, flipping it to `processing`
    /// inside the claiming transaction. No two concurrent calls ever return
    /// the same row. Eligible means: pending, or failed with attempts left,
    /// and `scheduled_for <= now`.
    async fn claim_next_job(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError>;

    /// Put a claimed job back without recording an attempt, e.g. when its
    /// category gate is saturated.
    async fn defer_job(&self, job_id: i64) -> Result<(), StoreError>;

    /// Whether the idempotency ledger already proves this job's effect was
    /// fully applied.
    async fn is_job_applied(&self, job_id: i64) -> Result<bool, StoreError>;

    /// Insert the idempotency record and mark the job completed in ONE
    /// transaction. If either write fails the job stays eligible for
    /// re-pick; this pairing is what makes handler effects at-most-once.
    async fn complete_job_applied(&self, job_id: i64) -> Result<(), StoreError>;

    /// Mark the job completed without touching the ledger: re-delivery of an
    /// already-applied job, or a rate-limit pause whose retry is owned by
    /// the evaluation checkpoint.
    async fn force_complete_job(&self, job_id: i64) -> Result<(), StoreError>;

    /// Record a failed attempt; the job stays eligible until its attempt
    /// ceiling is reached.
    async fn fail_job(&self, job_id: i64, error: &str) -> Result<(), StoreError>;

    /// Mark the job permanently failed with its dead-letter annotation. The
    /// row is kept for the audit trail but never re-picked.
    async fn dead_letter_job(&self, job_id: i64, error: &str) -> Result<(), StoreError>;

    /// Reset `processing` rows untouched since `cutoff` back to `pending`.
    /// A claim that old means the claiming process died (or its outcome
    /// write failed) before recording a result; re-delivery is safe because
    /// applied effects are guarded by the idempotency ledger. Returns the
    /// number of rows reset.
    async fn reclaim_stale_jobs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Durable state of evaluations, their checkpoints, and their audit trail.
#[async_trait]
pub trait EvaluationStore: Send + Sync + 'static {
    /// Create an evaluation in `pending` status.
    async fn create_evaluation(&self, evaluation: NewEvaluation) -> Result<(), StoreError>;

    /// Fetch one evaluation.
    async fn get_evaluation(&self, id: Uuid) -> Result<Evaluation, StoreError>;

    /// Update status and error text.
    async fn set_evaluation_status(
        &self,
        id: Uuid,
        status: EvaluationStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Load the checkpoint, if one exists yet.
    async fn load_checkpoint(&self, evaluation_id: Uuid) -> Result<Option<Checkpoint>, StoreError>;

    /// Create-or-replace the checkpoint. Phase, transcript, embeddings, and
    /// the divergence result are written together so readers never observe a
    /// torn phase transition.
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    /// Record a rate-limit pause: bump the retry counter (checkpoint and
    /// evaluation mirror), stamp `last_retry_at`, and set `next_retry_at`.
    /// Returns the new counter value.
    async fn schedule_checkpoint_retry(
        &self,
        evaluation_id: Uuid,
        next_retry_at: DateTime<Utc>,
    ) -> Result<i32, StoreError>;

    /// Reset all retry bookkeeping after a successful model call or on
    /// protocol completion.
    async fn clear_checkpoint_retry(&self, evaluation_id: Uuid) -> Result<(), StoreError>;

    /// Append one model response to the audit trail. Iterations are never
    /// mutated afterwards.
    async fn append_iteration(&self, iteration: NewIteration) -> Result<(), StoreError>;

    /// Write the terminal audit record.
    async fn insert_audit(&self, audit: NewAudit) -> Result<(), StoreError>;

    /// Evaluations whose checkpoint has a past-due `next_retry_at`, ready to
    /// be re-enqueued by the dispatcher's slow scan.
    async fn evaluations_due_for_retry(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Evaluation>, StoreError>;
}

/// Convenience supertrait for components that need both stores.
pub trait Store: JobStore + EvaluationStore {}

impl<T: JobStore + EvaluationStore> Store for T {}
