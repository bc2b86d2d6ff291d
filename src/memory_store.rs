//! In-memory store for embedding without a database and for tests.

use crate::errors::StoreError;
use crate::schema::{
    Audit, Checkpoint, Evaluation, EvaluationStatus, Iteration, Job, JobStatus,
};
use crate::store::{
    EvaluationStore, JobStore, NewAudit, NewEvaluation, NewIteration, NewJob,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

/// [`JobStore`] and [`EvaluationStore`] over process-local maps.
///
/// Mirrors the Postgres semantics closely enough for tests: claiming flips
/// the lowest-id eligible job to `processing`, idempotency keys deduplicate
/// at enqueue time, and dead-lettered jobs are permanently ineligible.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    next_job_id: i64,
    jobs: HashMap<i64, Job>,
    processed: HashSet<i64>,
    evaluations: HashMap<Uuid, Evaluation>,
    checkpoints: HashMap<Uuid, Checkpoint>,
    iterations: Vec<Iteration>,
    audits: Vec<Audit>,
}

fn eligible(job: &Job, now: DateTime<Utc>) -> bool {
    let status_ok = match job.status {
        JobStatus::Pending => true,
        JobStatus::Failed => job.attempt_count < job.max_attempts,
        JobStatus::Processing | JobStatus::Completed => false,
    };
    status_ok && job.scheduled_for <= now
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one job row.
    pub async fn job(&self, job_id: i64) -> Option<Job> {
        self.inner.lock().await.jobs.get(&job_id).cloned()
    }

    /// All job rows, id-ordered.
    pub async fn jobs(&self) -> Vec<Job> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner.jobs.values().cloned().collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    /// Snapshot of one evaluation row.
    pub async fn evaluation(&self, id: Uuid) -> Option<Evaluation> {
        self.inner.lock().await.evaluations.get(&id).cloned()
    }

    /// Snapshot of one checkpoint row.
    pub async fn checkpoint(&self, evaluation_id: Uuid) -> Option<Checkpoint> {
        self.inner.lock().await.checkpoints.get(&evaluation_id).cloned()
    }

    /// Iterations recorded for one evaluation, in insertion order.
    pub async fn iterations(&self, evaluation_id: Uuid) -> Vec<Iteration> {
        self.inner
            .lock()
            .await
            .iterations
            .iter()
            .filter(|iteration| iteration.evaluation_id == evaluation_id)
            .cloned()
            .collect()
    }

    /// Audit records for one evaluation, in insertion order.
    pub async fn audits(&self, evaluation_id: Uuid) -> Vec<Audit> {
        self.inner
            .lock()
            .await
            .audits
            .iter()
            .filter(|audit| audit.evaluation_id == evaluation_id)
            .cloned()
            .collect()
    }

    /// Rewrite a job's creation timestamp, for exercising age-based
    /// dead-lettering.
    pub async fn backdate_job(&self, job_id: i64, created_at: DateTime<Utc>) {
        if let Some(job) = self.inner.lock().await.jobs.get_mut(&job_id) {
            job.created_at = created_at;
        }
    }

    /// Rewrite a job's last-update timestamp, for exercising the stale-claim
    /// sweep.
    pub async fn backdate_job_update(&self, job_id: i64, updated_at: DateTime<Utc>) {
        if let Some(job) = self.inner.lock().await.jobs.get_mut(&job_id) {
            job.updated_at = updated_at;
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue_job(&self, job: NewJob) -> Result<Option<i64>, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(key) = &job.idempotency_key {
            let duplicate = inner
                .jobs
                .values()
                .any(|existing| existing.idempotency_key.as_deref() == Some(key.as_str()));
            if duplicate {
                return Ok(None);
            }
        }

        inner.next_job_id += 1;
        let id = inner.next_job_id;
        let now = Utc::now();
        inner.jobs.insert(
            id,
            Job {
                id,
                tenant_id: job.tenant_id,
                job_type: job.job_type,
                payload: job.payload,
                status: JobStatus::Pending,
                attempt_count: 0,
                max_attempts: 5,
                last_error: None,
                scheduled_for: job.scheduled_for.unwrap_or(now),
                created_at: now,
                updated_at: now,
                idempotency_key: job.idempotency_key,
            },
        );
        Ok(Some(id))
    }

    async fn claim_next_job(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let mut inner = self.inner.lock().await;
        let id = inner
            .jobs
            .values()
            .filter(|job| eligible(job, now))
            .map(|job| job.id)
            .min();
        let Some(id) = id else {
            return Ok(None);
        };
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or(StoreError::NotFound("job"))?;
        job.status = JobStatus::Processing;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn defer_job(&self, job_id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound("job"))?;
        job.status = JobStatus::Pending;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn is_job_applied(&self, job_id: i64) -> Result<bool, StoreError> {
        Ok(self.inner.lock().await.processed.contains(&job_id))
    }

    async fn complete_job_applied(&self, job_id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.processed.insert(job_id);
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound("job"))?;
        job.status = JobStatus::Completed;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn force_complete_job(&self, job_id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound("job"))?;
        job.status = JobStatus::Completed;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn fail_job(&self, job_id: i64, error: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound("job"))?;
        job.status = JobStatus::Failed;
        job.attempt_count += 1;
        job.last_error = Some(error.to_owned());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn dead_letter_job(&self, job_id: i64, error: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound("job"))?;
        job.status = JobStatus::Failed;
        job.attempt_count += 1;
        job.max_attempts = job.attempt_count;
        job.last_error = Some(error.to_owned());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn reclaim_stale_jobs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut reset = 0;
        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Processing && job.updated_at < cutoff {
                job.status = JobStatus::Pending;
                job.updated_at = Utc::now();
                reset += 1;
            }
        }
        Ok(reset)
    }
}

#[async_trait]
impl EvaluationStore for MemoryStore {
    async fn create_evaluation(&self, evaluation: NewEvaluation) -> Result<(), StoreError> {
        let now = Utc::now();
        self.inner.lock().await.evaluations.insert(
            evaluation.id,
            Evaluation {
                id: evaluation.id,
                tenant_id: evaluation.tenant_id,
                user_id: evaluation.user_id,
                base_prompt: evaluation.base_prompt,
                status: EvaluationStatus::Pending,
                retry_count: 0,
                error_message: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn get_evaluation(&self, id: Uuid) -> Result<Evaluation, StoreError> {
        self.inner
            .lock()
            .await
            .evaluations
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound("evaluation"))
    }

    async fn set_evaluation_status(
        &self,
        id: Uuid,
        status: EvaluationStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let evaluation = inner
            .evaluations
            .get_mut(&id)
            .ok_or(StoreError::NotFound("evaluation"))?;
        evaluation.status = status;
        evaluation.error_message = error.map(str::to_owned);
        evaluation.updated_at = Utc::now();
        Ok(())
    }

    async fn load_checkpoint(&self, evaluation_id: Uuid) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.inner.lock().await.checkpoints.get(&evaluation_id).cloned())
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .checkpoints
            .insert(checkpoint.evaluation_id, checkpoint.clone());
        Ok(())
    }

    async fn schedule_checkpoint_retry(
        &self,
        evaluation_id: Uuid,
        next_retry_at: DateTime<Utc>,
    ) -> Result<i32, StoreError> {
        let mut inner = self.inner.lock().await;
        let checkpoint = inner
            .checkpoints
            .get_mut(&evaluation_id)
            .ok_or(StoreError::NotFound("evaluation checkpoint"))?;
        checkpoint.retry_count += 1;
        checkpoint.last_retry_at = Some(Utc::now());
        checkpoint.next_retry_at = Some(next_retry_at);
        let retry_count = checkpoint.retry_count;

        if let Some(evaluation) = inner.evaluations.get_mut(&evaluation_id) {
            evaluation.retry_count = retry_count;
            evaluation.updated_at = Utc::now();
        }
        Ok(retry_count)
    }

    async fn clear_checkpoint_retry(&self, evaluation_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(checkpoint) = inner.checkpoints.get_mut(&evaluation_id) {
            checkpoint.retry_count = 0;
            checkpoint.last_retry_at = None;
            checkpoint.next_retry_at = None;
        }
        if let Some(evaluation) = inner.evaluations.get_mut(&evaluation_id) {
            evaluation.retry_count = 0;
            evaluation.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn append_iteration(&self, iteration: NewIteration) -> Result<(), StoreError> {
        self.inner.lock().await.iterations.push(Iteration {
            id: Uuid::new_v4(),
            evaluation_id: iteration.evaluation_id,
            phase: iteration.phase,
            response: iteration.response,
            embedding: iteration.embedding,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn insert_audit(&self, audit: NewAudit) -> Result<(), StoreError> {
        self.inner.lock().await.audits.push(Audit {
            id: Uuid::new_v4(),
            evaluation_id: audit.evaluation_id,
            divergence: audit.divergence,
            diagnosis: audit.diagnosis,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn evaluations_due_for_retry(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Evaluation>, StoreError> {
        let inner = self.inner.lock().await;
        let mut due: Vec<(DateTime<Utc>, Evaluation)> = inner
            .checkpoints
            .values()
            .filter_map(|checkpoint| {
                let next_retry_at = checkpoint.next_retry_at?;
                if next_retry_at > now {
                    return None;
                }
                let evaluation = inner.evaluations.get(&checkpoint.evaluation_id)?;
                match evaluation.status {
                    EvaluationStatus::Processing | EvaluationStatus::Retrying => {
                        Some((next_retry_at, evaluation.clone()))
                    }
                    _ => None,
                }
            })
            .collect();
        due.sort_by_key(|(next_retry_at, _)| *next_retry_at);
        Ok(due.into_iter().map(|(_, evaluation)| evaluation).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::job_types;
    use claims::{assert_none, assert_some};
    use serde_json::json;

    #[tokio::test]
    async fn claim_prefers_lowest_id_and_flips_status() {
        let store = MemoryStore::new();
        let first = store
            .enqueue_job(NewJob::new(job_types::SEND_EMAIL, json!({})))
            .await
            .unwrap()
            .unwrap();
        store
            .enqueue_job(NewJob::new(job_types::SEND_EMAIL, json!({})))
            .await
            .unwrap();

        let claimed = assert_some!(store.claim_next_job(Utc::now()).await.unwrap());
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, JobStatus::Processing);

        // The claimed row must not be claimable again.
        let second = assert_some!(store.claim_next_job(Utc::now()).await.unwrap());
        assert_ne!(second.id, first);
        assert_none!(store.claim_next_job(Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn scheduled_jobs_stay_invisible_until_due() {
        let store = MemoryStore::new();
        let mut job = NewJob::new(job_types::SEND_EMAIL, json!({}));
        job.scheduled_for = Some(Utc::now() + chrono::Duration::hours(1));
        store.enqueue_job(job).await.unwrap();

        assert_none!(store.claim_next_job(Utc::now()).await.unwrap());
        let later = Utc::now() + chrono::Duration::hours(2);
        assert_some!(store.claim_next_job(later).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_a_noop() {
        let store = MemoryStore::new();
        let mut job = NewJob::new(job_types::RUN_EVALUATION, json!({}));
        job.idempotency_key = Some("run_evaluation:abc:retry:1".into());

        assert_some!(store.enqueue_job(job.clone()).await.unwrap());
        assert_none!(store.enqueue_job(job).await.unwrap());
    }

    #[tokio::test]
    async fn dead_lettered_job_is_never_eligible_again() {
        let store = MemoryStore::new();
        let id = store
            .enqueue_job(NewJob::new(job_types::SEND_EMAIL, json!({})))
            .await
            .unwrap()
            .unwrap();
        store.claim_next_job(Utc::now()).await.unwrap();
        store.dead_letter_job(id, "MOVED_TO_DLQ: smtp down").await.unwrap();

        let job = store.job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, job.max_attempts);
        assert_none!(store.claim_next_job(Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn reclaim_resets_only_stale_processing_rows() {
        let store = MemoryStore::new();
        let id = store
            .enqueue_job(NewJob::new(job_types::SEND_EMAIL, json!({})))
            .await
            .unwrap()
            .unwrap();
        store.claim_next_job(Utc::now()).await.unwrap();

        // A fresh claim is left alone.
        let cutoff = Utc::now() - chrono::Duration::minutes(1);
        assert_eq!(store.reclaim_stale_jobs(cutoff).await.unwrap(), 0);
        assert_eq!(store.job(id).await.unwrap().status, JobStatus::Processing);

        store
            .backdate_job_update(id, Utc::now() - chrono::Duration::minutes(2))
            .await;
        assert_eq!(store.reclaim_stale_jobs(cutoff).await.unwrap(), 1);
        assert_eq!(store.job(id).await.unwrap().status, JobStatus::Pending);
        assert_some!(store.claim_next_job(Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn retry_scan_orders_by_due_time_and_skips_terminal_evaluations() {
        let store = MemoryStore::new();
        let earlier = Uuid::new_v4();
        let later = Uuid::new_v4();
        let finished = Uuid::new_v4();

        for (id, status, offset_secs) in [
            (later, EvaluationStatus::Retrying, -10),
            (earlier, EvaluationStatus::Retrying, -60),
            (finished, EvaluationStatus::Completed, -60),
        ] {
            store
                .create_evaluation(NewEvaluation {
                    id,
                    tenant_id: "t1".into(),
                    user_id: 1,
                    base_prompt: "p".into(),
                })
                .await
                .unwrap();
            store
                .set_evaluation_status(id, status, None)
                .await
                .unwrap();
            let mut checkpoint = Checkpoint::new(id);
            checkpoint.next_retry_at = Some(Utc::now() + chrono::Duration::seconds(offset_secs));
            store.save_checkpoint(&checkpoint).await.unwrap();
        }

        let due = store.evaluations_due_for_retry(Utc::now()).await.unwrap();
        let ids: Vec<Uuid> = due.iter().map(|evaluation| evaluation.id).collect();
        assert_eq!(ids, vec![earlier, later]);
    }
}
