//! Entry point for callers that want an evaluation run.

use crate::errors::EnqueueError;
use crate::schema::{job_types, EvaluationPayload};
use crate::store::{NewEvaluation, NewJob, Store};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Creates evaluations and queues the job that runs them.
#[derive(Clone)]
pub struct EvaluationService {
    store: Arc<dyn Store>,
}

impl EvaluationService {
    /// Build the service over a store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Create an evaluation for `prompt` and enqueue its run. Returns the
    /// evaluation id; progress is observable through the broker and the
    /// evaluation row.
    pub async fn start_evaluation(
        &self,
        tenant_id: &str,
        user_id: i64,
        prompt: &str,
    ) -> Result<Uuid, EnqueueError> {
        let evaluation_id = Uuid::new_v4();
        self.store
            .create_evaluation(NewEvaluation {
                id: evaluation_id,
                tenant_id: tenant_id.to_owned(),
                user_id,
                base_prompt: prompt.to_owned(),
            })
            .await?;

        let payload = serde_json::to_value(EvaluationPayload {
            evaluation_id,
            tenant_id: tenant_id.to_owned(),
            user_id,
            prompt: prompt.to_owned(),
            is_retry: false,
        })?;
        let mut job = NewJob::new(job_types::RUN_EVALUATION, payload);
        job.tenant_id = Some(tenant_id.to_owned());
        self.store.enqueue_job(job).await?;

        info!(%evaluation_id, tenant_id, user_id, "evaluation queued");
        Ok(evaluation_id)
    }
}
