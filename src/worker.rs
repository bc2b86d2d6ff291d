//! Job handlers and the per-job failure taxonomy.

use crate::config::WorkerConfig;
use crate::errors::HandlerError;
use crate::model::ModelClient;
use crate::protocol::{EvaluationProtocol, Outcome};
use crate::schema::{
    job_types, AiPayload, EmailPayload, EvaluationPayload, Job, Message, TokenEmailPayload,
};
use crate::store::Store;
use crate::util::try_to_extract_panic_info;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Prefix stamped onto `last_error` when a job is dead-lettered, so the rows
/// are greppable in the table.
pub const DEAD_LETTER_PREFIX: &str = "MOVED_TO_DLQ: ";

/// Outbound email seam; the SMTP/provider transport lives outside this crate.
#[async_trait]
pub trait Mailer: Send + Sync + 'static {
    /// Deliver one message.
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// What a successful handler asks the job queue to record.
enum HandlerOutcome {
    /// The handler's effect was fully applied; write the idempotency record.
    Applied,
    /// The evaluation parked itself on a rate limit. The job is done, the
    /// checkpoint owns the retry, so the ledger must stay untouched.
    CheckpointRetry(chrono::DateTime<Utc>),
}

/// Executes claimed jobs and records their outcome.
pub(crate) struct Worker {
    store: Arc<dyn Store>,
    client: Arc<dyn ModelClient>,
    mailer: Arc<dyn Mailer>,
    protocol: EvaluationProtocol,
    config: WorkerConfig,
}

impl Worker {
    pub(crate) fn new(
        store: Arc<dyn Store>,
        client: Arc<dyn ModelClient>,
        mailer: Arc<dyn Mailer>,
        protocol: EvaluationProtocol,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            client,
            mailer,
            protocol,
            config,
        }
    }

    /// Run one claimed job end to end, panic-safe, and record the result.
    pub(crate) async fn process(&self, job: Job) {
        let result = AssertUnwindSafe(self.run_handler(&job))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(HandlerError::Failed(try_to_extract_panic_info(&panic)))
            });

        let record = match result {
            Ok(HandlerOutcome::Applied) => self.store.complete_job_applied(job.id).await,
            Ok(HandlerOutcome::CheckpointRetry(resume_at)) => {
                info!(job_id = job.id, %resume_at, "evaluation parked, closing the delivery job");
                self.store.force_complete_job(job.id).await
            }
            Err(handler_error) => self.record_failure(&job, handler_error).await,
        };

        if let Err(store_error) = record {
            // The job stays `processing` until the stale-claim sweep returns
            // it to the queue.
            error!(job_id = job.id, error = %store_error, "failed to record job outcome");
        }
    }

    /// Decide between a retriable failure and the dead-letter queue.
    async fn record_failure(
        &self,
        job: &Job,
        handler_error: HandlerError,
    ) -> Result<(), crate::errors::StoreError> {
        let age = Utc::now() - job.created_at;
        let attempts_after = job.attempt_count + 1;

        let terminal = !handler_error.is_retriable()
            || attempts_after >= self.config.dead_letter_max_attempts
            || age > self.config.dead_letter_max_age;

        if terminal {
            let message = format!("{DEAD_LETTER_PREFIX}{handler_error}");
            error!(
                job_id = job.id,
                job_type = %job.job_type,
                attempts = attempts_after,
                error = %handler_error,
                "job moved to dead-letter queue"
            );
            self.store.dead_letter_job(job.id, &message).await
        } else {
            warn!(
                job_id = job.id,
                job_type = %job.job_type,
                attempts = attempts_after,
                error = %handler_error,
                "job failed, will retry"
            );
            self.store
                .fail_job(job.id, &handler_error.to_string())
                .await
        }
    }

    async fn run_handler(&self, job: &Job) -> Result<HandlerOutcome, HandlerError> {
        match job.job_type.as_str() {
            job_types::SEND_EMAIL => self.send_email(job).await,
            job_types::SEND_VERIFICATION_EMAIL => self.send_verification_email(job).await,
            job_types::SEND_PASSWORD_RESET_EMAIL => self.send_password_reset_email(job).await,
            job_types::PROCESS_AI => self.process_ai(job).await,
            job_types::RUN_EVALUATION => self.run_evaluation(job).await,
            other => Err(HandlerError::Failed(anyhow::anyhow!(
                "unknown job type: {other}"
            ))),
        }
    }

    async fn send_email(&self, job: &Job) -> Result<HandlerOutcome, HandlerError> {
        let payload: EmailPayload = parse_payload(job)?;
        self.mailer
            .send(&payload.to, &payload.subject, &payload.body)
            .await?;
        Ok(HandlerOutcome::Applied)
    }

    async fn send_verification_email(&self, job: &Job) -> Result<HandlerOutcome, HandlerError> {
        let payload: TokenEmailPayload = parse_payload(job)?;
        let link = format!("{}/verify-email?token={}", self.config.base_url, payload.token);
        let body = format!(
            "Bem-vindo! Confirme seu endereço de e-mail acessando o link abaixo:\n\n{link}\n"
        );
        self.mailer
            .send(&payload.email, "Verifique seu E-mail", &body)
            .await?;
        Ok(HandlerOutcome::Applied)
    }

    async fn send_password_reset_email(&self, job: &Job) -> Result<HandlerOutcome, HandlerError> {
        let payload: TokenEmailPayload = parse_payload(job)?;
        let link = format!("{}/reset-password?token={}", self.config.base_url, payload.token);
        let body = format!(
            "Recebemos um pedido de redefinição de senha. Use o link abaixo:\n\n{link}\n\n\
             Este link expira em 1 hora.\n"
        );
        self.mailer
            .send(&payload.email, "Recuperação de Senha", &body)
            .await?;
        Ok(HandlerOutcome::Applied)
    }

    async fn process_ai(&self, job: &Job) -> Result<HandlerOutcome, HandlerError> {
        let payload: AiPayload = parse_payload(job)?;
        let response = self
            .client
            .generate(&[Message::user(payload.prompt)])
            .await
            .map_err(anyhow::Error::from)?;
        info!(job_id = job.id, response_len = response.len(), "one-shot model call finished");
        Ok(HandlerOutcome::Applied)
    }

    async fn run_evaluation(&self, job: &Job) -> Result<HandlerOutcome, HandlerError> {
        let payload: EvaluationPayload = parse_payload(job)?;
        if payload.is_retry {
            info!(job_id = job.id, evaluation_id = %payload.evaluation_id, "resuming evaluation");
        }

        match self
            .protocol
            .run(payload.evaluation_id, &payload.prompt)
            .await
        {
            Ok(Outcome::Completed {
                divergence,
                diagnosis,
            }) => {
                info!(
                    job_id = job.id,
                    evaluation_id = %payload.evaluation_id,
                    divergence,
                    diagnosis,
                    "evaluation completed"
                );
                Ok(HandlerOutcome::Applied)
            }
            Ok(Outcome::RateLimited { resume_at }) => {
                Ok(HandlerOutcome::CheckpointRetry(resume_at))
            }
            Err(protocol_error) => Err(HandlerError::Failed(anyhow::Error::from(protocol_error))),
        }
    }
}

fn parse_payload<P: DeserializeOwned>(job: &Job) -> Result<P, HandlerError> {
    serde_json::from_value(job.payload.clone()).map_err(HandlerError::MalformedPayload)
}
