//! The claim/admit/spawn loop and the evaluation retry scan.

use crate::config::WorkerConfig;
use crate::limiter::{CategoryGates, JobCategory};
use crate::model::ModelClient;
use crate::notify::ProgressBroker;
use crate::protocol::EvaluationProtocol;
use crate::schema::{job_types, EvaluationPayload};
use crate::shutdown::Shutdown;
use crate::store::{NewJob, Store};
use crate::worker::{Mailer, Worker};
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Polling job dispatcher with per-category concurrency gates.
///
/// One instance owns the claim loop; handler work runs on spawned tasks so a
/// slow evaluation never blocks email delivery. Several dispatchers may poll
/// the same store concurrently; the claim query guarantees each job is
/// delivered to exactly one of them.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    worker: Arc<Worker>,
    gates: CategoryGates,
    config: WorkerConfig,
    shutdown: Shutdown,
}

impl Dispatcher {
    /// Wire up the dispatcher and its worker over the given collaborators.
    pub fn new(
        store: Arc<dyn Store>,
        client: Arc<dyn ModelClient>,
        mailer: Arc<dyn Mailer>,
        broker: Arc<ProgressBroker>,
        config: WorkerConfig,
        shutdown: Shutdown,
    ) -> Self {
        let protocol = EvaluationProtocol::new(
            Arc::clone(&store),
            Arc::clone(&client),
            broker,
            config.protocol_backoff,
        );
        let worker = Arc::new(Worker::new(
            Arc::clone(&store),
            client,
            mailer,
            protocol,
            config.clone(),
        ));
        let gates = CategoryGates::new(&config);
        Self {
            store,
            worker,
            gates,
            config,
            shutdown,
        }
    }

    /// Run until shutdown, then drain in-flight jobs.
    pub async fn run(self) {
        info!("dispatcher started");
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut retry_tick = interval(self.config.retry_scan_interval);
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of `interval` fires immediately; swallow it so the
        // scan runs on its period, not at startup.
        retry_tick.tick().await;

        loop {
            tokio::select! {
                () = self.shutdown.triggered() => break,
                () = sleep(self.poll_delay()) => {
                    if let Err(error) = self.dispatch_next(&mut tasks).await {
                        error!(%error, "dispatch cycle failed");
                    }
                }
                _ = retry_tick.tick() => {
                    if let Err(error) = self.reclaim_stale_claims().await {
                        error!(%error, "stale-claim sweep failed");
                    }
                    if let Err(error) = self.requeue_due_evaluations().await {
                        error!(%error, "evaluation retry scan failed");
                    }
                }
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(join_error) = result {
                        error!(%join_error, "worker task aborted");
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "dispatcher stopping, draining in-flight jobs");
        while let Some(result) = tasks.join_next().await {
            if let Err(join_error) = result {
                error!(%join_error, "worker task aborted during drain");
            }
        }
        info!("dispatcher stopped");
    }

    /// Jittered poll delay; desynchronizes concurrent dispatchers polling
    /// the same table.
    fn poll_delay(&self) -> Duration {
        let jitter = self.config.poll_jitter.as_millis() as u64;
        if jitter == 0 {
            return self.config.poll_interval;
        }
        self.config.poll_interval + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter))
    }

    /// Claim jobs until one is admitted to a worker task. Jobs whose
    /// category gate is saturated are skipped for this cycle and put back at
    /// the end, so a saturated category never blocks the jobs behind it.
    async fn dispatch_next(
        &self,
        tasks: &mut JoinSet<()>,
    ) -> Result<(), crate::errors::StoreError> {
        let mut skipped: Vec<i64> = Vec::new();
        let outcome = self.claim_and_admit(tasks, &mut skipped).await;
        for job_id in skipped {
            if let Err(error) = self.store.defer_job(job_id).await {
                error!(job_id, %error, "failed to put skipped job back");
            }
        }
        outcome
    }

    async fn claim_and_admit(
        &self,
        tasks: &mut JoinSet<()>,
        skipped: &mut Vec<i64>,
    ) -> Result<(), crate::errors::StoreError> {
        loop {
            let Some(job) = self.store.claim_next_job(Utc::now()).await? else {
                trace!("no eligible jobs");
                return Ok(());
            };

            // Claiming races the ledger write of a previous delivery;
            // re-check before running the handler again.
            if self.store.is_job_applied(job.id).await? {
                debug!(job_id = job.id, "job already applied, closing the duplicate delivery");
                self.store.force_complete_job(job.id).await?;
                continue;
            }

            let category = JobCategory::classify(&job.job_type);
            let Some(permit) = self.gates.try_admit(category) else {
                debug!(
                    job_id = job.id,
                    category = category.as_str(),
                    "category saturated, skipping job this cycle"
                );
                // Stays `processing` until the cycle ends, so the next claim
                // looks past it.
                skipped.push(job.id);
                continue;
            };

            debug!(
                job_id = job.id,
                job_type = %job.job_type,
                category = category.as_str(),
                attempt = job.attempt_count,
                "job admitted"
            );
            let worker = Arc::clone(&self.worker);
            tasks.spawn(async move {
                worker.process(job).await;
                drop(permit);
            });
            return Ok(());
        }
    }

    /// Give orphaned claims back to the queue. A row stuck in `processing`
    /// past the timeout never had an outcome recorded, which means the
    /// claiming process crashed or its outcome write failed; the idempotency
    /// ledger makes the re-delivery harmless.
    async fn reclaim_stale_claims(&self) -> Result<(), crate::errors::StoreError> {
        let cutoff = Utc::now() - self.config.stale_claim_timeout;
        let reclaimed = self.store.reclaim_stale_jobs(cutoff).await?;
        if reclaimed > 0 {
            warn!(reclaimed, "reset stale processing jobs to pending");
        }
        Ok(())
    }

    /// Re-enqueue evaluations whose rate-limit pause window has passed. The
    /// idempotency key makes overlapping scans harmless.
    async fn requeue_due_evaluations(&self) -> Result<(), crate::errors::StoreError> {
        let due = self.store.evaluations_due_for_retry(Utc::now()).await?;
        for evaluation in due {
            let payload = EvaluationPayload {
                evaluation_id: evaluation.id,
                tenant_id: evaluation.tenant_id.clone(),
                user_id: evaluation.user_id,
                prompt: evaluation.base_prompt.clone(),
                is_retry: true,
            };
            let payload = match serde_json::to_value(&payload) {
                Ok(payload) => payload,
                Err(error) => {
                    warn!(evaluation_id = %evaluation.id, %error, "could not encode retry payload");
                    continue;
                }
            };

            let job = NewJob {
                tenant_id: Some(evaluation.tenant_id.clone()),
                job_type: job_types::RUN_EVALUATION.to_owned(),
                payload,
                scheduled_for: None,
                idempotency_key: Some(format!(
                    "run_evaluation:{}:retry:{}",
                    evaluation.id, evaluation.retry_count
                )),
            };
            match self.store.enqueue_job(job).await? {
                Some(job_id) => {
                    info!(evaluation_id = %evaluation.id, job_id, "re-enqueued due evaluation");
                }
                None => {
                    trace!(evaluation_id = %evaluation.id, "retry job already enqueued");
                }
            }
        }
        Ok(())
    }
}
