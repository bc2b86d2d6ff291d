//! Dispatcher loop behavior over the in-memory store: delivery, idempotency,
//! retry, dead-lettering, category gating, and shutdown draining.

use elenchus::schema::{job_types, EvaluationStatus, JobStatus, Message};
use elenchus::{
    BackoffPolicy, Dispatcher, EvaluationService, JobStore, Mailer, MemoryStore, ModelClient,
    ModelError, NewJob, ProgressBroker, ShutdownHandle, WorkerConfig, DEAD_LETTER_PREFIX,
};
use serde_json::json;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Poll until the condition holds or the test deadline passes.
macro_rules! wait_until {
    ($cond:expr, $what:expr) => {{
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if $cond {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {}",
                $what
            );
            sleep(Duration::from_millis(10)).await;
        }
    }};
}

#[derive(Default)]
struct TestMailer {
    sent: Mutex<Vec<(String, String, String)>>,
    fail_remaining: AtomicI64,
}

impl TestMailer {
    fn failing(times: i64) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_remaining: AtomicI64::new(times),
        }
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Mailer for TestMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        if self.fail_remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
            anyhow::bail!("smtp connection refused");
        }
        self.sent
            .lock()
            .unwrap()
            .push((to.to_owned(), subject.to_owned(), body.to_owned()));
        Ok(())
    }
}

/// Model whose generate calls block until a permit is released.
struct GatedModel {
    gate: Semaphore,
    started: AtomicU32,
}

impl GatedModel {
    fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            started: AtomicU32::new(0),
        }
    }
}

#[async_trait::async_trait]
impl ModelClient for GatedModel {
    async fn generate(&self, _conversation: &[Message]) -> Result<String, ModelError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|err| ModelError::Other(err.into()))?;
        permit.forget();
        Ok("ok".to_owned())
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f64>, ModelError> {
        Ok(vec![1.0, 0.0])
    }
}

/// Model that rate-limits its first generate call, then answers normally.
struct RateLimitOnceModel {
    calls: AtomicU32,
}

#[async_trait::async_trait]
impl ModelClient for RateLimitOnceModel {
    async fn generate(&self, _conversation: &[Message]) -> Result<String, ModelError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(ModelError::RateLimited("429 Too Many Requests".to_owned()))
        } else {
            Ok("resposta".to_owned())
        }
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f64>, ModelError> {
        Ok(vec![1.0, 0.0])
    }
}

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(5),
        poll_jitter: Duration::ZERO,
        retry_scan_interval: Duration::from_millis(20),
        protocol_backoff: BackoffPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(20),
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts: 10,
        },
        ..WorkerConfig::default()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn spawn_dispatcher(
    store: Arc<MemoryStore>,
    model: Arc<dyn ModelClient>,
    mailer: Arc<dyn Mailer>,
    config: WorkerConfig,
) -> (JoinHandle<()>, ShutdownHandle) {
    init_tracing();
    let (handle, shutdown) = elenchus::shutdown_channel();
    let dispatcher = Dispatcher::new(
        store,
        model,
        mailer,
        Arc::new(ProgressBroker::new()),
        config,
        shutdown,
    );
    (tokio::spawn(dispatcher.run()), handle)
}

fn email_job() -> NewJob {
    NewJob::new(
        job_types::SEND_EMAIL,
        json!({"to": "ana@example.com", "subject": "Oi", "body": "corpo"}),
    )
}

async fn stop(running: JoinHandle<()>, handle: ShutdownHandle) {
    handle.trigger();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("dispatcher did not stop")
        .unwrap();
}

#[tokio::test]
async fn email_job_is_delivered_and_recorded_as_applied() {
    let store = Arc::new(MemoryStore::new());
    let mailer = Arc::new(TestMailer::default());
    let job_id = store.enqueue_job(email_job()).await.unwrap().unwrap();

    let (running, handle) = spawn_dispatcher(
        store.clone(),
        Arc::new(GatedModel::new()),
        mailer.clone(),
        fast_config(),
    );

    wait_until!(
        store.job(job_id).await.unwrap().status == JobStatus::Completed,
        "email job completion"
    );
    assert!(store.is_job_applied(job_id).await.unwrap());
    assert_eq!(mailer.sent_count(), 1);
    let sent = mailer.sent.lock().unwrap().clone();
    assert_eq!(sent[0].0, "ana@example.com");

    stop(running, handle).await;
}

#[tokio::test]
async fn redelivered_applied_job_is_not_run_twice() {
    let store = Arc::new(MemoryStore::new());
    let mailer = Arc::new(TestMailer::default());
    let job_id = store.enqueue_job(email_job()).await.unwrap().unwrap();
    // Simulate a crash between applying the effect and the delivery being
    // acknowledged: ledger written, then the job shows up as pending again.
    store.complete_job_applied(job_id).await.unwrap();
    store.defer_job(job_id).await.unwrap();

    let (running, handle) = spawn_dispatcher(
        store.clone(),
        Arc::new(GatedModel::new()),
        mailer.clone(),
        fast_config(),
    );

    wait_until!(
        store.job(job_id).await.unwrap().status == JobStatus::Completed,
        "duplicate delivery to be closed"
    );
    assert_eq!(mailer.sent_count(), 0);

    stop(running, handle).await;
}

#[tokio::test]
async fn persistent_failure_moves_the_job_to_the_dead_letter_queue() {
    let store = Arc::new(MemoryStore::new());
    let mailer = Arc::new(TestMailer::failing(i64::MAX));
    let job_id = store.enqueue_job(email_job()).await.unwrap().unwrap();

    let (running, handle) = spawn_dispatcher(
        store.clone(),
        Arc::new(GatedModel::new()),
        mailer.clone(),
        fast_config(),
    );

    wait_until!(
        {
            let job = store.job(job_id).await.unwrap();
            job.status == JobStatus::Failed && job.attempt_count == 5
        },
        "job to be dead-lettered"
    );
    let job = store.job(job_id).await.unwrap();
    assert!(job.last_error.as_deref().unwrap().starts_with(DEAD_LETTER_PREFIX));
    assert_eq!(job.max_attempts, 5);
    assert!(!store.is_job_applied(job_id).await.unwrap());

    // The row must stay put: no further attempts happen.
    sleep(Duration::from_millis(50)).await;
    assert_eq!(store.job(job_id).await.unwrap().attempt_count, 5);

    stop(running, handle).await;
}

#[tokio::test]
async fn stale_job_is_dead_lettered_on_its_next_failure() {
    let store = Arc::new(MemoryStore::new());
    let mailer = Arc::new(TestMailer::failing(i64::MAX));
    let job_id = store.enqueue_job(email_job()).await.unwrap().unwrap();
    store
        .backdate_job(job_id, chrono::Utc::now() - chrono::Duration::hours(25))
        .await;

    let (running, handle) = spawn_dispatcher(
        store.clone(),
        Arc::new(GatedModel::new()),
        mailer.clone(),
        fast_config(),
    );

    wait_until!(
        store.job(job_id).await.unwrap().status == JobStatus::Failed,
        "stale job to fail"
    );
    let job = store.job(job_id).await.unwrap();
    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.max_attempts, 1);
    assert!(job.last_error.as_deref().unwrap().starts_with(DEAD_LETTER_PREFIX));

    stop(running, handle).await;
}

#[tokio::test]
async fn malformed_payload_is_dead_lettered_without_retries() {
    let store = Arc::new(MemoryStore::new());
    let mailer = Arc::new(TestMailer::default());
    let job_id = store
        .enqueue_job(NewJob::new(job_types::SEND_EMAIL, json!({"oops": true})))
        .await
        .unwrap()
        .unwrap();

    let (running, handle) = spawn_dispatcher(
        store.clone(),
        Arc::new(GatedModel::new()),
        mailer.clone(),
        fast_config(),
    );

    wait_until!(
        store.job(job_id).await.unwrap().status == JobStatus::Failed,
        "malformed job to fail"
    );
    let job = store.job(job_id).await.unwrap();
    assert_eq!(job.attempt_count, 1);
    let last_error = job.last_error.unwrap();
    assert!(last_error.starts_with(DEAD_LETTER_PREFIX));
    assert!(last_error.contains("malformed payload"));
    assert_eq!(mailer.sent_count(), 0);

    stop(running, handle).await;
}

#[tokio::test]
async fn unknown_job_types_exhaust_their_attempts_and_die() {
    let store = Arc::new(MemoryStore::new());
    let job_id = store
        .enqueue_job(NewJob::new("mystery_job", json!({})))
        .await
        .unwrap()
        .unwrap();

    let (running, handle) = spawn_dispatcher(
        store.clone(),
        Arc::new(GatedModel::new()),
        Arc::new(TestMailer::default()),
        fast_config(),
    );

    wait_until!(
        {
            let job = store.job(job_id).await.unwrap();
            job.status == JobStatus::Failed && job.attempt_count == 5
        },
        "unknown job to be dead-lettered"
    );
    assert!(store
        .job(job_id)
        .await
        .unwrap()
        .last_error
        .unwrap()
        .contains("unknown job type: mystery_job"));

    stop(running, handle).await;
}

#[tokio::test]
async fn saturated_model_gate_defers_jobs_without_blocking_the_loop() {
    let store = Arc::new(MemoryStore::new());
    let model = Arc::new(GatedModel::new());
    let mailer = Arc::new(TestMailer::default());
    let config = WorkerConfig {
        max_concurrent_model_jobs: 1,
        ..fast_config()
    };

    let first = store
        .enqueue_job(NewJob::new(job_types::PROCESS_AI, json!({"prompt": "a"})))
        .await
        .unwrap()
        .unwrap();
    let second = store
        .enqueue_job(NewJob::new(job_types::PROCESS_AI, json!({"prompt": "b"})))
        .await
        .unwrap()
        .unwrap();

    let (running, handle) = spawn_dispatcher(store.clone(), model.clone(), mailer.clone(), config);

    wait_until!(model.started.load(Ordering::SeqCst) == 1, "first model call");
    // The gate holds the single permit; the second job must keep getting
    // deferred instead of starting a model call.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(model.started.load(Ordering::SeqCst), 1);
    assert_ne!(store.job(second).await.unwrap().status, JobStatus::Completed);

    // Emails flow while the model category is saturated.
    let email = store.enqueue_job(email_job()).await.unwrap().unwrap();
    wait_until!(
        store.job(email).await.unwrap().status == JobStatus::Completed,
        "email to pass the saturated model gate"
    );

    model.gate.add_permits(2);
    wait_until!(
        {
            let first_done = store.job(first).await.unwrap().status == JobStatus::Completed;
            let second_done = store.job(second).await.unwrap().status == JobStatus::Completed;
            first_done && second_done
        },
        "both model jobs to complete"
    );
    assert_eq!(model.started.load(Ordering::SeqCst), 2);

    stop(running, handle).await;
}

#[tokio::test]
async fn shutdown_drains_in_flight_jobs_before_stopping() {
    let store = Arc::new(MemoryStore::new());
    let model = Arc::new(GatedModel::new());
    let job_id = store
        .enqueue_job(NewJob::new(job_types::PROCESS_AI, json!({"prompt": "a"})))
        .await
        .unwrap()
        .unwrap();

    let (running, handle) = spawn_dispatcher(
        store.clone(),
        model.clone(),
        Arc::new(TestMailer::default()),
        fast_config(),
    );

    wait_until!(model.started.load(Ordering::SeqCst) == 1, "model call to start");
    handle.trigger();
    // The loop has stopped polling but the in-flight job must still finish.
    model.gate.add_permits(1);
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("dispatcher did not drain")
        .unwrap();
    assert_eq!(store.job(job_id).await.unwrap().status, JobStatus::Completed);
    assert!(store.is_job_applied(job_id).await.unwrap());
}

#[tokio::test]
async fn orphaned_claim_is_reclaimed_and_delivered() {
    let store = Arc::new(MemoryStore::new());
    let mailer = Arc::new(TestMailer::default());
    let job_id = store.enqueue_job(email_job()).await.unwrap().unwrap();

    // A previous process claimed the job and died before recording any
    // outcome: the row is stuck in `processing` and no eligibility predicate
    // matches it.
    let claimed = store.claim_next_job(chrono::Utc::now()).await.unwrap().unwrap();
    assert_eq!(claimed.id, job_id);
    store
        .backdate_job_update(job_id, chrono::Utc::now() - chrono::Duration::hours(1))
        .await;

    let (running, handle) = spawn_dispatcher(
        store.clone(),
        Arc::new(GatedModel::new()),
        mailer.clone(),
        fast_config(),
    );

    wait_until!(
        store.job(job_id).await.unwrap().status == JobStatus::Completed,
        "orphaned job to be reclaimed and delivered"
    );
    assert!(store.is_job_applied(job_id).await.unwrap());
    assert_eq!(mailer.sent_count(), 1);

    stop(running, handle).await;
}

#[tokio::test]
async fn rate_limited_evaluation_is_requeued_and_finishes() {
    let store = Arc::new(MemoryStore::new());
    let model = Arc::new(RateLimitOnceModel {
        calls: AtomicU32::new(0),
    });

    let service = EvaluationService::new(store.clone());
    let evaluation_id = service
        .start_evaluation("tenant-1", 42, "Implemente um cache LRU")
        .await
        .unwrap();

    let (running, handle) = spawn_dispatcher(
        store.clone(),
        model,
        Arc::new(TestMailer::default()),
        fast_config(),
    );

    wait_until!(
        store.evaluation(evaluation_id).await.unwrap().status == EvaluationStatus::Completed,
        "evaluation to complete after its rate-limit pause"
    );

    let jobs = store.jobs().await;
    assert_eq!(jobs.len(), 2, "one original delivery plus one retry");
    // The paused delivery was closed without touching the ledger.
    assert_eq!(jobs[0].status, JobStatus::Completed);
    assert!(!store.is_job_applied(jobs[0].id).await.unwrap());
    // The retry carries the deduplicating key and ran to completion.
    assert_eq!(
        jobs[1].idempotency_key.as_deref(),
        Some(format!("run_evaluation:{evaluation_id}:retry:1").as_str())
    );
    assert_eq!(jobs[1].status, JobStatus::Completed);
    assert!(store.is_job_applied(jobs[1].id).await.unwrap());

    assert_eq!(store.iterations(evaluation_id).await.len(), 4);
    assert_eq!(store.audits(evaluation_id).await.len(), 1);

    stop(running, handle).await;
}
