use crate::backoff::BackoffPolicy;
use std::time::Duration;

/// Explicit configuration for the dispatcher, worker pool, and retry engines.
///
/// Every constant the system depends on lives here and is passed in at
/// construction; nothing reads the ambient environment.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent model-call jobs (the model provider enforces per-minute
    /// quotas; keep this well under them).
    pub max_concurrent_model_jobs: usize,
    /// Concurrent email jobs.
    pub max_concurrent_email_jobs: usize,
    /// Concurrent jobs of any other category.
    pub max_concurrent_generic_jobs: usize,

    /// Base interval of the job-claim tick.
    pub poll_interval: Duration,
    /// Maximum random jitter added to each poll interval.
    pub poll_jitter: Duration,
    /// Interval of the evaluation retry scan.
    pub retry_scan_interval: Duration,

    /// A job that fails with this many attempts is dead-lettered.
    pub dead_letter_max_attempts: i32,
    /// A job older than this is dead-lettered on its next failure.
    pub dead_letter_max_age: chrono::Duration,
    /// A `processing` row untouched for longer than this is treated as
    /// orphaned by a crash and reset to `pending` by the slow scan. Must
    /// exceed the longest expected handler runtime.
    pub stale_claim_timeout: chrono::Duration,

    /// Backoff between rate-limit pauses of the evaluation protocol.
    pub protocol_backoff: BackoffPolicy,
    /// Backoff of the model client's own short-horizon retry. Independent of
    /// `protocol_backoff`; the two must not be conflated.
    pub client_backoff: BackoffPolicy,

    /// Base URL used in links inside generated emails.
    pub base_url: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_model_jobs: 5,
            max_concurrent_email_jobs: 10,
            max_concurrent_generic_jobs: 20,
            poll_interval: Duration::from_secs(1),
            poll_jitter: Duration::from_millis(100),
            retry_scan_interval: Duration::from_secs(30),
            dead_letter_max_attempts: 5,
            dead_letter_max_age: chrono::Duration::hours(24),
            stale_claim_timeout: chrono::Duration::minutes(10),
            protocol_backoff: BackoffPolicy::protocol(),
            client_backoff: BackoffPolicy::client(),
            base_url: "http://localhost:8080".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let config = WorkerConfig::default();
        assert_eq!(config.max_concurrent_model_jobs, 5);
        assert_eq!(config.max_concurrent_email_jobs, 10);
        assert_eq!(config.max_concurrent_generic_jobs, 20);
        assert_eq!(config.dead_letter_max_attempts, 5);
        assert_eq!(config.dead_letter_max_age, chrono::Duration::hours(24));
        assert_eq!(config.stale_claim_timeout, chrono::Duration::minutes(10));
        assert_eq!(config.protocol_backoff.base, Duration::from_secs(10));
        assert_eq!(config.client_backoff.base, Duration::from_secs(1));
    }
}
