//! The language-model client seam.
//!
//! The actual client (text generation, embeddings, transport) is an external
//! collaborator; the core only needs its two operations and a distinguishable
//! "rate limited" condition.

use crate::backoff::BackoffPolicy;
use crate::schema::Message;
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, trace};

/// Error messages carrying any of these indicators are treated as rate
/// limits, matching the provider's 429/quota/RPM-style wording.
const RATE_LIMIT_INDICATORS: &[&str] = &[
    "429",
    "too many requests",
    "quota exceeded",
    "rate limit",
    "resource_exhausted",
    "rpm",
    "tpm",
    "rpd",
];

/// Whether an error message indicates a provider rate limit
/// (case-insensitive).
pub fn is_rate_limit_message(message: &str) -> bool {
    let message = message.to_lowercase();
    RATE_LIMIT_INDICATORS
        .iter()
        .any(|indicator| message.contains(indicator))
}

/// Errors surfaced by a model client.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The provider signalled a rate limit; the caller decides whether to
    /// retry in-process or persist a retry timestamp.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The provider returned no usable content.
    #[error("no content generated")]
    EmptyResponse,

    /// Any other provider failure; terminal from the protocol's view.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ModelError {
    /// Whether this error is the distinguishable rate-limit condition.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            ModelError::RateLimited(_) => true,
            ModelError::EmptyResponse => false,
            ModelError::Other(error) => is_rate_limit_message(&error.to_string()),
        }
    }
}

/// Contract consumed by the evaluation protocol and the `process_ai` handler.
#[async_trait]
pub trait ModelClient: Send + Sync + 'static {
    /// Generate a completion for the given conversation.
    async fn generate(&self, conversation: &[Message]) -> Result<String, ModelError>;

    /// Embed a piece of text.
    async fn embed(&self, text: &str) -> Result<Vec<f64>, ModelError>;
}

/// Decorator adding the client's own short-horizon retry for rate limits.
///
/// Runs on the client backoff policy (1s base, 60s cap, 5 attempts), which is
/// independent of the protocol-level policy owning checkpointed retries. If
/// the rate limit persists past the attempt ceiling the last error is
/// returned still carrying its rate-limit signal, so the protocol layer can
/// react to it. Non-rate-limit errors are returned immediately.
pub struct RetryingClient<C> {
    inner: C,
    policy: BackoffPolicy,
    shutdown: Option<Shutdown>,
}

impl<C> RetryingClient<C> {
    /// Wrap `inner` with the given retry policy.
    pub fn new(inner: C, policy: BackoffPolicy) -> Self {
        Self {
            inner,
            policy,
            shutdown: None,
        }
    }

    /// Make backoff waits cancellable by the shutdown signal. A cancelled
    /// wait aborts the attempt and surfaces the pending error.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Wait out one backoff delay; false when cancelled by shutdown.
    async fn wait(&self, delay: Duration) -> bool {
        match &self.shutdown {
            Some(shutdown) => tokio::select! {
                () = shutdown.triggered() => false,
                () = sleep(delay) => true,
            },
            None => {
                sleep(delay).await;
                true
            }
        }
    }
}

#[async_trait]
impl<C: ModelClient> ModelClient for RetryingClient<C> {
    async fn generate(&self, conversation: &[Message]) -> Result<String, ModelError> {
        let mut attempt = 0;
        loop {
            match self.inner.generate(conversation).await {
                Ok(text) => return Ok(text),
                Err(error) if error.is_rate_limit() && attempt + 1 < self.policy.max_attempts => {
                    let delay = self.policy.delay(attempt);
                    trace!(attempt, ?delay, "model rate limited, backing off");
                    if !self.wait(delay).await {
                        debug!("backoff wait cancelled by shutdown");
                        return Err(error);
                    }
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f64>, ModelError> {
        let mut attempt = 0;
        loop {
            match self.inner.embed(text).await {
                Ok(vector) => return Ok(vector),
                Err(error) if error.is_rate_limit() && attempt + 1 < self.policy.max_attempts => {
                    let delay = self.policy.delay(attempt);
                    trace!(attempt, ?delay, "embedding rate limited, backing off");
                    if !self.wait(delay).await {
                        debug!("backoff wait cancelled by shutdown");
                        return Err(error);
                    }
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn recognizes_rate_limit_indicators() {
        assert!(is_rate_limit_message("HTTP 429 returned"));
        assert!(is_rate_limit_message("Quota Exceeded for project"));
        assert!(is_rate_limit_message("RESOURCE_EXHAUSTED"));
        assert!(is_rate_limit_message("exceeded your RPM allowance"));
        assert!(is_rate_limit_message("Too Many Requests"));
        assert!(!is_rate_limit_message("connection reset by peer"));
        assert!(!is_rate_limit_message("invalid api key"));
    }

    #[test]
    fn wrapped_anyhow_errors_are_classified_by_message() {
        let error = ModelError::Other(anyhow::anyhow!("upstream said: rate limit hit"));
        assert!(error.is_rate_limit());
        let error = ModelError::Other(anyhow::anyhow!("bad request"));
        assert!(!error.is_rate_limit());
    }

    struct FlakyModel {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ModelClient for FlakyModel {
        async fn generate(&self, _conversation: &[Message]) -> Result<String, ModelError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(ModelError::RateLimited("429".to_owned()))
            } else {
                Ok("ok".to_owned())
            }
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f64>, ModelError> {
            Err(ModelError::Other(anyhow::anyhow!("broken")))
        }
    }

    fn fast_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts,
        }
    }

    #[tokio::test]
    async fn retries_rate_limits_until_success() {
        let client = RetryingClient::new(
            FlakyModel {
                failures: 3,
                calls: AtomicU32::new(0),
            },
            fast_policy(5),
        );
        let text = client.generate(&[Message::user("oi")]).await.unwrap();
        assert_eq!(text, "ok");
        assert_eq!(client.inner.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn exhausted_retries_still_signal_rate_limit() {
        let client = RetryingClient::new(
            FlakyModel {
                failures: 10,
                calls: AtomicU32::new(0),
            },
            fast_policy(3),
        );
        let error = client.generate(&[Message::user("oi")]).await.unwrap_err();
        assert!(error.is_rate_limit());
        assert_eq!(client.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_rate_limit_errors_are_not_retried() {
        let client = RetryingClient::new(
            FlakyModel {
                failures: 10,
                calls: AtomicU32::new(0),
            },
            fast_policy(5),
        );
        let error = client.embed("texto").await.unwrap_err();
        assert!(!error.is_rate_limit());
    }
}
