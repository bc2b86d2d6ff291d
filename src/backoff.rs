use rand::Rng;
use std::time::Duration;

/// Exponential backoff with symmetric, proportional jitter.
///
/// `delay = min(max, base * multiplier^attempt) * (1 ± jitter)`. The jitter
/// is proportional to the computed delay, not the base, which prevents
/// synchronized retry storms across many simultaneously rate-limited
/// evaluations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Cap applied before jitter.
    pub max: Duration,
    /// Exponential growth factor.
    pub multiplier: f64,
    /// Jitter fraction of the capped delay, applied symmetrically.
    pub jitter: f64,
    /// Attempt ceiling; exceeding it is terminal for the caller.
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Protocol-level policy governing rate-limit pauses between evaluation
    /// phases.
    pub const fn protocol() -> Self {
        Self {
            base: Duration::from_secs(10),
            max: Duration::from_secs(5 * 60),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: 10,
        }
    }

    /// Client-level policy for the model client's own transient-error retry.
    pub const fn client() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: 5,
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self.base.as_secs_f64() * self.multiplier.powi(attempt.min(63) as i32);
        let capped = exponential.min(self.max.as_secs_f64());
        let spread = rand::thread_rng().gen_range(-1.0..=1.0);
        let jittered = capped * (1.0 + self.jitter * spread);
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_delay_stays_within_jitter_band() {
        let policy = BackoffPolicy::protocol();
        for _ in 0..100 {
            let delay = policy.delay(0).as_secs_f64();
            assert!((8.0..=12.0).contains(&delay), "delay {delay} out of band");
        }
    }

    #[test]
    fn delay_grows_exponentially_until_the_cap() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::protocol()
        };
        assert_eq!(policy.delay(0), Duration::from_secs(10));
        assert_eq!(policy.delay(1), Duration::from_secs(20));
        assert_eq!(policy.delay(2), Duration::from_secs(40));
        // 10 * 2^6 = 640s, capped at 300s.
        assert_eq!(policy.delay(6), Duration::from_secs(300));
        assert_eq!(policy.delay(60), Duration::from_secs(300));
    }

    #[test]
    fn jitter_is_proportional_to_the_capped_delay() {
        let policy = BackoffPolicy::protocol();
        for _ in 0..100 {
            let delay = policy.delay(10).as_secs_f64();
            assert!((240.0..=360.0).contains(&delay), "delay {delay} out of band");
        }
    }

    #[test]
    fn client_policy_is_independent_of_protocol_policy() {
        let client = BackoffPolicy::client();
        let protocol = BackoffPolicy::protocol();
        assert_ne!(client, protocol);
        assert_eq!(client.max_attempts, 5);
        assert_eq!(protocol.max_attempts, 10);
    }
}
