use crate::config::WorkerConfig;
use crate::schema::job_types;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Rate-limiting and handler-dispatch classification of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobCategory {
    /// Jobs that call the language model.
    Model,
    /// Outbound email jobs.
    Email,
    /// Everything else.
    Generic,
}

impl JobCategory {
    /// Classify a job by its category tag. Unknown tags fall into
    /// [`JobCategory::Generic`].
    pub fn classify(job_type: &str) -> Self {
        match job_type {
            job_types::RUN_EVALUATION | job_types::PROCESS_AI => JobCategory::Model,
            job_types::SEND_EMAIL
            | job_types::SEND_VERIFICATION_EMAIL
            | job_types::SEND_PASSWORD_RESET_EMAIL => JobCategory::Email,
            _ => JobCategory::Generic,
        }
    }

    /// Stable name for logging.
    pub fn as_str(self) -> &'static str {
        match self {
            JobCategory::Model => "model",
            JobCategory::Email => "email",
            JobCategory::Generic => "generic",
        }
    }
}

/// One bounded counting semaphore per job category.
///
/// Acquisition is always non-blocking from the dispatcher's perspective; a
/// saturated category defers its own jobs without blocking the others. The
/// permit is released when the worker task ends, success or failure alike.
/// Business logic never inspects permit counts.
#[derive(Debug)]
pub struct CategoryGates {
    model: Arc<Semaphore>,
    email: Arc<Semaphore>,
    generic: Arc<Semaphore>,
}

impl CategoryGates {
    /// Build the gates from the configured per-category limits.
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            model: Arc::new(Semaphore::new(config.max_concurrent_model_jobs)),
            email: Arc::new(Semaphore::new(config.max_concurrent_email_jobs)),
            generic: Arc::new(Semaphore::new(config.max_concurrent_generic_jobs)),
        }
    }

    /// Try to admit one job of the given category. `None` means the category
    /// is saturated and the job should be deferred to the next tick.
    pub fn try_admit(&self, category: JobCategory) -> Option<OwnedSemaphorePermit> {
        self.gate(category).clone().try_acquire_owned().ok()
    }

    fn gate(&self, category: JobCategory) -> &Arc<Semaphore> {
        match category {
            JobCategory::Model => &self.model,
            JobCategory::Email => &self.email,
            JobCategory::Generic => &self.generic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_tags() {
        assert_eq!(JobCategory::classify("run_evaluation"), JobCategory::Model);
        assert_eq!(JobCategory::classify("process_ai"), JobCategory::Model);
        assert_eq!(JobCategory::classify("send_email"), JobCategory::Email);
        assert_eq!(
            JobCategory::classify("send_verification_email"),
            JobCategory::Email
        );
        assert_eq!(
            JobCategory::classify("send_password_reset_email"),
            JobCategory::Email
        );
        assert_eq!(JobCategory::classify("process_webhook"), JobCategory::Generic);
        assert_eq!(JobCategory::classify("anything"), JobCategory::Generic);
    }

    #[test]
    fn saturated_gate_rejects_until_a_permit_is_released() {
        let config = WorkerConfig {
            max_concurrent_model_jobs: 2,
            ..WorkerConfig::default()
        };
        let gates = CategoryGates::new(&config);

        let first = gates.try_admit(JobCategory::Model).unwrap();
        let _second = gates.try_admit(JobCategory::Model).unwrap();
        assert!(gates.try_admit(JobCategory::Model).is_none());

        // Other categories are unaffected.
        assert!(gates.try_admit(JobCategory::Email).is_some());

        drop(first);
        assert!(gates.try_admit(JobCategory::Model).is_some());
    }
}
