#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod backoff;
mod config;
mod dispatcher;
mod divergence;
mod errors;
mod limiter;
mod memory_store;
mod model;
mod notify;
mod pg_store;
mod protocol;
pub mod schema;
mod service;
mod shutdown;
mod store;
mod util;
mod worker;

pub use backoff::BackoffPolicy;
pub use config::WorkerConfig;
pub use dispatcher::Dispatcher;
pub use divergence::divergence;
pub use errors::{EnqueueError, HandlerError, ProtocolError, StoreError};
pub use limiter::{CategoryGates, JobCategory};
pub use memory_store::MemoryStore;
pub use model::{is_rate_limit_message, ModelClient, ModelError, RetryingClient};
pub use notify::{
    Event, EventKind, ProgressBroker, Subscription, EVALUATION_RESOURCE, SUBSCRIBER_BUFFER,
};
pub use pg_store::{setup_database, PgStore};
pub use protocol::{
    EvaluationProtocol, Outcome, DIAGNOSIS_CONSISTENT, DIAGNOSIS_DIVERGENT, DIVERGENCE_THRESHOLD,
};
pub use service::EvaluationService;
pub use shutdown::{shutdown_channel, Shutdown, ShutdownHandle};
pub use store::{
    EvaluationStore, JobStore, NewAudit, NewEvaluation, NewIteration, NewJob, Store,
};
pub use worker::{Mailer, DEAD_LETTER_PREFIX};
