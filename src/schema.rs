//! Persisted row types and the typed value objects stored inside them.
//!
//! Transcripts and embeddings are kept as typed values throughout the crate;
//! (de)serialization to their stored JSON form happens only at the storage
//! boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Category tags carried on jobs, used for handler dispatch and rate limiting.
pub mod job_types {
    /// Runs the five-phase evaluation protocol.
    pub const RUN_EVALUATION: &str = "run_evaluation";
    /// One-shot model call without checkpointing.
    pub const PROCESS_AI: &str = "process_ai";
    /// Plain email with caller-provided subject and body.
    pub const SEND_EMAIL: &str = "send_email";
    /// Email-verification message built from a token.
    pub const SEND_VERIFICATION_EMAIL: &str = "send_verification_email";
    /// Password-reset message built from a token.
    pub const SEND_PASSWORD_RESET_EMAIL: &str = "send_password_reset_email";
}

/// Lifecycle status of a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be picked up.
    Pending,
    /// Claimed by a dispatch cycle.
    Processing,
    /// Handler effect fully applied.
    Completed,
    /// Failed; eligible for retry until the attempt ceiling is reached.
    Failed,
}

/// A unit of deferred work persisted in the `jobs` table.
///
/// Jobs are never deleted; permanently failed ones are marked failed with a
/// dead-letter annotation on `last_error`.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Monotonic identifier.
    pub id: i64,
    /// Owning tenant, if any.
    pub tenant_id: Option<String>,
    /// Category tag, see [`job_types`].
    pub job_type: String,
    /// Opaque payload, interpreted by the handler.
    pub payload: Value,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Number of failed attempts so far.
    pub attempt_count: i32,
    /// Attempt ceiling; a failed job with `attempt_count >= max_attempts` is
    /// never re-picked.
    pub max_attempts: i32,
    /// Error text from the most recent failure.
    pub last_error: Option<String>,
    /// Earliest instant the job becomes eligible.
    pub scheduled_for: DateTime<Utc>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Optional unique key for enqueue-time deduplication.
    pub idempotency_key: Option<String>,
}

/// Lifecycle status of an [`Evaluation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "evaluation_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EvaluationStatus {
    /// Created, no job has picked it up yet.
    Pending,
    /// The protocol is running.
    Processing,
    /// Paused on a model rate limit; resumption is owned by the checkpoint.
    Retrying,
    /// All five phases finished and the audit record was written.
    Completed,
    /// Terminal failure.
    Failed,
}

/// One instance of the multi-phase evaluation protocol.
#[derive(Debug, Clone, FromRow)]
pub struct Evaluation {
    /// Opaque identifier.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// Owning user.
    pub user_id: i64,
    /// The prompt the protocol interrogates the model about.
    pub base_prompt: String,
    /// Current lifecycle status.
    pub status: EvaluationStatus,
    /// Mirror of the checkpoint's rate-limit retry counter.
    pub retry_count: i32,
    /// Error text on terminal failure.
    pub error_message: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

/// One step of the five-step evaluation protocol, in strict forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "evaluation_phase", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Ask the base prompt and embed the answer.
    Inicial,
    /// Demand the diametrically opposite technical approach.
    Inversao,
    /// Falsely assert the first answer failed validation and embed the reply.
    Confronto,
    /// Compute divergence between the two embeddings; no model call.
    Calculo,
    /// Audit the original answer in a clean context and write the audit record.
    Purga,
}

impl Phase {
    /// All phases in execution order.
    pub const ORDER: [Phase; 5] = [
        Phase::Inicial,
        Phase::Inversao,
        Phase::Confronto,
        Phase::Calculo,
        Phase::Purga,
    ];

    /// The phase following this one, or `None` after [`Phase::Purga`].
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Inicial => Some(Phase::Inversao),
            Phase::Inversao => Some(Phase::Confronto),
            Phase::Confronto => Some(Phase::Calculo),
            Phase::Calculo => Some(Phase::Purga),
            Phase::Purga => None,
        }
    }

    /// 1-based position, used in progress events.
    pub fn step(self) -> usize {
        match self {
            Phase::Inicial => 1,
            Phase::Inversao => 2,
            Phase::Confronto => 3,
            Phase::Calculo => 4,
            Phase::Purga => 5,
        }
    }

    /// Stable lowercase name, matching the persisted form.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Inicial => "inicial",
            Phase::Inversao => "inversao",
            Phase::Confronto => "confronto",
            Phase::Calculo => "calculo",
            Phase::Purga => "purga",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Speaker of one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The interrogating side of the conversation.
    User,
    /// The model's side.
    Assistant,
}

/// One turn of a model conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Who spoke.
    pub role: Role,
    /// What was said.
    pub content: String,
}

impl Message {
    /// A user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// An assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Ordered conversation transcript accumulated across protocol phases.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transcript(Vec<Message>);

impl Transcript {
    /// An empty transcript.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a user turn.
    pub fn push_user(&mut self, content: impl Into<String>) {
        self.0.push(Message::user(content));
    }

    /// Append an assistant turn.
    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.0.push(Message::assistant(content));
    }

    /// All turns in order.
    pub fn messages(&self) -> &[Message] {
        &self.0
    }

    /// The first assistant turn, i.e. the model's original answer.
    pub fn first_assistant(&self) -> Option<&str> {
        self.0
            .iter()
            .find(|message| message.role == Role::Assistant)
            .map(|message| message.content.as_str())
    }

    /// Number of turns.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the transcript has no turns.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Embedding vector of a model answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding(Vec<f64>);

impl Embedding {
    /// The raw vector.
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    /// Vector length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the vector is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<f64>> for Embedding {
    fn from(values: Vec<f64>) -> Self {
        Self(values)
    }
}

/// The resumability anchor for one evaluation, exactly one row per
/// evaluation.
///
/// `current_phase` always names the next phase to execute. A set
/// `next_retry_at` blocks resumption until that instant passes.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// The owning evaluation.
    pub evaluation_id: Uuid,
    /// Next phase to execute.
    pub current_phase: Phase,
    /// Conversation accumulated so far.
    pub transcript: Transcript,
    /// Embedding of the `inicial` answer.
    pub embedding_inicial: Option<Embedding>,
    /// Embedding of the `confronto` answer.
    pub embedding_confronto: Option<Embedding>,
    /// Divergence score written by `calculo`.
    pub divergence: Option<f64>,
    /// Diagnosis label written by `calculo`.
    pub diagnosis: Option<String>,
    /// Rate-limit pauses taken so far.
    pub retry_count: i32,
    /// Instant of the most recent rate-limit pause.
    pub last_retry_at: Option<DateTime<Utc>>,
    /// Resumption is blocked until this instant passes.
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    /// A fresh checkpoint positioned at the first phase.
    pub fn new(evaluation_id: Uuid) -> Self {
        Self {
            evaluation_id,
            current_phase: Phase::Inicial,
            transcript: Transcript::new(),
            embedding_inicial: None,
            embedding_confronto: None,
            divergence: None,
            diagnosis: None,
            retry_count: 0,
            last_retry_at: None,
            next_retry_at: None,
        }
    }
}

/// Append-only record of one model response within an evaluation.
#[derive(Debug, Clone)]
pub struct Iteration {
    /// Record identifier.
    pub id: Uuid,
    /// The owning evaluation.
    pub evaluation_id: Uuid,
    /// Phase that produced the response.
    pub phase: Phase,
    /// The model's response text.
    pub response: String,
    /// Embedding of the response, where the phase computes one.
    pub embedding: Option<Embedding>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Terminal record per evaluation: divergence score and diagnosis label.
#[derive(Debug, Clone)]
pub struct Audit {
    /// Record identifier.
    pub id: Uuid,
    /// The owning evaluation.
    pub evaluation_id: Uuid,
    /// Final divergence score.
    pub divergence: f64,
    /// Final diagnosis label.
    pub diagnosis: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Payload of a [`job_types::RUN_EVALUATION`] job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationPayload {
    /// Evaluation to run or resume.
    pub evaluation_id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// Owning user.
    pub user_id: i64,
    /// The base prompt.
    pub prompt: String,
    /// Set on jobs created by the retry scan.
    #[serde(default)]
    pub is_retry: bool,
}

/// Payload of a [`job_types::SEND_EMAIL`] job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailPayload {
    /// Recipient address.
    pub to: String,
    /// Subject line.
    pub subject: String,
    /// Message body.
    pub body: String,
}

/// Payload of the verification and password-reset email jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEmailPayload {
    /// Recipient address.
    pub email: String,
    /// Single-use token embedded in the link.
    pub token: String,
}

/// Payload of a [`job_types::PROCESS_AI`] job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiPayload {
    /// Prompt for the one-shot model call.
    pub prompt: String,
}
