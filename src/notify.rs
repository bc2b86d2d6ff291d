//! Fire-and-forget progress fan-out keyed by resource identifier.
//!
//! The broker is best-effort by contract: each subscriber has a bounded
//! buffer, and a full buffer silently drops the event rather than blocking
//! the publisher. Transports (SSE, websockets) live outside this crate and
//! consume [`Subscription`]s.

use crate::schema::Phase;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Per-subscriber event buffer size.
pub const SUBSCRIBER_BUFFER: usize = 100;

/// Resource kind used for evaluation events.
pub const EVALUATION_RESOURCE: &str = "evaluation";

/// Classification of a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A phase of the protocol started.
    Progress,
    /// The protocol finished successfully.
    Completed,
    /// The protocol failed terminally.
    Failed,
}

impl EventKind {
    /// Stable wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Progress => "progress",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
        }
    }
}

/// One published event.
#[derive(Debug, Clone)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// Structured event payload.
    pub payload: Value,
}

/// Handle to one subscriber's event stream. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    /// Receive the next event, or `None` once the broker is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Drain whatever is currently buffered without waiting.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

type ResourceKey = (String, String);

/// Publish/subscribe fan-out keyed on `(resource kind, resource id)`.
#[derive(Debug, Default)]
pub struct ProgressBroker {
    subscribers: RwLock<HashMap<ResourceKey, Vec<mpsc::Sender<Event>>>>,
}

impl ProgressBroker {
    /// An empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for one resource.
    pub fn subscribe(&self, resource_kind: &str, resource_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers
            .entry((resource_kind.to_owned(), resource_id.to_owned()))
            .or_default()
            .push(tx);
        Subscription { rx }
    }

    /// Publish an event to every live subscriber of the resource. Never
    /// blocks; a full subscriber buffer drops the event.
    pub fn publish(&self, resource_kind: &str, resource_id: &str, event: Event) {
        let key = (resource_kind.to_owned(), resource_id.to_owned());
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(senders) = subscribers.get_mut(&key) {
            senders.retain(|tx| !tx.is_closed());
            for tx in senders.iter() {
                let _ = tx.try_send(event.clone());
            }
            if senders.is_empty() {
                subscribers.remove(&key);
            }
        }
    }

    /// Phase-start event for an evaluation.
    pub fn evaluation_progress(&self, evaluation_id: Uuid, phase: Phase) {
        self.publish(
            EVALUATION_RESOURCE,
            &evaluation_id.to_string(),
            Event {
                kind: EventKind::Progress,
                payload: json!({
                    "phase": phase.as_str(),
                    "step": phase.step(),
                    "total": Phase::ORDER.len(),
                }),
            },
        );
    }

    /// Terminal success event for an evaluation.
    pub fn evaluation_completed(&self, evaluation_id: Uuid, diagnosis: &str, divergence: f64) {
        self.publish(
            EVALUATION_RESOURCE,
            &evaluation_id.to_string(),
            Event {
                kind: EventKind::Completed,
                payload: json!({
                    "diagnosis": diagnosis,
                    "divergence": divergence,
                }),
            },
        );
    }

    /// Terminal failure event for an evaluation.
    pub fn evaluation_failed(&self, evaluation_id: Uuid, error: &str) {
        self.publish(
            EVALUATION_RESOURCE,
            &evaluation_id.to_string(),
            Event {
                kind: EventKind::Failed,
                payload: json!({ "error": error }),
            },
        );
    }
}
