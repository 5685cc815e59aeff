//! Event envelope and queue item models.
//!
//! An [`Event`] is the immutable unit of work flowing through the runtime.
//! The queue wraps each event in a [`QueueItem`] that carries the runtime
//! bookkeeping (priority, attempts, failure history).

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::dead_letter::FailureRecord;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an event id from its string form.
    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(Self)
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable typed message.
///
/// `event_type` is dot-namespaced (`agent.start`, `tool.invoke`) and is used
/// both for handler routing and for critical/DLQ classification by prefix.
/// On the wire the timestamp is encoded as epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Conversation or workflow the event belongs to.
    pub thread_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub ts: DateTime<Utc>,
}

impl Event {
    /// Create a new event with a fresh id stamped at the current time
    /// (millisecond precision, matching the wire format).
    pub fn new(
        event_type: impl Into<String>,
        thread_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            thread_id: thread_id.into(),
            data,
            ts: Utc::now().trunc_subsecs(3),
        }
    }

    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = id;
        self
    }

    /// Override the timestamp, truncated to the millisecond wire precision.
    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.ts = ts.trunc_subsecs(3);
        self
    }

    /// Whether the event type starts with any of the given prefixes.
    pub fn matches_prefix<S: AsRef<str>>(&self, prefixes: &[S]) -> bool {
        prefixes
            .iter()
            .any(|prefix| self.event_type.starts_with(prefix.as_ref()))
    }
}

/// Priority levels. Higher values are dequeued first.
pub struct Priority;

impl Priority {
    pub const LOW: u8 = 0;
    pub const NORMAL: u8 = 5;
    pub const HIGH: u8 = 10;
    pub const CRITICAL: u8 = 20;
}

/// An event plus the runtime metadata the queue and processor maintain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub event: Event,
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
    /// Delivery attempts so far. Only ever incremented.
    pub attempts: u32,
    /// Redeliveries allowed after the first attempt.
    pub max_retries: u32,
    /// Errors from earlier attempts, oldest first.
    #[serde(default)]
    pub failures: Vec<FailureRecord>,
}

impl QueueItem {
    pub fn new(event: Event, priority: u8, max_retries: u32, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            event,
            priority,
            enqueued_at,
            attempts: 0,
            max_retries,
            failures: Vec::new(),
        }
    }

    pub fn id(&self) -> EventId {
        self.event.id
    }

    /// Record a failed attempt.
    pub fn record_failure(&mut self, failure: FailureRecord) {
        self.attempts = self.attempts.saturating_add(1);
        self.failures.push(failure);
    }

    /// Whether the retry budget is spent.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_retries
    }

    /// Most recent failure message, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.failures.last().map(|f| f.error.as_str())
    }
}

/// Returned to producers when an event is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueReceipt {
    pub event_id: EventId,
    /// Queue depth right after admission.
    pub depth: usize,
    /// Whether a persisted copy was written before admission.
    pub durable: bool,
}
