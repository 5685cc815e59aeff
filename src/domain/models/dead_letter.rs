//! Dead-letter models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::{Event, EventId};

/// A single failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// When the failure occurred.
    pub timestamp: DateTime<Utc>,
    /// Error message or description.
    pub error: String,
}

impl FailureRecord {
    pub fn new(error: impl Into<String>) -> Self {
        Self::at(Utc::now(), error)
    }

    pub fn at(timestamp: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            timestamp,
            error: error.into(),
        }
    }
}

/// An event parked in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterItem {
    pub event: Event,
    /// Error that caused the event to be parked, as `CODE: message`.
    pub failure_reason: String,
    pub failure_history: Vec<FailureRecord>,
    pub first_failed_at: DateTime<Utc>,
    /// When retention sweeping may remove the entry.
    pub expires_at: DateTime<Utc>,
    /// Delivery attempts made before the event was dead-lettered.
    pub attempts: u32,
}

impl DeadLetterItem {
    pub fn id(&self) -> EventId {
        self.event.id
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Filter for listing dead-letter entries.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    /// Only entries whose event type starts with this prefix.
    pub event_type_prefix: Option<String>,
    /// Only entries for this thread.
    pub thread_id: Option<String>,
    /// Only entries that first failed at or after this time.
    pub failed_since: Option<DateTime<Utc>>,
    /// Maximum number of entries to return.
    pub limit: Option<usize>,
}

impl DeadLetterFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_type_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.event_type_prefix = Some(prefix.into());
        self
    }

    pub fn thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn failed_since(mut self, since: DateTime<Utc>) -> Self {
        self.failed_since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, item: &DeadLetterItem) -> bool {
        if let Some(ref prefix) = self.event_type_prefix {
            if !item.event.event_type.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(ref thread) = self.thread_id {
            if &item.event.thread_id != thread {
                return false;
            }
        }
        if let Some(since) = self.failed_since {
            if item.first_failed_at < since {
                return false;
            }
        }
        true
    }
}

/// Raised when the DLQ grows past its alert threshold or starts evicting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterAlert {
    /// Size crossed the configured threshold.
    ThresholdExceeded { size: usize, threshold: usize },
    /// An entry was evicted to make room. This is data loss.
    Evicted { event_id: EventId, event_type: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn item(event_type: &str, thread: &str, failed_at: DateTime<Utc>) -> DeadLetterItem {
        DeadLetterItem {
            event: Event::new(event_type, thread, json!({})),
            failure_reason: "RETRY_EXHAUSTED".to_string(),
            failure_history: vec![FailureRecord::at(failed_at, "boom")],
            first_failed_at: failed_at,
            expires_at: failed_at + Duration::days(7),
            attempts: 3,
        }
    }

    #[test]
    fn test_filter_matches() {
        let now = Utc::now();
        let entry = item("tool.search", "thread-a", now);

        assert!(DeadLetterFilter::new().matches(&entry));
        assert!(DeadLetterFilter::new().event_type_prefix("tool.").matches(&entry));
        assert!(!DeadLetterFilter::new().event_type_prefix("agent.").matches(&entry));
        assert!(!DeadLetterFilter::new().thread_id("thread-b").matches(&entry));
        assert!(!DeadLetterFilter::new()
            .failed_since(now + Duration::seconds(1))
            .matches(&entry));
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let entry = item("tool.search", "t", now - Duration::days(8));
        assert!(entry.is_expired(now));
        assert!(!item("tool.search", "t", now).is_expired(now));
    }
}
