use serde::{Deserialize, Serialize};

use super::circuit::CircuitBreakerConfig;

/// Main configuration structure for Bulwark
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Database configuration for persisted events and dead letters
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Event queue admission and ordering
    #[serde(default)]
    pub queue: QueueConfig,

    /// Event processor batching and concurrency
    #[serde(default)]
    pub processor: ProcessorConfig,

    /// Redelivery policy for failed events
    #[serde(default)]
    pub retry: RetryConfig,

    /// Dead letter queue bounds and retention
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,

    /// Default circuit breaker settings, overridable per resource
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Handler middleware defaults
    #[serde(default)]
    pub middleware: MiddlewareConfig,
}

/// Behaviour when a bounded queue or concurrency limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressurePolicy {
    /// Reject immediately and tell the caller.
    #[default]
    Drop,
    /// Suspend the caller until capacity frees up.
    Wait,
}

/// What to do with an event whose payload fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Fail with a validation error.
    #[default]
    Reject,
    /// Discard the event without invoking the handler.
    Drop,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Rotation for file logs: daily, hourly, never
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseConfig {
    /// Path to `SQLite` database file
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Maximum number of database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> String {
    ".bulwark/bulwark.db".to_string()
}

const fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

/// Event queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct QueueConfig {
    /// Maximum number of events waiting in the queue
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,

    /// Admission policy once the queue is full
    #[serde(default)]
    pub backpressure: BackpressurePolicy,

    /// Priority used when a producer does not supply one
    #[serde(default = "default_priority")]
    pub default_priority: u8,

    /// Consecutive bypasses of a waiting lower-priority event before the
    /// oldest waiting event is forced out
    #[serde(default = "default_starvation_limit")]
    pub starvation_limit: u32,

    /// Event type prefixes that must be persisted before admission
    #[serde(default)]
    pub critical_event_prefixes: Vec<String>,
}

const fn default_max_queue_depth() -> usize {
    10_000
}

const fn default_priority() -> u8 {
    5
}

const fn default_starvation_limit() -> u32 {
    32
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: default_max_queue_depth(),
            backpressure: BackpressurePolicy::default(),
            default_priority: default_priority(),
            starvation_limit: default_starvation_limit(),
            critical_event_prefixes: Vec::new(),
        }
    }
}

/// Event processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProcessorConfig {
    /// Events pulled from the queue per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Events dispatched together inside a batch
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Maximum concurrent handler invocations
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// How long the loop waits for new events before re-checking shutdown
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

const fn default_batch_size() -> usize {
    50
}

const fn default_chunk_size() -> usize {
    10
}

const fn default_max_concurrent() -> usize {
    10
}

const fn default_poll_interval_ms() -> u64 {
    1_000
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            chunk_size: default_chunk_size(),
            max_concurrent: default_max_concurrent(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Maximum delivery attempts before an event is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,

    /// Upper bound on any retry delay in milliseconds
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    /// Growth factor between successive delays
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Uniform random perturbation applied to each delay (0.0-1.0)
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_base_retry_delay_ms() -> u64 {
    1_000
}

const fn default_max_retry_delay_ms() -> u64 {
    30_000
}

const fn default_backoff_multiplier() -> f64 {
    2.0
}

const fn default_jitter_ratio() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_retry_delay_ms: default_base_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

/// Dead letter queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DeadLetterConfig {
    /// Maximum retained entries; the oldest is evicted beyond this
    #[serde(default = "default_max_dlq_size")]
    pub max_dlq_size: usize,

    /// Entries older than this are removed by the retention sweep
    #[serde(default = "default_max_retention_days")]
    pub max_retention_days: u32,

    /// Size at which an alert is raised
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: usize,
}

const fn default_max_dlq_size() -> usize {
    1_000
}

const fn default_max_retention_days() -> u32 {
    7
}

const fn default_alert_threshold() -> usize {
    100
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            max_dlq_size: default_max_dlq_size(),
            max_retention_days: default_max_retention_days(),
            alert_threshold: default_alert_threshold(),
        }
    }
}

/// Handler middleware defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MiddlewareConfig {
    /// Time budget for one handler invocation in milliseconds
    #[serde(default = "default_handler_timeout_ms")]
    pub timeout_ms: u64,

    /// Per-handler in-flight cap; unlimited when unset
    #[serde(default)]
    pub concurrency_limit: Option<usize>,

    /// Policy once the per-handler cap is reached
    #[serde(default)]
    pub concurrency_policy: BackpressurePolicy,

    /// Behaviour for payloads failing validation
    #[serde(default)]
    pub validation_mode: ValidationMode,
}

const fn default_handler_timeout_ms() -> u64 {
    30_000
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_handler_timeout_ms(),
            concurrency_limit: None,
            concurrency_policy: BackpressurePolicy::default(),
            validation_mode: ValidationMode::default(),
        }
    }
}
