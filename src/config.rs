//! Pipeline configuration.
//!
//! All of the operational parameters the engine recognizes - stream, group
//! and consumer identity, read batch size, blocking-read timeout, the retry
//! budget, and the shutdown grace period. These are external configuration,
//! not core state: [`PipelineConfig::default`] gives sensible local values
//! and [`PipelineConfig::from_env`] overlays `CONVEYOR_*` environment
//! variables the way a deployment would.

use std::time::Duration;

// =============================================================================
// Defaults
// =============================================================================

/// Default stream name events are appended to.
pub const DEFAULT_STREAM: &str = "conveyor:events";

/// Default consumer group name.
pub const DEFAULT_GROUP: &str = "conveyor-workers";

/// Default consumer name within the group.
pub const DEFAULT_CONSUMER: &str = "worker-1";

/// Default maximum entries fetched per read (new and pending each).
pub const DEFAULT_READ_BATCH_SIZE: usize = 10;

/// Default bounded blocking wait while no new entries exist.
pub const DEFAULT_BLOCK_TIMEOUT_MS: u64 = 5_000;

/// Default global retry budget before a message is dead-lettered.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default pause after a cycle-level fetch failure.
pub const DEFAULT_CYCLE_RETRY_PAUSE_MS: u64 = 1_000;

/// Default grace period waited for the delivery loop at shutdown.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 10_000;

// =============================================================================
// PipelineConfig
// =============================================================================

/// Operational parameters for one pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Stream the producer appends to and the consumer reads from.
    pub stream: String,

    /// Durable consumer-group (cursor) name shared by all instances.
    pub group: String,

    /// This instance's consumer name; pending entries are tracked per
    /// consumer, so each instance needs its own.
    pub consumer: String,

    /// Maximum entries requested per fetch (applied to the new-entry read
    /// and the pending-entry read independently).
    pub read_batch_size: usize,

    /// How long the new-entry read may block while the stream is idle.
    pub block_timeout: Duration,

    /// Failures after which a message is dead-lettered instead of retried.
    pub max_retries: u32,

    /// Pause before retrying after the fetch step itself fails.
    pub cycle_retry_pause: Duration,

    /// How long shutdown waits for the delivery loop to drain before
    /// abandoning it.
    pub shutdown_grace: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stream: DEFAULT_STREAM.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: DEFAULT_CONSUMER.to_string(),
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            block_timeout: Duration::from_millis(DEFAULT_BLOCK_TIMEOUT_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            cycle_retry_pause: Duration::from_millis(DEFAULT_CYCLE_RETRY_PAUSE_MS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
        }
    }
}

impl PipelineConfig {
    /// Builds a config from `CONVEYOR_*` environment variables, falling back
    /// to the defaults for anything unset or unparsable.
    ///
    /// Recognized variables: `CONVEYOR_STREAM`, `CONVEYOR_GROUP`,
    /// `CONVEYOR_CONSUMER`, `CONVEYOR_BATCH_SIZE`,
    /// `CONVEYOR_BLOCK_TIMEOUT_MS`, `CONVEYOR_MAX_RETRIES`,
    /// `CONVEYOR_SHUTDOWN_GRACE_MS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) but with an injectable variable
    /// source, so parsing is testable without touching process state.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            stream: lookup("CONVEYOR_STREAM").unwrap_or(defaults.stream),
            group: lookup("CONVEYOR_GROUP").unwrap_or(defaults.group),
            consumer: lookup("CONVEYOR_CONSUMER").unwrap_or(defaults.consumer),
            read_batch_size: parse_or(lookup("CONVEYOR_BATCH_SIZE"), defaults.read_batch_size),
            block_timeout: Duration::from_millis(parse_or(
                lookup("CONVEYOR_BLOCK_TIMEOUT_MS"),
                DEFAULT_BLOCK_TIMEOUT_MS,
            )),
            max_retries: parse_or(lookup("CONVEYOR_MAX_RETRIES"), defaults.max_retries),
            cycle_retry_pause: defaults.cycle_retry_pause,
            shutdown_grace: Duration::from_millis(parse_or(
                lookup("CONVEYOR_SHUTDOWN_GRACE_MS"),
                DEFAULT_SHUTDOWN_GRACE_MS,
            )),
        }
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.stream, "conveyor:events");
        assert_eq!(config.read_batch_size, 10);
        assert_eq!(config.block_timeout, Duration::from_secs(5));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.shutdown_grace, Duration::from_secs(10));
    }

    #[test]
    fn test_from_lookup_overrides_and_fallbacks() {
        let config = PipelineConfig::from_lookup(|name| match name {
            "CONVEYOR_STREAM" => Some("orders:events".to_string()),
            "CONVEYOR_MAX_RETRIES" => Some("3".to_string()),
            "CONVEYOR_BATCH_SIZE" => Some("not-a-number".to_string()),
            _ => None,
        });
        assert_eq!(config.stream, "orders:events");
        assert_eq!(config.max_retries, 3);
        // Unparsable values fall back instead of crashing startup.
        assert_eq!(config.read_batch_size, DEFAULT_READ_BATCH_SIZE);
        assert_eq!(config.group, DEFAULT_GROUP);
    }
}
