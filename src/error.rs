//! # Error Handling for Conveyor
//!
//! This module defines the error types used throughout the pipeline. We use a
//! single error enum ([`Error`]) to represent all failure modes, which keeps
//! function signatures simple while the *category* of a failure decides how
//! the pipeline reacts to it.
//!
//! ## Error Categories
//!
//! | Category | Variants | Pipeline response |
//! |----------|----------|-------------------|
//! | Bootstrap (fatal) | `Bootstrap` | Abort startup, non-zero exit |
//! | Fetch (recoverable) | `LogUnavailable` during reads | Pause one cycle, retry |
//! | Processing (per-message) | `Processing`, `MalformedPayload`, store failures during the gate | Retry scheduler: backoff or dead-letter |
//! | Publish (boundary) | `Publish`, `InvalidEvent` | Surfaced to the producer's caller |
//! | Signal (not really errors) | `GroupAlreadyExists`, `AlreadyProcessed` | Treated as success by the caller |
//!
//! Per-message failures are always caught by the delivery loop and converted
//! into retry/dead-letter state transitions; only bootstrap failures are
//! allowed to propagate to process exit.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in pipeline operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Bootstrap Errors (fatal - abort startup)
    // =========================================================================

    /// Startup could not complete: the log or store is unreachable, or group
    /// creation failed for a reason other than "already exists".
    #[error("bootstrap failed: {message}")]
    Bootstrap {
        /// What went wrong during startup.
        message: String,
    },

    // =========================================================================
    // Signals (success-shaped, callers treat these as "already done")
    // =========================================================================

    /// The consumer group already exists.
    ///
    /// Group creation is idempotent at the bootstrap level: `ensure_group`
    /// maps this to success. Surfaced as an error variant so the log
    /// implementation doesn't have to guess the caller's intent.
    #[error("consumer group '{group}' already exists")]
    GroupAlreadyExists {
        /// The group that was already present.
        group: String,
    },

    /// A Processed Record for this idempotency key already exists.
    ///
    /// # Not Really an Error
    ///
    /// Raised when the unique index on `idempotency_key` rejects a processed
    /// insert: some other delivery (possibly on another consumer instance)
    /// completed the same logical operation first. The gate treats this as
    /// the benign "already processed" outcome and the message is still
    /// acknowledged.
    #[error("operation '{idempotency_key}' already processed")]
    AlreadyProcessed {
        /// The idempotency key that was already recorded.
        idempotency_key: String,
    },

    // =========================================================================
    // Recoverable / per-message Errors
    // =========================================================================

    /// The log could not be reached or a log operation failed in transport.
    ///
    /// During the fetch step this is a cycle-level failure: the loop logs it,
    /// pauses briefly, and retries the cycle. It is never fatal.
    #[error("event log unavailable: {message}")]
    LogUnavailable {
        /// Underlying transport failure text.
        message: String,
    },

    /// The side effect for a message failed.
    ///
    /// Includes deliberate failures injected through the envelope's
    /// `forced_fail` payload flag. Handled by the retry scheduler; never
    /// crashes the loop.
    #[error("processing failed: {message}")]
    Processing {
        /// Why the side effect could not be applied.
        message: String,
    },

    /// The envelope payload could not be parsed.
    ///
    /// Treated exactly like a processing failure: the message enters the
    /// retry path (and eventually the dead-letter store, payload preserved
    /// verbatim).
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    // =========================================================================
    // Boundary Errors (surfaced to the producer's caller)
    // =========================================================================

    /// The producer could not append the envelope to the log.
    ///
    /// The caller decides whether to retry the publish; duplicate production
    /// is safe because the consumer collapses it on the idempotency key.
    #[error("failed to publish event: {message}")]
    Publish {
        /// Underlying append failure text.
        message: String,
    },

    /// The publish request was rejected before reaching the log.
    #[error("invalid event: {message}")]
    InvalidEvent {
        /// Which field was missing or malformed.
        message: String,
    },

    // =========================================================================
    // Internal Errors (investigate and fix)
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// Wraps any error from the `rusqlite` crate. Note that unique-constraint
    /// violations on the processed table are intercepted by the store and
    /// surfaced as [`Error::AlreadyProcessed`] instead.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Stored data did not match the expected schema (e.g. an unknown status
    /// string read back from the database).
    #[error("schema error: {0}")]
    Schema(String),

    /// A blocking store task could not be joined.
    #[error("task error: {0}")]
    Task(String),
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Error messages appear in logs and retry records; keep them readable.
    #[test]
    fn test_error_display() {
        let publish = Error::Publish {
            message: "connection refused".to_string(),
        };
        assert_eq!(
            publish.to_string(),
            "failed to publish event: connection refused"
        );

        let group = Error::GroupAlreadyExists {
            group: "workers".to_string(),
        };
        assert_eq!(group.to_string(), "consumer group 'workers' already exists");

        let dup = Error::AlreadyProcessed {
            idempotency_key: "idemp-1".to_string(),
        };
        assert_eq!(dup.to_string(), "operation 'idemp-1' already processed");
    }

    /// `?` must convert rusqlite and serde_json errors automatically.
    #[test]
    fn test_from_conversions() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("x".to_string());
        let err: Error = sqlite_err.into();
        assert!(matches!(err, Error::Sqlite(_)));

        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::MalformedPayload(_)));
        assert!(err.to_string().starts_with("malformed payload"));
    }
}
