//! Error types for coherence synchronizers
//!
//! This module provides:
//! - Structured error types with descriptive messages
//! - Stable error codes for programmatic handling
//! - Error categories for grouping and filtering
//! - JSON serialization for embedding applications
//! - The single [`ErrorReporter`] hook every isolation boundary reports into
//!
//! # Propagation
//!
//! Argument and configuration errors are returned to the caller at the point
//! of misuse. Listener and subscriber failures never propagate to the emitter;
//! they are handed to the injected [`ErrorReporter`] and execution continues.
//!
//! # Example
//!
//! ```rust
//! use coherence_core::error::{SyncError, ErrorCategory};
//!
//! fn handle_error(err: SyncError) {
//!     match err.category() {
//!         ErrorCategory::Validation => println!("Invalid input"),
//!         ErrorCategory::Lifecycle => println!("Engine misuse"),
//!         _ => println!("Other error"),
//!     }
//!
//!     if err.is_recoverable() {
//!         println!("Retry may succeed");
//!     }
//! }
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for synchronizer operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Error category for grouping related errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed argument or configuration
    Validation,
    /// A subscriber or listener failed in isolation
    Listener,
    /// Serialization or delivery of an export failed
    Export,
    /// Operation attempted in the wrong lifecycle state
    Lifecycle,
    /// Infrastructure failure (I/O, JSON)
    Internal,
}

/// Errors that can occur in synchronizer operations
#[derive(Error, Debug)]
pub enum SyncError {
    // ═══════════════════════════════════════════════════════════════════════
    // Validation errors
    // ═══════════════════════════════════════════════════════════════════════

    /// Malformed event type, out-of-domain configuration or bad argument
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// Configuration file or value rejected
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    /// Aggregator received an input name it was not configured with
    #[error("Unknown aggregator input: '{name}'. Add it to the aggregator inputs first.")]
    UnknownInput { name: String },

    /// A field source produced a value that cannot be clamped
    #[error("Engine '{engine}' produced a non-finite reading ({value}); tick skipped")]
    InvalidReading { engine: String, value: f64 },

    // ═══════════════════════════════════════════════════════════════════════
    // Isolation errors (reported, never propagated to the emitter)
    // ═══════════════════════════════════════════════════════════════════════

    /// A bus listener or engine subscriber failed
    #[error("Listener '{subscriber}' failed on '{event_type}': {reason}")]
    ListenerFailure {
        event_type: String,
        subscriber: String,
        reason: String,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Export errors
    // ═══════════════════════════════════════════════════════════════════════

    /// Rendering or delivering an export artifact failed
    #[error("Export failed: {reason}")]
    ExportFailure { reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle errors
    // ═══════════════════════════════════════════════════════════════════════

    /// Operation attempted on an engine after `destroy()`
    #[error("Engine '{engine}' has been destroyed and can no longer be used")]
    EngineAlreadyDestroyed { engine: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Infrastructure errors
    // ═══════════════════════════════════════════════════════════════════════

    /// JSON serialization or deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O operation failed
    #[error("IO error: {message}")]
    Io { message: String },
}

impl SyncError {
    /// Shorthand for [`SyncError::InvalidArgument`]
    pub fn invalid(reason: impl Into<String>) -> Self {
        SyncError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Returns true if this error might succeed on retry
    ///
    /// Listener failures and bad readings are transient: the next emission
    /// or tick runs normally. Export failures may succeed once the sink
    /// recovers. Everything else needs different input or a new instance.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::ListenerFailure { .. }
                | SyncError::InvalidReading { .. }
                | SyncError::ExportFailure { .. }
                | SyncError::Io { .. }
        )
    }

    /// Returns the error category for grouping
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::InvalidArgument { .. }
            | SyncError::Config { .. }
            | SyncError::UnknownInput { .. }
            | SyncError::InvalidReading { .. } => ErrorCategory::Validation,

            SyncError::ListenerFailure { .. } => ErrorCategory::Listener,

            SyncError::ExportFailure { .. } => ErrorCategory::Export,

            SyncError::EngineAlreadyDestroyed { .. } => ErrorCategory::Lifecycle,

            SyncError::Json(_) | SyncError::Io { .. } => ErrorCategory::Internal,
        }
    }

    /// Returns the stable error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            SyncError::InvalidArgument { .. } => "INVALID_ARGUMENT",
            SyncError::Config { .. } => "INVALID_CONFIG",
            SyncError::UnknownInput { .. } => "UNKNOWN_INPUT",
            SyncError::InvalidReading { .. } => "INVALID_READING",
            SyncError::ListenerFailure { .. } => "LISTENER_FAILURE",
            SyncError::ExportFailure { .. } => "EXPORT_FAILURE",
            SyncError::EngineAlreadyDestroyed { .. } => "ENGINE_ALREADY_DESTROYED",
            SyncError::Json(_) => "JSON_ERROR",
            SyncError::Io { .. } => "IO_ERROR",
        }
    }

    /// Converts this error to a JSON-serializable response object
    ///
    /// ```json
    /// {
    ///   "error": {
    ///     "code": "LISTENER_FAILURE",
    ///     "message": "Listener 'chart' failed on 'consciousness:update': ...",
    ///     "category": "listener",
    ///     "recoverable": true
    ///   }
    /// }
    /// ```
    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.to_string(),
                category: self.category(),
                recoverable: self.is_recoverable(),
            },
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io {
            message: err.to_string(),
        }
    }
}

/// JSON-serializable error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error details
    pub error: ErrorDetail,
}

/// Error detail for JSON responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable error code (e.g., "LISTENER_FAILURE")
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Error category
    pub category: ErrorCategory,
    /// Whether retry might succeed
    pub recoverable: bool,
}

/// Hook the core calls into whenever a failure is isolated instead of returned
///
/// The embedding application decides how to surface these (toast, log,
/// status bar). Implementations must not panic.
pub trait ErrorReporter: Send + Sync {
    /// Called once per isolated failure
    fn report(&self, error: &SyncError);
}

/// Default reporter: structured log line per failure
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, error: &SyncError) {
        match error.category() {
            ErrorCategory::Lifecycle | ErrorCategory::Internal => tracing::error!(
                code = error.error_code(),
                category = ?error.category(),
                "{}",
                error
            ),
            _ => tracing::warn!(
                code = error.error_code(),
                category = ?error.category(),
                "{}",
                error
            ),
        }
    }
}

/// Reporter that keeps every report in memory
///
/// Useful in tests and for embedders that poll for failures to display.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    reports: Mutex<Vec<ErrorDetail>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all reports so far, oldest first
    pub fn reports(&self) -> Vec<ErrorDetail> {
        self.reports.lock().clone()
    }

    /// Number of reports with the given error code
    pub fn count_code(&self, code: &str) -> usize {
        self.reports.lock().iter().filter(|r| r.code == code).count()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }

    /// Drain all reports
    pub fn take(&self) -> Vec<ErrorDetail> {
        std::mem::take(&mut *self.reports.lock())
    }
}

impl ErrorReporter for MemoryReporter {
    fn report(&self, error: &SyncError) {
        self.reports.lock().push(error.to_error_response().error);
    }
}

/// Render a caught panic payload as text
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_recoverable() {
        assert!(SyncError::ListenerFailure {
            event_type: "a:b".to_string(),
            subscriber: "s".to_string(),
            reason: "boom".to_string(),
        }
        .is_recoverable());
        assert!(SyncError::ExportFailure {
            reason: "disk full".to_string()
        }
        .is_recoverable());
        assert!(!SyncError::EngineAlreadyDestroyed {
            engine: "field".to_string()
        }
        .is_recoverable());
        assert!(!SyncError::invalid("empty event type").is_recoverable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(SyncError::invalid("x").error_code(), "INVALID_ARGUMENT");
        assert_eq!(
            SyncError::EngineAlreadyDestroyed {
                engine: "e".to_string()
            }
            .error_code(),
            "ENGINE_ALREADY_DESTROYED"
        );
        assert_eq!(
            SyncError::UnknownInput {
                name: "b".to_string()
            }
            .error_code(),
            "UNKNOWN_INPUT"
        );
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(SyncError::invalid("x").category(), ErrorCategory::Validation);
        assert_eq!(
            SyncError::ExportFailure {
                reason: "x".to_string()
            }
            .category(),
            ErrorCategory::Export
        );
        assert_eq!(
            SyncError::EngineAlreadyDestroyed {
                engine: "e".to_string()
            }
            .category(),
            ErrorCategory::Lifecycle
        );
    }

    #[test]
    fn test_error_response_serialization() {
        let err = SyncError::ListenerFailure {
            event_type: "consciousness:update".to_string(),
            subscriber: "chart-1".to_string(),
            reason: "boom".to_string(),
        };
        let response = err.to_error_response();

        let json = serde_json::to_string_pretty(&response).unwrap();
        assert!(json.contains("LISTENER_FAILURE"));
        assert!(json.contains("chart-1"));
        assert!(json.contains("\"listener\""));

        let parsed: ErrorResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.error.code, "LISTENER_FAILURE");
        assert!(parsed.error.recoverable);
    }

    #[test]
    fn test_memory_reporter_collects() {
        let reporter = MemoryReporter::new();
        reporter.report(&SyncError::invalid("one"));
        reporter.report(&SyncError::ExportFailure {
            reason: "two".to_string(),
        });

        assert_eq!(reporter.len(), 2);
        assert_eq!(reporter.count_code("INVALID_ARGUMENT"), 1);
        assert_eq!(reporter.take().len(), 2);
        assert!(reporter.is_empty());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload.as_ref()), "static str");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
    }
}
