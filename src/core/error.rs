// SPDX-License-Identifier: MIT OR Apache-2.0

//! Engine error types.
//!
//! One error enum covers every condition the engine surfaces to its
//! callers. Per-record failures inside a batch are accumulated and
//! returned alongside the batch result rather than aborting it; only
//! store-level and pool-level failures travel through these variants.

use thiserror::Error;

/// Result type for engine operations
pub type MarkovResult<T> = Result<T, MarkovError>;

/// Errors surfaced by the generation engine
#[derive(Error, Debug)]
pub enum MarkovError {
    #[error("Invalid input: {message}")]
    InvalidInput {
        message: String,
        field: Option<String>,
    },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Corrupt snapshot: {message}")]
    Corrupt {
        message: String,
        path: Option<String>,
    },

    #[error("Training already in progress: {message}")]
    Contention { message: String, pid: Option<u32> },

    #[error("Task cancelled: {message}")]
    Cancelled { message: String },

    #[error("Worker failure: {message}")]
    Worker {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MarkovError {
    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
            field: None,
        }
    }

    /// Create an invalid input error naming the offending field or key
    pub fn invalid_input_for(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a corrupt snapshot error
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
            path: None,
        }
    }

    /// Create a corrupt snapshot error carrying the offending path
    pub fn corrupt_at(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
            path: Some(path.into()),
        }
    }

    /// Create a contention error
    pub fn contention(message: impl Into<String>) -> Self {
        Self::Contention {
            message: message.into(),
            pid: None,
        }
    }

    /// Create a contention error naming the holding process
    pub fn contention_with_pid(message: impl Into<String>, pid: u32) -> Self {
        Self::Contention {
            message: message.into(),
            pid: Some(pid),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Create a worker failure error
    pub fn worker(message: impl Into<String>) -> Self {
        Self::Worker {
            message: message.into(),
            source: None,
        }
    }

    /// Create a worker failure error wrapping the underlying cause
    pub fn worker_with_source(
        message: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Worker {
            message: message.into(),
            source: Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_input_error() {
        let error = MarkovError::invalid_input_for("weight must be >= 1", "weight");
        assert!(matches!(error, MarkovError::InvalidInput { .. }));
        assert!(error.to_string().contains("weight must be >= 1"));
    }

    #[test]
    fn test_contention_error_carries_pid() {
        let error = MarkovError::contention_with_pid("lock held", 4242);
        match error {
            MarkovError::Contention { pid, .. } => assert_eq!(pid, Some(4242)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let error: MarkovError = io.into();
        assert!(matches!(error, MarkovError::Io(_)));
    }
}
