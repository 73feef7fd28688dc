//! Error types for the entry store
//!
//! Every layer normalizes the failures of the layer below it into this one
//! type. Disk and transaction failures become [`Error::Storage`] or
//! [`Error::Aborted`], keeping the original error as the `source` so the full
//! cause chain survives for diagnostics.

use thiserror::Error;

/// Boxed cause carried by I/O failures
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Common result type for entry store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the entry store
#[derive(Debug, Error)]
pub enum Error {
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {context}")]
    Storage {
        context: String,
        #[source]
        source: Option<Cause>,
    },

    #[error("transaction aborted: {context}")]
    Aborted {
        context: String,
        #[source]
        source: Option<Cause>,
    },

    #[error("schema mismatch for {type_name}: stored {stored} fields, got {given}")]
    SchemaMismatch {
        type_name: String,
        stored: usize,
        given: usize,
    },

    #[error("unknown entry type: {0}")]
    UnknownType(String),

    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a storage error without an underlying cause
    pub fn storage(context: impl Into<String>) -> Self {
        Self::Storage {
            context: context.into(),
            source: None,
        }
    }

    /// Create a storage error chaining the original cause
    pub fn storage_with(
        context: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            context: context.into(),
            source: Some(Box::new(cause)),
        }
    }

    /// Create an abort error chaining the original cause
    pub fn aborted_with(
        context: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Aborted {
            context: context.into(),
            source: Some(Box::new(cause)),
        }
    }

    /// Create a codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is an I/O failure as seen by callers
    #[must_use]
    pub fn is_io_failure(&self) -> bool {
        matches!(
            self,
            Self::DiskIo(_) | Self::Storage { .. } | Self::Aborted { .. }
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::UnknownType(_))
    }
}
