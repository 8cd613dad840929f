//! Error types for Tessera
//!
//! Every engine operation returns [`Result<T>`]. Backend-native failures are
//! re-wrapped into these kinds before they cross the engine boundary.

use crate::types::{BackendKind, SegmentLocation, VectorId};
use std::io;
use thiserror::Error;

/// Result type alias for Tessera operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the storage and indexing core
#[derive(Debug, Error)]
pub enum Error {
    /// Vector length doesn't match the table/segment dimension
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Dimension fixed by the descriptor
        expected: usize,
        /// Length of the offending vector
        got: usize,
    },

    /// Explicit id already present in the target segment (or repeated in the batch)
    #[error("Duplicate id: {id}")]
    DuplicateId {
        /// The conflicting id
        id: VectorId,
    },

    /// Two merge sources carry the same live id
    #[error("Merge id conflict: {id} present in more than one source segment")]
    MergeIdConflict {
        /// The conflicting id
        id: VectorId,
    },

    /// Segment has neither a built backend nor a raw buffer
    #[error("Segment not ready: {reason}")]
    NotReady {
        /// Why the segment cannot serve the request
        reason: String,
    },

    /// I/O failure during serialize/load/merge/log operations
    #[error("I/O error ({context}): {source}")]
    Io {
        /// What the engine was doing
        context: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Checksum or format mismatch while loading a segment
    #[error("Corrupted segment {location}: {reason}")]
    CorruptedSegment {
        /// Segment whose files failed validation
        location: SegmentLocation,
        /// What failed
        reason: String,
    },

    /// Soft signal: the cache exceeded its budget because every entry is pinned
    #[error("Cache capacity pressure: {resident_bytes} bytes resident, capacity {capacity_bytes}")]
    CacheCapacityPressure {
        /// Bytes currently resident
        resident_bytes: usize,
        /// Configured soft limit
        capacity_bytes: usize,
    },

    /// Backend lacks an optional capability (consumed internally by fallbacks)
    #[error("Backend {backend} does not support {operation}")]
    BackendUnsupportedOperation {
        /// Backend variant
        backend: BackendKind,
        /// Operation name
        operation: &'static str,
    },

    /// Malformed argument
    #[error("Invalid input: {message}")]
    InvalidInput {
        /// Description of the problem
        message: String,
    },

    /// Table with given name was not found
    #[error("Table not found: {name}")]
    TableNotFound {
        /// Table name
        name: String,
    },

    /// Table with given name already exists
    #[error("Table already exists: {name}")]
    TableAlreadyExists {
        /// Table name
        name: String,
    },

    /// Long-running operation was cancelled; committed state is untouched
    #[error("Operation cancelled")]
    Cancelled,

    /// Session call made after disconnect
    #[error("Session is not connected")]
    NotConnected,

    /// Encoding/decoding of a metadata or log body failed
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the failure
        message: String,
    },
}

impl Error {
    /// Wrap an `io::Error` with a short context string
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Shorthand for [`Error::InvalidInput`]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Error::InvalidInput {
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::NotReady`]
    pub fn not_ready(reason: impl Into<String>) -> Self {
        Error::NotReady {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`Error::CorruptedSegment`]
    pub fn corrupted(location: &SegmentLocation, reason: impl Into<String>) -> Self {
        Error::CorruptedSegment {
            location: location.clone(),
            reason: reason.into(),
        }
    }

    /// Errors after which prior committed state is guaranteed intact and the
    /// operation may simply be retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Io { .. } | Error::Cancelled | Error::CacheCapacityPressure { .. }
        )
    }

    /// Errors caused by the caller's arguments rather than engine state
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Error::DimensionMismatch { .. }
                | Error::DuplicateId { .. }
                | Error::InvalidInput { .. }
        )
    }

    /// Check if this error indicates the table was not found
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::TableNotFound { .. })
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Serialization {
            message: e.to_string(),
        }
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Serialization {
            message: e.to_string(),
        }
    }
}
