use std::io;

use crate::{ProcessMode, StoreId};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The name of the current process could not be determined yet.
    ///
    /// Name resolution can be transiently unavailable right after process start. Retry after a
    /// short delay.
    #[error("process name detection failed, try again later")]
    ProcessNameUnavailable,

    /// The owning process's broker endpoint could not be resolved or reached.
    #[error("broker unreachable: {reason}")]
    BrokerUnreachable {
        reason: String,
        #[source]
        source: Option<io::Error>,
    },

    /// A received envelope lacks a usable descriptor.
    #[error("invalid envelope for store [{id}]: {reason}")]
    InvalidEnvelope { id: String, reason: &'static str },

    /// The store is held under the other process mode by someone else.
    #[error("store [{id}] requested as {requested} but opened as {actual} by someone else")]
    ModeMismatch {
        id: StoreId,
        requested: ProcessMode,
        actual: ProcessMode,
    },

    /// The native layer did not produce a valid handle.
    #[error("failed to create store [{id}]")]
    CreationError {
        id: StoreId,
        #[source]
        source: Option<io::Error>,
    },

    /// An anonymous store has no room left for the write. It can not grow.
    #[error("store [{id}] of fixed size {capacity} can not hold {required} bytes")]
    FixedSizeExceeded {
        id: StoreId,
        capacity: usize,
        required: usize,
    },

    /// The owning process answered the request with an error.
    #[error("broker rejected store [{id}]: {message}")]
    Rejected { id: String, message: String },

    /// A frame on the broker connection could not be understood.
    #[error("broker protocol violation: {0}")]
    Protocol(String),

    /// The handle was closed.
    #[error("store [{0}] is closed")]
    Closed(StoreId),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the same request may succeed when simply repeated later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ProcessNameUnavailable)
    }

    pub(crate) fn unreachable(reason: impl Into<String>, source: Option<io::Error>) -> Self {
        Error::BrokerUnreachable {
            reason: reason.into(),
            source,
        }
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
