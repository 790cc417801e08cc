use blobbuf_common::LocatorError;
use object_store::path::Path;

/// Errors surfaced by [`BufferedReader`](crate::BufferedReader) operations.
///
/// This layer performs no retries and no local recovery: every failure from
/// the underlying store is surfaced immediately to the caller.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    /// The backend session could not be established from the object locator.
    #[error("cannot establish object store session")]
    Connection(#[from] LocatorError),

    /// The object could not be opened for reading, e.g. because it does not
    /// exist or access is denied.
    #[error("cannot open object {location} for reading")]
    Open {
        /// Location of the object that failed to open.
        location: Path,
        /// Error reported by the store.
        #[source]
        source: object_store::Error,
    },

    /// The reader has been closed; no further operations are possible.
    #[error("reader is closed")]
    InvalidState,

    /// A cache refill received fewer bytes than the cache capacity. The
    /// cached window is left as it was before the refill attempt.
    #[error("short read at offset {offset}: got {actual} of {expected} bytes")]
    ShortRead {
        /// Absolute offset the refill started at.
        offset: u64,
        /// Bytes required to fill the cache window.
        expected: usize,
        /// Bytes actually delivered before the object ended.
        actual: usize,
    },

    /// Transport error from the underlying store, forwarded unmodified.
    #[error(transparent)]
    Transport(#[from] object_store::Error),
}

/// Result type for reader operations.
pub type Result<T, E = ReaderError> = std::result::Result<T, E>;
