//! Error types for the reference vector.

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by vector operations.
///
/// Three bands: argument errors leave the vector untouched, structural
/// errors indicate a corrupted backing store or a bug, and `Storage`
/// propagates backing-store failures unchanged.
#[derive(Error, Debug)]
pub enum Error {
    /// Element or hash not present in the vector
    #[error("not found")]
    NotFound,

    /// Index outside `[0, length)`
    #[error("index {index} out of range for length {length}")]
    IndexOutOfRange { index: usize, length: usize },

    /// Slice bounds with `from > to`
    #[error("invalid slice index: {from} > {to}")]
    InvalidSliceIndex { from: usize, to: usize },

    /// Encoded record violates the depth/degree/length constraints
    #[error("invalid encoded refs: {0}")]
    InvalidEncodedRefs(String),

    /// Tree walk failed to locate an element counted by a parent length
    #[error("invalid refs: {0}")]
    InvalidRefs(&'static str),

    /// Element is present but holds the all-zero hash
    #[error("element is nil")]
    ElementIsNil,

    /// Rebuild requested while a traversal is active
    #[error("refs is iterating")]
    Iterating,

    /// Backing-store failure, propagated unchanged
    #[error("storage error: {0}")]
    Storage(String),

    /// Element payload failed to encode or decode
    #[error("payload codec error: {0}")]
    Payload(#[from] postcard::Error),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    /// Create an invalid-encoding error
    pub fn invalid_encoding(msg: impl Into<String>) -> Self {
        Error::InvalidEncodedRefs(msg.into())
    }

    /// Create an out-of-range error for `index` against `length`
    pub fn out_of_range(index: usize, length: usize) -> Self {
        Error::IndexOutOfRange { index, length }
    }
}
