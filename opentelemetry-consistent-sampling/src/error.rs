//! Errors returned by this crate.
use opentelemetry_sdk::trace::TraceError;
use thiserror::Error;

/// A specialized `Result` type for operations on the `ot` trace state entry.
pub type ConsistentSamplingResult<T> = Result<T, ConsistentSamplingError>;

/// Structural reason an `ot` trace state payload was rejected.
///
/// Only returned by the strict entry points ([`OtelTraceState::try_parse`] and
/// its [`FromStr`] impl). Out-of-range `p` or `r` values are not structural and
/// never produce a `ParseError`.
///
/// [`OtelTraceState::try_parse`]: crate::OtelTraceState::try_parse
/// [`FromStr`]: std::str::FromStr
#[derive(Error, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// The payload was empty.
    #[error("the `ot` trace state entry is empty")]
    Empty,

    /// The payload exceeded the trace state size limit.
    #[error("the `ot` trace state entry is {len} characters long, the limit is 256")]
    TooLong {
        /// Length of the rejected payload.
        len: usize,
    },

    /// An entry between two separators (or at either end) was empty.
    #[error("empty entry at offset {offset} in the `ot` trace state entry")]
    EmptyEntry {
        /// Byte offset of the empty entry.
        offset: usize,
    },

    /// A key was empty, did not start with a lowercase letter, or contained
    /// a character outside `[a-z0-9]`.
    #[error("invalid key character at offset {offset} in the `ot` trace state entry")]
    InvalidKey {
        /// Byte offset of the offending character.
        offset: usize,
    },

    /// A key was not followed by `:`.
    #[error("missing `:` after the key ending at offset {offset} in the `ot` trace state entry")]
    MissingKeyValueSeparator {
        /// Byte offset where the `:` was expected.
        offset: usize,
    },

    /// A value contained a character outside `[a-zA-Z0-9._-]`.
    #[error("invalid value character at offset {offset} in the `ot` trace state entry")]
    InvalidValue {
        /// Byte offset of the offending character.
        offset: usize,
    },

    /// The payload ended with a `;`.
    #[error("the `ot` trace state entry ends with a separator")]
    TrailingSeparator,
}

/// Errors returned when reading or writing the `ot` entry of a W3C
/// [`TraceState`].
///
/// [`TraceState`]: opentelemetry::trace::TraceState
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConsistentSamplingError {
    /// The `ot` entry is structurally invalid.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The W3C trace state rejected the update.
    #[error(transparent)]
    TraceState(#[from] TraceError),
}
