//! Error and Result types for state history operations.

use statehist_types::{Quark, StateValueTypeError, Timestamp};
use std::io;
use thiserror::Error;

/// A convenience `Result` type for state history operations.
pub type Result<T> = std::result::Result<T, StateSystemError>;

/// Every way a timestamp can be rejected, at write or at query time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeRangeError {
    /// Query timestamp outside the range covered by the history.
    #[error("timestamp {timestamp} outside of history range [{start}, {end}]")]
    OutOfBounds {
        timestamp: Timestamp,
        start: Timestamp,
        end: Timestamp,
    },

    /// Range whose start is after its end.
    #[error("inverted time range [{start}, {end}]")]
    InvertedRange { start: Timestamp, end: Timestamp },

    /// Interval starting before the store's start time.
    #[error("interval start {start} precedes history start {history_start}")]
    BeforeStart {
        start: Timestamp,
        history_start: Timestamp,
    },

    /// Write at a time earlier than the last write on the same attribute.
    #[error("write at {timestamp} on quark {quark} precedes its last write at {last}")]
    NonMonotonic {
        quark: Quark,
        timestamp: Timestamp,
        last: Timestamp,
    },

    /// Sampling resolution that is not strictly positive.
    #[error("sampling resolution must be positive, got {0}")]
    InvalidResolution(i64),
}

/// The error type for state history operations.
#[derive(Debug, Error)]
pub enum StateSystemError {
    /// A path or quark does not resolve to an attribute.
    #[error("attribute not found: {0}")]
    AttributeNotFound(String),

    /// Timestamp outside the valid bounds of the history.
    #[error("time range error: {0}")]
    TimeRange(#[from] TimeRangeError),

    /// Value unboxed or written as the wrong type.
    #[error("state value type error: {0}")]
    StateValueType(#[from] StateValueTypeError),

    /// Increment of a counter already at the maximum of its type.
    #[error("counter on quark {quark} overflows at {value}")]
    CounterOverflow { quark: Quark, value: i64 },

    /// The backend cannot answer this kind of query.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// A persisted history file failed validation on open.
    #[error("corrupt persisted state: {0}")]
    CorruptPersistedState(String),

    /// The history has been disposed.
    #[error("state system has been disposed")]
    Disposed,

    /// Write attempted after the history was closed.
    #[error("state history is already built")]
    AlreadyBuilt,

    /// Construction stopped on an earlier error; the history stays partial.
    #[error("state history construction was aborted")]
    BuildAborted,

    /// A registry already holds a history under this id.
    #[error("a history is already registered under '{0}'")]
    HistoryAlreadyRegistered(String),

    /// An interval that does not fit in an empty tree node.
    #[error("interval of {size} bytes does not fit in a node with {capacity} bytes of room")]
    IntervalTooLarge { size: usize, capacity: usize },

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StateSystemError {
    pub fn is_time_range(&self) -> bool {
        matches!(self, Self::TimeRange(_))
    }

    pub fn is_attribute_not_found(&self) -> bool {
        matches!(self, Self::AttributeNotFound(_))
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::UnsupportedOperation(_))
    }

    pub(crate) fn quark_not_found(quark: Quark) -> Self {
        Self::AttributeNotFound(format!("quark {}", quark))
    }
}
