//! State change input.
//!
//! Upstream parsers turn raw trace events into an ordered stream of
//! `(timestamp, attribute path, value)` changes. This module defines that
//! contract and a simple recorded implementation of it.

use serde::{Deserialize, Serialize};
use statehist_types::{StateValue, Timestamp};

/// "At `timestamp`, the attribute at `path` took `value`."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub timestamp: Timestamp,
    pub path: Vec<String>,
    pub value: StateValue,
}

impl StateChange {
    pub fn new<S, V>(timestamp: Timestamp, path: &[S], value: V) -> Self
    where
        S: AsRef<str>,
        V: Into<StateValue>,
    {
        Self {
            timestamp,
            path: path.iter().map(|s| s.as_ref().to_string()).collect(),
            value: value.into(),
        }
    }
}

/// A replayable, time-ordered stream of state changes.
///
/// Partial histories only store periodic checkpoints and replay the
/// source between a checkpoint and the queried time, so the same source
/// must be available when such a history is queried.
pub trait EventSource: Send + Sync {
    /// Timestamp of the first change the source can produce
    fn start_time(&self) -> Timestamp;

    /// Timestamp of the last change
    fn end_time(&self) -> Timestamp;

    /// Changes with `from <= timestamp <= to`, in timestamp order
    fn changes(&self, from: Timestamp, to: Timestamp)
    -> Box<dyn Iterator<Item = &StateChange> + '_>;
}

/// An in-memory event source.
///
/// # Examples
///
/// ```rust
/// use statehist::{EventSource, RecordedEvents, StateChange};
///
/// let events = RecordedEvents::new(vec![
///     StateChange::new(10, &["cpu"], 1),
///     StateChange::new(20, &["cpu"], 0),
/// ]);
/// assert_eq!(events.changes(15, 30).count(), 1);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordedEvents {
    changes: Vec<StateChange>,
}

impl RecordedEvents {
    /// Wrap `changes`, ordering them by timestamp. Changes sharing a
    /// timestamp keep their relative order.
    pub fn new(mut changes: Vec<StateChange>) -> Self {
        changes.sort_by_key(|change| change.timestamp);
        Self { changes }
    }

    /// Append a change, keeping timestamp order.
    pub fn push(&mut self, change: StateChange) {
        let pos = self
            .changes
            .partition_point(|existing| existing.timestamp <= change.timestamp);
        self.changes.insert(pos, change);
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StateChange> {
        self.changes.iter()
    }
}

impl EventSource for RecordedEvents {
    fn start_time(&self) -> Timestamp {
        self.changes.first().map_or(0, |change| change.timestamp)
    }

    fn end_time(&self) -> Timestamp {
        self.changes.last().map_or(0, |change| change.timestamp)
    }

    fn changes(
        &self,
        from: Timestamp,
        to: Timestamp,
    ) -> Box<dyn Iterator<Item = &StateChange> + '_> {
        let first = self.changes.partition_point(|change| change.timestamp < from);
        Box::new(
            self.changes[first..]
                .iter()
                .take_while(move |change| change.timestamp <= to),
        )
    }
}

impl FromIterator<StateChange> for RecordedEvents {
    fn from_iter<I: IntoIterator<Item = StateChange>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
