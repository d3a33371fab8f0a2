//! Interval store abstraction
//!
//! Every history keeps its closed intervals in a [`StateHistoryBackend`].
//! The façade owns the open (ongoing) values; a backend only ever sees
//! intervals that are final.

pub mod history_tree;
pub mod memory;
pub mod partial;

use crate::attribute::AttributeTree;
use crate::error::{Result, TimeRangeError};
use statehist_types::{Quark, StateInterval, Timestamp};

pub use history_tree::HistoryTreeBackend;
pub use memory::MemoryBackend;
pub use partial::PartialHistoryBackend;

/// Trait for interval store implementations
///
/// Queries take `&self` and may run from many threads once construction is
/// over. Inserts take `&mut self` and come from the single writer.
pub trait StateHistoryBackend: Send + Sync {
    /// Earliest timestamp the store covers
    fn start_time(&self) -> Timestamp;

    /// Latest timestamp covered by a stored interval or by the close time
    fn end_time(&self) -> Timestamp;

    /// Store one closed interval
    fn insert(&mut self, interval: StateInterval) -> Result<()>;

    /// Freeze the store. No insert is accepted afterwards.
    fn finished_building(&mut self, end_time: Timestamp, attributes: &AttributeTree) -> Result<()>;

    /// Fill `states[q]` with the interval of quark `q` covering `t`.
    /// Slots of quarks without a stored interval at `t` are left untouched.
    fn query_full(&self, t: Timestamp, states: &mut [Option<StateInterval>]) -> Result<()>;

    /// Interval of `quark` covering `t`, if one is stored
    fn query_single(&self, t: Timestamp, quark: Quark) -> Result<Option<StateInterval>>;

    /// Stored intervals of `quark` intersecting `[t1, t2]`, ordered by start
    fn query_range(&self, quark: Quark, t1: Timestamp, t2: Timestamp)
    -> Result<Vec<StateInterval>>;

    /// Intervals of `quark` touching one of the sample points
    /// `t1, t1 + resolution, ...` and `t2`, each reported once.
    fn query_sampled(
        &self,
        quark: Quark,
        t1: Timestamp,
        t2: Timestamp,
        resolution: i64,
    ) -> Result<Vec<StateInterval>> {
        check_range(t1, t2, self.start_time(), self.end_time())?;
        check_resolution(resolution)?;

        let mut intervals: Vec<StateInterval> = Vec::new();
        let mut t = t1;
        loop {
            let next = match self.query_single(t, quark)? {
                Some(interval) => {
                    let next = next_sample(t1, interval.end, resolution);
                    if intervals.last().map(|last| last.start) != Some(interval.start) {
                        intervals.push(interval);
                    }
                    next
                }
                None => t.checked_add(resolution),
            };
            match next {
                Some(next) if next <= t2 => t = next,
                _ if t < t2 => {
                    // Sample t2 itself once the regular points run out.
                    if let Some(interval) = self.query_single(t2, quark)?
                        && intervals.last().map(|last| last.start) != Some(interval.start)
                    {
                        intervals.push(interval);
                    }
                    break;
                }
                _ => break,
            }
        }
        Ok(intervals)
    }

    /// Get store statistics
    fn stats(&self) -> BackendStats;

    /// Release every resource held by the store, files included
    fn dispose(&mut self) -> Result<()>;
}

/// Interval store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendStats {
    /// Number of stored intervals
    pub interval_count: u64,
    /// Number of tree nodes (zero for non-paginated stores)
    pub node_count: u64,
    /// Bytes written to disk
    pub size_bytes: u64,
}

/// First sample point strictly after `end`.
fn next_sample(t1: Timestamp, end: Timestamp, resolution: i64) -> Option<Timestamp> {
    let steps = end.checked_sub(t1)? / resolution + 1;
    steps.checked_mul(resolution)?.checked_add(t1)
}

pub(crate) fn check_time(t: Timestamp, start: Timestamp, end: Timestamp) -> Result<()> {
    if t < start || t > end {
        return Err(TimeRangeError::OutOfBounds {
            timestamp: t,
            start,
            end,
        }
        .into());
    }
    Ok(())
}

pub(crate) fn check_range(
    t1: Timestamp,
    t2: Timestamp,
    start: Timestamp,
    end: Timestamp,
) -> Result<()> {
    if t1 > t2 {
        return Err(TimeRangeError::InvertedRange { start: t1, end: t2 }.into());
    }
    check_time(t1, start, end)?;
    check_time(t2, start, end)
}

pub(crate) fn check_resolution(resolution: i64) -> Result<()> {
    if resolution <= 0 {
        return Err(TimeRangeError::InvalidResolution(resolution).into());
    }
    Ok(())
}

/// Validate an interval against a store starting at `store_start`.
pub(crate) fn check_insert(interval: &StateInterval, store_start: Timestamp) -> Result<()> {
    if interval.start > interval.end {
        return Err(TimeRangeError::InvertedRange {
            start: interval.start,
            end: interval.end,
        }
        .into());
    }
    if interval.start < store_start {
        return Err(TimeRangeError::BeforeStart {
            start: interval.start,
            history_start: store_start,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_sample() {
        assert_eq!(next_sample(0, 0, 10), Some(10));
        assert_eq!(next_sample(0, 9, 10), Some(10));
        assert_eq!(next_sample(0, 10, 10), Some(20));
        assert_eq!(next_sample(5, 27, 10), Some(35));
        assert_eq!(next_sample(0, i64::MAX - 1, 10), None);
    }

    #[test]
    fn test_bounds_helpers() {
        assert!(check_time(5, 0, 10).is_ok());
        assert!(check_time(11, 0, 10).unwrap_err().is_time_range());
        assert!(check_range(3, 2, 0, 10).unwrap_err().is_time_range());
        assert!(check_range(0, 10, 0, 10).is_ok());
        assert!(check_resolution(0).is_err());
    }

    #[test]
    fn test_check_insert() {
        use statehist_types::StateValue;
        let bad = StateInterval::new(5, 4, 0, StateValue::Null);
        assert!(check_insert(&bad, 0).is_err());
        let early = StateInterval::new(-1, 4, 0, StateValue::Null);
        assert!(check_insert(&early, 0).is_err());
        let ok = StateInterval::new(0, 0, 0, StateValue::Null);
        assert!(check_insert(&ok, 0).is_ok());
    }
}
