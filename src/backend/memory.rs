//! In-memory interval store.

use super::{BackendStats, StateHistoryBackend, check_insert, check_range, check_time};
use crate::attribute::AttributeTree;
use crate::error::{Result, StateSystemError};
use statehist_types::{Quark, StateInterval, Timestamp};
use std::collections::BTreeMap;

/// Interval store bounded by process memory.
///
/// Each quark keeps its intervals in a `BTreeMap` keyed by start time, so
/// inserts may arrive in any order.
pub struct MemoryBackend {
    start: Timestamp,
    end: Timestamp,
    intervals: Vec<BTreeMap<Timestamp, StateInterval>>,
    stats: BackendStats,
    finished: bool,
}

impl MemoryBackend {
    /// Create an empty store starting at `start`
    pub fn new(start: Timestamp) -> Self {
        Self {
            start,
            end: start,
            intervals: Vec::new(),
            stats: BackendStats::default(),
            finished: false,
        }
    }

    fn quark_intervals(&self, quark: Quark) -> Option<&BTreeMap<Timestamp, StateInterval>> {
        usize::try_from(quark)
            .ok()
            .and_then(|index| self.intervals.get(index))
    }

    fn covering(&self, quark: Quark, t: Timestamp) -> Option<&StateInterval> {
        self.quark_intervals(quark)?
            .range(..=t)
            .next_back()
            .map(|(_, interval)| interval)
            .filter(|interval| interval.end >= t)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(0)
    }
}

impl StateHistoryBackend for MemoryBackend {
    fn start_time(&self) -> Timestamp {
        self.start
    }

    fn end_time(&self) -> Timestamp {
        self.end
    }

    fn insert(&mut self, interval: StateInterval) -> Result<()> {
        if self.finished {
            return Err(StateSystemError::AlreadyBuilt);
        }
        check_insert(&interval, self.start)?;
        let index = usize::try_from(interval.quark)
            .map_err(|_| StateSystemError::quark_not_found(interval.quark))?;

        if index >= self.intervals.len() {
            self.intervals.resize_with(index + 1, BTreeMap::new);
        }
        self.end = self.end.max(interval.end);
        if self.intervals[index]
            .insert(interval.start, interval)
            .is_none()
        {
            self.stats.interval_count += 1;
        }
        Ok(())
    }

    fn finished_building(&mut self, end_time: Timestamp, _attributes: &AttributeTree) -> Result<()> {
        self.end = self.end.max(end_time);
        self.finished = true;
        log::debug!(
            "In-memory history closed at {} with {} intervals",
            self.end,
            self.stats.interval_count
        );
        Ok(())
    }

    fn query_full(&self, t: Timestamp, states: &mut [Option<StateInterval>]) -> Result<()> {
        check_time(t, self.start, self.end)?;
        for (quark, slot) in states.iter_mut().enumerate() {
            if let Some(interval) = self.covering(quark as Quark, t) {
                *slot = Some(interval.clone());
            }
        }
        Ok(())
    }

    fn query_single(&self, t: Timestamp, quark: Quark) -> Result<Option<StateInterval>> {
        check_time(t, self.start, self.end)?;
        Ok(self.covering(quark, t).cloned())
    }

    fn query_range(
        &self,
        quark: Quark,
        t1: Timestamp,
        t2: Timestamp,
    ) -> Result<Vec<StateInterval>> {
        check_range(t1, t2, self.start, self.end)?;
        let Some(map) = self.quark_intervals(quark) else {
            return Ok(Vec::new());
        };
        // Intervals of one quark never overlap, so ends grow with starts.
        let mut intervals: Vec<StateInterval> = map
            .range(..=t2)
            .rev()
            .map(|(_, interval)| interval)
            .take_while(|interval| interval.end >= t1)
            .cloned()
            .collect();
        intervals.reverse();
        Ok(intervals)
    }

    fn stats(&self) -> BackendStats {
        self.stats.clone()
    }

    fn dispose(&mut self) -> Result<()> {
        self.intervals.clear();
        self.stats = BackendStats::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statehist_types::StateValue;

    fn backend_with(intervals: &[(Timestamp, Timestamp, Quark, &str)]) -> MemoryBackend {
        let mut backend = MemoryBackend::new(0);
        for &(start, end, quark, value) in intervals {
            backend
                .insert(StateInterval::new(start, end, quark, value.into()))
                .unwrap();
        }
        backend
    }

    #[test]
    fn test_boundary_resolves_to_later_interval() {
        let backend = backend_with(&[(10, 19, 0, "A"), (20, 29, 0, "B")]);
        let at = |t| backend.query_single(t, 0).unwrap().unwrap().value;
        assert_eq!(at(15), StateValue::from("A"));
        assert_eq!(at(25), StateValue::from("B"));
        assert_eq!(at(20), StateValue::from("B"));
        assert_eq!(at(19), StateValue::from("A"));
    }

    #[test]
    fn test_gaps_and_unknown_quarks() {
        let backend = backend_with(&[(10, 19, 0, "A"), (25, 29, 0, "B")]);
        assert!(backend.query_single(5, 0).unwrap().is_none());
        assert!(backend.query_single(22, 0).unwrap().is_none());
        assert!(backend.query_single(15, 7).unwrap().is_none());
        assert!(backend.query_single(30, 0).unwrap_err().is_time_range());
    }

    #[test]
    fn test_unordered_insert() {
        let backend = backend_with(&[(20, 29, 0, "B"), (0, 9, 1, "x"), (10, 19, 0, "A")]);
        let range = backend.query_range(0, 0, 29).unwrap();
        let starts: Vec<_> = range.iter().map(|i| i.start).collect();
        assert_eq!(starts, vec![10, 20]);
        assert_eq!(backend.stats().interval_count, 3);
    }

    #[test]
    fn test_full_query_leaves_unknown_slots() {
        let backend = backend_with(&[(0, 9, 0, "a"), (5, 9, 2, "c")]);
        let mut states = vec![None; 4];
        backend.query_full(3, &mut states).unwrap();
        assert!(states[0].is_some());
        assert!(states[1].is_none());
        assert!(states[2].is_none());
        backend.query_full(6, &mut states).unwrap();
        assert_eq!(states[2].as_ref().unwrap().value, StateValue::from("c"));
    }

    #[test]
    fn test_range_edges() {
        let backend = backend_with(&[(0, 9, 0, "a"), (10, 19, 0, "b"), (20, 29, 0, "c")]);
        assert_eq!(backend.query_range(0, 9, 10).unwrap().len(), 2);
        assert_eq!(backend.query_range(0, 12, 18).unwrap().len(), 1);
        assert_eq!(backend.query_range(0, 0, 29).unwrap().len(), 3);
        assert!(backend.query_range(0, 18, 12).is_err());
    }

    #[test]
    fn test_sampled_range() {
        let backend = backend_with(&[
            (0, 1, 0, "a"),
            (2, 3, 0, "b"),
            (4, 11, 0, "c"),
            (12, 12, 0, "d"),
            (13, 20, 0, "e"),
        ]);
        let sampled = backend.query_sampled(0, 0, 20, 5).unwrap();
        let values: Vec<String> = sampled.iter().map(|i| i.value.to_string()).collect();
        // Samples at 0, 5, 10, 15, 20: "b" and "d" fall between points.
        assert_eq!(values, vec!["\"a\"", "\"c\"", "\"e\""]);

        let sampled = backend.query_sampled(0, 0, 12, 5).unwrap();
        assert_eq!(sampled.last().unwrap().value, StateValue::from("d"));
        assert!(backend.query_sampled(0, 0, 12, 0).is_err());
    }

    #[test]
    fn test_rejects_bad_intervals() {
        let mut backend = MemoryBackend::new(100);
        let err = backend
            .insert(StateInterval::new(50, 150, 0, StateValue::Null))
            .unwrap_err();
        assert!(err.is_time_range());
        assert!(
            backend
                .insert(StateInterval::new(150, 140, 0, StateValue::Null))
                .is_err()
        );
    }

    #[test]
    fn test_insert_after_close() {
        let mut backend = MemoryBackend::new(0);
        backend.finished_building(10, &AttributeTree::new()).unwrap();
        assert_eq!(backend.end_time(), 10);
        assert!(matches!(
            backend.insert(StateInterval::new(0, 1, 0, StateValue::Null)),
            Err(StateSystemError::AlreadyBuilt)
        ));
    }
}
