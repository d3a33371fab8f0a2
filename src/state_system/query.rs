//! Read side of the state history.
//!
//! Queries only see closed intervals. While the history is being built,
//! the time after the last closed interval reads as null.

use super::StateSystem;
use crate::backend::{BackendStats, check_range, check_resolution, check_time};
use crate::error::Result;
use statehist_types::{Quark, StateInterval, Timestamp};

impl StateSystem {
    pub fn start_time(&self) -> Timestamp {
        self.start
    }

    /// Latest time covered by the history: the last write while it is built,
    /// the close time afterwards.
    pub fn current_end_time(&self) -> Timestamp {
        let written = self.transient.lock().latest_time();
        self.backend.read().end_time().max(written)
    }

    /// State of every attribute at `t`, indexed by quark. Attributes
    /// without a value at `t` hold a null interval `[t, t]`.
    pub fn query_full_state(&self, t: Timestamp) -> Result<Vec<StateInterval>> {
        self.ensure_live()?;
        check_time(t, self.start, self.current_end_time())?;

        let mut states = vec![None; self.attributes.len()];
        let backend = self.backend.read();
        if t <= backend.end_time() {
            backend.query_full(t, &mut states)?;
        }
        Ok(states
            .into_iter()
            .enumerate()
            .map(|(quark, state)| state.unwrap_or_else(|| StateInterval::null_at(t, quark as Quark)))
            .collect())
    }

    /// State of `quark` at `t`.
    pub fn query_single_state(&self, t: Timestamp, quark: Quark) -> Result<StateInterval> {
        self.ensure_live()?;
        self.require_quark(quark)?;
        check_time(t, self.start, self.current_end_time())?;

        let backend = self.backend.read();
        let found = if t <= backend.end_time() {
            backend.query_single(t, quark)?
        } else {
            None
        };
        Ok(found.unwrap_or_else(|| StateInterval::null_at(t, quark)))
    }

    /// Intervals of `quark` intersecting `[t1, t2]`, ordered by start.
    pub fn query_history_range(
        &self,
        quark: Quark,
        t1: Timestamp,
        t2: Timestamp,
    ) -> Result<Vec<StateInterval>> {
        self.ensure_live()?;
        self.require_quark(quark)?;
        check_range(t1, t2, self.start, self.current_end_time())?;

        let backend = self.backend.read();
        let stored_end = backend.end_time();
        if t1 > stored_end {
            return Ok(Vec::new());
        }
        backend.query_range(quark, t1, t2.min(stored_end))
    }

    /// Like [`StateSystem::query_history_range`], keeping only the
    /// intervals that cover one of `t1, t1 + resolution, ...` or `t2`.
    pub fn query_history_range_sampled(
        &self,
        quark: Quark,
        t1: Timestamp,
        t2: Timestamp,
        resolution: i64,
    ) -> Result<Vec<StateInterval>> {
        self.ensure_live()?;
        self.require_quark(quark)?;
        check_resolution(resolution)?;
        check_range(t1, t2, self.start, self.current_end_time())?;

        let backend = self.backend.read();
        let stored_end = backend.end_time();
        if t1 > stored_end {
            return Ok(Vec::new());
        }
        backend.query_sampled(quark, t1, t2.min(stored_end), resolution)
    }

    pub fn backend_stats(&self) -> BackendStats {
        self.backend.read().stats()
    }
}

#[cfg(test)]
mod tests {
    use crate::attribute::AttributeTree;
    use crate::backend::MemoryBackend;
    use crate::state_system::StateSystem;
    use statehist_types::StateValue;
    use std::sync::Arc;

    fn boundary_history() -> (StateSystem, i32) {
        let ss = StateSystem::new(
            "q".to_string(),
            Arc::new(AttributeTree::new()),
            Box::new(MemoryBackend::new(0)),
        );
        let q = ss.quark_absolute_and_add(&["q"]).unwrap();
        ss.modify_attribute(10, "A", q).unwrap();
        ss.modify_attribute(20, "B", q).unwrap();
        ss.modify_attribute(30, StateValue::Null, q).unwrap();
        (ss, q)
    }

    #[test]
    fn test_open_interval_is_invisible() {
        let (ss, q) = boundary_history();
        assert_eq!(ss.current_end_time(), 30);
        // [30, ...] is still open: reads as null.
        assert!(ss.query_single_state(30, q).unwrap().value.is_null());
        assert_eq!(ss.query_single_state(25, q).unwrap().value, StateValue::from("B"));
        assert!(ss.query_single_state(31, q).unwrap_err().is_time_range());
    }

    #[test]
    fn test_boundary_example() {
        let (ss, q) = boundary_history();
        ss.close_history(40).unwrap();
        let at = |t| ss.query_single_state(t, q).unwrap().value;
        assert_eq!(at(15), StateValue::from("A"));
        assert_eq!(at(25), StateValue::from("B"));
        assert_eq!(at(20), StateValue::from("B"));
        assert!(at(5).is_null());
    }

    #[test]
    fn test_sentinel_shape() {
        let (ss, q) = boundary_history();
        ss.close_history(40).unwrap();
        let sentinel = ss.query_single_state(3, q).unwrap();
        assert_eq!((sentinel.start, sentinel.end, sentinel.quark), (3, 3, q));
    }

    #[test]
    fn test_full_state_matches_single_queries() {
        let (ss, q) = boundary_history();
        let other = ss.quark_absolute_and_add(&["other"]).unwrap();
        ss.modify_attribute(12, 7, other).unwrap();
        ss.close_history(40).unwrap();

        for t in ss.start_time()..=ss.current_end_time() {
            let full = ss.query_full_state(t).unwrap();
            assert_eq!(full.len(), 2);
            assert_eq!(full[q as usize], ss.query_single_state(t, q).unwrap());
            assert_eq!(full[other as usize], ss.query_single_state(t, other).unwrap());
        }
    }

    #[test]
    fn test_range_queries() {
        let (ss, q) = boundary_history();
        ss.close_history(40).unwrap();
        let range = ss.query_history_range(q, 0, 40).unwrap();
        let values: Vec<_> = range.iter().map(|i| i.value.clone()).collect();
        assert_eq!(
            values,
            vec![StateValue::from("A"), StateValue::from("B"), StateValue::Null]
        );
        assert!(ss.query_history_range(q, 30, 10).unwrap_err().is_time_range());
        assert!(ss.query_history_range(q, 0, 41).unwrap_err().is_time_range());
        assert!(ss.query_history_range(99, 0, 10).unwrap_err().is_attribute_not_found());

        let sampled = ss.query_history_range_sampled(q, 10, 40, 100).unwrap();
        // Samples at 10 and 40 only.
        assert_eq!(sampled.len(), 2);
        assert!(ss.query_history_range_sampled(q, 10, 40, 0).is_err());
    }
}
