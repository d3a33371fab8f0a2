//! Event statistics built on a state history.
//!
//! Counters are ordinary attributes of a dedicated history:
//!
//! ```text
//! statistics/total                  events so far
//! statistics/event_types/<type>     events of one type so far
//! ```
//!
//! Counters never decrease, so the number of events in `[t1, t2]` is the
//! difference of two point queries at `t2` and `t1 - 1`.

pub mod mipmap;

use crate::error::{Result, TimeRangeError};
use crate::state_system::StateSystem;
use statehist_types::{Quark, StateInterval, StateValue, Timestamp};
use std::collections::BTreeMap;
use std::sync::Arc;

pub use mipmap::{Mipmap, MipmapFeature};

const STATISTICS: &str = "statistics";
const TOTAL: &str = "total";
const EVENT_TYPES: &str = "event_types";

/// Event counters of one trace.
///
/// # Examples
///
/// ```rust
/// use statehist::HistoryBuilder;
/// use statehist::statistics::EventStatistics;
/// use std::sync::Arc;
///
/// # fn main() -> statehist::Result<()> {
/// let stats = EventStatistics::new(Arc::new(HistoryBuilder::new().build()?))?;
/// stats.record_event(10, "sched_switch")?;
/// stats.record_event(15, "irq_entry")?;
/// stats.record_event(20, "sched_switch")?;
/// stats.history().close_history(30)?;
///
/// assert_eq!(stats.events_total()?, 3);
/// assert_eq!(stats.events_in_range(11, 30)?, 2);
/// assert_eq!(stats.event_types_in_range(11, 30)?["sched_switch"], 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct EventStatistics {
    history: Arc<StateSystem>,
    total: Quark,
    event_types: Quark,
}

impl EventStatistics {
    /// Counters on a history being built. Creates the counter attributes.
    pub fn new(history: Arc<StateSystem>) -> Result<Self> {
        let total = history.quark_absolute_and_add(&[STATISTICS, TOTAL])?;
        let event_types = history.quark_absolute_and_add(&[STATISTICS, EVENT_TYPES])?;
        Ok(Self {
            history,
            total,
            event_types,
        })
    }

    /// Counters of a history built earlier, e.g. a reopened file.
    pub fn open(history: Arc<StateSystem>) -> Result<Self> {
        let total = history.quark_absolute(&[STATISTICS, TOTAL])?;
        let event_types = history.quark_absolute(&[STATISTICS, EVENT_TYPES])?;
        Ok(Self {
            history,
            total,
            event_types,
        })
    }

    pub fn history(&self) -> &Arc<StateSystem> {
        &self.history
    }

    /// Count one event of `event_type` at `t`.
    pub fn record_event(&self, t: Timestamp, event_type: &str) -> Result<()> {
        let per_type = self
            .history
            .quark_relative_and_add(self.event_types, &[event_type])?;
        self.history.increment_counter(t, self.total)?;
        self.history.increment_counter(t, per_type)
    }

    fn count_at(&self, t: Timestamp, quark: Quark) -> Result<i64> {
        if t < self.history.start_time() {
            return Ok(0);
        }
        count_of(&self.history.query_single_state(t, quark)?)
    }

    /// Events counted over the whole history.
    pub fn events_total(&self) -> Result<i64> {
        self.count_at(self.history.current_end_time(), self.total)
    }

    /// Events counted in `[t1, t2]`.
    pub fn events_in_range(&self, t1: Timestamp, t2: Timestamp) -> Result<i64> {
        check_order(t1, t2)?;
        Ok(self.count_at(t2, self.total)? - self.count_at(t1 - 1, self.total)?)
    }

    /// Events per type over the whole history.
    pub fn event_types_total(&self) -> Result<BTreeMap<String, i64>> {
        self.event_types_in_range(self.history.start_time(), self.history.current_end_time())
    }

    /// Events per type in `[t1, t2]`, one full-state query per bound.
    pub fn event_types_in_range(
        &self,
        t1: Timestamp,
        t2: Timestamp,
    ) -> Result<BTreeMap<String, i64>> {
        check_order(t1, t2)?;
        let types = self.history.sub_attributes(self.event_types, false)?;
        let at_end = self.history.query_full_state(t2)?;
        let before = if t1 > self.history.start_time() {
            Some(self.history.query_full_state(t1 - 1)?)
        } else {
            None
        };

        let mut counts = BTreeMap::new();
        for quark in types {
            let index = quark as usize;
            let end = at_end.get(index).map(count_of).transpose()?.unwrap_or(0);
            let start = match &before {
                Some(states) => states.get(index).map(count_of).transpose()?.unwrap_or(0),
                None => 0,
            };
            counts.insert(self.history.attribute_name(quark)?, end - start);
        }
        Ok(counts)
    }

    /// Split `[t1, t2]` in `buckets` slices of near-equal width and count
    /// the events of each.
    pub fn histogram(&self, t1: Timestamp, t2: Timestamp, buckets: usize) -> Result<Vec<i64>> {
        check_order(t1, t2)?;
        if buckets == 0 {
            return Err(TimeRangeError::InvalidResolution(0).into());
        }
        let span = i128::from(t2) - i128::from(t1) + 1;
        let bound = |i: usize| (i128::from(t1) + span * i as i128 / buckets as i128) as Timestamp;

        let mut previous = self.count_at(t1 - 1, self.total)?;
        let mut counts = Vec::with_capacity(buckets);
        for i in 1..=buckets {
            let current = self.count_at(bound(i) - 1, self.total)?;
            counts.push(current - previous);
            previous = current;
        }
        Ok(counts)
    }
}

fn count_of(interval: &StateInterval) -> Result<i64> {
    match &interval.value {
        StateValue::Null => Ok(0),
        value => Ok(value.unbox_long()?),
    }
}

fn check_order(t1: Timestamp, t2: Timestamp) -> Result<()> {
    if t1 > t2 {
        return Err(TimeRangeError::InvertedRange { start: t1, end: t2 }.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::HistoryBuilder;

    fn recorded() -> EventStatistics {
        let stats = EventStatistics::new(Arc::new(HistoryBuilder::new().build().unwrap())).unwrap();
        for (t, kind) in [
            (1, "a"),
            (2, "b"),
            (2, "a"),
            (5, "a"),
            (9, "c"),
            (12, "b"),
        ] {
            stats.record_event(t, kind).unwrap();
        }
        stats.history().close_history(20).unwrap();
        stats
    }

    #[test]
    fn test_counters_are_long() {
        let stats = recorded();
        let ss = stats.history();
        let total = ss.quark_absolute(&[STATISTICS, TOTAL]).unwrap();
        let a = ss.quark_absolute(&[STATISTICS, EVENT_TYPES, "a"]).unwrap();
        assert_eq!(ss.query_single_state(20, total).unwrap().value, StateValue::Long(6));
        assert_eq!(ss.query_single_state(1, a).unwrap().value, StateValue::Long(1));
    }

    #[test]
    fn test_totals() {
        let stats = recorded();
        assert_eq!(stats.events_total().unwrap(), 6);
        assert_eq!(stats.events_in_range(0, 20).unwrap(), 6);
        assert_eq!(stats.events_in_range(2, 2).unwrap(), 2);
        assert_eq!(stats.events_in_range(3, 8).unwrap(), 1);
        assert_eq!(stats.events_in_range(13, 20).unwrap(), 0);
    }

    #[test]
    fn test_range_over_whole_history_matches_total() {
        let stats = recorded();
        let ss = stats.history();
        assert_eq!(
            stats.events_in_range(ss.start_time(), ss.current_end_time()).unwrap(),
            stats.events_total().unwrap()
        );
    }

    #[test]
    fn test_event_types() {
        let stats = recorded();
        let all = stats.event_types_total().unwrap();
        assert_eq!(all["a"], 3);
        assert_eq!(all["b"], 2);
        assert_eq!(all["c"], 1);

        let window = stats.event_types_in_range(3, 12).unwrap();
        assert_eq!(window["a"], 1);
        assert_eq!(window["b"], 1);
        assert_eq!(window["c"], 1);
    }

    #[test]
    fn test_histogram() {
        let stats = recorded();
        assert_eq!(stats.histogram(0, 19, 4).unwrap(), vec![3, 2, 1, 0]);
        let counts = stats.histogram(0, 20, 7).unwrap();
        assert_eq!(counts.iter().sum::<i64>(), 6);
        assert!(stats.histogram(0, 20, 0).is_err());
    }

    #[test]
    fn test_inverted_and_out_of_range() {
        let stats = recorded();
        assert!(stats.events_in_range(5, 4).unwrap_err().is_time_range());
        assert!(stats.events_in_range(0, 21).unwrap_err().is_time_range());
    }
}
