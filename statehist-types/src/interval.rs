use crate::value::StateValue;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Time unit of a history. The engine only assumes it is totally ordered.
pub type Timestamp = i64;

/// Dense attribute identifier, assigned in creation order.
pub type Quark = i32;

/// Quark of the (unnamed) root of an attribute tree.
pub const ROOT_QUARK: Quark = -1;

/// "Attribute `quark` held `value` over `[start, end]`", both ends inclusive.
///
/// # Examples
///
/// ```
/// use statehist_types::{StateInterval, StateValue};
///
/// let running = StateInterval::new(10, 19, 3, StateValue::Int(1));
/// assert!(running.contains(10) && running.contains(19));
/// assert!(!running.contains(20));
/// assert!(running.intersects(0, 10));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateInterval {
    pub start: Timestamp,
    pub end: Timestamp,
    pub quark: Quark,
    pub value: StateValue,
}

impl StateInterval {
    pub fn new(start: Timestamp, end: Timestamp, quark: Quark, value: StateValue) -> Self {
        Self {
            start,
            end,
            quark,
            value,
        }
    }

    /// Zero-length null interval returned when nothing is known at `t`.
    pub fn null_at(t: Timestamp, quark: Quark) -> Self {
        Self::new(t, t, quark, StateValue::Null)
    }

    pub fn contains(&self, t: Timestamp) -> bool {
        self.start <= t && t <= self.end
    }

    pub fn intersects(&self, t1: Timestamp, t2: Timestamp) -> bool {
        self.start <= t2 && t1 <= self.end
    }

    /// Number of time units covered, counting both ends.
    pub fn duration(&self) -> i64 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }

    pub fn with_end(mut self, end: Timestamp) -> Self {
        self.end = end;
        self
    }
}

impl fmt::Display for StateInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}] quark={} value={}",
            self.start, self.end, self.quark, self.value
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_are_inclusive() {
        let interval = StateInterval::new(5, 5, 0, StateValue::Int(1));
        assert!(interval.contains(5));
        assert!(!interval.contains(4));
        assert!(!interval.contains(6));
        assert_eq!(interval.duration(), 1);
    }

    #[test]
    fn test_intersects_edges() {
        let interval = StateInterval::new(10, 20, 0, StateValue::Null);
        assert!(interval.intersects(20, 30));
        assert!(interval.intersects(0, 10));
        assert!(!interval.intersects(21, 30));
        assert!(!interval.intersects(0, 9));
    }

    #[test]
    fn test_null_sentinel() {
        let sentinel = StateInterval::null_at(42, 7);
        assert!(sentinel.value.is_null());
        assert_eq!((sentinel.start, sentinel.end, sentinel.quark), (42, 42, 7));
    }

    #[test]
    fn test_display() {
        let interval = StateInterval::new(1, 2, 3, StateValue::from("x"));
        assert_eq!(interval.to_string(), "[1, 2] quark=3 value=\"x\"");
    }
}
