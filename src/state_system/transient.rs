//! Ongoing state table.
//!
//! Holds, per quark, the value that is currently open and the time it was
//! opened. A change of value closes the open interval and hands it back to
//! the caller for storage.

use crate::error::{Result, TimeRangeError};
use statehist_types::{Quark, StateInterval, StateValue, StateValueType, StateValueTypeError, Timestamp};

#[derive(Debug, Clone, Default)]
struct Slot {
    open: Option<(Timestamp, StateValue)>,
    value_type: Option<StateValueType>,
    last_write: Option<Timestamp>,
}

#[derive(Debug)]
pub(crate) struct TransientState {
    start: Timestamp,
    latest: Timestamp,
    slots: Vec<Slot>,
}

impl TransientState {
    pub fn new(start: Timestamp) -> Self {
        Self {
            start,
            latest: start,
            slots: Vec::new(),
        }
    }

    /// Latest timestamp written so far.
    pub fn latest_time(&self) -> Timestamp {
        self.latest
    }

    fn slot(&self, quark: Quark) -> Option<&Slot> {
        usize::try_from(quark).ok().and_then(|index| self.slots.get(index))
    }

    fn slot_mut(&mut self, quark: Quark) -> &mut Slot {
        let index = quark as usize;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, Slot::default);
        }
        &mut self.slots[index]
    }

    fn check_write(&self, t: Timestamp, quark: Quark, value: &StateValue) -> Result<()> {
        if t < self.start {
            return Err(TimeRangeError::BeforeStart {
                start: t,
                history_start: self.start,
            }
            .into());
        }
        let Some(slot) = self.slot(quark) else {
            return Ok(());
        };
        if let Some(last) = slot.last_write
            && t < last
        {
            return Err(TimeRangeError::NonMonotonic {
                quark,
                timestamp: t,
                last,
            }
            .into());
        }
        if let Some(expected) = slot.value_type
            && !value.is_null()
            && value.value_type() != expected
        {
            return Err(StateValueTypeError {
                expected,
                actual: value.value_type(),
            }
            .into());
        }
        Ok(())
    }

    /// Record `value` for `quark` at `t`. Returns the interval closed by the
    /// change, if any. `quark` must be a valid attribute.
    pub fn modify(
        &mut self,
        t: Timestamp,
        value: StateValue,
        quark: Quark,
    ) -> Result<Option<StateInterval>> {
        self.check_write(t, quark, &value)?;
        self.latest = self.latest.max(t);

        let slot = self.slot_mut(quark);
        slot.last_write = Some(t);
        if !value.is_null() {
            slot.value_type = Some(value.value_type());
        }

        match slot.open.take() {
            None if value.is_null() => Ok(None),
            None => {
                slot.open = Some((t, value));
                Ok(None)
            }
            Some((start, current)) if current == value => {
                slot.open = Some((start, current));
                Ok(None)
            }
            // Rewrite at the same instant replaces the open value.
            Some((start, _)) if start == t => {
                slot.open = Some((t, value));
                Ok(None)
            }
            Some((start, current)) => {
                slot.open = Some((t, value));
                Ok(Some(StateInterval::new(start, t - 1, quark, current)))
            }
        }
    }

    /// Replace the open value of `quark` without closing anything.
    pub fn update(&mut self, value: StateValue, quark: Quark) -> Result<()> {
        if let Some(slot) = self.slot(quark)
            && let Some(expected) = slot.value_type
            && !value.is_null()
            && value.value_type() != expected
        {
            return Err(StateValueTypeError {
                expected,
                actual: value.value_type(),
            }
            .into());
        }

        let start = self.start;
        let slot = self.slot_mut(quark);
        if !value.is_null() {
            slot.value_type = Some(value.value_type());
        }
        let opened = slot
            .open
            .as_ref()
            .map_or(slot.last_write.unwrap_or(start), |(t, _)| *t);
        slot.open = Some((opened, value));
        Ok(())
    }

    pub fn ongoing_value(&self, quark: Quark) -> StateValue {
        self.slot(quark)
            .and_then(|slot| slot.open.as_ref())
            .map(|(_, value)| value.clone())
            .unwrap_or_default()
    }

    pub fn ongoing_start(&self, quark: Quark) -> Option<Timestamp> {
        self.slot(quark)
            .and_then(|slot| slot.open.as_ref())
            .map(|(start, _)| *start)
    }

    /// Close every open interval at `end`, which is raised to the latest
    /// write time if it lies before it.
    pub fn close_all(&mut self, end: Timestamp) -> (Timestamp, Vec<StateInterval>) {
        let end = end.max(self.latest);
        self.latest = end;
        let intervals = self
            .slots
            .iter_mut()
            .enumerate()
            .filter_map(|(quark, slot)| {
                slot.open
                    .take()
                    .map(|(start, value)| StateInterval::new(start, end, quark as Quark, value))
            })
            .collect();
        (end, intervals)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}
