//! Checkpointed interval store.
//!
//! Instead of every interval, the partial store keeps the full state at
//! checkpoints every `checkpoint_interval` time units, in a regular history
//! tree. The state at any other time is rebuilt by replaying the event
//! source from the previous checkpoint. Answers are sampled: an interval
//! returned by a query ends at the queried time, whatever its real end.

use super::history_tree::HistoryTreeBackend;
use super::{BackendStats, StateHistoryBackend, check_insert, check_range, check_resolution, check_time};
use crate::attribute::AttributeTree;
use crate::config::Config;
use crate::error::{Result, StateSystemError};
use crate::provider::EventSource;
use statehist_types::{Quark, ROOT_QUARK, StateInterval, StateValue, Timestamp};
use std::path::Path;
use std::sync::Arc;

pub struct PartialHistoryBackend {
    checkpoints: HistoryTreeBackend,
    attributes: Arc<AttributeTree>,
    source: Arc<dyn EventSource>,
    start: Timestamp,
    end: Timestamp,
    checkpoint_interval: i64,
    interval_count: u64,
}

impl PartialHistoryBackend {
    pub fn create<P: AsRef<Path>>(
        path: P,
        start: Timestamp,
        config: &Config,
        attributes: Arc<AttributeTree>,
        source: Arc<dyn EventSource>,
    ) -> Result<Self> {
        let checkpoints = HistoryTreeBackend::create_file(path.as_ref(), start, config, true)?;
        Ok(Self {
            checkpoints,
            attributes,
            source,
            start,
            end: start,
            checkpoint_interval: config.checkpoint_interval,
            interval_count: 0,
        })
    }

    /// Reopen a finished partial history. The source must be the one the
    /// history was built from. Checkpoints are located with the spacing
    /// recorded in the file, not `config.checkpoint_interval`.
    pub fn open_existing<P: AsRef<Path>>(
        path: P,
        config: &Config,
        source: Arc<dyn EventSource>,
    ) -> Result<(Self, Arc<AttributeTree>)> {
        let (checkpoints, attributes) =
            HistoryTreeBackend::open_file(path.as_ref(), config, true)?;
        let attributes = Arc::new(attributes);
        let checkpoint_interval = checkpoints.checkpoint_interval();
        if checkpoint_interval != config.checkpoint_interval {
            log::debug!(
                "{} was built with checkpoints every {}, ignoring configured {}",
                path.as_ref().display(),
                checkpoint_interval,
                config.checkpoint_interval
            );
        }
        let backend = Self {
            start: checkpoints.start_time(),
            end: checkpoints.end_time(),
            checkpoints,
            attributes: Arc::clone(&attributes),
            source,
            checkpoint_interval,
            interval_count: 0,
        };
        Ok((backend, attributes))
    }

    /// Latest checkpoint at or before `t`.
    fn checkpoint_before(&self, t: Timestamp) -> Timestamp {
        self.start + (t - self.start) / self.checkpoint_interval * self.checkpoint_interval
    }

    /// Checkpoints inside `[start, end]`.
    fn checkpoints_in(&self, start: Timestamp, end: Timestamp) -> impl Iterator<Item = Timestamp> {
        let step = self.checkpoint_interval;
        let mut first = self.checkpoint_before(start);
        if first < start {
            first += step;
        }
        std::iter::successors(Some(first), move |c| c.checked_add(step))
            .take_while(move |&c| c <= end)
    }

    /// State of `quark` at `t`, rebuilt from the previous checkpoint.
    fn state_at(&self, t: Timestamp, quark: Quark) -> Result<Option<StateInterval>> {
        let checkpoint = self.checkpoint_before(t);
        let mut state = if checkpoint <= self.checkpoints.end_time() {
            self.checkpoints
                .query_single(checkpoint, quark)?
                .map(|interval| StateInterval::new(checkpoint, t, quark, interval.value))
        } else {
            None
        };

        if checkpoint < t {
            for change in self.source.changes(checkpoint + 1, t) {
                if self.attributes.optional_quark(ROOT_QUARK, &change.path) == Some(quark) {
                    replay(&mut state, change.timestamp, t, quark, &change.value);
                }
            }
        }
        Ok(state)
    }
}

/// Apply one replayed change to the state of `quark` sampled at `t`.
/// Writing the current value again, or null to an unset attribute, leaves
/// the interval as it was.
fn replay(
    state: &mut Option<StateInterval>,
    timestamp: Timestamp,
    t: Timestamp,
    quark: Quark,
    value: &StateValue,
) {
    let unchanged = match state {
        Some(current) => current.value == *value,
        None => value.is_null(),
    };
    if !unchanged {
        *state = Some(StateInterval::new(timestamp, t, quark, value.clone()));
    }
}

impl StateHistoryBackend for PartialHistoryBackend {
    fn start_time(&self) -> Timestamp {
        self.start
    }

    fn end_time(&self) -> Timestamp {
        self.end
    }

    fn insert(&mut self, interval: StateInterval) -> Result<()> {
        check_insert(&interval, self.start)?;
        self.end = self.end.max(interval.end);
        self.interval_count += 1;
        if interval.value.is_null() {
            return Ok(());
        }
        let checkpoints: Vec<Timestamp> = self.checkpoints_in(interval.start, interval.end).collect();
        for checkpoint in checkpoints {
            self.checkpoints.insert(StateInterval::new(
                checkpoint,
                checkpoint,
                interval.quark,
                interval.value.clone(),
            ))?;
        }
        Ok(())
    }

    fn finished_building(&mut self, end_time: Timestamp, attributes: &AttributeTree) -> Result<()> {
        self.end = self.end.max(end_time);
        self.checkpoints.finished_building(self.end, attributes)
    }

    fn query_full(&self, t: Timestamp, states: &mut [Option<StateInterval>]) -> Result<()> {
        check_time(t, self.start, self.end)?;
        let checkpoint = self.checkpoint_before(t);
        if checkpoint <= self.checkpoints.end_time() {
            let mut at_checkpoint = vec![None; states.len()];
            self.checkpoints.query_full(checkpoint, &mut at_checkpoint)?;
            for (slot, found) in states.iter_mut().zip(at_checkpoint) {
                if let Some(interval) = found {
                    *slot = Some(StateInterval::new(checkpoint, t, interval.quark, interval.value));
                }
            }
        }

        if checkpoint < t {
            for change in self.source.changes(checkpoint + 1, t) {
                let Some(quark) = self.attributes.optional_quark(ROOT_QUARK, &change.path) else {
                    continue;
                };
                if let Some(slot) = states.get_mut(quark as usize) {
                    replay(slot, change.timestamp, t, quark, &change.value);
                }
            }
        }
        Ok(())
    }

    fn query_single(&self, _t: Timestamp, _quark: Quark) -> Result<Option<StateInterval>> {
        Err(StateSystemError::UnsupportedOperation(
            "partial histories only answer full-state and sampled range queries",
        ))
    }

    fn query_range(
        &self,
        _quark: Quark,
        _t1: Timestamp,
        _t2: Timestamp,
    ) -> Result<Vec<StateInterval>> {
        Err(StateSystemError::UnsupportedOperation(
            "partial histories need a resolution for range queries",
        ))
    }

    fn query_sampled(
        &self,
        quark: Quark,
        t1: Timestamp,
        t2: Timestamp,
        resolution: i64,
    ) -> Result<Vec<StateInterval>> {
        check_range(t1, t2, self.start, self.end)?;
        check_resolution(resolution)?;

        let samples = std::iter::successors(Some(t1), |t| t.checked_add(resolution))
            .take_while(|&t| t < t2)
            .chain(std::iter::once(t2));

        let mut intervals: Vec<StateInterval> = Vec::new();
        for t in samples {
            if let Some(interval) = self.state_at(t, quark)? {
                let repeated = intervals
                    .last()
                    .is_some_and(|last| last.start == interval.start && last.value == interval.value);
                if !repeated {
                    intervals.push(interval);
                }
            }
        }
        Ok(intervals)
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            interval_count: self.interval_count,
            ..self.checkpoints.stats()
        }
    }

    fn dispose(&mut self) -> Result<()> {
        self.checkpoints.dispose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{RecordedEvents, StateChange};
    use tempfile::tempdir;

    /// A single attribute toggling between 0 and 1 every 7 time units.
    fn toggling(until: Timestamp) -> (Arc<AttributeTree>, Arc<RecordedEvents>, Vec<StateInterval>) {
        let attributes = Arc::new(AttributeTree::new());
        let quark = attributes.quark_or_add(ROOT_QUARK, &["cpu"]).unwrap();
        let mut events = Vec::new();
        let mut intervals = Vec::new();
        let mut t = 0;
        while t < until {
            let value = (t / 7 % 2) as i32;
            events.push(StateChange::new(t, &["cpu"], value));
            intervals.push(StateInterval::new(t, (t + 6).min(until), quark, value.into()));
            t += 7;
        }
        (attributes, Arc::new(RecordedEvents::new(events)), intervals)
    }

    fn build(dir: &Path, until: Timestamp) -> PartialHistoryBackend {
        let (attributes, events, intervals) = toggling(until);
        let config = Config::default().with_checkpoint_interval(50);
        let mut backend =
            PartialHistoryBackend::create(dir.join("p.ht"), 0, &config, Arc::clone(&attributes), events)
                .unwrap();
        for interval in intervals {
            backend.insert(interval).unwrap();
        }
        backend.finished_building(until, &attributes).unwrap();
        backend
    }

    #[test]
    fn test_checkpoint_placement() {
        let dir = tempdir().unwrap();
        let backend = build(dir.path(), 10);
        let points: Vec<_> = backend.checkpoints_in(1, 120).collect();
        assert_eq!(points, vec![50, 100]);
        let points: Vec<_> = backend.checkpoints_in(0, 50).collect();
        assert_eq!(points, vec![0, 50]);
        assert_eq!(backend.checkpoint_before(149), 100);
    }

    #[test]
    fn test_single_and_plain_range_unsupported() {
        let dir = tempdir().unwrap();
        let backend = build(dir.path(), 500);
        assert!(backend.query_single(10, 0).unwrap_err().is_unsupported());
        assert!(backend.query_range(0, 0, 100).unwrap_err().is_unsupported());
    }

    #[test]
    fn test_sampled_range_fabricates_end() {
        let dir = tempdir().unwrap();
        let backend = build(dir.path(), 500);
        let sampled = backend.query_sampled(0, 100, 200, 25).unwrap();
        assert!(!sampled.is_empty());
        for interval in &sampled {
            assert!([100, 125, 150, 175, 200].contains(&interval.end));
            let expected = StateValue::Int((interval.end / 7 % 2) as i32);
            assert_eq!(interval.value, expected);
        }
    }

    #[test]
    fn test_full_state_matches_source() {
        let dir = tempdir().unwrap();
        let backend = build(dir.path(), 500);
        for t in [0, 49, 50, 51, 333, 499] {
            let mut states = vec![None; 1];
            backend.query_full(t, &mut states).unwrap();
            let interval = states[0].as_ref().unwrap();
            assert_eq!(interval.value, StateValue::Int((t / 7 % 2) as i32));
            assert_eq!(interval.end, t);
            assert!(interval.start <= t);
        }
    }

    #[test]
    fn test_reopen_with_source() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.ht");
        drop(build(dir.path(), 300));

        let (_, events, _) = toggling(300);
        let config = Config::default().with_checkpoint_interval(50);
        let (backend, attributes) = PartialHistoryBackend::open_existing(&path, &config, events).unwrap();
        assert_eq!(attributes.len(), 1);
        assert_eq!((backend.start_time(), backend.end_time()), (0, 300));
        let mut states = vec![None; 1];
        backend.query_full(222, &mut states).unwrap();
        assert_eq!(states[0].as_ref().unwrap().value, StateValue::Int((222 / 7 % 2) as i32));
    }

    #[test]
    fn test_reopen_uses_recorded_checkpoint_spacing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.ht");
        let attributes = Arc::new(AttributeTree::new());
        let cpu = attributes.quark_or_add(ROOT_QUARK, &["cpu"]).unwrap();
        let other = attributes.quark_or_add(ROOT_QUARK, &["other"]).unwrap();
        let events = Arc::new(RecordedEvents::new(vec![
            StateChange::new(0, &["cpu"], 7),
            StateChange::new(1_000, &["other"], 1),
        ]));

        let config = Config::default().with_checkpoint_interval(100);
        let mut backend =
            PartialHistoryBackend::create(&path, 0, &config, Arc::clone(&attributes), events.clone())
                .unwrap();
        backend.insert(StateInterval::new(0, 1_000, cpu, 7.into())).unwrap();
        backend.finished_building(1_000, &attributes).unwrap();
        drop(backend);

        let other_config = Config::default().with_checkpoint_interval(77);
        let (backend, _) = PartialHistoryBackend::open_existing(&path, &other_config, events).unwrap();
        assert_eq!(backend.checkpoint_before(530), 500);
        let mut states = vec![None; 2];
        backend.query_full(530, &mut states).unwrap();
        assert_eq!(states[cpu as usize].as_ref().unwrap().value, StateValue::Int(7));
        assert!(states[other as usize].is_none());
    }

    #[test]
    fn test_repeated_value_keeps_start() {
        let dir = tempdir().unwrap();
        let attributes = Arc::new(AttributeTree::new());
        let cpu = attributes.quark_or_add(ROOT_QUARK, &["cpu"]).unwrap();
        let events = Arc::new(RecordedEvents::new(vec![
            StateChange::new(110, &["cpu"], 3),
            StateChange::new(120, &["cpu"], 3),
            StateChange::new(130, &["cpu"], 3),
        ]));
        let config = Config::default().with_checkpoint_interval(100);
        let mut backend =
            PartialHistoryBackend::create(dir.path().join("p.ht"), 0, &config, Arc::clone(&attributes), events)
                .unwrap();
        backend.insert(StateInterval::new(110, 200, cpu, 3.into())).unwrap();
        backend.finished_building(200, &attributes).unwrap();

        let mut states = vec![None; 1];
        backend.query_full(140, &mut states).unwrap();
        let interval = states[0].as_ref().unwrap();
        assert_eq!((interval.start, interval.end), (110, 140));

        let sampled = backend.query_sampled(cpu, 115, 145, 10).unwrap();
        assert_eq!(sampled.len(), 1);
        assert_eq!(sampled[0].start, 110);
    }
}
