//! Multi-resolution aggregates of a numeric attribute.
//!
//! Every raw sample written through a [`Mipmap`] lands on the tracked
//! attribute and in the level 0 window of each feature. Each time a window
//! holds `resolution` samples, its aggregate is written one level up as an
//! interval starting at the window's first sample, and that level's own
//! window absorbs it. Level `k` therefore summarizes `resolution^k` samples
//! per interval.
//!
//! Levels are created the first time a window below them fills up. The new
//! level count is written on `<base>/<feature>` at the sample that filled
//! the window. The level itself gets no placeholder interval there: its
//! first aggregate starts at the first sample it covers, which lies before
//! that trigger. Time on a level only moves forward, so a placeholder at
//! the trigger would make that first write go back in time.
//!
//! Layout under the tracked attribute `<base>`:
//!
//! ```text
//! <base>/<feature>        number of levels (Int)
//! <base>/<feature>/<k>    level k aggregates, k >= 1
//! <base>/avg/samples      running sample count, weights the averages
//! ```

use crate::error::Result;
use crate::state_system::StateSystem;
use statehist_types::{Quark, StateValue, StateValueType, StateValueTypeError, Timestamp};
use std::sync::Arc;

/// Aggregate maintained by a mipmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MipmapFeature {
    Min,
    Max,
    Avg,
}

impl MipmapFeature {
    pub const ALL: [MipmapFeature; 3] = [Self::Min, Self::Max, Self::Avg];

    /// Attribute name of the feature under the tracked attribute.
    pub fn name(self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Avg => "avg",
        }
    }
}

const SAMPLES: &str = "samples";

/// Running aggregate of one window.
#[derive(Debug, Clone, Default)]
struct Window {
    start: Timestamp,
    count: usize,
    weight: u64,
    best: Option<StateValue>,
    sum: f64,
}

impl Window {
    fn absorb(&mut self, feature: MipmapFeature, t: Timestamp, value: &StateValue, weight: u64) {
        if self.count == 0 {
            *self = Window {
                start: t,
                ..Window::default()
            };
        }
        self.count += 1;
        self.weight += weight;
        let x = value.as_f64().unwrap_or_default();
        self.sum += x * weight as f64;
        let replace = match (&self.best, feature) {
            (None, _) => true,
            (Some(best), MipmapFeature::Min) => x < best.as_f64().unwrap_or_default(),
            (Some(best), MipmapFeature::Max) => x > best.as_f64().unwrap_or_default(),
            (Some(_), MipmapFeature::Avg) => false,
        };
        if replace {
            self.best = Some(value.clone());
        }
    }

    /// Aggregate of the window. `None` when nothing was absorbed.
    fn aggregate(&self, feature: MipmapFeature) -> Option<StateValue> {
        if self.count == 0 {
            return None;
        }
        match feature {
            MipmapFeature::Avg => Some(StateValue::Double(self.sum / self.weight.max(1) as f64)),
            MipmapFeature::Min | MipmapFeature::Max => self.best.clone(),
        }
    }
}

#[derive(Debug)]
struct FeatureLevels {
    feature: MipmapFeature,
    root: Quark,
    /// `windows[k]` accumulates level `k` values for level `k + 1`.
    windows: Vec<Window>,
    /// `levels[k - 1]` is the quark of level `k`.
    levels: Vec<Quark>,
}

/// Writer side of a mipmap over one attribute.
///
/// # Examples
///
/// ```rust
/// use statehist::HistoryBuilder;
/// use statehist::statistics::mipmap::{self, Mipmap, MipmapFeature};
/// use std::sync::Arc;
///
/// # fn main() -> statehist::Result<()> {
/// let ss = Arc::new(HistoryBuilder::new().build()?);
/// let load = ss.quark_absolute_and_add(&["cpu", "load"])?;
/// let mut mm = Mipmap::new(Arc::clone(&ss), load, 4, &MipmapFeature::ALL)?;
///
/// for (i, value) in [3, 9, 1, 4, 7, 2].into_iter().enumerate() {
///     mm.update(i as i64 * 10, value)?;
/// }
/// mm.finish()?;
/// ss.close_history(60)?;
///
/// assert_eq!(mipmap::range_max(&ss, load, 0, 60)?, Some(9.0));
/// assert_eq!(mipmap::range_min(&ss, load, 20, 35)?, Some(1.0));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Mipmap {
    history: Arc<StateSystem>,
    base: Quark,
    resolution: usize,
    samples: Option<Quark>,
    features: Vec<FeatureLevels>,
}

impl Mipmap {
    /// Track `base` with a fan-in of `resolution` per level.
    pub fn new(
        history: Arc<StateSystem>,
        base: Quark,
        resolution: usize,
        features: &[MipmapFeature],
    ) -> Result<Self> {
        if resolution < 2 {
            return Err(crate::error::StateSystemError::InvalidConfig(format!(
                "mipmap resolution must be at least 2, got {}",
                resolution
            )));
        }
        let mut tracked = Vec::with_capacity(features.len());
        let mut samples = None;
        for &feature in features {
            let root = history.quark_relative_and_add(base, &[feature.name()])?;
            if feature == MipmapFeature::Avg {
                samples = Some(history.quark_relative_and_add(root, &[SAMPLES])?);
            }
            tracked.push(FeatureLevels {
                feature,
                root,
                windows: vec![Window::default()],
                levels: Vec::new(),
            });
        }
        Ok(Self {
            history,
            base,
            resolution,
            samples,
            features: tracked,
        })
    }

    /// Track `base` with the resolution configured for the history.
    pub fn with_config(
        history: Arc<StateSystem>,
        base: Quark,
        config: &crate::Config,
        features: &[MipmapFeature],
    ) -> Result<Self> {
        Self::new(history, base, config.mipmap_resolution, features)
    }

    pub fn base(&self) -> Quark {
        self.base
    }

    /// Number of levels above the raw attribute built so far for `feature`.
    pub fn levels(&self, feature: MipmapFeature) -> usize {
        self.features
            .iter()
            .find(|f| f.feature == feature)
            .map_or(0, |f| f.levels.len())
    }

    /// Quark holding level `level` of `feature`, once that level exists.
    pub fn level_quark(&self, feature: MipmapFeature, level: usize) -> Option<Quark> {
        let tracked = self.features.iter().find(|f| f.feature == feature)?;
        match level {
            0 => Some(self.base),
            k => tracked.levels.get(k - 1).copied(),
        }
    }

    /// Write a raw sample at `t` and fold it into every level.
    pub fn update<V: Into<StateValue>>(&mut self, t: Timestamp, value: V) -> Result<()> {
        let value = value.into();
        if !value.value_type().is_numeric() {
            return Err(StateValueTypeError {
                expected: StateValueType::Double,
                actual: value.value_type(),
            }
            .into());
        }
        self.history.modify_attribute(t, value.clone(), self.base)?;
        if let Some(samples) = self.samples {
            self.history.increment_counter(t, samples)?;
        }

        let history = &self.history;
        for tracked in &mut self.features {
            tracked.windows[0].absorb(tracked.feature, t, &value, 1);
            if tracked.windows[0].count == self.resolution {
                propagate(history, tracked, self.resolution, 0, t, true)?;
            }
        }
        Ok(())
    }

    /// Flush partially filled windows into the levels that already exist.
    /// Call before closing the history.
    pub fn finish(&mut self) -> Result<()> {
        let history = &self.history;
        for tracked in &mut self.features {
            let mut level = 0;
            while level < tracked.windows.len() {
                if tracked.windows[level].count > 0 {
                    let trigger = tracked.windows[level].start;
                    propagate(history, tracked, self.resolution, level, trigger, false)?;
                }
                level += 1;
            }
        }
        Ok(())
    }
}

/// Close the window of `level` and write its aggregate to `level + 1`.
fn propagate(
    history: &StateSystem,
    tracked: &mut FeatureLevels,
    resolution: usize,
    level: usize,
    trigger: Timestamp,
    create: bool,
) -> Result<()> {
    let window = std::mem::take(&mut tracked.windows[level]);
    let Some(aggregate) = window.aggregate(tracked.feature) else {
        return Ok(());
    };

    let target = level + 1;
    if tracked.levels.len() < target {
        if !create {
            return Ok(());
        }
        let quark = history.quark_relative_and_add(tracked.root, &[target.to_string()])?;
        history.modify_attribute(trigger, StateValue::Int(target as i32), tracked.root)?;
        tracked.levels.push(quark);
        tracked.windows.push(Window::default());
        log::debug!(
            "Mipmap {} level {} created at {}",
            tracked.feature.name(),
            target,
            trigger
        );
    }

    history.modify_attribute(window.start, aggregate.clone(), tracked.levels[level])?;
    tracked.windows[target].absorb(tracked.feature, window.start, &aggregate, window.weight);
    if tracked.windows[target].count == resolution {
        propagate(history, tracked, resolution, target, trigger, create)?;
    }
    Ok(())
}

/// Combined result of a descent through the levels.
#[derive(Default)]
struct RangeAccumulator {
    best: Option<f64>,
    sum: f64,
    weight: f64,
}

struct RangeQuery<'a> {
    history: &'a StateSystem,
    feature: MipmapFeature,
    base: Quark,
    root: Option<Quark>,
    samples: Option<Quark>,
}

impl RangeQuery<'_> {
    fn new(history: &StateSystem, base: Quark, feature: MipmapFeature) -> RangeQuery<'_> {
        let root = history.optional_quark_relative(base, &[feature.name()]);
        let samples = root.and_then(|root| history.optional_quark_relative(root, &[SAMPLES]));
        RangeQuery {
            history,
            feature,
            base,
            root,
            samples,
        }
    }

    fn level_count(&self) -> Result<usize> {
        let Some(root) = self.root else {
            return Ok(0);
        };
        let end = self.history.current_end_time();
        match self.history.query_single_state(end, root)?.value {
            StateValue::Null => Ok(0),
            value => Ok(value.unbox_int()?.max(0) as usize),
        }
    }

    fn level_quark(&self, level: usize) -> Option<Quark> {
        match level {
            0 => Some(self.base),
            k => self
                .root
                .and_then(|root| self.history.optional_quark_relative(root, &[k.to_string()])),
        }
    }

    /// Samples starting inside `[from, to]`.
    fn sample_count(&self, from: Timestamp, to: Timestamp) -> Result<f64> {
        let Some(samples) = self.samples else {
            return Ok(1.0);
        };
        let at = |t: Timestamp| -> Result<i64> {
            if t < self.history.start_time() {
                return Ok(0);
            }
            match self.history.query_single_state(t, samples)?.value {
                StateValue::Null => Ok(0),
                value => Ok(value.unbox_long()?),
            }
        };
        Ok((at(to)? - at(from - 1)?) as f64)
    }

    fn collect(
        &self,
        level: usize,
        t1: Timestamp,
        t2: Timestamp,
        acc: &mut RangeAccumulator,
    ) -> Result<()> {
        let Some(quark) = self.level_quark(level) else {
            return self.collect(level - 1, t1, t2, acc);
        };
        for interval in self.history.query_history_range(quark, t1, t2)? {
            let Some(x) = interval.value.as_f64() else {
                continue;
            };
            let contained = t1 <= interval.start && interval.end <= t2;
            if level > 0 && !contained {
                self.collect(level - 1, interval.start.max(t1), interval.end.min(t2), acc)?;
                continue;
            }
            acc.best = Some(match (acc.best, self.feature) {
                (None, _) => x,
                (Some(best), MipmapFeature::Min) => best.min(x),
                (Some(best), MipmapFeature::Max) => best.max(x),
                (Some(best), MipmapFeature::Avg) => best,
            });
            if self.feature == MipmapFeature::Avg {
                // The sample alive at the first covered instant, plus those starting later.
                let first = interval.start.max(t1);
                let weight = 1.0 + self.sample_count(first + 1, interval.end.min(t2))?;
                acc.sum += x * weight;
                acc.weight += weight;
            }
        }
        Ok(())
    }

    fn run(&self, t1: Timestamp, t2: Timestamp) -> Result<Option<f64>> {
        let mut acc = RangeAccumulator::default();
        self.collect(self.level_count()?, t1, t2, &mut acc)?;
        Ok(match self.feature {
            MipmapFeature::Avg if acc.weight > 0.0 => Some(acc.sum / acc.weight),
            MipmapFeature::Avg => None,
            _ => acc.best,
        })
    }
}

/// Smallest value `base` held over `[t1, t2]`.
pub fn range_min(history: &StateSystem, base: Quark, t1: Timestamp, t2: Timestamp) -> Result<Option<f64>> {
    RangeQuery::new(history, base, MipmapFeature::Min).run(t1, t2)
}

/// Largest value `base` held over `[t1, t2]`.
pub fn range_max(history: &StateSystem, base: Quark, t1: Timestamp, t2: Timestamp) -> Result<Option<f64>> {
    RangeQuery::new(history, base, MipmapFeature::Max).run(t1, t2)
}

/// Mean of the samples of `base` alive during `[t1, t2]`.
pub fn range_avg(history: &StateSystem, base: Quark, t1: Timestamp, t2: Timestamp) -> Result<Option<f64>> {
    RangeQuery::new(history, base, MipmapFeature::Avg).run(t1, t2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::HistoryBuilder;

    fn tracked(resolution: usize) -> (Arc<StateSystem>, Quark, Mipmap) {
        let ss = Arc::new(HistoryBuilder::new().build().unwrap());
        let base = ss.quark_absolute_and_add(&["load"]).unwrap();
        let mm = Mipmap::new(Arc::clone(&ss), base, resolution, &MipmapFeature::ALL).unwrap();
        (ss, base, mm)
    }

    fn ongoing(ss: &StateSystem, mm: &Mipmap, feature: MipmapFeature, level: usize) -> StateValue {
        ss.query_ongoing_state(mm.level_quark(feature, level).unwrap())
            .unwrap()
    }

    #[test]
    fn test_windows_do_not_accumulate() {
        let (ss, _, mut mm) = tracked(5);
        for i in 1..=5 {
            mm.update(i * 10, i as i32).unwrap();
        }
        assert_eq!(mm.levels(MipmapFeature::Min), 1);
        assert_eq!(ongoing(&ss, &mm, MipmapFeature::Min, 1), StateValue::Int(1));
        assert_eq!(ongoing(&ss, &mm, MipmapFeature::Max, 1), StateValue::Int(5));
        assert_eq!(ongoing(&ss, &mm, MipmapFeature::Avg, 1), StateValue::Double(3.0));

        for i in 6..=10 {
            mm.update(i * 10, i as i32).unwrap();
        }
        assert_eq!(ongoing(&ss, &mm, MipmapFeature::Min, 1), StateValue::Int(6));
        assert_eq!(ongoing(&ss, &mm, MipmapFeature::Max, 1), StateValue::Int(10));
        assert_eq!(ongoing(&ss, &mm, MipmapFeature::Avg, 1), StateValue::Double(8.0));
        assert_eq!(mm.levels(MipmapFeature::Avg), 1);
    }

    #[test]
    fn test_levels_created_lazily() {
        let (ss, _, mut mm) = tracked(2);
        mm.update(0, 1).unwrap();
        assert_eq!(mm.levels(MipmapFeature::Max), 0);
        assert!(mm.level_quark(MipmapFeature::Max, 1).is_none());
        for t in 1..8 {
            mm.update(t, t as i32).unwrap();
        }
        // 8 samples at fan-in 2: 4, 2 and 1 values above the raw level.
        assert_eq!(mm.levels(MipmapFeature::Max), 3);
        let root = ss.quark_absolute(&["load", "max"]).unwrap();
        assert_eq!(ss.query_ongoing_state(root).unwrap(), StateValue::Int(3));
        assert_eq!(ongoing(&ss, &mm, MipmapFeature::Max, 3), StateValue::Int(7));
        assert_eq!(ss.query_ongoing_start_time(mm.level_quark(MipmapFeature::Max, 3).unwrap()).unwrap(), Some(0));
    }

    #[test]
    fn test_range_queries_match_raw_scan() {
        let (ss, base, mut mm) = tracked(3);
        let values = [5, 2, 8, 1, 9, 4, 4, 7, 3, 6, 2, 8, 5];
        for (i, v) in values.iter().enumerate() {
            mm.update(i as i64 * 10, *v).unwrap();
        }
        mm.finish().unwrap();
        ss.close_history(130).unwrap();

        for (t1, t2) in [(0, 130), (15, 75), (40, 40), (35, 121), (0, 9)] {
            let alive: Vec<f64> = values
                .iter()
                .enumerate()
                .filter(|(i, _)| {
                    let start = *i as i64 * 10;
                    let end = start + 9;
                    start <= t2 && end >= t1
                })
                .map(|(_, v)| *v as f64)
                .collect();
            let min = alive.iter().copied().fold(f64::INFINITY, f64::min);
            let max = alive.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let avg = alive.iter().sum::<f64>() / alive.len() as f64;

            assert_eq!(range_min(&ss, base, t1, t2).unwrap(), Some(min), "min {t1}..{t2}");
            assert_eq!(range_max(&ss, base, t1, t2).unwrap(), Some(max), "max {t1}..{t2}");
            let got = range_avg(&ss, base, t1, t2).unwrap().unwrap();
            assert!((got - avg).abs() < 1e-9, "avg {t1}..{t2}: {got} != {avg}");
        }
    }

    #[test]
    fn test_non_numeric_sample() {
        let (_, _, mut mm) = tracked(4);
        assert!(mm.update(1, "busy").is_err());
    }

    #[test]
    fn test_finish_flushes_existing_levels_only() {
        let (ss, base, mut mm) = tracked(4);
        for t in 0..3 {
            mm.update(t, 10).unwrap();
        }
        mm.finish().unwrap();
        assert_eq!(mm.levels(MipmapFeature::Min), 0);
        ss.close_history(10).unwrap();
        assert_eq!(range_min(&ss, base, 0, 10).unwrap(), Some(10.0));
    }

    #[test]
    fn test_invalid_resolution() {
        let ss = Arc::new(HistoryBuilder::new().build().unwrap());
        let base = ss.quark_absolute_and_add(&["x"]).unwrap();
        assert!(Mipmap::new(ss, base, 1, &[MipmapFeature::Min]).is_err());
    }
}
