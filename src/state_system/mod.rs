//! The state history façade.
//!
//! A [`StateSystem`] owns one attribute tree, one interval store and the
//! ongoing state table. One writer builds it through the `modify_*`
//! family; once [`StateSystem::close_history`] has run it is read-only and
//! can be queried from any number of threads.

mod query;
mod transient;

use crate::attribute::AttributeTree;
use crate::backend::StateHistoryBackend;
use crate::error::{Result, StateSystemError};
use crate::provider::{EventSource, StateChange};
use parking_lot::{Condvar, Mutex, RwLock};
use statehist_types::{Quark, ROOT_QUARK, StateValue, Timestamp};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use transient::TransientState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildState {
    Building,
    Built,
    Aborted,
}

/// Attribute-indexed state history.
///
/// # Examples
///
/// ```rust
/// use statehist::{HistoryBuilder, StateValue};
///
/// # fn main() -> statehist::Result<()> {
/// let ss = HistoryBuilder::new().start_time(0).build()?;
/// let cpu = ss.quark_absolute_and_add(&["CPUs", "0", "Status"])?;
///
/// ss.modify_attribute(10, "idle", cpu)?;
/// ss.modify_attribute(20, "running", cpu)?;
/// ss.close_history(30)?;
///
/// assert_eq!(ss.query_single_state(15, cpu)?.value, StateValue::from("idle"));
/// assert_eq!(ss.query_single_state(20, cpu)?.value, StateValue::from("running"));
/// # Ok(())
/// # }
/// ```
pub struct StateSystem {
    id: String,
    start: Timestamp,
    attributes: Arc<AttributeTree>,
    transient: Mutex<TransientState>,
    backend: RwLock<Box<dyn StateHistoryBackend>>,
    state: Mutex<BuildState>,
    built_cond: Condvar,
    disposed: AtomicBool,
}

impl StateSystem {
    pub(crate) fn new(
        id: String,
        attributes: Arc<AttributeTree>,
        backend: Box<dyn StateHistoryBackend>,
    ) -> Self {
        let start = backend.start_time();
        Self {
            id,
            start,
            attributes,
            transient: Mutex::new(TransientState::new(start)),
            backend: RwLock::new(backend),
            state: Mutex::new(BuildState::Building),
            built_cond: Condvar::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Wrap a store that already holds a finished history.
    pub(crate) fn reopened(
        id: String,
        attributes: Arc<AttributeTree>,
        backend: Box<dyn StateHistoryBackend>,
    ) -> Self {
        let system = Self::new(id, attributes, backend);
        system.transient.lock().close_all(system.backend.read().end_time());
        *system.state.lock() = BuildState::Built;
        system
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn attributes(&self) -> &AttributeTree {
        &self.attributes
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StateSystemError::Disposed);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_live()?;
        match *self.state.lock() {
            BuildState::Building => Ok(()),
            BuildState::Built => Err(StateSystemError::AlreadyBuilt),
            BuildState::Aborted => Err(StateSystemError::BuildAborted),
        }
    }

    fn finish(&self, outcome: BuildState) {
        let mut state = self.state.lock();
        if *state == BuildState::Building {
            *state = outcome;
        }
        self.built_cond.notify_all();
    }

    /// Stop construction after a fatal write error. Waiters are released.
    fn abort_on(&self, err: StateSystemError) -> StateSystemError {
        let fatal = !matches!(
            err,
            StateSystemError::AttributeNotFound(_)
                | StateSystemError::StateValueType(_)
                | StateSystemError::CounterOverflow { .. }
                | StateSystemError::AlreadyBuilt
                | StateSystemError::BuildAborted
                | StateSystemError::Disposed
        );
        if fatal {
            log::warn!("Construction of history '{}' aborted: {}", self.id, err);
            self.finish(BuildState::Aborted);
        }
        err
    }

    fn require_quark(&self, quark: Quark) -> Result<()> {
        if !self.attributes.contains(quark) {
            return Err(StateSystemError::quark_not_found(quark));
        }
        Ok(())
    }

    /// Whether construction completed.
    pub fn is_built(&self) -> bool {
        *self.state.lock() == BuildState::Built
    }

    /// Block until construction ends. Returns `false` if it was aborted
    /// or the history was disposed.
    pub fn wait_until_built(&self) -> bool {
        let mut state = self.state.lock();
        while *state == BuildState::Building {
            self.built_cond.wait(&mut state);
        }
        *state == BuildState::Built && !self.disposed.load(Ordering::Acquire)
    }

    /// Release the store and its files. Every later call fails with
    /// [`StateSystemError::Disposed`].
    pub fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.finish(BuildState::Aborted);
        self.transient.lock().clear();
        self.attributes.clear();
        log::debug!("Disposed history '{}'", self.id);
        self.backend.write().dispose()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    // Attribute access

    pub fn quark_absolute<S: AsRef<str>>(&self, path: &[S]) -> Result<Quark> {
        self.quark_relative(ROOT_QUARK, path)
    }

    pub fn quark_relative<S: AsRef<str>>(&self, start: Quark, path: &[S]) -> Result<Quark> {
        self.ensure_live()?;
        self.attributes.quark(start, path)
    }

    pub fn quark_absolute_and_add<S: AsRef<str>>(&self, path: &[S]) -> Result<Quark> {
        self.quark_relative_and_add(ROOT_QUARK, path)
    }

    pub fn quark_relative_and_add<S: AsRef<str>>(&self, start: Quark, path: &[S]) -> Result<Quark> {
        self.ensure_live()?;
        self.attributes.quark_or_add(start, path)
    }

    pub fn optional_quark_absolute<S: AsRef<str>>(&self, path: &[S]) -> Option<Quark> {
        self.attributes.optional_quark(ROOT_QUARK, path)
    }

    pub fn optional_quark_relative<S: AsRef<str>>(&self, start: Quark, path: &[S]) -> Option<Quark> {
        self.attributes.optional_quark(start, path)
    }

    /// Expand a pattern of path segments where `*` matches every child and
    /// `..` moves to the parent.
    pub fn quarks<S: AsRef<str>>(&self, pattern: &[S]) -> Result<Vec<Quark>> {
        self.quarks_relative(ROOT_QUARK, pattern)
    }

    pub fn quarks_relative<S: AsRef<str>>(&self, start: Quark, pattern: &[S]) -> Result<Vec<Quark>> {
        self.ensure_live()?;
        self.attributes.quarks(start, pattern)
    }

    pub fn sub_attributes(&self, quark: Quark, recursive: bool) -> Result<Vec<Quark>> {
        self.ensure_live()?;
        self.attributes.sub_attributes(quark, recursive)
    }

    pub fn sub_attributes_matching(&self, quark: Quark, pattern: &str) -> Result<Vec<Quark>> {
        self.ensure_live()?;
        self.attributes.sub_attributes_matching(quark, pattern)
    }

    pub fn parent_quark(&self, quark: Quark) -> Result<Quark> {
        self.attributes.parent_quark(quark)
    }

    pub fn attribute_name(&self, quark: Quark) -> Result<String> {
        self.attributes.attribute_name(quark)
    }

    pub fn full_attribute_path(&self, quark: Quark) -> Result<String> {
        self.attributes.full_path(quark)
    }

    pub fn nb_attributes(&self) -> usize {
        self.attributes.len()
    }

    // Construction

    /// Set `quark` to `value` from `t` on.
    ///
    /// Opens an interval if none is open, closes the open one at `t - 1`
    /// and opens a new one when the value differs, and does nothing when
    /// it is equal.
    pub fn modify_attribute<V: Into<StateValue>>(
        &self,
        t: Timestamp,
        value: V,
        quark: Quark,
    ) -> Result<()> {
        self.ensure_writable()?;
        self.require_quark(quark)?;
        self.store_change(t, value.into(), quark)
            .map_err(|e| self.abort_on(e))
    }

    fn store_change(&self, t: Timestamp, value: StateValue, quark: Quark) -> Result<()> {
        let closed = self.transient.lock().modify(t, value, quark)?;
        if let Some(interval) = closed {
            self.backend.write().insert(interval)?;
        }
        Ok(())
    }

    /// Replace the ongoing value of `quark` without closing an interval.
    pub fn update_ongoing_state<V: Into<StateValue>>(&self, value: V, quark: Quark) -> Result<()> {
        self.ensure_writable()?;
        self.require_quark(quark)?;
        self.transient.lock().update(value.into(), quark)
    }

    /// Add one to an integer or long counter. A null counter becomes `Int(1)`.
    /// A counter at its type's maximum is left as is and the call fails
    /// with [`StateSystemError::CounterOverflow`].
    pub fn increment_attribute(&self, t: Timestamp, quark: Quark) -> Result<()> {
        self.increment_from(t, quark, StateValue::Int(1))
    }

    /// Like [`StateSystem::increment_attribute`], but a null counter
    /// becomes `Long(1)`.
    pub fn increment_counter(&self, t: Timestamp, quark: Quark) -> Result<()> {
        self.increment_from(t, quark, StateValue::Long(1))
    }

    fn increment_from(&self, t: Timestamp, quark: Quark, first: StateValue) -> Result<()> {
        self.require_quark(quark)?;
        let next = match self.query_ongoing_state(quark)? {
            StateValue::Null => first,
            StateValue::Int(v) => StateValue::Int(
                v.checked_add(1)
                    .ok_or(StateSystemError::CounterOverflow { quark, value: i64::from(v) })?,
            ),
            StateValue::Long(v) => StateValue::Long(
                v.checked_add(1)
                    .ok_or(StateSystemError::CounterOverflow { quark, value: v })?,
            ),
            other => {
                return Err(statehist_types::StateValueTypeError {
                    expected: statehist_types::StateValueType::Int,
                    actual: other.value_type(),
                }
                .into());
            }
        };
        self.modify_attribute(t, next, quark)
    }

    /// Push `value` on the stack attribute `quark`. The attribute holds the
    /// stack depth; its children `1..=depth` hold the elements.
    pub fn push_attribute<V: Into<StateValue>>(
        &self,
        t: Timestamp,
        value: V,
        quark: Quark,
    ) -> Result<()> {
        let depth = match self.query_ongoing_state(quark)? {
            StateValue::Null => 0,
            other => other.unbox_int()?,
        };
        let depth = depth.saturating_add(1);
        let element = self.quark_relative_and_add(quark, &[depth.to_string()])?;
        self.modify_attribute(t, depth, quark)?;
        self.modify_attribute(t, value, element)
    }

    /// Pop the top of the stack attribute `quark`. Returns `None` on an
    /// empty stack.
    pub fn pop_attribute(&self, t: Timestamp, quark: Quark) -> Result<Option<StateValue>> {
        let depth = match self.query_ongoing_state(quark)? {
            StateValue::Null => return Ok(None),
            other => other.unbox_int()?,
        };
        if depth <= 0 {
            return Ok(None);
        }
        let element = self.quark_relative(quark, &[depth.to_string()])?;
        let popped = self.query_ongoing_state(element)?;
        self.modify_attribute(t, StateValue::Null, element)?;
        let remaining = if depth == 1 {
            StateValue::Null
        } else {
            StateValue::Int(depth - 1)
        };
        self.modify_attribute(t, remaining, quark)?;
        Ok(Some(popped))
    }

    /// Null out `quark` and its whole subtree at `t`.
    pub fn remove_attribute(&self, t: Timestamp, quark: Quark) -> Result<()> {
        let mut targets = self.sub_attributes(quark, true)?;
        targets.push(quark);
        for target in targets {
            self.modify_attribute(t, StateValue::Null, target)?;
        }
        Ok(())
    }

    /// Value currently open for `quark` (writer side).
    pub fn query_ongoing_state(&self, quark: Quark) -> Result<StateValue> {
        self.ensure_live()?;
        self.require_quark(quark)?;
        Ok(self.transient.lock().ongoing_value(quark))
    }

    /// Start of the interval currently open for `quark`, if any.
    pub fn query_ongoing_start_time(&self, quark: Quark) -> Result<Option<Timestamp>> {
        self.ensure_live()?;
        self.require_quark(quark)?;
        Ok(self.transient.lock().ongoing_start(quark))
    }

    /// Close every open interval at `end` and freeze the history.
    pub fn close_history(&self, end: Timestamp) -> Result<()> {
        self.ensure_writable()?;
        self.seal(end).map_err(|e| self.abort_on(e))?;
        self.finish(BuildState::Built);
        log::info!(
            "History '{}' built over [{}, {}] with {} attributes",
            self.id,
            self.start,
            self.current_end_time(),
            self.attributes.len()
        );
        Ok(())
    }

    fn seal(&self, end: Timestamp) -> Result<()> {
        let (end, closed) = self.transient.lock().close_all(end);
        let mut backend = self.backend.write();
        for interval in closed {
            backend.insert(interval)?;
        }
        backend.finished_building(end, &self.attributes)
    }

    /// Apply one upstream change, creating its attribute if needed.
    pub fn apply(&self, change: &StateChange) -> Result<()> {
        let quark = self.quark_absolute_and_add(&change.path)?;
        self.modify_attribute(change.timestamp, change.value.clone(), quark)
    }

    /// Apply every change of `source`, then close the history at `end`
    /// (or at the last change). A change before the history start is
    /// rejected like any other write and aborts construction.
    pub fn consume(&self, source: &dyn EventSource, end: Option<Timestamp>) -> Result<()> {
        let last = source.end_time();
        let first = source.start_time().min(self.start);
        for change in source.changes(first, last) {
            if let Err(err) = self.apply(change) {
                // Errors that do not abort by themselves still end construction here.
                self.finish(BuildState::Aborted);
                return Err(err);
            }
        }
        self.close_history(end.unwrap_or(last))
    }

    /// Run [`StateSystem::consume`] on a dedicated writer thread.
    pub fn spawn_builder(
        self: &Arc<Self>,
        source: Arc<dyn EventSource>,
        end: Option<Timestamp>,
    ) -> Result<JoinHandle<Result<()>>> {
        let system = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("statehist-build-{}", self.id))
            .spawn(move || {
                let outcome = system.consume(source.as_ref(), end);
                if let Err(err) = &outcome {
                    log::warn!("Builder thread for '{}' stopped: {}", system.id, err);
                }
                outcome
            })?;
        Ok(handle)
    }
}

impl Drop for StateSystem {
    fn drop(&mut self) {
        // Wake anyone still waiting on a history nobody will finish.
        self.finish(BuildState::Aborted);
    }
}

impl std::fmt::Debug for StateSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSystem")
            .field("id", &self.id)
            .field("start", &self.start)
            .field("attributes", &self.attributes.len())
            .field("state", &*self.state.lock())
            .finish()
    }
}
