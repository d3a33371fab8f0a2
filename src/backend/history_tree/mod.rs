//! Disk-backed interval store.

mod io;
mod node;
mod tree;

use super::{BackendStats, StateHistoryBackend, check_insert, check_range, check_time};
use crate::attribute::AttributeTree;
use crate::config::Config;
use crate::error::{Result, StateSystemError};
use statehist_types::{Quark, StateInterval, Timestamp};
use std::path::{Path, PathBuf};
use tree::HistoryTree;

/// Bytes taken by one child entry in a core node.
pub const CHILD_ENTRY_SIZE: usize = 4 + 8;

/// Interval store backed by a paginated history tree file.
///
/// Point queries read one node per tree level; range queries only visit
/// nodes overlapping the range. A closed file can be reopened with
/// [`HistoryTreeBackend::open_existing`] and queried without rebuilding.
pub struct HistoryTreeBackend {
    tree: HistoryTree,
    path: PathBuf,
    disposed: bool,
}

impl HistoryTreeBackend {
    /// Create a new history file at `path`, truncating any previous file
    pub fn create<P: AsRef<Path>>(path: P, start: Timestamp, config: &Config) -> Result<Self> {
        Self::create_file(path.as_ref(), start, config, false)
    }

    /// Reopen a finished history file along with its attribute tree
    pub fn open_existing<P: AsRef<Path>>(
        path: P,
        config: &Config,
    ) -> Result<(Self, AttributeTree)> {
        Self::open_file(path.as_ref(), config, false)
    }

    pub(crate) fn create_file(
        path: &Path,
        start: Timestamp,
        config: &Config,
        partial: bool,
    ) -> Result<Self> {
        config.validate().map_err(StateSystemError::InvalidConfig)?;
        Ok(Self {
            tree: HistoryTree::create(path, start, config, partial)?,
            path: path.to_path_buf(),
            disposed: false,
        })
    }

    pub(crate) fn open_file(
        path: &Path,
        config: &Config,
        partial: bool,
    ) -> Result<(Self, AttributeTree)> {
        let (tree, paths) = HistoryTree::open(path, config)?;
        if tree.is_partial() != partial {
            return Err(StateSystemError::CorruptPersistedState(format!(
                "{} holds a {} history",
                path.display(),
                if tree.is_partial() { "partial" } else { "full" }
            )));
        }
        let attributes = AttributeTree::from_paths(&paths)?;
        let backend = Self {
            tree,
            path: path.to_path_buf(),
            disposed: false,
        };
        Ok((backend, attributes))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_finished(&self) -> bool {
        self.tree.is_closed()
    }

    /// Checkpoint spacing recorded in the file. Zero for full histories.
    pub(crate) fn checkpoint_interval(&self) -> i64 {
        self.tree.checkpoint_interval()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed {
            return Err(StateSystemError::Disposed);
        }
        Ok(())
    }
}

impl StateHistoryBackend for HistoryTreeBackend {
    fn start_time(&self) -> Timestamp {
        self.tree.start()
    }

    fn end_time(&self) -> Timestamp {
        self.tree.end()
    }

    fn insert(&mut self, interval: StateInterval) -> Result<()> {
        self.ensure_live()?;
        check_insert(&interval, self.tree.start())?;
        self.tree.insert(interval)
    }

    fn finished_building(&mut self, end_time: Timestamp, attributes: &AttributeTree) -> Result<()> {
        self.ensure_live()?;
        self.tree.close(end_time, attributes)
    }

    fn query_full(&self, t: Timestamp, states: &mut [Option<StateInterval>]) -> Result<()> {
        self.ensure_live()?;
        check_time(t, self.tree.start(), self.tree.end())?;
        self.tree.query_full(t, states)
    }

    fn query_single(&self, t: Timestamp, quark: Quark) -> Result<Option<StateInterval>> {
        self.ensure_live()?;
        check_time(t, self.tree.start(), self.tree.end())?;
        self.tree.query_single(t, quark)
    }

    fn query_range(
        &self,
        quark: Quark,
        t1: Timestamp,
        t2: Timestamp,
    ) -> Result<Vec<StateInterval>> {
        self.ensure_live()?;
        check_range(t1, t2, self.tree.start(), self.tree.end())?;
        self.tree.query_range(quark, t1, t2)
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            interval_count: self.tree.interval_count(),
            node_count: u64::from(self.tree.node_count()),
            size_bytes: self.tree.size_bytes(),
        }
    }

    fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        self.tree.release();
        match std::fs::remove_file(self.tree.path()) {
            Ok(()) => {
                log::debug!("Removed history file {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
