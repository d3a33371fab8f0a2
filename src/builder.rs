//! History builder
//!
//! Selects the interval store of a new [`StateSystem`] and wires it to its
//! attribute tree, or reopens a history file written earlier.

use crate::attribute::AttributeTree;
use crate::backend::{HistoryTreeBackend, MemoryBackend, PartialHistoryBackend, StateHistoryBackend};
use crate::config::Config;
use crate::error::{Result, StateSystemError};
use crate::provider::EventSource;
use crate::state_system::StateSystem;
use statehist_types::Timestamp;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

enum Store {
    Memory,
    HistoryTree(PathBuf),
    Partial(PathBuf, Arc<dyn EventSource>),
}

/// Builder for state histories.
///
/// ```rust
/// use statehist::{Config, HistoryBuilder};
///
/// let dir = tempfile::tempdir().unwrap();
/// let ss = HistoryBuilder::new()
///     .history_tree(dir.path().join("kernel.ht"))
///     .config(Config::default().with_block_size(4096))
///     .start_time(1_000)
///     .id("kernel")
///     .build()
///     .unwrap();
/// assert_eq!(ss.id(), "kernel");
/// assert_eq!(ss.start_time(), 1_000);
/// ```
pub struct HistoryBuilder {
    store: Store,
    config: Config,
    start: Timestamp,
    id: Option<String>,
    open_existing: bool,
}

impl HistoryBuilder {
    /// Create a new builder for an in-memory history starting at 0.
    pub fn new() -> Self {
        Self {
            store: Store::Memory,
            config: Config::default(),
            start: 0,
            id: None,
            open_existing: false,
        }
    }

    /// Keep intervals in memory. Nothing is written to disk.
    pub fn in_memory(mut self) -> Self {
        self.store = Store::Memory;
        self.open_existing = false;
        self
    }

    /// Store intervals in a history tree file at `path`.
    pub fn history_tree<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.store = Store::HistoryTree(path.into());
        self
    }

    /// Store checkpoints only, in a file at `path`. Queries replay `source`
    /// between checkpoints, so it must be the source the history is built from.
    pub fn partial<P: Into<PathBuf>>(mut self, path: P, source: Arc<dyn EventSource>) -> Self {
        self.store = Store::Partial(path.into(), source);
        self
    }

    /// Reopen the file given to [`HistoryBuilder::history_tree`] or
    /// [`HistoryBuilder::partial`] instead of creating it.
    pub fn open_existing(mut self) -> Self {
        self.open_existing = true;
        self
    }

    pub fn start_time(mut self, start: Timestamp) -> Self {
        self.start = start;
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Identifier of the history. Defaults to a random UUID.
    pub fn id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Build the history, creating or reopening its file if one is configured.
    pub fn build(self) -> Result<StateSystem> {
        self.config
            .validate()
            .map_err(StateSystemError::InvalidConfig)?;
        let id = self.id.unwrap_or_else(|| Uuid::new_v4().to_string());

        if self.open_existing {
            let (backend, attributes) = match self.store {
                Store::Memory => {
                    return Err(StateSystemError::InvalidConfig(
                        "an in-memory history has no file to reopen".to_string(),
                    ));
                }
                Store::HistoryTree(path) => {
                    let (backend, attributes) =
                        HistoryTreeBackend::open_existing(&path, &self.config)?;
                    let backend: Box<dyn StateHistoryBackend> = Box::new(backend);
                    (backend, Arc::new(attributes))
                }
                Store::Partial(path, source) => {
                    let (backend, attributes) =
                        PartialHistoryBackend::open_existing(&path, &self.config, source)?;
                    let backend: Box<dyn StateHistoryBackend> = Box::new(backend);
                    (backend, attributes)
                }
            };
            log::info!(
                "Reopened history '{}' over [{}, {}] with {} attributes",
                id,
                backend.start_time(),
                backend.end_time(),
                attributes.len()
            );
            return Ok(StateSystem::reopened(id, attributes, backend));
        }

        let attributes = Arc::new(AttributeTree::new());
        let backend: Box<dyn StateHistoryBackend> = match self.store {
            Store::Memory => Box::new(MemoryBackend::new(self.start)),
            Store::HistoryTree(path) => {
                Box::new(HistoryTreeBackend::create(&path, self.start, &self.config)?)
            }
            Store::Partial(path, source) => Box::new(PartialHistoryBackend::create(
                &path,
                self.start,
                &self.config,
                Arc::clone(&attributes),
                source,
            )?),
        };
        log::debug!("Building history '{}' from {}", id, self.start);
        Ok(StateSystem::new(id, attributes, backend))
    }
}

impl Default for HistoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HistoryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let store = match &self.store {
            Store::Memory => "memory".to_string(),
            Store::HistoryTree(path) => format!("history_tree({})", path.display()),
            Store::Partial(path, _) => format!("partial({})", path.display()),
        };
        f.debug_struct("HistoryBuilder")
            .field("store", &store)
            .field("start", &self.start)
            .field("id", &self.id)
            .field("open_existing", &self.open_existing)
            .finish()
    }
}
