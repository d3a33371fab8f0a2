//! Registry of open histories
//!
//! Analyses usually keep several histories side by side (kernel state,
//! statistics, user-space call stacks). A [`HistoryRegistry`] owned by the
//! caller keeps them addressable by id and releases them together.

use crate::error::{Result, StateSystemError};
use crate::state_system::StateSystem;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Histories keyed by id.
///
/// # Examples
///
/// ```rust
/// use statehist::{HistoryBuilder, HistoryRegistry};
///
/// # fn main() -> statehist::Result<()> {
/// let registry = HistoryRegistry::new();
/// let kernel = registry.register(HistoryBuilder::new().id("kernel").build()?)?;
///
/// assert!(registry.get("kernel").is_some());
/// assert_eq!(kernel.id(), "kernel");
/// registry.remove("kernel")?;
/// assert!(kernel.is_disposed());
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct HistoryRegistry {
    histories: RwLock<FxHashMap<String, Arc<StateSystem>>>,
}

impl HistoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `history` under its id. Fails if the id is taken.
    pub fn register(&self, history: StateSystem) -> Result<Arc<StateSystem>> {
        let mut histories = self.histories.write();
        if histories.contains_key(history.id()) {
            return Err(StateSystemError::HistoryAlreadyRegistered(
                history.id().to_string(),
            ));
        }
        let history = Arc::new(history);
        histories.insert(history.id().to_string(), Arc::clone(&history));
        log::debug!("Registered history '{}'", history.id());
        Ok(history)
    }

    pub fn get(&self, id: &str) -> Option<Arc<StateSystem>> {
        self.histories.read().get(id).cloned()
    }

    /// Remove and dispose the history `id`. Returns whether it was present.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let Some(history) = self.histories.write().remove(id) else {
            return Ok(false);
        };
        history.dispose()?;
        log::debug!("Removed history '{}'", id);
        Ok(true)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.histories.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.histories.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.read().is_empty()
    }
}

impl Drop for HistoryRegistry {
    fn drop(&mut self) {
        for (id, history) in self.histories.get_mut().drain() {
            if let Err(err) = history.dispose() {
                log::warn!("Failed to dispose history '{}': {}", id, err);
            }
        }
    }
}

impl std::fmt::Debug for HistoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::HistoryBuilder;

    fn history(id: &str) -> StateSystem {
        HistoryBuilder::new().id(id).build().unwrap()
    }

    #[test]
    fn test_register_and_get() {
        let registry = HistoryRegistry::new();
        assert!(registry.is_empty());
        registry.register(history("b")).unwrap();
        registry.register(history("a")).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.ids(), vec!["a", "b"]);
        assert_eq!(registry.get("a").unwrap().id(), "a");
        assert!(registry.get("c").is_none());
    }

    #[test]
    fn test_duplicate_id() {
        let registry = HistoryRegistry::new();
        registry.register(history("kernel")).unwrap();
        let err = registry.register(history("kernel")).unwrap_err();
        assert!(matches!(err, StateSystemError::HistoryAlreadyRegistered(id) if id == "kernel"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_disposes() {
        let registry = HistoryRegistry::new();
        let kept = registry.register(history("x")).unwrap();
        assert!(registry.remove("x").unwrap());
        assert!(!registry.remove("x").unwrap());
        assert!(kept.is_disposed());
        assert!(matches!(kept.query_full_state(0), Err(StateSystemError::Disposed)));
    }

    #[test]
    fn test_drop_disposes_everything() {
        let registry = HistoryRegistry::new();
        let a = registry.register(history("a")).unwrap();
        let b = registry.register(history("b")).unwrap();
        drop(registry);
        assert!(a.is_disposed());
        assert!(b.is_disposed());
    }
}
