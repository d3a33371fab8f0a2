//! Attribute-indexed interval state history.
//!
//! A history records, for every attribute of a hierarchical namespace, the
//! value it held over time as closed intervals. It is built once from an
//! ordered stream of state changes and then answers point-in-time and range
//! queries.
//!
//! ```rust
//! use statehist::{HistoryBuilder, StateValue};
//!
//! let ss = HistoryBuilder::new().build()?;
//! let status = ss.quark_absolute_and_add(&["Threads", "42", "Status"])?;
//! ss.modify_attribute(10, "running", status)?;
//! ss.modify_attribute(25, "blocked", status)?;
//! ss.close_history(40)?;
//!
//! let states = ss.query_full_state(30)?;
//! assert_eq!(states[status as usize].value, StateValue::from("blocked"));
//! assert_eq!(ss.query_history_range(status, 0, 40)?.len(), 2);
//! # Ok::<(), statehist::StateSystemError>(())
//! ```

pub mod attribute;
pub mod backend;
pub mod builder;
pub mod config;
pub mod error;
pub mod provider;
pub mod registry;
pub mod state_system;

#[cfg(feature = "statistics")]
pub mod statistics;

pub use attribute::AttributeTree;
pub use backend::{
    BackendStats, HistoryTreeBackend, MemoryBackend, PartialHistoryBackend, StateHistoryBackend,
};
pub use builder::HistoryBuilder;
pub use config::Config;
pub use error::{Result, StateSystemError, TimeRangeError};
pub use provider::{EventSource, RecordedEvents, StateChange};
pub use registry::HistoryRegistry;
pub use state_system::StateSystem;

pub use statehist_types::{
    Quark, ROOT_QUARK, StateInterval, StateValue, StateValueType, StateValueTypeError, Timestamp,
};

#[cfg(feature = "statistics")]
pub use statistics::{EventStatistics, Mipmap, MipmapFeature};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {

    pub use crate::{HistoryBuilder, HistoryRegistry, Result, StateSystem, StateSystemError};

    pub use crate::{Config, EventSource, RecordedEvents, StateChange};

    pub use crate::{Quark, StateInterval, StateValue, Timestamp};

    #[cfg(feature = "statistics")]
    pub use crate::{EventStatistics, Mipmap, MipmapFeature};
}
