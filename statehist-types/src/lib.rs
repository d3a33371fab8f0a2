//! # statehist-types
//!
//! Core value and interval types shared by the statehist state-history engine.
//!
//! - **Values**: [`StateValue`], a tagged union of null / int / long / double / string
//! - **Intervals**: [`StateInterval`], "attribute `quark` held `value` over `[start, end]`"
//! - **Identifiers**: [`Timestamp`] and [`Quark`]
//!
//! All types are serializable with Serde.
//!
//! ## Examples
//!
//! ```rust
//! use statehist_types::{StateInterval, StateValue};
//!
//! let interval = StateInterval::new(10, 19, 0, StateValue::from("running"));
//! assert!(interval.contains(15));
//! assert_eq!(interval.value.unbox_str().unwrap(), "running");
//! ```

pub mod interval;
pub mod value;

pub use interval::{Quark, ROOT_QUARK, StateInterval, Timestamp};
pub use value::{StateValue, StateValueType, StateValueTypeError};
