use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Discriminant of a [`StateValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateValueType {
    Null,
    Int,
    Long,
    Double,
    String,
}

impl StateValueType {
    /// One-byte tag used by binary encodings.
    pub fn tag(self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Int => 1,
            Self::Long => 2,
            Self::Double => 3,
            Self::String => 4,
        }
    }

    /// Inverse of [`StateValueType::tag`].
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Null),
            1 => Some(Self::Int),
            2 => Some(Self::Long),
            3 => Some(Self::Double),
            4 => Some(Self::String),
            _ => None,
        }
    }

    /// Whether values of this type can take part in numeric aggregates.
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Int | Self::Long | Self::Double)
    }
}

impl fmt::Display for StateValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Int => "int",
            Self::Long => "long",
            Self::Double => "double",
            Self::String => "string",
        };
        f.write_str(name)
    }
}

/// Raised when a value is unboxed as a type it does not hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("expected {expected} state value, found {actual}")]
pub struct StateValueTypeError {
    pub expected: StateValueType,
    pub actual: StateValueType,
}

/// The value an attribute holds over an interval.
///
/// `Null` is a real value meaning "no information", not an error condition.
///
/// # Examples
///
/// ```
/// use statehist_types::{StateValue, StateValueType};
///
/// let value = StateValue::Int(42);
/// assert_eq!(value.unbox_int().unwrap(), 42);
/// // Ints widen to longs, nothing else converts implicitly.
/// assert_eq!(value.unbox_long().unwrap(), 42);
/// assert_eq!(
///     value.unbox_str().unwrap_err().actual,
///     StateValueType::Int
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateValue {
    #[default]
    Null,
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
}

impl StateValue {
    pub fn value_type(&self) -> StateValueType {
        match self {
            Self::Null => StateValueType::Null,
            Self::Int(_) => StateValueType::Int,
            Self::Long(_) => StateValueType::Long,
            Self::Double(_) => StateValueType::Double,
            Self::String(_) => StateValueType::String,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    fn mismatch(&self, expected: StateValueType) -> StateValueTypeError {
        StateValueTypeError {
            expected,
            actual: self.value_type(),
        }
    }

    pub fn unbox_int(&self) -> Result<i32, StateValueTypeError> {
        match self {
            Self::Int(v) => Ok(*v),
            _ => Err(self.mismatch(StateValueType::Int)),
        }
    }

    /// Unbox as a long. Int values are widened.
    pub fn unbox_long(&self) -> Result<i64, StateValueTypeError> {
        match self {
            Self::Int(v) => Ok(i64::from(*v)),
            Self::Long(v) => Ok(*v),
            _ => Err(self.mismatch(StateValueType::Long)),
        }
    }

    pub fn unbox_double(&self) -> Result<f64, StateValueTypeError> {
        match self {
            Self::Double(v) => Ok(*v),
            _ => Err(self.mismatch(StateValueType::Double)),
        }
    }

    pub fn unbox_str(&self) -> Result<&str, StateValueTypeError> {
        match self {
            Self::String(v) => Ok(v.as_str()),
            _ => Err(self.mismatch(StateValueType::String)),
        }
    }

    /// Numeric view used by aggregates; `None` for null and string values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(f64::from(*v)),
            Self::Long(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            Self::Null | Self::String(_) => None,
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Int(v) => write!(f, "{}", v),
            Self::Long(v) => write!(f, "{}L", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::String(v) => write!(f, "\"{}\"", v),
        }
    }
}

impl From<i32> for StateValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<f64> for StateValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl<T: Into<StateValue>> From<Option<T>> for StateValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}
