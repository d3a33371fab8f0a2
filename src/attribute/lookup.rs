//! Child lookup strategies for attribute nodes.
//!
//! Most trace namespaces mix two shapes of children: dense numeric ids
//! (threads, CPUs, IRQ numbers) and free-form names. Each node picks the
//! strategy matching its first child and upgrades to a hash map when a
//! name arrives that the numeric table cannot hold.

use rustc_hash::FxHashMap;
use statehist_types::Quark;

/// Largest child name the numeric table indexes directly.
pub const MAX_NUMERIC_CHILD: u32 = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    Numeric,
    AlphaNumeric,
}

/// Name to quark map for the children of one attribute.
pub trait ChildLookup: Send + Sync {
    /// Quark of the child called `name`, if any
    fn get(&self, name: &str) -> Option<Quark>;

    /// Record a new child. Returns `false` when this strategy cannot hold
    /// `name`, in which case nothing was recorded.
    fn try_insert(&mut self, name: &str, quark: Quark) -> bool;

    /// Number of children recorded
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn kind(&self) -> LookupKind;
}

/// Parse a canonical decimal child name ("0", "17", never "017" or "+1").
pub fn numeric_name(name: &str) -> Option<u32> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > 5 || !bytes.iter().all(u8::is_ascii_digit) {
        return None;
    }
    if bytes.len() > 1 && bytes[0] == b'0' {
        return None;
    }
    let value: u32 = name.parse().ok()?;
    (value < MAX_NUMERIC_CHILD).then_some(value)
}

/// Pick the strategy for a node whose first child is `first_child`.
pub fn for_first_child(first_child: &str) -> Box<dyn ChildLookup> {
    if numeric_name(first_child).is_some() {
        Box::new(NumericLookup::default())
    } else {
        Box::new(AlphaNumericLookup::default())
    }
}

/// Children addressed by small integers, stored in a table indexed by value.
#[derive(Debug, Default)]
pub struct NumericLookup {
    slots: Vec<Option<Quark>>,
    len: usize,
}

impl ChildLookup for NumericLookup {
    fn get(&self, name: &str) -> Option<Quark> {
        let index = numeric_name(name)? as usize;
        self.slots.get(index).copied().flatten()
    }

    fn try_insert(&mut self, name: &str, quark: Quark) -> bool {
        let Some(index) = numeric_name(name) else {
            return false;
        };
        let index = index as usize;
        if index >= self.slots.len() {
            self.slots.resize(index + 1, None);
        }
        if self.slots[index].replace(quark).is_none() {
            self.len += 1;
        }
        true
    }

    fn len(&self) -> usize {
        self.len
    }

    fn kind(&self) -> LookupKind {
        LookupKind::Numeric
    }
}

/// General children, hashed by name.
#[derive(Debug, Default)]
pub struct AlphaNumericLookup {
    map: FxHashMap<String, Quark>,
}

impl ChildLookup for AlphaNumericLookup {
    fn get(&self, name: &str) -> Option<Quark> {
        self.map.get(name).copied()
    }

    fn try_insert(&mut self, name: &str, quark: Quark) -> bool {
        self.map.insert(name.to_string(), quark);
        true
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn kind(&self) -> LookupKind {
        LookupKind::AlphaNumeric
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_name_is_canonical() {
        assert_eq!(numeric_name("0"), Some(0));
        assert_eq!(numeric_name("4242"), Some(4242));
        assert_eq!(numeric_name("007"), None);
        assert_eq!(numeric_name("-1"), None);
        assert_eq!(numeric_name("65536"), None);
        assert_eq!(numeric_name("cpu0"), None);
        assert_eq!(numeric_name(""), None);
    }

    #[test]
    fn test_strategy_follows_first_child() {
        assert_eq!(for_first_child("12").kind(), LookupKind::Numeric);
        assert_eq!(for_first_child("Threads").kind(), LookupKind::AlphaNumeric);
    }

    #[test]
    fn test_numeric_lookup_refuses_names() {
        let mut lookup = NumericLookup::default();
        assert!(lookup.try_insert("3", 10));
        assert!(lookup.try_insert("1", 11));
        assert!(!lookup.try_insert("status", 12));
        assert_eq!(lookup.get("3"), Some(10));
        assert_eq!(lookup.get("2"), None);
        assert_eq!(lookup.get("status"), None);
        assert_eq!(lookup.len(), 2);
    }

    #[test]
    fn test_alphanumeric_lookup() {
        let mut lookup = AlphaNumericLookup::default();
        assert!(lookup.is_empty());
        assert!(lookup.try_insert("007", 1));
        assert!(lookup.try_insert("7", 2));
        assert_eq!(lookup.get("007"), Some(1));
        assert_eq!(lookup.get("7"), Some(2));
    }
}
