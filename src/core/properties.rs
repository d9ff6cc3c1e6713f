//! Named image properties.
//!
//! Property names are case-insensitive. Entries are either set explicitly by
//! a client or derived (a cached lookup result that can go stale and is
//! cleared whenever a rendering is invalidated).

use crate::core::types::Value;
use indexmap::IndexMap;

/// How a property entry came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyOrigin {
    /// Set by a client; survives invalidation.
    Explicit,
    /// Cached from an inherited lookup; cleared on invalidation.
    Derived,
}

#[derive(Debug, Clone, PartialEq)]
struct PropertyEntry {
    value: Value,
    origin: PropertyOrigin,
}

/// An ordered, case-insensitive property table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyTable {
    entries: IndexMap<String, PropertyEntry>,
}

/// Normalize a property name for lookup.
pub fn normalize_name(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl PropertyTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property explicitly.
    pub fn set(&mut self, name: &str, value: Value) {
        self.insert(name, value, PropertyOrigin::Explicit);
    }

    /// Cache a derived property. Never overrides an explicit entry.
    pub fn cache(&mut self, name: &str, value: Value) {
        let key = normalize_name(name);
        if matches!(self.entries.get(&key), Some(entry) if entry.origin == PropertyOrigin::Explicit) {
            return;
        }
        self.entries.insert(
            key,
            PropertyEntry {
                value,
                origin: PropertyOrigin::Derived,
            },
        );
    }

    fn insert(&mut self, name: &str, value: Value, origin: PropertyOrigin) {
        self.entries
            .insert(normalize_name(name), PropertyEntry { value, origin });
    }

    /// Look up a property.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(&normalize_name(name)).map(|e| &e.value)
    }

    /// How an existing entry was created.
    pub fn origin(&self, name: &str) -> Option<PropertyOrigin> {
        self.entries.get(&normalize_name(name)).map(|e| e.origin)
    }

    /// Remove a property, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.entries
            .shift_remove(&normalize_name(name))
            .map(|e| e.value)
    }

    /// Whether a property is present.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&normalize_name(name))
    }

    /// Drop every derived entry.
    pub fn clear_derived(&mut self) {
        self.entries
            .retain(|_, entry| entry.origin == PropertyOrigin::Explicit);
    }

    /// Property names in insertion order.
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_case_insensitive() {
        let mut table = PropertyTable::new();
        table.set("Title", Value::from("sunset"));
        assert_eq!(table.get("TITLE"), Some(&Value::from("sunset")));
        assert_eq!(table.names(), vec!["title".to_string()]);
    }

    #[test]
    fn test_clear_derived_keeps_explicit() {
        let mut table = PropertyTable::new();
        table.set("a", Value::Integer(1));
        table.cache("b", Value::Integer(2));
        table.clear_derived();
        assert!(table.contains("a"));
        assert!(!table.contains("b"));
    }

    #[test]
    fn test_cache_does_not_override_explicit() {
        let mut table = PropertyTable::new();
        table.set("a", Value::Integer(1));
        table.cache("a", Value::Integer(2));
        assert_eq!(table.get("a"), Some(&Value::Integer(1)));
        assert_eq!(table.origin("a"), Some(PropertyOrigin::Explicit));
    }
}
