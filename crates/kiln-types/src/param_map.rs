//! Copy-on-write parameter map.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::Value;

/// A string-keyed map that is cheap to clone.
///
/// Clones share storage until one of them is written to, at which point the
/// writer gets its own copy. Parsed macro parameters are handed to scripts
/// this way, so a script mutating its parameter map never changes the parsed
/// template.
#[derive(Clone, Default, PartialEq)]
pub struct ParamMap {
    entries: Arc<BTreeMap<String, Value>>,
}

impl ParamMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// String value of an entry, if it is a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        Arc::make_mut(&mut self.entries).insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        if !self.entries.contains_key(key) {
            return None;
        }
        Arc::make_mut(&mut self.entries).remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Whether storage is currently shared with another clone.
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.entries) > 1
    }
}

impl fmt::Debug for ParamMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ParamMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let entries = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            entries: Arc::new(entries),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_shares_until_write() {
        let original: ParamMap = [("prefix", "<b>")].into_iter().collect();
        let mut copy = original.clone();
        assert!(original.is_shared());

        copy.insert("prefix", "<i>");

        assert!(!original.is_shared());
        assert_eq!(original.get_str("prefix"), Some("<b>"));
        assert_eq!(copy.get_str("prefix"), Some("<i>"));
    }

    #[test]
    fn test_remove_missing_key_keeps_sharing() {
        let original: ParamMap = [("a", "1")].into_iter().collect();
        let mut copy = original.clone();
        assert!(copy.remove("b").is_none());
        assert!(copy.is_shared());
        assert_eq!(copy.remove("a"), Some(Value::from("1")));
        assert_eq!(original.len(), 1);
        assert!(copy.is_empty());
    }
}
