//! Key-value store behind the script `local` global.

use dashmap::DashMap;

/// Small string store scoped by rule name, shared by every host of a registry.
#[derive(Debug, Default)]
pub struct LocalStore {
    entries: DashMap<(String, String), String>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored value, or an empty string when absent.
    pub fn get(&self, rule: &str, key: &str) -> String {
        self.entries
            .get(&(rule.to_string(), key.to_string()))
            .map(|v| v.value().clone())
            .unwrap_or_default()
    }

    pub fn set(&self, rule: &str, key: &str, value: String) {
        self.entries.insert((rule.to_string(), key.to_string()), value);
    }

    pub fn delete(&self, rule: &str, key: &str) {
        self.entries.remove(&(rule.to_string(), key.to_string()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
