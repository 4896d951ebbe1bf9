use std::sync::Arc;

use ahash::AHashMap;
use dashmap::DashMap;
use serde_json::{Map, Value};

/// Plugin notes, kept in a side table keyed by connection or transaction id.
///
/// Connections and mail items never hold plugin state themselves; they hand a
/// clone of this table to every hook and drop their scope when they end.
#[derive(Clone, Debug, Default)]
pub struct Notes {
    scopes: Arc<DashMap<String, AHashMap<String, Value>>>,
}

impl Notes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, scope: &str, key: impl Into<String>, value: impl Into<Value>) {
        self.scopes
            .entry(scope.to_string())
            .or_default()
            .insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, scope: &str, key: &str) -> Option<Value> {
        self.scopes
            .get(scope)
            .and_then(|notes| notes.get(key).cloned())
    }

    /// All notes for `scope`, in a form ready to be serialised.
    #[must_use]
    pub fn snapshot(&self, scope: &str) -> Map<String, Value> {
        self.scopes
            .get(scope)
            .map(|notes| {
                notes
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Forget everything stored under `scope`.
    pub fn clear(&self, scope: &str) {
        self.scopes.remove(scope);
    }

    #[must_use]
    pub fn scopes(&self) -> usize {
        self.scopes.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::Notes;

    #[test]
    fn scoped_values() {
        let notes = Notes::new();
        notes.set("conn-1", "karma", 3);
        notes.set("conn-1.1", "spam", true);

        assert_eq!(notes.get("conn-1", "karma"), Some(json!(3)));
        assert_eq!(notes.get("conn-1", "spam"), None);
        assert_eq!(notes.snapshot("conn-1.1").get("spam"), Some(&json!(true)));

        notes.clear("conn-1.1");
        assert_eq!(notes.scopes(), 1);
        assert!(notes.snapshot("conn-1.1").is_empty());
    }

    #[test]
    fn clones_share_storage() {
        let notes = Notes::new();
        let other = notes.clone();
        other.set("a", "k", "v");
        assert_eq!(notes.get("a", "k"), Some(json!("v")));
    }
}
