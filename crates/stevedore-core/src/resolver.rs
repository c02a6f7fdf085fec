//! Hierarchical key resolution with documented defaults.
//!
//! The resolver is the one place that knows which provisioning keys carry a
//! default when the setup store leaves them out. Every other component asks
//! the resolver instead of poking stores directly.

use crate::error::{StevedoreError, StevedoreResult};
use crate::store::{ConfStore, Value};
use std::collections::BTreeMap;

/// Replace a positional placeholder (e.g. `{node_id}`, `{index}`) inside a
/// key template before lookup.
pub fn substituted(template: &str, placeholder: &str, replacement: &str) -> String {
    template.replace(placeholder, replacement)
}

/// Resolves hierarchical keys against the active setup store, falling back
/// to registered defaults.
pub struct KeyResolver<'a> {
    store: &'a dyn ConfStore,
    defaults: BTreeMap<String, Value>,
}

impl<'a> KeyResolver<'a> {
    pub fn new(store: &'a dyn ConfStore) -> Self {
        Self {
            store,
            defaults: BTreeMap::new(),
        }
    }

    /// Attach the defaults registry built by the caller (one entry per key
    /// that is allowed to be absent).
    pub fn with_defaults(store: &'a dyn ConfStore, defaults: BTreeMap<String, Value>) -> Self {
        Self { store, defaults }
    }

    /// Register a default for `key`, replacing any earlier registration.
    pub fn register_default(&mut self, key: &str, value: Value) {
        self.defaults.insert(key.to_string(), value);
    }

    /// Look up `key`; absent keys fall back to a registered default and fail
    /// with [`StevedoreError::MissingKey`] when none exists.
    pub fn resolve(&self, key: &str) -> StevedoreResult<Value> {
        if let Some(value) = self.store.get(key) {
            return Ok(value);
        }
        self.defaults
            .get(key)
            .cloned()
            .ok_or_else(|| StevedoreError::MissingKey(key.to_string()))
    }

    /// Resolve `key` and require a scalar string rendering.
    pub fn resolve_str(&self, key: &str) -> StevedoreResult<String> {
        match self.resolve(key)? {
            Value::Str(s) => Ok(s),
            Value::Int(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(StevedoreError::Store(format!(
                "key '{key}' holds structured data where a scalar was expected: {other}"
            ))),
        }
    }

    /// Resolve `key` as a non-negative integer, accepting digit strings.
    pub fn resolve_u64(&self, key: &str) -> StevedoreResult<u64> {
        let value = self.resolve(key)?;
        value
            .as_i64()
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| {
                StevedoreError::Store(format!(
                    "key '{key}' holds '{value}' where a non-negative integer was expected"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ConfStore, Value};

    struct MapStore(BTreeMap<String, Value>);

    impl ConfStore for MapStore {
        fn get(&self, key: &str) -> Option<Value> {
            self.0.get(key).cloned()
        }

        fn set(&mut self, key: &str, value: Value, _persist: bool) -> StevedoreResult<()> {
            self.0.insert(key.to_string(), value);
            Ok(())
        }

        fn persist(&self) -> StevedoreResult<()> {
            Ok(())
        }
    }

    fn store_with(entries: &[(&str, Value)]) -> MapStore {
        MapStore(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn resolve_prefers_store_over_default() {
        let store = store_with(&[("CONFIG>SETUP_TYPE", Value::Str("container".into()))]);
        let mut resolver = KeyResolver::new(&store);
        resolver.register_default("CONFIG>SETUP_TYPE", Value::Str("standard".into()));

        assert_eq!(
            resolver.resolve("CONFIG>SETUP_TYPE").unwrap(),
            Value::Str("container".into())
        );
    }

    #[test]
    fn resolve_falls_back_to_default() {
        let store = store_with(&[]);
        let mut resolver = KeyResolver::new(&store);
        resolver.register_default("CONFIG>INSTANCE_COUNT", Value::Int(1));

        assert_eq!(
            resolver.resolve("CONFIG>INSTANCE_COUNT").unwrap(),
            Value::Int(1)
        );
    }

    #[test]
    fn resolve_without_default_is_fatal() {
        let store = store_with(&[]);
        let resolver = KeyResolver::new(&store);
        match resolver.resolve("CONFIG>CLUSTER_ID") {
            Err(StevedoreError::MissingKey(key)) => assert_eq!(key, "CONFIG>CLUSTER_ID"),
            other => panic!("expected MissingKey, got {other:?}"),
        }
    }

    #[test]
    fn resolve_u64_accepts_digit_strings() {
        let store = store_with(&[("CONFIG>INSTANCE_COUNT", Value::Str("3".into()))]);
        let resolver = KeyResolver::new(&store);
        assert_eq!(resolver.resolve_u64("CONFIG>INSTANCE_COUNT").unwrap(), 3);
    }

    #[test]
    fn substituted_replaces_placeholders() {
        assert_eq!(
            substituted("CONFIG>NODE>{node_id}>TYPE", "{node_id}", "srv-12"),
            "CONFIG>NODE>srv-12>TYPE"
        );
    }
}
