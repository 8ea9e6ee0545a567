use std::any::{Any, type_name};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;

use parking_lot::RwLock;

use crate::error::ValueStoreError;

struct StoredValue {
    value: Box<dyn Any + Send + Sync>,
    type_name: &'static str,
}

/// Write-once scratchpad shared by the actions of one coordinator.
///
/// A compensation cannot see its forward action's locals, so anything it
/// needs to undo the forward effect is staged here under a key. Each key can
/// be written once; reads return a clone of the stored value and fail on a
/// missing key or a type other than the one written.
#[derive(Default)]
pub struct ValueStore {
    values: RwLock<HashMap<String, StoredValue>>,
}

impl ValueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Returns [`ValueStoreError::DuplicateKey`] if `key` already holds a
    /// value; the stored value is left unchanged.
    pub fn set<V>(&self, key: impl Into<String>, value: V) -> Result<(), ValueStoreError>
    where
        V: Any + Send + Sync,
    {
        match self.values.write().entry(key.into()) {
            Entry::Occupied(occupied) => Err(ValueStoreError::DuplicateKey {
                key: occupied.key().clone(),
            }),
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue {
                    value: Box::new(value),
                    type_name: type_name::<V>(),
                });
                Ok(())
            }
        }
    }

    /// # Errors
    ///
    /// Returns [`ValueStoreError::MissingKey`] if nothing was stored under
    /// `key`, or [`ValueStoreError::TypeMismatch`] if it holds another type.
    pub fn get<V>(&self, key: &str) -> Result<V, ValueStoreError>
    where
        V: Any + Clone,
    {
        let values = self.values.read();
        let stored = values.get(key).ok_or_else(|| ValueStoreError::MissingKey {
            key: key.to_string(),
        })?;

        stored
            .value
            .downcast_ref::<V>()
            .cloned()
            .ok_or_else(|| ValueStoreError::TypeMismatch {
                key: key.to_string(),
                stored: stored.type_name,
                requested: type_name::<V>(),
            })
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.read().contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

impl fmt::Debug for ValueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = self.values.read();
        let mut map = f.debug_map();
        for (key, stored) in values.iter() {
            map.entry(key, &stored.type_name);
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_value_is_returned() -> Result<(), ValueStoreError> {
        let store = ValueStore::new();

        store.set("last_entry_time", String::from("2024-03-01T10:00:00"))?;

        let value: String = store.get("last_entry_time")?;
        assert_eq!(value, "2024-03-01T10:00:00");
        Ok(())
    }

    #[test]
    fn second_set_is_rejected_and_first_value_kept() -> Result<(), ValueStoreError> {
        let store = ValueStore::new();

        store.set("k", 1_u32)?;
        let result = store.set("k", 2_u32);

        assert_eq!(
            result,
            Err(ValueStoreError::DuplicateKey {
                key: "k".to_string()
            })
        );
        assert_eq!(store.get::<u32>("k")?, 1);
        Ok(())
    }

    #[test]
    fn missing_key_is_an_error_not_a_default() {
        let store = ValueStore::new();

        let result = store.get::<u32>("absent");

        assert_eq!(
            result,
            Err(ValueStoreError::MissingKey {
                key: "absent".to_string()
            })
        );
    }

    #[test]
    fn reading_with_wrong_type_is_rejected() -> Result<(), ValueStoreError> {
        let store = ValueStore::new();
        store.set("k", 7_i64)?;

        let result = store.get::<String>("k");

        assert!(matches!(
            result,
            Err(ValueStoreError::TypeMismatch { ref key, stored, .. })
                if key == "k" && stored == "i64"
        ));
        Ok(())
    }

    #[test]
    fn rejected_set_with_other_type_keeps_original() -> Result<(), ValueStoreError> {
        let store = ValueStore::new();
        store.set("k", 7_i64)?;

        assert!(store.set("k", "seven").is_err());
        assert_eq!(store.get::<i64>("k")?, 7);
        Ok(())
    }

    #[test]
    fn len_and_contains_track_keys() -> Result<(), ValueStoreError> {
        let store = ValueStore::new();
        assert!(store.is_empty());

        store.set("a", ())?;
        store.set("b", vec![1, 2, 3])?;

        assert_eq!(store.len(), 2);
        assert!(store.contains("a"));
        assert!(!store.contains("c"));
        Ok(())
    }

    #[test]
    fn debug_lists_keys_with_types() -> Result<(), ValueStoreError> {
        let store = ValueStore::new();
        store.set("count", 3_u8)?;

        assert_eq!(format!("{store:?}"), r#"{"count": "u8"}"#);
        Ok(())
    }
}
