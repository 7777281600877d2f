//! The per-run state bag shared by all steps.

use crate::errors::StateError;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// A named, typed key into a [`StateBag`].
///
/// Keys are declared once as constants (see [`crate::context::keys`]) so a
/// reader and a writer can never disagree on the value type.
pub struct StateKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StateKey<T> {
    /// Declares a key.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// Returns the key name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for StateKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StateKey<T> {}

impl<T> fmt::Debug for StateKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateKey").field(&self.name).finish()
    }
}

type Slot = Arc<dyn Any + Send + Sync>;

/// A typed key-value context passed through the step pipeline.
///
/// Absence of a key means the publishing step did not run or failed before
/// publishing; [`StateBag::get`] reports that as an error instead of
/// substituting a default.
#[derive(Default)]
pub struct StateBag {
    values: RwLock<HashMap<&'static str, Slot>>,
}

impl StateBag {
    /// Creates a new empty state bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a value, replacing any previous value under the same key.
    pub fn put<T>(&self, key: StateKey<T>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.values.write().insert(key.name, Arc::new(value));
    }

    /// Reads a required value.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Missing`] if nothing was published and
    /// [`StateError::TypeMismatch`] if the stored value has another type.
    pub fn get<T>(&self, key: StateKey<T>) -> Result<T, StateError>
    where
        T: Any + Send + Sync + Clone,
    {
        let slot = self
            .values
            .read()
            .get(key.name)
            .cloned()
            .ok_or_else(|| StateError::Missing {
                key: key.name.to_string(),
            })?;

        slot.downcast_ref::<T>()
            .cloned()
            .ok_or(StateError::TypeMismatch {
                key: key.name.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    /// Reads an optional value; a type mismatch is treated as absent.
    #[must_use]
    pub fn get_ok<T>(&self, key: StateKey<T>) -> Option<T>
    where
        T: Any + Send + Sync + Clone,
    {
        self.get(key).ok()
    }

    /// Returns true if a value was published under the key.
    #[must_use]
    pub fn contains<T>(&self, key: StateKey<T>) -> bool {
        self.values.read().contains_key(key.name)
    }

    /// Removes a value, returning it if it existed with the expected type.
    pub fn remove<T>(&self, key: StateKey<T>) -> Option<T>
    where
        T: Any + Send + Sync + Clone,
    {
        let slot = self.values.write().remove(key.name)?;
        slot.downcast_ref::<T>().cloned()
    }

    /// Updates a value in place, inserting `T::default()` first if absent.
    pub fn update<T, F>(&self, key: StateKey<T>, f: F)
    where
        T: Any + Send + Sync + Clone + Default,
        F: FnOnce(&mut T),
    {
        let mut values = self.values.write();
        let mut current = values
            .get(key.name)
            .and_then(|slot| slot.downcast_ref::<T>().cloned())
            .unwrap_or_default();
        f(&mut current);
        values.insert(key.name, Arc::new(current));
    }

    /// Returns the number of published values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    /// Returns true if nothing has been published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    /// Returns all published key names, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<_> = self.values.read().keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}

impl fmt::Debug for StateBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateBag").field("keys", &self.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    const NAME: StateKey<String> = StateKey::new("name");
    const COUNT: StateKey<u32> = StateKey::new("count");
    const NAME_AS_INT: StateKey<u32> = StateKey::new("name");
    const AMIS: StateKey<BTreeMap<String, String>> = StateKey::new("amis");

    #[test]
    fn test_put_and_get() {
        let bag = StateBag::new();
        bag.put(NAME, "ami-builder".to_string());

        assert_eq!(bag.get(NAME).unwrap(), "ami-builder");
        assert!(bag.contains(NAME));
        assert!(!bag.contains(COUNT));
    }

    #[test]
    fn test_missing_key_fails_loudly() {
        let bag = StateBag::new();
        assert_eq!(
            bag.get(COUNT),
            Err(StateError::Missing { key: "count".to_string() })
        );
        assert_eq!(bag.get_ok(COUNT), None);
    }

    #[test]
    fn test_type_mismatch() {
        let bag = StateBag::new();
        bag.put(NAME, "x".to_string());

        let err = bag.get(NAME_AS_INT).unwrap_err();
        assert!(matches!(err, StateError::TypeMismatch { ref key, .. } if key == "name"));
    }

    #[test]
    fn test_put_overwrites() {
        let bag = StateBag::new();
        bag.put(COUNT, 1);
        bag.put(COUNT, 2);
        assert_eq!(bag.get(COUNT).unwrap(), 2);
        assert_eq!(bag.len(), 1);
    }

    #[test]
    fn test_update_inserts_default() {
        let bag = StateBag::new();
        bag.update(AMIS, |amis| {
            amis.insert("us-east-1".to_string(), "ami-1".to_string());
        });
        bag.update(AMIS, |amis| {
            amis.insert("eu-west-1".to_string(), "ami-2".to_string());
        });

        let amis = bag.get(AMIS).unwrap();
        assert_eq!(amis.len(), 2);
    }

    #[test]
    fn test_remove_and_keys() {
        let bag = StateBag::new();
        bag.put(NAME, "a".to_string());
        bag.put(COUNT, 3);
        assert_eq!(bag.keys(), vec!["count", "name"]);

        assert_eq!(bag.remove(COUNT), Some(3));
        assert!(!bag.contains(COUNT));
        assert_eq!(bag.keys(), vec!["name"]);
    }
}
