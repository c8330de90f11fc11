//! Reactive Store
//!
//! A [`Store`] is a record of named properties where each property is its
//! own dependency source. Reading `x` inside an effect subscribes that effect
//! to `x` only; writing `y` never re-runs it. No property has to be declared
//! as a signal up front: its edge bucket appears the first time a tracked
//! region reads it.
//!
//! Property values are [`serde_json::Value`]s, with typed access through
//! [`Store::get_as`] and [`Store::set_serialized`].
//!
//! Besides plain properties a store carries:
//!
//! - **getters**: derived properties computed on read. A getter runs in the
//!   reader's tracked region, so the reader depends on exactly the
//!   properties the getter touched.
//! - **actions**: named functions that read and write the store. Each write
//!   inside an action notifies on its own, in write order. Wrap the body in
//!   [`batch`](crate::reactive::batch) to coalesce.
//!
//! Enumerating keys ([`Store::keys`], [`Store::len`]) is a tracked read of
//! the key set, which changes only when a property is added or removed.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::trace;

use crate::error::ReactiveError;
use crate::graph::{NodeId, SourceId};
use crate::reactive::{untrack, Runtime};

/// Derived property body.
pub type Getter = Arc<dyn Fn(&Store) -> Value + Send + Sync>;

/// Named store action. Receives the store and a payload.
pub type Action = Arc<dyn Fn(&Store, Value) -> Result<Value, ReactiveError> + Send + Sync>;

/// A record whose properties are tracked individually.
///
/// Cloning a store creates a new handle to the same record.
///
/// # Example
///
/// ```rust
/// use filament_core::store::Store;
/// use serde_json::json;
///
/// let store = Store::new("profile");
/// store.set("first", json!("Ada")).unwrap();
/// store.set("last", json!("Lovelace")).unwrap();
/// store.define_getter("full", |s| {
///     let first = s.get("first").unwrap_or_default();
///     let last = s.get("last").unwrap_or_default();
///     json!(format!("{} {}", first.as_str().unwrap_or(""), last.as_str().unwrap_or("")))
/// });
///
/// assert_eq!(store.get("full"), Some(json!("Ada Lovelace")));
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    id: NodeId,
    name: String,
    values: RwLock<IndexMap<Arc<str>, Value>>,
    getters: RwLock<IndexMap<Arc<str>, Getter>>,
    actions: RwLock<IndexMap<Arc<str>, Action>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        Runtime::forget(self.id);
    }
}

impl Store {
    /// Create an empty store.
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_object(name, Map::new())
    }

    /// Create a store whose properties are the entries of `object`.
    pub fn from_object(name: impl Into<String>, object: Map<String, Value>) -> Self {
        let values = object
            .into_iter()
            .map(|(key, value)| (Arc::from(key), value))
            .collect();
        Self {
            inner: Arc::new(StoreInner {
                id: NodeId::new(),
                name: name.into(),
                values: RwLock::new(values),
                getters: RwLock::new(IndexMap::new()),
                actions: RwLock::new(IndexMap::new()),
            }),
        }
    }

    /// Create a store from any value that serializes to a JSON object.
    pub fn from_serialize<T: Serialize>(name: impl Into<String>, value: &T) -> Result<Self, ReactiveError> {
        let name = name.into();
        match serde_json::to_value(value) {
            Ok(Value::Object(object)) => Ok(Self::from_object(name, object)),
            Ok(other) => Err(ReactiveError::Serialization {
                key: name,
                message: format!("expected an object, got {}", kind_of(&other)),
            }),
            Err(err) => Err(ReactiveError::Serialization {
                key: name,
                message: err.to_string(),
            }),
        }
    }

    /// The store's node ID.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// The store's name, used in errors and logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn property(&self, key: &str) -> SourceId {
        SourceId::Property {
            store: self.inner.id,
            key: Arc::from(key),
        }
    }

    fn keys_source(&self) -> SourceId {
        SourceId::Keys { store: self.inner.id }
    }

    /// Read a property (or evaluate a getter), registering a dependency on it.
    pub fn get(&self, key: &str) -> Option<Value> {
        Runtime::track(self.property(key));

        let getter = self.inner.getters.read().get(key).cloned();
        if let Some(getter) = getter {
            return Some(getter(self));
        }
        self.inner.values.read().get(key).cloned()
    }

    /// Read a property and deserialize it.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ReactiveError> {
        self.get(key)
            .map(|value| {
                serde_json::from_value(value).map_err(|err| ReactiveError::Serialization {
                    key: key.to_string(),
                    message: err.to_string(),
                })
            })
            .transpose()
    }

    /// Read a property without registering a dependency.
    pub fn get_untracked(&self, key: &str) -> Option<Value> {
        untrack(|| self.get(key))
    }

    /// Whether a property or getter named `key` exists.
    ///
    /// Tracked on `key`, so adding or removing it re-runs the reader.
    pub fn contains_key(&self, key: &str) -> bool {
        Runtime::track(self.property(key));
        self.inner.values.read().contains_key(key) || self.inner.getters.read().contains_key(key)
    }

    /// Write a property, notifying only its readers.
    ///
    /// Adding a new property also notifies key-set readers. Writing a getter
    /// fails with [`ReactiveError::ImmutableTarget`].
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<(), ReactiveError> {
        if self.inner.getters.read().contains_key(key) {
            return Err(ReactiveError::ImmutableTarget {
                target: format!("getter `{}` of store `{}`", key, self.inner.name),
            });
        }

        let added = self
            .inner
            .values
            .write()
            .insert(Arc::from(key), value.into())
            .is_none();

        trace!(store = %self.inner.id, key, added, "store property written");
        Runtime::notify(self.property(key));
        if added {
            Runtime::notify(self.keys_source());
        }
        Ok(())
    }

    /// Serialize `value` and write it to `key`.
    pub fn set_serialized<T: Serialize>(&self, key: &str, value: &T) -> Result<(), ReactiveError> {
        let value = serde_json::to_value(value).map_err(|err| ReactiveError::Serialization {
            key: key.to_string(),
            message: err.to_string(),
        })?;
        self.set(key, value)
    }

    /// Replace a property with a value derived from its current one.
    ///
    /// The current value is read untracked.
    pub fn update<F>(&self, key: &str, f: F) -> Result<(), ReactiveError>
    where
        F: FnOnce(Option<&Value>) -> Value,
    {
        let next = {
            let values = self.inner.values.read();
            f(values.get(key))
        };
        self.set(key, next)
    }

    /// Remove a property, notifying its readers and key-set readers.
    pub fn remove(&self, key: &str) -> Option<Value> {
        let removed = self.inner.values.write().shift_remove(key)?;
        trace!(store = %self.inner.id, key, "store property removed");
        Runtime::notify(self.property(key));
        Runtime::notify(self.keys_source());
        Some(removed)
    }

    /// Names of the data properties, in insertion order. Getters are not
    /// included.
    ///
    /// Tracked on the key set: the reader re-runs when a property is added
    /// or removed, not when one is overwritten.
    pub fn keys(&self) -> Vec<String> {
        Runtime::track(self.keys_source());
        self.inner
            .values
            .read()
            .keys()
            .map(|key| key.to_string())
            .collect()
    }

    /// Number of data properties. Tracked on the key set.
    pub fn len(&self) -> usize {
        Runtime::track(self.keys_source());
        self.inner.values.read().len()
    }

    /// Whether the store has no data properties. Tracked on the key set.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// An untracked copy of all data properties.
    pub fn snapshot(&self) -> Value {
        let values = self.inner.values.read();
        Value::Object(
            values
                .iter()
                .map(|(key, value)| (key.to_string(), value.clone()))
                .collect(),
        )
    }

    /// Attach a derived property.
    ///
    /// The getter runs on every read, in the reader's tracked region.
    /// Readers of the getter property itself are notified if the getter is
    /// later redefined.
    pub fn define_getter<F>(&self, name: &str, getter: F)
    where
        F: Fn(&Store) -> Value + Send + Sync + 'static,
    {
        self.inner
            .getters
            .write()
            .insert(Arc::from(name), Arc::new(getter));
        Runtime::notify(self.property(name));
    }

    /// Attach a named action.
    pub fn define_action<F>(&self, name: &str, action: F)
    where
        F: Fn(&Store, Value) -> Result<Value, ReactiveError> + Send + Sync + 'static,
    {
        self.inner
            .actions
            .write()
            .insert(Arc::from(name), Arc::new(action));
    }

    /// Run a named action with `payload`.
    ///
    /// The action's reads are not tracked by the caller.
    pub fn dispatch(&self, name: &str, payload: Value) -> Result<Value, ReactiveError> {
        let action = self.inner.actions.read().get(name).cloned();
        let Some(action) = action else {
            return Err(ReactiveError::UnknownAction {
                store: self.inner.name.clone(),
                name: name.to_string(),
            });
        };
        trace!(store = %self.inner.id, action = name, "dispatching action");
        untrack(|| action(self, payload))
    }

    /// Number of observers currently depending on property `key`.
    pub fn observer_count(&self, key: &str) -> usize {
        Runtime::observer_count(&self.property(key))
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("values", &*self.inner.values.read())
            .field("getters", &self.inner.getters.read().keys().collect::<Vec<_>>())
            .field("actions", &self.inner.actions.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{batch, Effect};
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn watch(store: &Store, key: &'static str, runs: &Arc<AtomicUsize>) -> Effect {
        let (store, runs) = (store.clone(), runs.clone());
        Effect::new(move || {
            store.get(key);
            runs.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn write_reruns_only_readers_of_that_property() {
        let store = Store::new("point");
        store.set("x", 0).unwrap();
        store.set("y", 0).unwrap();

        let (x_runs, y_runs) = (counter(), counter());
        let _x = watch(&store, "x", &x_runs);
        let _y = watch(&store, "y", &y_runs);

        store.set("y", 1).unwrap();
        store.set("y", 2).unwrap();

        assert_eq!(x_runs.load(Ordering::SeqCst), 1);
        assert_eq!(y_runs.load(Ordering::SeqCst), 3);

        store.set("x", 5).unwrap();
        assert_eq!(x_runs.load(Ordering::SeqCst), 2);
        assert_eq!(y_runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn repeated_reads_record_one_edge() {
        let store = Store::new("s");
        store.set("x", 1).unwrap();

        let reader = store.clone();
        let _effect = Effect::new(move || {
            reader.get("x");
            reader.get("x");
        });

        assert_eq!(store.observer_count("x"), 1);
        assert_eq!(store.observer_count("y"), 0);
    }

    #[test]
    fn key_iteration_tracks_additions_and_removals() {
        let store = Store::new("todos");
        store.set("a", true).unwrap();

        let runs = counter();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (reader, runs_clone, seen_clone) = (store.clone(), runs.clone(), seen.clone());
        let _effect = Effect::new(move || {
            *seen_clone.lock() = reader.keys();
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });

        // Overwriting an existing key does not change the key set.
        store.set("a", false).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        store.set("b", true).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(*seen.lock(), vec!["a".to_string(), "b".to_string()]);

        store.remove("a");
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(*seen.lock(), vec!["b".to_string()]);
    }

    #[test]
    fn getter_is_fine_grained() {
        let store = Store::new("profile");
        store.set("first", "Ada").unwrap();
        store.set("last", "Lovelace").unwrap();
        store.set("age", 36).unwrap();
        store.define_getter("initials", |s| {
            let first = s.get_as::<String>("first").ok().flatten().unwrap_or_default();
            let last = s.get_as::<String>("last").ok().flatten().unwrap_or_default();
            json!(format!("{}{}", &first[..1], &last[..1]))
        });

        let runs = counter();
        let _effect = watch(&store, "initials", &runs);

        store.set("age", 37).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        store.set("last", "Byron").unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(store.get("initials"), Some(json!("AB")));
    }

    #[test]
    fn writing_a_getter_is_rejected() {
        let store = Store::new("s");
        store.define_getter("total", |_| json!(0));

        let err = store.set("total", 1).unwrap_err();
        assert!(matches!(err, ReactiveError::ImmutableTarget { .. }));
    }

    #[test]
    fn action_writes_notify_in_order() {
        let store = Store::new("account");
        store.set("balance", 10).unwrap();
        store.set("history", json!([])).unwrap();
        store.define_action("deposit", |s, amount| {
            let amount = amount.as_i64().unwrap_or(0);
            s.update("balance", |v| json!(v.and_then(Value::as_i64).unwrap_or(0) + amount))?;
            s.update("history", |v| {
                let mut entries = v.and_then(Value::as_array).cloned().unwrap_or_default();
                entries.push(json!(amount));
                Value::Array(entries)
            })?;
            Ok(s.get_untracked("balance").unwrap_or_default())
        });

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (s1, o1) = (store.clone(), order.clone());
        let _balance = Effect::new(move || {
            s1.get("balance");
            o1.lock().push("balance");
        });
        let (s2, o2) = (store.clone(), order.clone());
        let _history = Effect::new(move || {
            s2.get("history");
            o2.lock().push("history");
        });
        order.lock().clear();

        let result = store.dispatch("deposit", json!(5)).unwrap();

        assert_eq!(result, json!(15));
        assert_eq!(*order.lock(), vec!["balance", "history"]);
    }

    #[test]
    fn unknown_action_is_an_error() {
        let store = Store::new("s");
        let err = store.dispatch("missing", Value::Null).unwrap_err();
        assert_eq!(
            err,
            ReactiveError::UnknownAction {
                store: "s".to_string(),
                name: "missing".to_string()
            }
        );
    }

    #[test]
    fn batch_delivers_final_value_once() {
        let store = Store::new("s");
        store.set("x", 0).unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (reader, seen_clone) = (store.clone(), seen.clone());
        let _effect = Effect::new(move || {
            seen_clone.lock().push(reader.get("x"));
        });

        batch(|| {
            store.set("x", 1).unwrap();
            store.set("x", 2).unwrap();
            store.set("x", 3).unwrap();
        });

        assert_eq!(*seen.lock(), vec![Some(json!(0)), Some(json!(3))]);
    }

    #[test]
    fn typed_round_trip_through_serde() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Settings {
            theme: String,
            font_size: u32,
        }

        let store = Store::from_serialize(
            "settings",
            &Settings {
                theme: "dark".into(),
                font_size: 12,
            },
        )
        .unwrap();

        assert_eq!(store.get_as::<u32>("font_size").unwrap(), Some(12));
        store.set_serialized("font_size", &14u32).unwrap();
        assert_eq!(store.snapshot(), json!({ "theme": "dark", "font_size": 14 }));
        assert!(store.get_as::<u32>("theme").is_err());
        assert!(Store::from_serialize("n", &5).is_err());
    }

    #[test]
    fn contains_key_tracks_property_creation() {
        let store = Store::new("s");
        let runs = counter();
        let (reader, runs_clone) = (store.clone(), runs.clone());
        let _effect = Effect::new(move || {
            reader.contains_key("token");
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });

        store.set("other", 1).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        store.set("token", "abc").unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
