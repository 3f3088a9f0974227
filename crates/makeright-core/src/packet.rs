//! Per-run state carried between the steps of a fiber.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

type Value = Arc<dyn Any + Send + Sync>;

const RETRY_PREFIX: &str = "makeright.retry.";

/// Typed registry of collaborators injected into a [`Packet`].
///
/// A component holds at most one value per type. Packets look values up
/// here when [`Packet::get_spi`] misses in the packet's own entries.
///
/// ```
/// use makeright_core::Component;
///
/// #[derive(Debug, PartialEq)]
/// struct KubernetesVersion(u32, u32);
///
/// let component = Component::new().with(KubernetesVersion(1, 28));
/// assert_eq!(component.get::<KubernetesVersion>().as_deref(), Some(&KubernetesVersion(1, 28)));
/// ```
#[derive(Clone, Default)]
pub struct Component {
    values: HashMap<TypeId, (&'static str, Value)>,
}

impl Component {
    /// Creates an empty component.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value, replacing any previous value of the same type.
    pub fn with<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.insert(value);
        self
    }

    /// Adds a value, replacing any previous value of the same type.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        self.values
            .insert(TypeId::of::<T>(), (type_name::<T>(), Arc::new(value)));
    }

    /// Returns the value of type `T`, if registered.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|(_, v)| Arc::clone(v).downcast::<T>().ok())
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field(
                "types",
                &self.values.values().map(|(n, _)| *n).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Mutable key/value bag threaded through a fiber's steps.
///
/// Values of any `Send + Sync` type are stored behind an `Arc`, so
/// [`Packet::copy`] produces a new container that shares the values with
/// the original. Forked children receive such copies.
///
/// Missing keys and type mismatches both read as `None`.
///
/// ```
/// use makeright_core::Packet;
///
/// let mut packet = Packet::new();
/// packet.put("domain.uid", "dom1".to_string());
/// packet.put("domain.replicas", 3u32);
///
/// assert_eq!(packet.get::<u32>("domain.replicas"), Some(&3));
/// assert_eq!(packet.get::<String>("domain.replicas"), None);
///
/// let mut copy = packet.copy();
/// copy.put("domain.replicas", 5u32);
/// assert_eq!(packet.get::<u32>("domain.replicas"), Some(&3));
/// ```
#[derive(Clone)]
pub struct Packet {
    data: HashMap<String, Value>,
    components: HashMap<String, Component>,
    created_at: Instant,
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .field("components", &self.components.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl Packet {
    /// Creates an empty packet.
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
            components: HashMap::new(),
            created_at: Instant::now(),
        }
    }

    /// Stores a value, replacing whatever the key held before.
    pub fn put<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.data.insert(key.into(), Arc::new(value));
    }

    /// Stores an already shared value.
    pub fn put_arc<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: Arc<T>) {
        self.data.insert(key.into(), value);
    }

    /// Returns a reference to the value for `key` if it has type `T`.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.data.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    /// Returns a shared handle to the value for `key` if it has type `T`.
    pub fn get_arc<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.data
            .get(key)
            .and_then(|v| Arc::clone(v).downcast::<T>().ok())
    }

    /// Returns a mutable reference to the value for `key`.
    ///
    /// Returns `None` when the key is missing, the type differs, or the
    /// value is still shared with a copied packet.
    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.data
            .get_mut(key)
            .and_then(Arc::get_mut)
            .and_then(|v| v.downcast_mut::<T>())
    }

    /// Removes the value for `key`, returning it if it had type `T`.
    ///
    /// The entry is removed even when the type does not match.
    pub fn remove<T: Any + Send + Sync>(&mut self, key: &str) -> Option<Arc<T>> {
        self.data.remove(key).and_then(|v| v.downcast::<T>().ok())
    }

    /// Returns `true` if the packet holds a value for `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Iterates over the keys present in the packet.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    /// Number of entries, not counting components.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the packet holds no entries.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// New outer container sharing every value and component with `self`.
    pub fn copy(&self) -> Packet {
        Packet {
            data: self.data.clone(),
            components: self.components.clone(),
            created_at: Instant::now(),
        }
    }

    /// Stores a singleton for this run under the type's name.
    pub fn put_spi<T: Any + Send + Sync>(&mut self, value: T) {
        self.put(type_name::<T>(), value);
    }

    /// Looks up a singleton by type: first among the packet's own entries,
    /// then in the registered components.
    pub fn get_spi<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.get_arc::<T>(type_name::<T>())
            .or_else(|| self.components.values().find_map(Component::get::<T>))
    }

    /// Registers a component under `name`, replacing any previous one.
    pub fn add_component(&mut self, name: impl Into<String>, component: Component) {
        self.components.insert(name.into(), component);
    }

    /// The registered components.
    pub fn components(&self) -> &HashMap<String, Component> {
        &self.components
    }

    /// Mutable access to the registered components.
    pub fn components_mut(&mut self) -> &mut HashMap<String, Component> {
        &mut self.components
    }

    /// Retries recorded so far for `step`.
    pub fn retry_count(&self, step: &str) -> u32 {
        self.get::<u32>(&retry_key(step)).copied().unwrap_or(0)
    }

    /// Records one more retry for `step` and returns the new count.
    pub fn increment_retry(&mut self, step: &str) -> u32 {
        let count = self.retry_count(step) + 1;
        self.put(retry_key(step), count);
        count
    }

    /// Clears the retry count for `step`.
    pub fn reset_retry(&mut self, step: &str) {
        self.data.remove(&retry_key(step));
    }

    /// Time since this packet (or copy) was created.
    pub fn elapsed(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

fn retry_key(step: &str) -> String {
    format!("{RETRY_PREFIX}{step}")
}
