//! Routing-key to context map with atomic reservation.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::context::RoutingKey;
use crate::error::{ContextError, ContextResult};

enum Slot<T> {
    /// Creation in flight.
    Pending,
    Live(T),
}

struct Inner<T> {
    slots: HashMap<RoutingKey, Slot<T>>,
    closed: bool,
}

/// Holds at most one entry per routing key.
///
/// Creation is a two step affair: [`Registry::reserve`] claims the key or
/// fails, then [`Reservation::fill`] publishes the value. A dropped
/// reservation frees the key again. Every method completes under one lock,
/// so no caller observes a half-applied update.
pub struct Registry<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> Registry<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Claims `key`.
    ///
    /// # Errors
    ///
    /// [`ContextError::DuplicateContext`] if `key` is live or being created,
    /// [`ContextError::ManagerDisposed`] after [`Registry::close`].
    pub fn reserve(&self, key: RoutingKey) -> ContextResult<Reservation<'_, T>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ContextError::ManagerDisposed);
        }
        if inner.slots.contains_key(&key) {
            return Err(ContextError::DuplicateContext(key.to_string()));
        }
        inner.slots.insert(key.clone(), Slot::Pending);
        Ok(Reservation {
            registry: self,
            key: Some(key),
        })
    }

    /// The live entry for `key`.
    pub fn get(&self, key: &RoutingKey) -> Option<T> {
        match self.inner.lock().slots.get(key) {
            Some(Slot::Live(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Whether `key` is live or being created.
    pub fn contains(&self, key: &RoutingKey) -> bool {
        self.inner.lock().slots.contains_key(key)
    }

    /// Removes and returns the live entry for `key`.
    pub fn remove(&self, key: &RoutingKey) -> Option<T> {
        let mut inner = self.inner.lock();
        match inner.slots.get(key) {
            Some(Slot::Live(_)) => match inner.slots.remove(key) {
                Some(Slot::Live(value)) => Some(value),
                _ => None,
            },
            _ => None,
        }
    }

    /// Every live entry, the global one first.
    pub fn all(&self) -> Vec<T> {
        self.entries_where(|_| true).into_iter().map(|(_, v)| v).collect()
    }

    /// Live folder entries with their keys.
    pub fn folders(&self) -> Vec<(RoutingKey, T)> {
        self.entries_where(|key| matches!(key, RoutingKey::Folder(_)))
    }

    fn entries_where(&self, keep: impl Fn(&RoutingKey) -> bool) -> Vec<(RoutingKey, T)> {
        let inner = self.inner.lock();
        let mut entries: Vec<(RoutingKey, T)> = inner
            .slots
            .iter()
            .filter(|(key, _)| keep(key))
            .filter_map(|(key, slot)| match slot {
                Slot::Live(value) => Some((key.clone(), value.clone())),
                Slot::Pending => None,
            })
            .collect();
        entries.sort_by_key(|(key, _)| match key {
            RoutingKey::Global => String::new(),
            RoutingKey::Folder(uri) => uri.to_string(),
        });
        entries
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    /// Whether no entry is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuses further reservations and returns every live entry, the
    /// global one first.
    pub fn close(&self) -> Vec<T> {
        let live = self.all();
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.slots.retain(|_, slot| matches!(slot, Slot::Pending));
        live
    }

    /// Whether [`Registry::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl<T: Clone> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A claimed routing key awaiting its value.
#[must_use = "dropping a reservation releases the key"]
pub struct Reservation<'a, T: Clone> {
    registry: &'a Registry<T>,
    key: Option<RoutingKey>,
}

impl<T: Clone> Reservation<'_, T> {
    /// The claimed key.
    pub fn key(&self) -> Option<&RoutingKey> {
        self.key.as_ref()
    }

    /// Publishes `value` under the claimed key.
    ///
    /// # Errors
    ///
    /// [`ContextError::ManagerDisposed`] if the registry was closed while the
    /// value was being created; the key is released and `value` dropped.
    pub fn fill(mut self, value: T) -> ContextResult<()> {
        let Some(key) = self.key.take() else {
            return Ok(());
        };
        let mut inner = self.registry.inner.lock();
        if inner.closed {
            inner.slots.remove(&key);
            return Err(ContextError::ManagerDisposed);
        }
        inner.slots.insert(key, Slot::Live(value));
        Ok(())
    }
}

impl<T: Clone> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let mut inner = self.registry.inner.lock();
            if matches!(inner.slots.get(&key), Some(Slot::Pending)) {
                inner.slots.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsp_types::Url;

    fn folder(path: &str) -> RoutingKey {
        RoutingKey::Folder(Url::parse(&format!("file://{path}")).unwrap())
    }

    #[test]
    fn test_reserve_is_exclusive() {
        let registry = Registry::<u32>::new();
        let reservation = registry.reserve(RoutingKey::Global).unwrap();
        assert!(matches!(
            registry.reserve(RoutingKey::Global),
            Err(ContextError::DuplicateContext(_))
        ));
        assert!(registry.contains(&RoutingKey::Global));
        assert!(registry.get(&RoutingKey::Global).is_none());

        reservation.fill(7).unwrap();
        assert_eq!(registry.get(&RoutingKey::Global), Some(7));
        assert!(matches!(
            registry.reserve(RoutingKey::Global),
            Err(ContextError::DuplicateContext(_))
        ));
    }

    #[test]
    fn test_dropped_reservation_releases_key() {
        let registry = Registry::<u32>::new();
        drop(registry.reserve(folder("/w/f1")).unwrap());
        assert!(!registry.contains(&folder("/w/f1")));
        registry.reserve(folder("/w/f1")).unwrap().fill(1).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_all_lists_global_first() {
        let registry = Registry::<&'static str>::new();
        registry.reserve(folder("/w/b")).unwrap().fill("b").unwrap();
        registry.reserve(RoutingKey::Global).unwrap().fill("g").unwrap();
        registry.reserve(folder("/w/a")).unwrap().fill("a").unwrap();

        assert_eq!(registry.all(), vec!["g", "a", "b"]);
        let folders: Vec<_> = registry.folders().into_iter().map(|(_, v)| v).collect();
        assert_eq!(folders, vec!["a", "b"]);

        assert_eq!(registry.remove(&RoutingKey::Global), Some("g"));
        assert_eq!(registry.remove(&RoutingKey::Global), None);
        assert_eq!(registry.all(), vec!["a", "b"]);
    }

    #[test]
    fn test_remove_ignores_pending() {
        let registry = Registry::<u32>::new();
        let reservation = registry.reserve(RoutingKey::Global).unwrap();
        assert_eq!(registry.remove(&RoutingKey::Global), None);
        reservation.fill(3).unwrap();
        assert_eq!(registry.get(&RoutingKey::Global), Some(3));
    }

    #[test]
    fn test_close_rejects_late_fill() {
        let registry = Registry::<u32>::new();
        registry.reserve(RoutingKey::Global).unwrap().fill(1).unwrap();
        let pending = registry.reserve(folder("/w/f1")).unwrap();

        assert_eq!(registry.close(), vec![1]);
        assert!(registry.is_closed());
        assert!(matches!(pending.fill(2), Err(ContextError::ManagerDisposed)));
        assert!(registry.is_empty());
        assert!(!registry.contains(&folder("/w/f1")));
        assert!(matches!(
            registry.reserve(RoutingKey::Global),
            Err(ContextError::ManagerDisposed)
        ));
    }
}
