//! Typed publish/subscribe channels.
//!
//! An [`Emitter`] delivers a value synchronously to every listener that is
//! subscribed at the time of the call. Subscribing returns a
//! [`Subscription`]; the listener stays registered until the subscription is
//! disposed or dropped.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct EmitterInner<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
    closed: bool,
}

/// A typed event stream.
pub struct Emitter<T> {
    inner: Arc<Mutex<EmitterInner<T>>>,
}

impl<T: 'static> Emitter<T> {
    /// Creates an emitter with no listeners.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EmitterInner {
                next_id: 0,
                listeners: Vec::new(),
                closed: false,
            })),
        }
    }

    /// Registers a listener. Subscribing to a closed emitter returns an inert
    /// subscription.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Subscription::empty();
            }
            let id = inner.next_id;
            inner.next_id += 1;
            inner.listeners.push((id, Arc::new(listener)));
            id
        };

        let weak: Weak<Mutex<EmitterInner<T>>> = Arc::downgrade(&self.inner);
        Subscription::from_fn(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().listeners.retain(|(lid, _)| *lid != id);
            }
        })
    }

    /// Delivers `value` to every listener.
    ///
    /// Listeners run outside the internal lock, so they may subscribe or
    /// dispose other subscriptions while being notified.
    pub fn emit(&self, value: &T) {
        let listeners: Vec<Listener<T>> = {
            let inner = self.inner.lock();
            inner.listeners.iter().map(|(_, l)| l.clone()).collect()
        };
        for listener in listeners {
            listener(value);
        }
    }

    /// Drops every listener and refuses new ones.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.listeners.clear();
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }
}

impl<T: 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Disposer token returned by every registration.
///
/// Disposal is idempotent and also happens on drop.
#[must_use = "dropping a subscription unregisters it immediately"]
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wraps an arbitrary teardown action.
    pub fn from_fn(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    /// A subscription with nothing to release.
    pub fn empty() -> Self {
        Self { dispose: None }
    }

    /// Runs the teardown action if it has not run yet.
    pub fn dispose(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }

    /// Whether the teardown action already ran.
    pub fn is_disposed(&self) -> bool {
        self.dispose.is_none()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// An owned list of subscriptions released together.
#[derive(Default)]
pub struct Subscriptions {
    items: Mutex<Vec<Subscription>>,
}

impl Subscriptions {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscription to be released by [`Subscriptions::dispose_all`].
    pub fn push(&self, subscription: Subscription) {
        self.items.lock().push(subscription);
    }

    /// Releases every subscription, most recent first.
    pub fn dispose_all(&self) {
        let items = std::mem::take(&mut *self.items.lock());
        for mut item in items.into_iter().rev() {
            item.dispose();
        }
    }

    /// Number of subscriptions held.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether no subscriptions are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
