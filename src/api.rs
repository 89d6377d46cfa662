//! Surface for other extensions that want to talk to clangd directly.

use std::sync::Arc;

use lsp_types::Url;

use crate::event::{Emitter, Subscription, Subscriptions};
use crate::lsp::Connection;
use crate::manager::ContextManager;

/// Connections of the live contexts, plus a change notification.
pub struct ClientApi {
    manager: Arc<ContextManager>,
    changed: Arc<Emitter<()>>,
    subscriptions: Subscriptions,
}

impl ClientApi {
    /// Wraps `manager`.
    pub fn new(manager: Arc<ContextManager>) -> Self {
        let changed = Arc::new(Emitter::new());
        let subscriptions = Subscriptions::new();
        let on_create = changed.clone();
        subscriptions.push(manager.on_did_create_context(move |_| on_create.emit(&())));
        let on_dispose = changed.clone();
        subscriptions.push(manager.on_did_dispose_context(move |_| on_dispose.emit(&())));
        Self {
            manager,
            changed,
            subscriptions,
        }
    }

    /// Connection of the context serving the focused document.
    pub fn language_client(&self) -> Option<Arc<dyn Connection>> {
        self.manager
            .get_active_context()
            .map(|context| context.connection().clone())
    }

    /// Connection of the context serving `uri`, or the active one for
    /// `None`.
    pub fn get_language_client(&self, uri: Option<&Url>) -> Option<Arc<dyn Connection>> {
        let context = match uri {
            Some(uri) => self.manager.get_context_for_uri(uri),
            None => self.manager.get_active_context(),
        };
        context.map(|context| context.connection().clone())
    }

    /// Connections of every live context, the global one first.
    pub fn get_all_language_clients(&self) -> Vec<Arc<dyn Connection>> {
        self.manager
            .get_all_contexts()
            .iter()
            .map(|context| context.connection().clone())
            .collect()
    }

    /// Fires whenever a context is created or disposed.
    pub fn on_did_change_clients(&self, listener: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.changed.subscribe(move |_| listener())
    }

    /// Stops forwarding manager events.
    pub fn dispose(&self) {
        self.subscriptions.dispose_all();
        self.changed.close();
    }
}
