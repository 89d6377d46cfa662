//! Editor commands.
//!
//! Commands are registered once per manager under their `clangd.*` id and
//! run with the manager, so every handler resolves its target context
//! through the same lookups the rest of the bridge uses.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::{CommandError, CommandResult};
use crate::event::Subscription;
use crate::manager::ContextManager;

/// Future returned by a command handler.
pub type CommandFuture = BoxFuture<'static, CommandResult<()>>;

/// An async command handler.
pub type CommandHandler = Arc<dyn Fn(Arc<ContextManager>, Value) -> CommandFuture + Send + Sync>;

/// Wraps an async function as a [`CommandHandler`].
pub fn handler<F, Fut>(f: F) -> CommandHandler
where
    F: Fn(Arc<ContextManager>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CommandResult<()>> + Send + 'static,
{
    Arc::new(move |manager, args| Box::pin(f(manager, args)))
}

/// Decodes command arguments, treating `null` as the type's absence.
///
/// # Errors
///
/// Returns [`CommandError::InvalidArguments`] if `args` has the wrong shape.
pub fn parse_args<T: DeserializeOwned>(args: Value) -> CommandResult<T> {
    serde_json::from_value(args).map_err(|e| CommandError::InvalidArguments(e.to_string()))
}

/// Command id to handler map.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: RwLock<HashMap<String, CommandHandler>>,
}

impl CommandRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `id` until the subscription is disposed.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::AlreadyRegistered`] if `id` is taken.
    pub fn register(self: &Arc<Self>, id: &str, handler: CommandHandler) -> CommandResult<Subscription> {
        {
            let mut handlers = self.handlers.write();
            if handlers.contains_key(id) {
                return Err(CommandError::AlreadyRegistered(id.to_string()));
            }
            handlers.insert(id.to_string(), handler);
        }
        debug!(command = id, "command registered");
        let registry = Arc::downgrade(self);
        let id = id.to_string();
        Ok(Subscription::from_fn(move || {
            if let Some(registry) = registry.upgrade() {
                registry.handlers.write().remove(&id);
            }
        }))
    }

    /// Runs the handler registered under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::NotFound`] for an unknown id, or whatever the
    /// handler returns.
    pub async fn execute(&self, manager: Arc<ContextManager>, id: &str, args: Value) -> CommandResult<()> {
        let handler = self
            .handlers
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CommandError::NotFound(id.to_string()))?;
        handler(manager, args).await
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.handlers.read().contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}
