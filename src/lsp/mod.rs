//! Language server connections.
//!
//! A [`Connection`] wraps one language server process: request and
//! notification primitives, a feature-registration hook and an observable
//! run-state. [`Launcher`] creates connections; [`client::LspLauncher`] is the
//! real implementation over async-lsp.
//!
//! # Architecture
//!
//! - `client`: async-lsp backed connection and launcher
//! - `protocol`: method bindings and clangd extension payloads
//! - `state`: the Starting/Running/Stopped state machine
//! - `types`: conversion helpers

pub mod client;
pub mod protocol;
pub mod state;
pub mod types;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lsp_types::WorkspaceFolder;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::ConnectionError;
use crate::event::Subscription;

use state::{ConnectionState, StateMachine};

/// Result type for connection operations.
pub type LspResult<T> = crate::error::ConnectionResult<T>;

/// Handler for a server-pushed notification.
pub type NotificationHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// A protocol extension hook registered on a connection before it starts.
pub trait ProtocolFeature: Send + Sync {
    /// Adds client capabilities to the `initialize` request.
    fn fill_client_capabilities(&self, _capabilities: &mut Value) {}

    /// Receives the server capabilities once the handshake completed.
    fn initialize(&self, _server_capabilities: &Value) {}
}

/// State shared by every connection implementation: the run-state machine,
/// registered features and notification handlers.
#[derive(Default)]
pub struct ConnectionCore {
    state: StateMachine,
    features: RwLock<Vec<Arc<dyn ProtocolFeature>>>,
    handlers: Arc<NotificationTable>,
    capabilities: RwLock<Option<Value>>,
}

impl ConnectionCore {
    /// Creates a core in the Starting state.
    pub fn new() -> Self {
        Self::default()
    }

    /// The run-state machine.
    pub fn state(&self) -> &StateMachine {
        &self.state
    }

    /// Registers a protocol feature.
    pub fn register_feature(&self, feature: Arc<dyn ProtocolFeature>) {
        self.features.write().push(feature);
    }

    /// Lets every registered feature extend `capabilities`.
    pub fn fill_client_capabilities(&self, capabilities: &mut Value) {
        for feature in self.features.read().iter() {
            feature.fill_client_capabilities(capabilities);
        }
    }

    /// Stores the server capabilities and hands them to every feature.
    pub fn initialize_features(&self, server_capabilities: Value) {
        let features: Vec<_> = self.features.read().clone();
        for feature in features {
            feature.initialize(&server_capabilities);
        }
        *self.capabilities.write() = Some(server_capabilities);
    }

    /// Server capabilities received during the handshake.
    pub fn server_capabilities(&self) -> Option<Value> {
        self.capabilities.read().clone()
    }

    /// The notification dispatch table.
    pub fn notifications(&self) -> &Arc<NotificationTable> {
        &self.handlers
    }
}

impl std::fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("state", &self.state.get())
            .field("features", &self.features.read().len())
            .finish_non_exhaustive()
    }
}

/// Notification handlers keyed by method.
#[derive(Default)]
pub struct NotificationTable {
    next_id: Mutex<u64>,
    handlers: RwLock<HashMap<String, Vec<(u64, NotificationHandler)>>>,
}

impl NotificationTable {
    /// Registers `handler` for `method`.
    pub fn register(self: &Arc<Self>, method: &str, handler: NotificationHandler) -> Subscription {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        self.handlers
            .write()
            .entry(method.to_string())
            .or_default()
            .push((id, handler));

        let table = Arc::downgrade(self);
        let method = method.to_string();
        Subscription::from_fn(move || {
            if let Some(table) = table.upgrade() {
                let mut handlers = table.handlers.write();
                if let Some(list) = handlers.get_mut(&method) {
                    list.retain(|(hid, _)| *hid != id);
                    if list.is_empty() {
                        handlers.remove(&method);
                    }
                }
            }
        })
    }

    /// Delivers a notification. Returns whether any handler received it.
    pub fn dispatch(&self, method: &str, params: Value) -> bool {
        let handlers: Vec<NotificationHandler> = match self.handlers.read().get(method) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => {
                trace!(method, "no handler for notification");
                return false;
            }
        };
        for handler in handlers {
            handler(params.clone());
        }
        true
    }
}

/// One live channel to a language server process.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Shared state of the connection.
    fn core(&self) -> &ConnectionCore;

    /// Launches the server and performs the initialize handshake.
    ///
    /// Every feature must be registered before this is called.
    async fn start(&self) -> LspResult<()>;

    /// Shuts the server down. Safe to call in any state.
    async fn stop(&self) -> LspResult<()>;

    /// Sends a request and waits for its response, or for `cancel`.
    async fn send_request(
        &self,
        method: &str,
        params: Value,
        cancel: CancellationToken,
    ) -> LspResult<Value>;

    /// Sends a notification.
    fn send_notification(&self, method: &str, params: Value) -> LspResult<()>;

    /// Current run-state.
    fn state(&self) -> ConnectionState {
        self.core().state().get()
    }

    /// The run-state machine, for observing transitions.
    fn state_machine(&self) -> &StateMachine {
        self.core().state()
    }

    /// Registers a protocol feature.
    fn register_feature(&self, feature: Arc<dyn ProtocolFeature>) {
        self.core().register_feature(feature);
    }

    /// Registers a handler for a server-pushed notification.
    fn on_notification(&self, method: &str, handler: NotificationHandler) -> Subscription {
        self.core().notifications().register(method, handler)
    }

    /// Capabilities the server announced.
    fn server_capabilities(&self) -> Option<Value> {
        self.core().server_capabilities()
    }
}

/// Typed request helpers over [`Connection`].
#[async_trait]
pub trait ConnectionExt {
    /// Sends a request with serializable params and decodes the response.
    async fn request<P, T>(&self, method: &str, params: &P, cancel: CancellationToken) -> LspResult<T>
    where
        P: Serialize + Sync,
        T: DeserializeOwned;

    /// Sends a notification with serializable params.
    fn notify<P: Serialize>(&self, method: &str, params: &P) -> LspResult<()>;
}

#[async_trait]
impl<C: Connection + ?Sized> ConnectionExt for C {
    async fn request<P, T>(&self, method: &str, params: &P, cancel: CancellationToken) -> LspResult<T>
    where
        P: Serialize + Sync,
        T: DeserializeOwned,
    {
        let params = serde_json::to_value(params)
            .map_err(|e| ConnectionError::ParseError(format!("{method} params: {e}")))?;
        let value = self.send_request(method, params, cancel).await?;
        serde_json::from_value(value)
            .map_err(|e| ConnectionError::ParseError(format!("{method} result: {e}")))
    }

    fn notify<P: Serialize>(&self, method: &str, params: &P) -> LspResult<()> {
        let params = serde_json::to_value(params)
            .map_err(|e| ConnectionError::ParseError(format!("{method} params: {e}")))?;
        self.send_notification(method, params)
    }
}

/// How to run the server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    /// Executable (or script, when `shell` is set).
    pub command: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Run the command line through the platform shell.
    pub shell: bool,
}

/// Client-side options of a connection.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Language identifiers served by the connection.
    pub document_selector: Vec<String>,
    /// `initializationOptions` sent with `initialize`.
    pub initialization_options: Value,
    /// Workspace folders announced to the server.
    pub workspace_folders: Vec<WorkspaceFolder>,
    /// Timeout for the initialize handshake.
    pub init_timeout: Duration,
    /// Timeout for individual requests.
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            document_selector: Vec::new(),
            initialization_options: Value::Null,
            workspace_folders: Vec::new(),
            init_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Creates connections. A connection is returned unstarted so that features
/// can register before the handshake.
pub trait Launcher: Send + Sync {
    /// Builds a connection for `spec`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be constructed.
    fn launch(&self, spec: ServerSpec, options: ClientOptions) -> LspResult<Arc<dyn Connection>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_notification_table_dispatch_and_unregister() {
        let table = Arc::new(NotificationTable::default());
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let mut sub = table.register(
            "textDocument/inactiveRegions",
            Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(table.dispatch("textDocument/inactiveRegions", json!({})));
        assert!(!table.dispatch("textDocument/other", json!({})));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        sub.dispose();
        assert!(!table.dispatch("textDocument/inactiveRegions", json!({})));
    }

    struct CapabilityFlag;

    impl ProtocolFeature for CapabilityFlag {
        fn fill_client_capabilities(&self, capabilities: &mut Value) {
            capabilities["textDocument"]["flag"] = json!(true);
        }
    }

    #[test]
    fn test_core_fills_capabilities() {
        let core = ConnectionCore::new();
        core.register_feature(Arc::new(CapabilityFlag));
        let mut caps = json!({"textDocument": {}});
        core.fill_client_capabilities(&mut caps);
        assert_eq!(caps["textDocument"]["flag"], json!(true));
    }
}
