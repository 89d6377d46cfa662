//! One clangd session.
//!
//! A [`ClangdContext`] owns exactly one [`Connection`] and optionally the
//! workspace folder it serves. It starts the connection with every built-in
//! feature attached, keeps text documents in sync, applies the response
//! middleware and defers diagnostics while the user types. Contexts are only
//! ever created by the [`crate::manager::ContextManager`].

mod diagnostics;
pub mod middleware;

pub use diagnostics::DelayedDiagnostics;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use lsp_types::{
    CompletionList, CompletionParams, CompletionResponse, DidChangeTextDocumentParams,
    DidCloseTextDocumentParams, DidOpenTextDocumentParams, ExecuteCommandParams,
    GotoDefinitionParams, GotoDefinitionResponse, Hover, HoverParams, Location,
    PublishDiagnosticsParams, ReferenceParams, TextDocumentContentChangeEvent,
    TextDocumentIdentifier, TextDocumentItem, Url, VersionedTextDocumentIdentifier,
    WorkspaceFolder, WorkspaceSymbolParams, WorkspaceSymbolResponse,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Configuration, ConfigurationExt, Settings, Variables, settings};
use crate::editor::{EditorHost, MessageLevel, TextDocument, text_in_range};
use crate::error::{ConnectionError, ContextError, ContextResult};
use crate::event::{Subscription, Subscriptions};
use crate::features::Feature;
use crate::install::Installer;
use crate::lsp::protocol::{ClangdSettings, CompileCommand, pushed};
use crate::lsp::state::ConnectionState;
use crate::lsp::types::url_to_path;
use crate::lsp::{ClientOptions, Connection, ConnectionExt, Launcher, LspResult, ProtocolFeature};

/// Language identifiers clangd serves.
pub const LANGUAGES: &[&str] = &["c", "cpp", "cuda-cpp", "objective-c", "objective-cpp"];

/// Whether clangd should handle `document`: a local file in a C-family
/// language.
pub fn is_clangd_document(document: &TextDocument) -> bool {
    document.uri.scheme() == "file" && LANGUAGES.contains(&document.language_id.as_str())
}

/// Identity of a context, unique for the lifetime of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which documents a context serves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoutingKey {
    /// The single shared context.
    Global,
    /// The context of one workspace folder.
    Folder(Url),
}

impl RoutingKey {
    /// The key of `folder`, or the global key for `None`.
    pub fn of(folder: Option<&WorkspaceFolder>) -> Self {
        match folder {
            Some(folder) => Self::Folder(folder.uri.clone()),
            None => Self::Global,
        }
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Folder(uri) => write!(f, "folder {uri}"),
        }
    }
}

/// Collaborators every context is built from.
#[derive(Clone)]
pub struct Services {
    /// The editor.
    pub host: Arc<dyn EditorHost>,
    /// The editor's settings.
    pub config: Arc<dyn Configuration>,
    /// Finds the clangd executable.
    pub installer: Arc<dyn Installer>,
    /// Creates connections.
    pub launcher: Arc<dyn Launcher>,
    /// Persistent storage directory.
    pub storage_root: PathBuf,
}

struct EditsNearCursor;

impl ProtocolFeature for EditsNearCursor {
    fn fill_client_capabilities(&self, capabilities: &mut Value) {
        capabilities["textDocument"]["completion"]["editsNearCursor"] = json!(true);
    }
}

/// A live clangd session.
pub struct ClangdContext {
    id: ContextId,
    key: RoutingKey,
    folder: Option<WorkspaceFolder>,
    services: Services,
    connection: Arc<dyn Connection>,
    features: Vec<Arc<dyn Feature>>,
    diagnostics: DelayedDiagnostics,
    subscriptions: Subscriptions,
    opened: Mutex<HashSet<Url>>,
    disposed: AtomicBool,
}

impl ClangdContext {
    /// Starts a context serving `folder`, or every folder for `None`.
    ///
    /// Returns `None` when there is no usable clangd or the server failed to
    /// start; the user has been told in either case.
    pub async fn create(
        services: Services,
        id: ContextId,
        folder: Option<WorkspaceFolder>,
        features: Vec<Arc<dyn Feature>>,
    ) -> Option<Arc<Self>> {
        let key = RoutingKey::of(folder.as_ref());
        let vars = Self::variables(&services, folder.as_ref());
        let scope = folder.as_ref().map(|f| f.uri.clone());
        let settings = Settings::load(services.config.as_ref(), &vars, scope.as_ref());

        let executable = services
            .installer
            .resolve(&services.storage_root, &settings)
            .await?;

        let spec = settings.server_spec(&executable, vars.workspace_root.clone());
        let options = ClientOptions {
            document_selector: LANGUAGES.iter().map(|l| l.to_string()).collect(),
            initialization_options: settings.initialization_options(),
            workspace_folders: match &folder {
                Some(folder) => vec![folder.clone()],
                None => services.host.workspace_folders(),
            },
            ..ClientOptions::default()
        };
        let connection = match services.launcher.launch(spec, options) {
            Ok(connection) => connection,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to launch clangd");
                services
                    .host
                    .show_message(MessageLevel::Error, &format!("Failed to launch clangd: {e}"));
                return None;
            }
        };

        let context = Arc::new(Self {
            id,
            key,
            folder,
            diagnostics: DelayedDiagnostics::new(
                services.host.clone(),
                Duration::from_millis(settings.diagnostics_delay),
            ),
            services,
            connection,
            features,
            subscriptions: Subscriptions::new(),
            opened: Mutex::new(HashSet::new()),
            disposed: AtomicBool::new(false),
        });

        context.connection.register_feature(Arc::new(EditsNearCursor));
        let weak = Arc::downgrade(&context);
        context.subscribe_notification(pushed::PUBLISH_DIAGNOSTICS, move |params| {
            let Some(context) = weak.upgrade() else {
                return;
            };
            match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                Ok(params) => context.diagnostics.push(params),
                Err(e) => debug!(context = %context.id, error = %e, "malformed diagnostics"),
            }
        });
        for feature in &context.features {
            feature.clone().attach(&context);
        }

        if let Err(e) = context.connection.start().await {
            warn!(context = %context.id, key = %context.key, error = %e, "clangd failed to start");
            context
                .services
                .host
                .show_message(MessageLevel::Error, &format!("Failed to start clangd: {e}"));
            if let Err(e) = context.dispose().await {
                debug!(error = %e, "context already disposed");
            }
            return None;
        }
        info!(context = %context.id, key = %context.key, "clangd context running");
        Some(context)
    }

    fn variables(services: &Services, folder: Option<&WorkspaceFolder>) -> Variables {
        let root = folder
            .map(|f| f.uri.clone())
            .or_else(|| services.host.workspace_folders().first().map(|f| f.uri.clone()))
            .and_then(|uri| url_to_path(&uri));
        let active = services
            .host
            .active_document()
            .and_then(|doc| url_to_path(&doc.uri));
        Variables::new(root.as_deref(), active.as_deref())
    }

    /// Identity of this context.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Routing key this context serves.
    pub fn key(&self) -> &RoutingKey {
        &self.key
    }

    /// The workspace folder this context serves, `None` for the global one.
    pub fn folder(&self) -> Option<&WorkspaceFolder> {
        self.folder.as_ref()
    }

    /// The exclusively owned connection.
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// The editor.
    pub fn host(&self) -> &Arc<dyn EditorHost> {
        &self.services.host
    }

    /// The editor's settings store.
    pub fn config(&self) -> &Arc<dyn Configuration> {
        &self.services.config
    }

    /// The diagnostics deferral policy.
    pub fn diagnostics(&self) -> &DelayedDiagnostics {
        &self.diagnostics
    }

    /// Current settings, re-read from the settings store.
    pub fn settings(&self) -> Settings {
        let vars = Self::variables(&self.services, self.folder.as_ref());
        let scope = self.folder.as_ref().map(|f| f.uri.clone());
        Settings::load(self.services.config.as_ref(), &vars, scope.as_ref())
    }

    fn setting<T: serde::de::DeserializeOwned>(&self, name: &str, default: T) -> T {
        let scope = self.folder.as_ref().map(|f| &f.uri);
        self.services.config.get_or(&settings::key(name), scope, default)
    }

    /// Keeps `subscription` alive until the context is disposed.
    pub fn push_subscription(&self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    /// Registers a server notification handler for the lifetime of the
    /// context.
    pub fn subscribe_notification(&self, method: &str, handler: impl Fn(Value) + Send + Sync + 'static) {
        let subscription = self.connection.on_notification(method, Arc::new(handler));
        self.subscriptions.push(subscription);
    }

    /// Whether the handshake is still in progress.
    pub fn client_is_starting(&self) -> bool {
        self.connection.state() == ConnectionState::Starting
    }

    /// Whether the server is ready for requests.
    pub fn client_is_running(&self) -> bool {
        self.connection.state() == ConnectionState::Running
    }

    /// Whether [`ClangdContext::dispose`] ran.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// A weak handle for callbacks that must not keep the context alive.
    pub fn downgrade(self: &Arc<Self>) -> Weak<Self> {
        Arc::downgrade(self)
    }

    /// Whether `uri` is inside this context's folder. The global context
    /// serves everything.
    pub fn serves(&self, uri: &Url) -> bool {
        match &self.folder {
            None => true,
            Some(folder) => self
                .services
                .host
                .workspace_folder_for(uri)
                .is_some_and(|f| f.uri == folder.uri),
        }
    }

    /// Visible documents clangd handles that this context serves.
    pub fn visible_clangd_documents(&self) -> Vec<Url> {
        let host = &self.services.host;
        let qualifying: HashSet<Url> = host
            .open_documents()
            .into_iter()
            .filter(is_clangd_document)
            .map(|doc| doc.uri)
            .collect();
        host.visible_documents()
            .into_iter()
            .filter(|uri| qualifying.contains(uri) && self.serves(uri))
            .collect()
    }

    /// Announces `document` to the server. Later calls for the same
    /// document are ignored until it is closed.
    pub fn did_open(&self, document: &TextDocument) {
        if !is_clangd_document(document) || !self.opened.lock().insert(document.uri.clone()) {
            return;
        }
        let text = self
            .services
            .host
            .document_text(&document.uri)
            .unwrap_or_default();
        let params = DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: document.uri.clone(),
                language_id: document.language_id.clone(),
                version: document.version,
                text,
            },
        };
        if let Err(e) = self.connection.notify("textDocument/didOpen", &params) {
            debug!(context = %self.id, uri = %document.uri, error = %e, "didOpen not sent");
        }
    }

    /// Forwards an edit and restarts the diagnostics countdown.
    pub fn did_change(&self, document: &TextDocument, text: &str) {
        self.diagnostics.on_edit();
        if !self.opened.lock().contains(&document.uri) {
            return;
        }
        let params = DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier {
                uri: document.uri.clone(),
                version: document.version,
            },
            content_changes: vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text: text.to_string(),
            }],
        };
        if let Err(e) = self.connection.notify("textDocument/didChange", &params) {
            debug!(context = %self.id, uri = %document.uri, error = %e, "didChange not sent");
        }
    }

    /// Forwards a close.
    pub fn did_close(&self, document: &TextDocument) {
        if !self.opened.lock().remove(&document.uri) {
            return;
        }
        let params = DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier {
                uri: document.uri.clone(),
            },
        };
        if let Err(e) = self.connection.notify("textDocument/didClose", &params) {
            debug!(context = %self.id, uri = %document.uri, error = %e, "didClose not sent");
        }
    }

    /// Whether `uri` was announced with `didOpen`.
    pub fn is_open(&self, uri: &Url) -> bool {
        self.opened.lock().contains(uri)
    }

    /// Completion with server-side ranking preserved.
    pub async fn completion(
        &self,
        params: CompletionParams,
        cancel: CancellationToken,
    ) -> LspResult<Option<CompletionResponse>> {
        if !self.setting("enableCodeCompletion", true) {
            return Ok(Some(CompletionResponse::List(CompletionList {
                is_incomplete: false,
                items: Vec::new(),
            })));
        }
        let uri = params.text_document_position.text_document.uri.clone();
        let position = params.text_document_position.position;
        let response: Option<CompletionResponse> = self
            .connection
            .request("textDocument/completion", &params, cancel)
            .await?;
        if !self.setting("serverCompletionRanking", true) {
            return Ok(response);
        }
        let text = self.services.host.document_text(&uri).unwrap_or_default();
        let list = middleware::rank_by_server(response, position, |range| {
            text_in_range(&text, range)
        });
        Ok(Some(CompletionResponse::List(list)))
    }

    /// Hover, unless disabled.
    pub async fn hover(&self, params: HoverParams, cancel: CancellationToken) -> LspResult<Option<Hover>> {
        if !self.setting("enableHover", true) {
            return Ok(None);
        }
        self.connection
            .request("textDocument/hover", &params, cancel)
            .await
    }

    /// Workspace symbols with qualified names for qualified queries.
    pub async fn workspace_symbols(
        &self,
        params: WorkspaceSymbolParams,
        cancel: CancellationToken,
    ) -> LspResult<Option<WorkspaceSymbolResponse>> {
        let query = params.query.clone();
        let response = self
            .connection
            .request("workspace/symbol", &params, cancel)
            .await?;
        Ok(middleware::qualify_symbols(&query, response))
    }

    async fn navigate(
        &self,
        method: &str,
        params: GotoDefinitionParams,
        cancel: CancellationToken,
    ) -> LspResult<Option<GotoDefinitionResponse>> {
        let response: Option<GotoDefinitionResponse> = self
            .connection
            .request(method, &params, cancel.clone())
            .await?;
        match response {
            Some(response) if self.setting("followSymlinks", false) => Ok(Some(
                middleware::SymlinkResolver::new()
                    .navigation(response, &cancel)
                    .await,
            )),
            other => Ok(other),
        }
    }

    /// `textDocument/definition`.
    pub async fn definition(
        &self,
        params: GotoDefinitionParams,
        cancel: CancellationToken,
    ) -> LspResult<Option<GotoDefinitionResponse>> {
        self.navigate("textDocument/definition", params, cancel).await
    }

    /// `textDocument/typeDefinition`.
    pub async fn type_definition(
        &self,
        params: GotoDefinitionParams,
        cancel: CancellationToken,
    ) -> LspResult<Option<GotoDefinitionResponse>> {
        self.navigate("textDocument/typeDefinition", params, cancel).await
    }

    /// `textDocument/implementation`.
    pub async fn implementation(
        &self,
        params: GotoDefinitionParams,
        cancel: CancellationToken,
    ) -> LspResult<Option<GotoDefinitionResponse>> {
        self.navigate("textDocument/implementation", params, cancel).await
    }

    /// `textDocument/declaration`.
    pub async fn declaration(
        &self,
        params: GotoDefinitionParams,
        cancel: CancellationToken,
    ) -> LspResult<Option<GotoDefinitionResponse>> {
        self.navigate("textDocument/declaration", params, cancel).await
    }

    /// `textDocument/references`.
    pub async fn references(
        &self,
        params: ReferenceParams,
        cancel: CancellationToken,
    ) -> LspResult<Option<Vec<Location>>> {
        let response: Option<Vec<Location>> = self
            .connection
            .request("textDocument/references", &params, cancel.clone())
            .await?;
        match response {
            Some(locations) if self.setting("followSymlinks", false) => Ok(Some(
                middleware::SymlinkResolver::new()
                    .locations(locations, &cancel)
                    .await,
            )),
            other => Ok(other),
        }
    }

    /// `workspace/executeCommand`. Server errors are shown to the user since
    /// commands are always user-initiated.
    pub async fn execute_command(
        &self,
        params: ExecuteCommandParams,
        cancel: CancellationToken,
    ) -> LspResult<Option<Value>> {
        let result = self
            .connection
            .request("workspace/executeCommand", &params, cancel)
            .await;
        if let Err(ConnectionError::RequestFailed(message)) = &result {
            self.services.host.show_message(MessageLevel::Error, message);
        }
        result
    }

    /// Overrides compile commands for individual files through
    /// `workspace/didChangeConfiguration`.
    pub fn update_compilation_database(
        &self,
        changes: HashMap<String, CompileCommand>,
    ) -> LspResult<()> {
        let settings = ClangdSettings {
            compilation_database_changes: changes,
        };
        debug!(context = %self.id, files = settings.compilation_database_changes.len(), "compile command overrides");
        self.connection
            .notify("workspace/didChangeConfiguration", &json!({ "settings": settings }))
    }

    /// Releases every feature, subscription and diagnostic, then stops the
    /// connection. Works whether or not startup completed.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::AlreadyDisposed`] on a second call.
    pub async fn dispose(&self) -> ContextResult<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Err(ContextError::AlreadyDisposed(self.id.0));
        }
        info!(context = %self.id, key = %self.key, "disposing context");
        for feature in self.features.iter().rev() {
            feature.detach(self);
        }
        self.subscriptions.dispose_all();
        self.diagnostics.dispose();
        self.opened.lock().clear();
        if let Err(e) = self.connection.stop().await {
            warn!(context = %self.id, error = %e, "error while stopping clangd");
        }
        Ok(())
    }
}

impl fmt::Debug for ClangdContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClangdContext")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.connection.state())
            .finish_non_exhaustive()
    }
}
