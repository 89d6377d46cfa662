//! Common test helpers: an in-memory editor, a scripted clangd and the
//! wiring that turns them into a running manager.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lsp_types::{Diagnostic, Range, Url, WorkspaceFolder};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use clangd_bridge::config::{ConfigTarget, Configuration, Settings};
use clangd_bridge::editor::{
    Decorations, EditorEvent, EditorHost, InlayHint, MessageLevel, OpenOptions, TextDocument,
    ViewId,
};
use clangd_bridge::error::{ConfigResult, ConnectionError};
use clangd_bridge::install::Installer;
use clangd_bridge::lsp::state::ConnectionState;
use clangd_bridge::lsp::{
    ClientOptions, Connection, ConnectionCore, Launcher, LspResult, ServerSpec,
};
use clangd_bridge::{Builtin, ClangdContext, ContextManager, Services};

/// `file:///w/<name>` as a workspace folder.
pub fn folder(name: &str) -> WorkspaceFolder {
    WorkspaceFolder {
        uri: url(&format!("file:///w/{name}")),
        name: name.to_string(),
    }
}

/// Parses `uri`.
pub fn url(uri: &str) -> Url {
    Url::parse(uri).expect("valid test uri")
}

#[derive(Default)]
struct HostState {
    folders: Vec<WorkspaceFolder>,
    documents: Vec<(TextDocument, String)>,
    visible: Vec<Url>,
    active: Option<Url>,
    selection: Option<Range>,
    status: Option<String>,
    context_keys: HashMap<String, bool>,
    diagnostics: HashMap<Url, Vec<Diagnostic>>,
    publishes: Vec<(Url, usize)>,
    inlay_hints: HashMap<Url, Vec<InlayHint>>,
    decorations: HashMap<Url, Decorations>,
    messages: Vec<(MessageLevel, String)>,
    prompts: Vec<String>,
    answers: VecDeque<String>,
    opened: Vec<(Url, OpenOptions)>,
    refreshed: Vec<ViewId>,
}

/// An editor that keeps everything in memory and records every UI call.
#[derive(Default)]
pub struct RecordingHost {
    state: Mutex<HostState>,
}

impl RecordingHost {
    /// A host with `folders` open.
    pub fn with_folders(folders: Vec<WorkspaceFolder>) -> Arc<Self> {
        let host = Self::default();
        host.state.lock().folders = folders;
        Arc::new(host)
    }

    /// Opens `uri` as a `language` document and shows it in the focused
    /// editor.
    pub fn add_document(&self, uri: &str, language: &str, text: &str) -> TextDocument {
        let document = TextDocument::new(url(uri), language, 1);
        let mut state = self.state.lock();
        state.documents.retain(|(d, _)| d.uri != document.uri);
        state.documents.push((document.clone(), text.to_string()));
        if !state.visible.contains(&document.uri) {
            state.visible.push(document.uri.clone());
        }
        state.active = Some(document.uri.clone());
        document
    }

    /// The open document at `uri`.
    pub fn document(&self, uri: &Url) -> TextDocument {
        self.state
            .lock()
            .documents
            .iter()
            .find(|(d, _)| &d.uri == uri)
            .map(|(d, _)| d.clone())
            .expect("document is open")
    }

    /// Closes `uri`.
    pub fn remove_document(&self, uri: &Url) {
        let mut state = self.state.lock();
        state.documents.retain(|(d, _)| &d.uri != uri);
        state.visible.retain(|v| v != uri);
        if state.active.as_ref() == Some(uri) {
            state.active = None;
        }
    }

    /// Replaces the visible editors.
    pub fn set_visible(&self, uris: Vec<Url>) {
        self.state.lock().visible = uris;
    }

    /// Moves focus.
    pub fn set_active(&self, uri: Option<Url>) {
        self.state.lock().active = uri;
    }

    /// Sets the selection of the focused editor.
    pub fn select(&self, range: Range) {
        self.state.lock().selection = Some(range);
    }

    /// Replaces the workspace folders.
    pub fn set_folders(&self, folders: Vec<WorkspaceFolder>) {
        self.state.lock().folders = folders;
    }

    /// Queues the answer to the next prompt.
    pub fn answer_next(&self, answer: &str) {
        self.state.lock().answers.push_back(answer.to_string());
    }

    pub fn status(&self) -> Option<String> {
        self.state.lock().status.clone()
    }

    pub fn context_key(&self, key: &str) -> Option<bool> {
        self.state.lock().context_keys.get(key).copied()
    }

    pub fn diagnostics(&self, uri: &Url) -> Vec<Diagnostic> {
        self.state.lock().diagnostics.get(uri).cloned().unwrap_or_default()
    }

    /// Every `publish_diagnostics` call as (uri, count).
    pub fn publishes(&self) -> Vec<(Url, usize)> {
        self.state.lock().publishes.clone()
    }

    pub fn inlay_hints(&self, uri: &Url) -> Option<Vec<InlayHint>> {
        self.state.lock().inlay_hints.get(uri).cloned()
    }

    pub fn decorations(&self, uri: &Url) -> Option<Decorations> {
        self.state.lock().decorations.get(uri).cloned()
    }

    pub fn messages(&self) -> Vec<(MessageLevel, String)> {
        self.state.lock().messages.clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.state.lock().prompts.clone()
    }

    pub fn opened(&self) -> Vec<(Url, OpenOptions)> {
        self.state.lock().opened.clone()
    }

    pub fn refreshed(&self) -> Vec<ViewId> {
        self.state.lock().refreshed.clone()
    }
}

#[async_trait]
impl EditorHost for RecordingHost {
    fn workspace_folders(&self) -> Vec<WorkspaceFolder> {
        self.state.lock().folders.clone()
    }

    fn open_documents(&self) -> Vec<TextDocument> {
        self.state.lock().documents.iter().map(|(d, _)| d.clone()).collect()
    }

    fn visible_documents(&self) -> Vec<Url> {
        self.state.lock().visible.clone()
    }

    fn active_document(&self) -> Option<TextDocument> {
        let state = self.state.lock();
        let active = state.active.as_ref()?;
        state
            .documents
            .iter()
            .find(|(d, _)| &d.uri == active)
            .map(|(d, _)| d.clone())
    }

    fn active_selection(&self) -> Option<Range> {
        self.state.lock().selection
    }

    fn document_text(&self, uri: &Url) -> Option<String> {
        self.state
            .lock()
            .documents
            .iter()
            .find(|(d, _)| &d.uri == uri)
            .map(|(_, text)| text.clone())
    }

    fn set_status(&self, text: Option<String>) {
        self.state.lock().status = text;
    }

    fn set_context_key(&self, key: &str, value: bool) {
        self.state.lock().context_keys.insert(key.to_string(), value);
    }

    fn refresh_view(&self, view: ViewId) {
        self.state.lock().refreshed.push(view);
    }

    fn set_decorations(&self, uri: &Url, decorations: Option<Decorations>) {
        let mut state = self.state.lock();
        match decorations {
            Some(decorations) => {
                state.decorations.insert(uri.clone(), decorations);
            }
            None => {
                state.decorations.remove(uri);
            }
        }
    }

    fn publish_diagnostics(&self, uri: &Url, diagnostics: Vec<Diagnostic>) {
        let mut state = self.state.lock();
        state.publishes.push((uri.clone(), diagnostics.len()));
        if diagnostics.is_empty() {
            state.diagnostics.remove(uri);
        } else {
            state.diagnostics.insert(uri.clone(), diagnostics);
        }
    }

    fn set_inlay_hints(&self, uri: &Url, hints: Vec<InlayHint>) {
        self.state.lock().inlay_hints.insert(uri.clone(), hints);
    }

    fn show_message(&self, level: MessageLevel, message: &str) {
        self.state.lock().messages.push((level, message.to_string()));
    }

    async fn prompt(&self, message: &str, choices: Vec<String>) -> Option<String> {
        let mut state = self.state.lock();
        state.prompts.push(message.to_string());
        state.answers.pop_front().filter(|a| choices.contains(a))
    }

    async fn open_document(&self, uri: &Url, options: OpenOptions) -> bool {
        self.state.lock().opened.push((uri.clone(), options));
        true
    }
}

/// A settings store over a map of dotted keys. Scopes are ignored.
#[derive(Default)]
pub struct MapConfig {
    values: Mutex<HashMap<String, Value>>,
    writes: Mutex<Vec<(String, Value, ConfigTarget)>>,
}

impl MapConfig {
    pub fn with(pairs: &[(&str, Value)]) -> Arc<Self> {
        let config = Self::default();
        for (key, value) in pairs {
            config.set(key, value.clone());
        }
        Arc::new(config)
    }

    /// Changes a value without recording a write.
    pub fn set(&self, key: &str, value: Value) {
        self.values.lock().insert(key.to_string(), value);
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.values.lock().get(key).cloned()
    }

    pub fn writes(&self) -> Vec<(String, Value, ConfigTarget)> {
        self.writes.lock().clone()
    }
}

impl Configuration for MapConfig {
    fn get_raw(&self, key: &str, _scope: Option<&Url>) -> Option<Value> {
        self.value(key)
    }

    fn update(&self, key: &str, value: Value, target: ConfigTarget) -> ConfigResult<()> {
        self.writes.lock().push((key.to_string(), value.clone(), target));
        self.set(key, value);
        Ok(())
    }
}

/// Resolves to a fixed executable, or to nothing.
pub struct FakeInstaller {
    executable: Option<PathBuf>,
    resolves: Mutex<usize>,
}

impl FakeInstaller {
    pub fn found() -> Arc<Self> {
        Arc::new(Self {
            executable: Some(PathBuf::from("/usr/bin/clangd")),
            resolves: Mutex::new(0),
        })
    }

    pub fn missing() -> Arc<Self> {
        Arc::new(Self {
            executable: None,
            resolves: Mutex::new(0),
        })
    }

    pub fn resolves(&self) -> usize {
        *self.resolves.lock()
    }
}

#[async_trait]
impl Installer for FakeInstaller {
    async fn resolve(&self, _storage_root: &Path, _settings: &Settings) -> Option<PathBuf> {
        *self.resolves.lock() += 1;
        self.executable.clone()
    }
}

#[derive(Clone)]
struct Reply {
    value: Value,
    delay: Duration,
}

/// What every fake server answers.
#[derive(Default)]
pub struct Script {
    capabilities: Mutex<Value>,
    replies: Mutex<HashMap<String, Reply>>,
    queued: Mutex<HashMap<String, VecDeque<Reply>>>,
    fail_start: Mutex<bool>,
    start_delay: Mutex<Duration>,
    ignore_cancellation: Mutex<bool>,
}

impl Script {
    /// Every future server advertises `capabilities`.
    pub fn capabilities(&self, capabilities: Value) {
        *self.capabilities.lock() = capabilities;
    }

    /// Answers `method` with `value` from now on.
    pub fn respond(&self, method: &str, value: Value) {
        self.replies.lock().insert(
            method.to_string(),
            Reply {
                value,
                delay: Duration::ZERO,
            },
        );
    }

    /// Answers the next `method` request with `value` after `delay`.
    pub fn respond_once(&self, method: &str, value: Value, delay: Duration) {
        self.queued
            .lock()
            .entry(method.to_string())
            .or_default()
            .push_back(Reply { value, delay });
    }

    /// Makes the handshake of future servers fail.
    pub fn fail_start(&self, fail: bool) {
        *self.fail_start.lock() = fail;
    }

    /// Makes the handshake of future servers take `delay`.
    pub fn start_delay(&self, delay: Duration) {
        *self.start_delay.lock() = delay;
    }

    /// Makes servers answer requests even after they were cancelled.
    pub fn ignore_cancellation(&self, ignore: bool) {
        *self.ignore_cancellation.lock() = ignore;
    }

    fn reply(&self, method: &str) -> Option<Reply> {
        let queued = self
            .queued
            .lock()
            .get_mut(method)
            .and_then(VecDeque::pop_front);
        queued.or_else(|| self.replies.lock().get(method).cloned())
    }
}

/// A connection to an imaginary clangd that follows a [`Script`].
pub struct FakeConnection {
    core: ConnectionCore,
    script: Arc<Script>,
    pub spec: ServerSpec,
    pub options: ClientOptions,
    client_capabilities: Mutex<Option<Value>>,
    requests: Mutex<Vec<(String, Value)>>,
    notifications: Mutex<Vec<(String, Value)>>,
}

impl FakeConnection {
    /// Capabilities sent with `initialize`.
    pub fn client_capabilities(&self) -> Option<Value> {
        self.client_capabilities.lock().clone()
    }

    /// Every request sent, in order.
    pub fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().clone()
    }

    /// Params of every request for `method`.
    pub fn requests_for(&self, method: &str) -> Vec<Value> {
        self.requests
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Params of every notification sent for `method`.
    pub fn notifications_for(&self, method: &str) -> Vec<Value> {
        self.notifications
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Delivers a server-pushed notification.
    pub fn push(&self, method: &str, params: Value) -> bool {
        self.core.notifications().dispatch(method, params)
    }

    /// Simulates the server process dying.
    pub fn crash(&self) {
        self.core.state().stop();
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    async fn start(&self) -> LspResult<()> {
        let mut capabilities = json!({"textDocument": {}, "workspace": {}});
        self.core.fill_client_capabilities(&mut capabilities);
        *self.client_capabilities.lock() = Some(capabilities);

        let delay = *self.script.start_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if *self.script.fail_start.lock() {
            self.core.state().stop();
            return Err(ConnectionError::InitializationFailed(
                "scripted failure".to_string(),
            ));
        }
        let server = self.script.capabilities.lock().clone();
        self.core.initialize_features(server);
        self.core.state().transition(ConnectionState::Running)
    }

    async fn stop(&self) -> LspResult<()> {
        self.core.state().stop();
        Ok(())
    }

    async fn send_request(
        &self,
        method: &str,
        params: Value,
        cancel: CancellationToken,
    ) -> LspResult<Value> {
        if self.core.state().get() != ConnectionState::Running {
            return Err(ConnectionError::NotRunning);
        }
        self.requests.lock().push((method.to_string(), params));
        let Some(reply) = self.script.reply(method) else {
            return Ok(Value::Null);
        };
        if *self.script.ignore_cancellation.lock() {
            tokio::time::sleep(reply.delay).await;
            return Ok(reply.value);
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(ConnectionError::Cancelled),
            _ = tokio::time::sleep(reply.delay) => Ok(reply.value),
        }
    }

    fn send_notification(&self, method: &str, params: Value) -> LspResult<()> {
        self.notifications.lock().push((method.to_string(), params));
        Ok(())
    }
}

/// Builds [`FakeConnection`]s and remembers them.
#[derive(Default)]
pub struct FakeLauncher {
    pub script: Arc<Script>,
    launched: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeLauncher {
    /// Every connection launched so far.
    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.launched.lock().clone()
    }

    /// The most recent connection.
    pub fn last(&self) -> Arc<FakeConnection> {
        self.launched
            .lock()
            .last()
            .cloned()
            .expect("a connection was launched")
    }

    /// The connection whose server announced `folder`.
    pub fn for_folder(&self, folder: &WorkspaceFolder) -> Option<Arc<FakeConnection>> {
        self.launched
            .lock()
            .iter()
            .rev()
            .find(|c| c.options.workspace_folders == vec![folder.clone()])
            .cloned()
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, spec: ServerSpec, options: ClientOptions) -> LspResult<Arc<dyn Connection>> {
        let connection = Arc::new(FakeConnection {
            core: ConnectionCore::new(),
            script: self.script.clone(),
            spec,
            options,
            client_capabilities: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
        });
        self.launched.lock().push(connection.clone());
        Ok(connection)
    }
}

/// Capabilities of a recent clangd.
pub fn clangd_capabilities() -> Value {
    json!({
        "astProvider": true,
        "memoryUsageProvider": true,
        "clangdInlayHintsProvider": true,
        "inactiveRegionsProvider": true,
        "typeHierarchyProvider": true,
    })
}

/// A manager wired to fakes.
pub struct Harness {
    pub host: Arc<RecordingHost>,
    pub config: Arc<MapConfig>,
    pub installer: Arc<FakeInstaller>,
    pub launcher: Arc<FakeLauncher>,
    pub builtin: Builtin,
    pub manager: Arc<ContextManager>,
}

impl Harness {
    /// An inactive manager over `folders` and `settings`.
    pub fn new(folders: Vec<WorkspaceFolder>, settings: &[(&str, Value)]) -> Self {
        Self::with_installer(folders, settings, FakeInstaller::found())
    }

    pub fn with_installer(
        folders: Vec<WorkspaceFolder>,
        settings: &[(&str, Value)],
        installer: Arc<FakeInstaller>,
    ) -> Self {
        let host = RecordingHost::with_folders(folders);
        let config = MapConfig::with(settings);
        let launcher = Arc::new(FakeLauncher::default());
        launcher.script.capabilities(clangd_capabilities());
        let services = Services {
            host: host.clone(),
            config: config.clone(),
            installer: installer.clone(),
            launcher: launcher.clone(),
            storage_root: PathBuf::from("/tmp/clangd-bridge-test"),
        };
        let builtin = Builtin::new(host.clone());
        let manager = ContextManager::new(services, builtin.all());
        Self {
            host,
            config,
            installer,
            launcher,
            builtin,
            manager,
        }
    }

    /// One context per folder.
    pub fn per_folder(folders: Vec<WorkspaceFolder>) -> Self {
        Self::new(folders, &[("clangd.enablePerFolderServer", json!(true))])
    }

    /// Opens a document in the editor and lets the manager handle it.
    pub async fn open(&self, uri: &str, language: &str, text: &str) -> TextDocument {
        let document = self.host.add_document(uri, language, text);
        self.manager
            .handle_event(EditorEvent::DocumentOpened(document.clone()))
            .await;
        document
    }

    /// Opens a C++ document.
    pub async fn open_cpp(&self, uri: &str) -> TextDocument {
        self.open(uri, "cpp", "int main() { return 0; }\n").await
    }

    pub async fn send(&self, event: EditorEvent) {
        self.manager.handle_event(event).await;
    }

    pub fn global(&self) -> Option<Arc<ClangdContext>> {
        self.manager.global_context()
    }
}

/// Polls `condition` while letting spawned and blocking tasks progress.
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::task::yield_now().await;
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Lets spawned tasks run.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
