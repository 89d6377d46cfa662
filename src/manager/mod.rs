//! The context registry and its lifecycle policy.
//!
//! [`ContextManager`] owns every [`ClangdContext`]: zero or one global
//! context, or one context per workspace folder, depending on
//! `clangd.enablePerFolderServer`. Contexts are created lazily when a
//! qualifying document is opened and disposed when their folder goes away,
//! when the mode flips or when the manager is disposed.

mod registry;

pub use registry::{Registry, Reservation};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use lsp_types::{Url, WorkspaceFolder};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::commands::{self, CommandRegistry};
use crate::config::ConfigurationExt;
use crate::context::{ClangdContext, ContextId, RoutingKey, Services, is_clangd_document};
use crate::editor::{EditorEvent, TextDocument};
use crate::error::{CommandResult, ContextError, ContextResult, Result};
use crate::event::{Emitter, Subscription, Subscriptions};
use crate::features::Feature;

/// Setting that selects per-folder servers.
pub const PER_FOLDER_SETTING: &str = "clangd.enablePerFolderServer";

/// Work serialized through the event loop.
enum Job {
    Editor(EditorEvent),
    Restart(oneshot::Sender<ContextResult<()>>),
}

/// Owner of every clangd context.
pub struct ContextManager {
    services: Services,
    features: Vec<Arc<dyn Feature>>,
    registry: Registry<Arc<ClangdContext>>,
    next_id: AtomicU64,
    created: Emitter<Arc<ClangdContext>>,
    removed: Emitter<Arc<ClangdContext>>,
    commands: Arc<CommandRegistry>,
    subscriptions: Subscriptions,
    events: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl ContextManager {
    /// Creates an inactive manager.
    pub fn new(services: Services, features: Vec<Arc<dyn Feature>>) -> Arc<Self> {
        Arc::new(Self {
            services,
            features,
            registry: Registry::new(),
            next_id: AtomicU64::new(0),
            created: Emitter::new(),
            removed: Emitter::new(),
            commands: Arc::new(CommandRegistry::new()),
            subscriptions: Subscriptions::new(),
            events: Mutex::new(None),
            event_loop: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    /// Registers commands, starts consuming editor events and creates the
    /// contexts needed by documents that are already open.
    ///
    /// # Errors
    ///
    /// Fails if a command id is registered twice or the manager was
    /// disposed.
    pub async fn activate(self: &Arc<Self>) -> Result<()> {
        if self.is_disposed() {
            return Err(ContextError::ManagerDisposed.into());
        }
        let restart = commands::handler(|manager: Arc<ContextManager>, _args: Value| async move {
            manager.restart().await?;
            Ok(())
        });
        self.subscriptions
            .push(self.commands.register("clangd.restart", restart)?);
        for feature in &self.features {
            for (id, handler) in feature.clone().commands() {
                self.subscriptions.push(self.commands.register(id, handler)?);
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                match job {
                    Job::Editor(event) => manager.handle_event(event).await,
                    Job::Restart(reply) => {
                        // The caller may have given up waiting.
                        let _ = reply.send(manager.restart_now().await);
                    }
                }
            }
        });
        *self.events.lock() = Some(tx);
        *self.event_loop.lock() = Some(task);

        info!(per_folder = self.per_folder_mode(), "context manager activated");
        self.sweep().await;
        Ok(())
    }

    /// Queues an editor event. Events are handled one at a time, in order.
    pub fn send_event(&self, event: EditorEvent) {
        match self.events.lock().as_ref() {
            Some(tx) => {
                if tx.send(Job::Editor(event)).is_err() {
                    debug!("event loop stopped, dropping editor event");
                }
            }
            None => debug!("manager not active, dropping editor event"),
        }
    }

    /// The collaborators contexts are built from.
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// The registered commands.
    pub fn commands(&self) -> &Arc<CommandRegistry> {
        &self.commands
    }

    /// Runs a registered command.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown command or a failing handler.
    pub async fn execute_command(self: &Arc<Self>, id: &str, args: Value) -> CommandResult<()> {
        self.commands.execute(self.clone(), id, args).await
    }

    /// Whether per-folder mode is on.
    pub fn per_folder_mode(&self) -> bool {
        self.services.config.get_or(PER_FOLDER_SETTING, None, false)
    }

    /// The routing key `document` maps to under the current mode, with its
    /// folder. `None` when no context should serve it.
    pub fn route(&self, document: &TextDocument) -> Option<(RoutingKey, Option<WorkspaceFolder>)> {
        if !is_clangd_document(document) {
            return None;
        }
        if self.per_folder_mode() {
            let folder = self.services.host.workspace_folder_for(&document.uri)?;
            Some((RoutingKey::of(Some(&folder)), Some(folder)))
        } else {
            Some((RoutingKey::Global, None))
        }
    }

    /// Creates the context of `folder`, or the global context for `None`.
    ///
    /// Returns `Ok(None)` when no clangd could be started.
    ///
    /// # Errors
    ///
    /// [`ContextError::DuplicateContext`] if the key already has a context
    /// or one is being created, [`ContextError::ManagerDisposed`] once the
    /// manager is disposed.
    pub async fn create_context(
        &self,
        folder: Option<WorkspaceFolder>,
    ) -> ContextResult<Option<Arc<ClangdContext>>> {
        if self.is_disposed() {
            return Err(ContextError::ManagerDisposed);
        }
        let reservation = self.registry.reserve(RoutingKey::of(folder.as_ref()))?;
        let id = ContextId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        info!(context = %id, folder = ?folder.as_ref().map(|f| f.uri.as_str()), "creating context");

        let Some(context) =
            ClangdContext::create(self.services.clone(), id, folder, self.features.clone()).await
        else {
            debug!(context = %id, "no context created");
            return Ok(None);
        };
        if let Err(e) = reservation.fill(context.clone()) {
            warn!(context = %id, "manager disposed during creation");
            if let Err(e) = context.dispose().await {
                debug!(error = %e, "context already disposed");
            }
            return Err(e);
        }
        self.created.emit(&context);
        Ok(Some(context))
    }

    /// Disposes the context of `folder`, or the global one for `None`. Does
    /// nothing when there is none.
    ///
    /// # Errors
    ///
    /// Propagates [`ContextError::AlreadyDisposed`].
    pub async fn dispose_context(&self, folder: Option<&WorkspaceFolder>) -> ContextResult<()> {
        self.dispose_key(&RoutingKey::of(folder)).await
    }

    async fn dispose_key(&self, key: &RoutingKey) -> ContextResult<()> {
        let Some(context) = self.registry.remove(key) else {
            return Ok(());
        };
        self.removed.emit(&context);
        context.dispose().await
    }

    /// The context serving `folder`, falling back to the global context.
    pub fn get_context_for_folder(&self, folder: &WorkspaceFolder) -> Option<Arc<ClangdContext>> {
        self.registry
            .get(&RoutingKey::Folder(folder.uri.clone()))
            .or_else(|| self.registry.get(&RoutingKey::Global))
    }

    /// The context serving `uri`.
    pub fn get_context_for_uri(&self, uri: &Url) -> Option<Arc<ClangdContext>> {
        match self.services.host.workspace_folder_for(uri) {
            Some(folder) => self.get_context_for_folder(&folder),
            None => self.registry.get(&RoutingKey::Global),
        }
    }

    /// The context serving `document`.
    pub fn get_context_for_document(&self, document: &TextDocument) -> Option<Arc<ClangdContext>> {
        self.get_context_for_uri(&document.uri)
    }

    /// The context of the focused document, else the global context.
    pub fn get_active_context(&self) -> Option<Arc<ClangdContext>> {
        match self.services.host.active_document() {
            Some(document) => self.get_context_for_document(&document),
            None => self.registry.get(&RoutingKey::Global),
        }
    }

    /// The global context, if any.
    pub fn global_context(&self) -> Option<Arc<ClangdContext>> {
        self.registry.get(&RoutingKey::Global)
    }

    /// Every live context, the global one first.
    pub fn get_all_contexts(&self) -> Vec<Arc<ClangdContext>> {
        self.registry.all()
    }

    /// Whether any context is still in its handshake.
    pub fn is_any_context_starting(&self) -> bool {
        self.registry.all().iter().any(|c| c.client_is_starting())
    }

    /// Whether any context is ready for requests.
    pub fn is_any_context_running(&self) -> bool {
        self.registry.all().iter().any(|c| c.client_is_running())
    }

    /// Observes context creation.
    pub fn on_did_create_context(
        &self,
        listener: impl Fn(&Arc<ClangdContext>) + Send + Sync + 'static,
    ) -> Subscription {
        self.created.subscribe(listener)
    }

    /// Observes context disposal; listeners run before the context is torn
    /// down.
    pub fn on_did_dispose_context(
        &self,
        listener: impl Fn(&Arc<ClangdContext>) + Send + Sync + 'static,
    ) -> Subscription {
        self.removed.subscribe(listener)
    }

    async fn open_document(&self, document: &TextDocument) {
        let Some((key, folder)) = self.route(document) else {
            return;
        };
        let context = match self.registry.get(&key) {
            Some(context) => Some(context),
            None if self.registry.contains(&key) => {
                debug!(key = %key, "context creation already in flight");
                None
            }
            None => match self.create_context(folder).await {
                Ok(context) => context,
                Err(e) => {
                    warn!(key = %key, error = %e, "context creation failed");
                    None
                }
            },
        };
        if let Some(context) = context {
            context.did_open(document);
        }
    }

    /// Creates missing contexts for every open document.
    pub async fn sweep(&self) {
        for document in self.services.host.open_documents() {
            self.open_document(&document).await;
        }
    }

    fn owner_of(&self, uri: &Url) -> Option<Arc<ClangdContext>> {
        self.registry
            .all()
            .into_iter()
            .find(|context| context.is_open(uri))
            .or_else(|| self.get_context_for_uri(uri))
    }

    async fn dispose_all(&self) {
        let global = self.registry.remove(&RoutingKey::Global);
        let folders = self
            .registry
            .folders()
            .into_iter()
            .filter_map(|(key, _)| self.registry.remove(&key));
        let contexts: Vec<_> = global.into_iter().chain(folders).collect();
        for context in contexts {
            self.removed.emit(&context);
            if let Err(e) = context.dispose().await {
                warn!(context = %context.id(), error = %e, "disposing context failed");
            }
        }
    }

    /// Disposes every context and recreates the ones open documents need.
    /// Once activated, the restart is queued behind pending editor events.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::ManagerDisposed`] after [`ContextManager::dispose`].
    pub async fn restart(&self) -> ContextResult<()> {
        let queued = {
            let events = self.events.lock();
            events.as_ref().map(|tx| {
                let (reply, done) = oneshot::channel();
                tx.send(Job::Restart(reply)).map(|()| done)
            })
        };
        match queued {
            Some(Ok(done)) => done.await.unwrap_or(Err(ContextError::ManagerDisposed)),
            Some(Err(_)) => Err(ContextError::ManagerDisposed),
            None => self.restart_now().await,
        }
    }

    async fn restart_now(&self) -> ContextResult<()> {
        if self.is_disposed() {
            return Err(ContextError::ManagerDisposed);
        }
        info!("restarting clangd");
        self.dispose_all().await;
        self.sweep().await;
        Ok(())
    }

    async fn apply_mode(&self) {
        let per_folder = self.per_folder_mode();
        info!(per_folder, "server mode changed");
        if per_folder {
            if let Err(e) = self.dispose_key(&RoutingKey::Global).await {
                warn!(error = %e, "disposing global context failed");
            }
        } else {
            for (key, _) in self.registry.folders() {
                if let Err(e) = self.dispose_key(&key).await {
                    warn!(key = %key, error = %e, "disposing folder context failed");
                }
            }
        }
        self.sweep().await;
    }

    /// Applies one editor event, then hands it to every feature.
    pub async fn handle_event(self: &Arc<Self>, event: EditorEvent) {
        if self.is_disposed() {
            return;
        }
        match &event {
            EditorEvent::DocumentOpened(document) => self.open_document(document).await,
            EditorEvent::DocumentChanged { document, text } => {
                if let Some(context) = self.owner_of(&document.uri) {
                    context.did_change(document, text);
                }
            }
            EditorEvent::DocumentClosed(document) => {
                if let Some(context) = self.owner_of(&document.uri) {
                    context.did_close(document);
                }
            }
            EditorEvent::WorkspaceFoldersChanged { removed, .. } => {
                if self.per_folder_mode() {
                    for folder in removed {
                        if let Err(e) = self.dispose_context(Some(folder)).await {
                            warn!(folder = %folder.uri, error = %e, "disposing folder context failed");
                        }
                    }
                }
            }
            EditorEvent::ConfigurationChanged(change) if change.affects(PER_FOLDER_SETTING) => {
                self.apply_mode().await;
            }
            _ => {}
        }
        for feature in &self.features {
            feature.clone().on_editor_event(self, &event);
        }
    }

    /// Whether [`ContextManager::dispose`] ran.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Disposes every context (the global one first), unregisters commands
    /// and closes the event streams.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::ManagerDisposed`] on a second call.
    pub async fn dispose(&self) -> ContextResult<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Err(ContextError::ManagerDisposed);
        }
        info!("disposing context manager");
        self.events.lock().take();
        if let Some(task) = self.event_loop.lock().take() {
            task.abort();
        }
        for context in self.registry.close() {
            self.removed.emit(&context);
            if let Err(e) = context.dispose().await {
                warn!(context = %context.id(), error = %e, "disposing context failed");
            }
        }
        self.subscriptions.dispose_all();
        self.created.close();
        self.removed.close();
        Ok(())
    }
}
