//! Built-in protocol extensions.
//!
//! Every [`Feature`] is instantiated once per manager and attached to each
//! context as it is created, before its connection starts. A feature keys
//! whatever it derives from a context by [`ContextId`] and drops it again in
//! [`Feature::detach`].

pub mod ast;
pub mod config_watcher;
pub mod file_status;
pub mod inactive_regions;
pub mod inlay_hints;
pub mod memory_usage;
pub mod open_config;
pub mod switch_source_header;
pub mod type_hierarchy;

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use lsp_types::{Position, Range, Url};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::commands::{CommandHandler, parse_args};
use crate::context::{ClangdContext, ContextId};
use crate::editor::{EditorEvent, EditorHost, TreeDataProvider, ViewId};
use crate::error::CommandResult;
use crate::lsp::ProtocolFeature;
use crate::manager::ContextManager;

/// A capability layered on every context.
pub trait Feature: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Wires the feature into `context`. Runs before the connection starts,
    /// so protocol hooks registered here see the handshake.
    fn attach(self: Arc<Self>, context: &Arc<ClangdContext>);

    /// Clears everything derived from `context`.
    fn detach(&self, context: &ClangdContext);

    /// Editor activity, after the manager applied it.
    fn on_editor_event(self: Arc<Self>, _manager: &Arc<ContextManager>, _event: &EditorEvent) {}

    /// Commands contributed by the feature.
    fn commands(self: Arc<Self>) -> Vec<(&'static str, CommandHandler)> {
        Vec::new()
    }
}

type FillHook = Box<dyn Fn(&mut Value) + Send + Sync>;
type InitializeHook = Box<dyn Fn(&Value) + Send + Sync>;

/// A [`ProtocolFeature`] assembled from closures.
#[derive(Default)]
pub struct Hook {
    fill: Option<FillHook>,
    initialize: Option<InitializeHook>,
}

impl Hook {
    /// A hook that does nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` on the client capabilities.
    #[must_use]
    pub fn on_fill(mut self, f: impl Fn(&mut Value) + Send + Sync + 'static) -> Self {
        self.fill = Some(Box::new(f));
        self
    }

    /// Runs `f` on the server capabilities.
    #[must_use]
    pub fn on_initialize(mut self, f: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.initialize = Some(Box::new(f));
        self
    }
}

impl ProtocolFeature for Hook {
    fn fill_client_capabilities(&self, capabilities: &mut Value) {
        if let Some(fill) = &self.fill {
            fill(capabilities);
        }
    }

    fn initialize(&self, server_capabilities: &Value) {
        if let Some(initialize) = &self.initialize {
            initialize(server_capabilities);
        }
    }
}

/// Whether the server capabilities announce `provider` with a truthy value.
pub fn has_capability(capabilities: &Value, provider: &str) -> bool {
    match capabilities.get(provider) {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(_) => true,
    }
}

/// A handle on the newest request for one subject.
#[derive(Debug, Clone)]
pub struct Ticket<K> {
    key: K,
    owner: ContextId,
    generation: u64,
    token: CancellationToken,
}

impl<K> Ticket<K> {
    /// Token to pass to the request.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// The context the request was issued to.
    pub fn owner(&self) -> ContextId {
        self.owner
    }
}

struct InFlight {
    owner: ContextId,
    generation: u64,
    token: CancellationToken,
}

/// Last-request-wins bookkeeping: starting a request for a subject cancels
/// the previous one, and only the newest may apply its result.
pub struct LatestRequests<K> {
    inner: Mutex<(u64, HashMap<K, InFlight>)>,
}

impl<K: Eq + Hash + Clone> LatestRequests<K> {
    /// No requests in flight.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new((0, HashMap::new())),
        }
    }

    /// Starts a request for `key` on `owner`, cancelling the previous one.
    pub fn begin(&self, key: K, owner: ContextId) -> Ticket<K> {
        let mut inner = self.inner.lock();
        inner.0 += 1;
        let generation = inner.0;
        let token = CancellationToken::new();
        let previous = inner.1.insert(
            key.clone(),
            InFlight {
                owner,
                generation,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
        }
        Ticket {
            key,
            owner,
            generation,
            token,
        }
    }

    /// Ends `ticket`'s request. Returns whether its result may be applied.
    pub fn finish(&self, ticket: &Ticket<K>) -> bool {
        let mut inner = self.inner.lock();
        let current = inner
            .1
            .get(&ticket.key)
            .is_some_and(|f| f.generation == ticket.generation);
        if current {
            inner.1.remove(&ticket.key);
        }
        current && !ticket.token.is_cancelled()
    }

    /// Cancels the request for `key`.
    pub fn cancel(&self, key: &K) {
        if let Some(flight) = self.inner.lock().1.remove(key) {
            flight.token.cancel();
        }
    }

    /// Cancels every request issued to `owner`.
    pub fn cancel_owner(&self, owner: ContextId) {
        self.inner.lock().1.retain(|_, flight| {
            if flight.owner == owner {
                flight.token.cancel();
                false
            } else {
                true
            }
        });
    }

    /// Whether a request for `key` is in flight.
    pub fn is_pending(&self, key: &K) -> bool {
        self.inner.lock().1.contains_key(key)
    }
}

impl<K: Eq + Hash + Clone> Default for LatestRequests<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TargetArgs {
    uri: Option<Url>,
    range: Option<Range>,
    position: Option<Position>,
}

/// The document and selection a command acts on: explicit `uri` /
/// `range` / `position` arguments, else the focused editor.
pub fn command_target(host: &dyn EditorHost, args: Value) -> CommandResult<Option<(Url, Range)>> {
    let args: Option<TargetArgs> = parse_args(args)?;
    let args = args.unwrap_or_default();
    let Some(uri) = args.uri.or_else(|| host.active_document().map(|d| d.uri)) else {
        return Ok(None);
    };
    let range = args
        .range
        .or_else(|| args.position.map(|p| Range::new(p, p)))
        .or_else(|| host.active_selection())
        .unwrap_or_default();
    Ok(Some((uri, range)))
}

/// The built-in feature set.
pub struct Builtin {
    /// Per-file status line.
    pub file_status: Arc<file_status::FileStatus>,
    /// AST viewer.
    pub ast: Arc<ast::AstView>,
    /// Type hierarchy view.
    pub type_hierarchy: Arc<type_hierarchy::TypeHierarchyView>,
    /// Memory usage view.
    pub memory_usage: Arc<memory_usage::MemoryUsageView>,
    /// Inlay hints.
    pub inlay_hints: Arc<inlay_hints::InlayHints>,
    /// Inactive region decorations.
    pub inactive_regions: Arc<inactive_regions::InactiveRegions>,
    /// Source/header switching.
    pub switch_source_header: Arc<switch_source_header::SwitchSourceHeader>,
    /// Compile flag and settings change watcher.
    pub config_watcher: Arc<config_watcher::ConfigWatcher>,
    /// `.clangd` and user config openers.
    pub open_config: Arc<open_config::OpenConfig>,
}

impl Builtin {
    /// Creates every built-in feature.
    pub fn new(host: Arc<dyn EditorHost>) -> Self {
        Self {
            file_status: Arc::new(file_status::FileStatus::new(host.clone())),
            ast: Arc::new(ast::AstView::new(host.clone())),
            type_hierarchy: Arc::new(type_hierarchy::TypeHierarchyView::new(host.clone())),
            memory_usage: Arc::new(memory_usage::MemoryUsageView::new(host.clone())),
            inlay_hints: Arc::new(inlay_hints::InlayHints::new(host.clone())),
            inactive_regions: Arc::new(inactive_regions::InactiveRegions::new(host.clone())),
            switch_source_header: Arc::new(switch_source_header::SwitchSourceHeader),
            config_watcher: Arc::new(config_watcher::ConfigWatcher::new(host)),
            open_config: Arc::new(open_config::OpenConfig),
        }
    }

    /// Every feature, in attach order.
    pub fn all(&self) -> Vec<Arc<dyn Feature>> {
        vec![
            self.type_hierarchy.clone(),
            self.inlay_hints.clone(),
            self.memory_usage.clone(),
            self.ast.clone(),
            self.open_config.clone(),
            self.inactive_regions.clone(),
            self.config_watcher.clone(),
            self.file_status.clone(),
            self.switch_source_header.clone(),
        ]
    }

    /// The data provider behind `view`.
    pub fn tree(&self, view: ViewId) -> Arc<dyn TreeDataProvider> {
        match view {
            ViewId::Ast => self.ast.clone(),
            ViewId::TypeHierarchy => self.type_hierarchy.clone(),
            ViewId::MemoryUsage => self.memory_usage.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_has_capability() {
        let caps = json!({"astProvider": true, "memoryUsageProvider": false, "inactiveRegionsProvider": {}});
        assert!(has_capability(&caps, "astProvider"));
        assert!(!has_capability(&caps, "memoryUsageProvider"));
        assert!(has_capability(&caps, "inactiveRegionsProvider"));
        assert!(!has_capability(&caps, "clangdInlayHintsProvider"));
    }

    #[test]
    fn test_latest_request_wins() {
        let requests = LatestRequests::<&str>::new();
        let first = requests.begin("a.cpp", ContextId(1));
        let second = requests.begin("a.cpp", ContextId(1));
        assert!(first.token().is_cancelled());

        assert!(requests.finish(&second));
        assert!(!requests.finish(&first));
        assert!(!requests.is_pending(&"a.cpp"));
    }

    #[test]
    fn test_cancel_owner_only_hits_that_context() {
        let requests = LatestRequests::<&str>::new();
        let a = requests.begin("a.cpp", ContextId(1));
        let b = requests.begin("b.cpp", ContextId(2));
        requests.cancel_owner(ContextId(1));

        assert!(a.token().is_cancelled());
        assert!(!requests.finish(&a));
        assert!(!b.token().is_cancelled());
        assert!(requests.finish(&b));
        assert_eq!(b.owner(), ContextId(2));
    }
}
