//! `$/memoryUsage` tree view.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::debug;

use crate::commands::{CommandHandler, handler};
use crate::context::{ClangdContext, ContextId};
use crate::editor::{Collapsible, EditorHost, MessageLevel, NodeId, TreeDataProvider, TreeItem, ViewId};
use crate::error::CommandResult;
use crate::lsp::{ConnectionExt, LspResult};
use crate::lsp::state::ConnectionState;
use crate::manager::ContextManager;

use super::{Feature, Hook, LatestRequests, has_capability};

const SUPPORTED_KEY: &str = "clangd.memoryUsage.supported";
const HAS_DATA_KEY: &str = "clangd.memoryUsage.hasData";

/// One node of a memory usage report.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryTree {
    /// Basename of the component.
    pub title: String,
    /// Bytes including children.
    pub total: u64,
    /// Bytes of this component alone.
    pub self_bytes: u64,
    /// Whether the component is a file path.
    pub is_file: bool,
    /// Sub-components, largest first.
    pub children: Vec<MemoryTree>,
}

impl MemoryTree {
    /// Converts the wire shape (`_self`, `_total` and named children) under
    /// `title`.
    pub fn convert(wire: &Value, title: &str) -> Self {
        let (is_file, title) = match title.rfind(['/', '\\']) {
            Some(slash) => (true, &title[slash + 1..]),
            None => (false, title),
        };
        let mut names: Vec<&String> = wire
            .as_object()
            .map(|map| map.keys().filter(|k| !k.starts_with('_')).collect())
            .unwrap_or_default();
        names.sort();
        let mut children: Vec<MemoryTree> = names
            .into_iter()
            .map(|name| Self::convert(&wire[name.as_str()], name))
            .collect();
        children.sort_by(|a, b| b.total.cmp(&a.total));
        Self {
            title: title.to_string(),
            total: wire["_total"].as_u64().unwrap_or(0),
            self_bytes: wire["_self"].as_u64().unwrap_or(0),
            is_file,
            children,
        }
    }

    fn item(&self) -> TreeItem {
        self.presentation(self.children.len())
    }

    fn presentation(&self, child_count: usize) -> TreeItem {
        let icon = if self.is_file {
            Some("symbol-file")
        } else if child_count == 0 {
            Some("circle-filled")
        } else {
            None
        };
        let collapsible = match child_count {
            0 => Collapsible::None,
            n if n >= 6 || self.is_file => Collapsible::Collapsed,
            _ => Collapsible::Expanded,
        };
        TreeItem {
            label: self.title.clone(),
            description: Some(format!("{:.2} MB", self.total as f64 / 1024.0 / 1024.0)),
            tooltip: Some(format!("self={} total={}", self.self_bytes, self.total)),
            icon: icon.map(str::to_string),
            collapsible,
            action: None,
        }
    }
}

struct Flat {
    owner: ContextId,
    nodes: Vec<(MemoryTree, Vec<NodeId>)>,
}

impl Flat {
    fn new(owner: ContextId, root: MemoryTree) -> Self {
        let mut flat = Self {
            owner,
            nodes: Vec::new(),
        };
        flat.insert(root);
        flat
    }

    fn insert(&mut self, mut tree: MemoryTree) -> NodeId {
        let children = std::mem::take(&mut tree.children);
        let id = self.nodes.len();
        self.nodes.push((tree, Vec::new()));
        let ids: Vec<NodeId> = children.into_iter().map(|child| self.insert(child)).collect();
        self.nodes[id].1 = ids;
        id
    }
}

/// The "clangd.memoryUsage" view.
pub struct MemoryUsageView {
    host: Arc<dyn EditorHost>,
    supported: Mutex<HashMap<ContextId, bool>>,
    tree: Mutex<Option<Flat>>,
    requests: LatestRequests<ViewId>,
}

impl MemoryUsageView {
    /// An empty view.
    pub fn new(host: Arc<dyn EditorHost>) -> Self {
        Self {
            host,
            supported: Mutex::new(HashMap::new()),
            tree: Mutex::new(None),
            requests: LatestRequests::new(),
        }
    }

    /// Whether a report is shown.
    pub fn has_root(&self) -> bool {
        self.tree.lock().is_some()
    }

    fn set_root(&self, tree: Option<Flat>) {
        let has_data = tree.is_some();
        *self.tree.lock() = tree;
        self.host.set_context_key(HAS_DATA_KEY, has_data);
        self.host.refresh_view(ViewId::MemoryUsage);
    }

    async fn show(&self, manager: Arc<ContextManager>) -> CommandResult<()> {
        let Some(context) = manager.get_active_context() else {
            self.host.show_message(MessageLevel::Info, "No clangd instance is running");
            return Ok(());
        };
        let ticket = self.requests.begin(ViewId::MemoryUsage, context.id());
        let result: LspResult<Option<Value>> = context
            .connection()
            .request("$/memoryUsage", &json!({}), ticket.token())
            .await;
        if !self.requests.finish(&ticket) || context.is_disposed() {
            debug!(context = %context.id(), "dropping superseded memory usage");
            return Ok(());
        }
        if let Some(usage) = result? {
            let root = MemoryTree::convert(&usage, "<root>");
            self.set_root(Some(Flat::new(context.id(), root)));
        }
        Ok(())
    }
}

impl Feature for MemoryUsageView {
    fn name(&self) -> &'static str {
        "memory-usage"
    }

    fn attach(self: Arc<Self>, context: &Arc<ClangdContext>) {
        let owner = context.id();
        let view = self.clone();
        context
            .connection()
            .register_feature(Arc::new(Hook::new().on_initialize(move |caps| {
                view.supported
                    .lock()
                    .insert(owner, has_capability(caps, "memoryUsageProvider"));
            })));
        let view = self;
        let subscription = context
            .connection()
            .state_machine()
            .on_change(move |change| match change.new {
                ConnectionState::Running => {
                    let supported = view.supported.lock().get(&owner).copied().unwrap_or(false);
                    view.host.set_context_key(SUPPORTED_KEY, supported);
                }
                ConnectionState::Stopped => {
                    view.requests.cancel_owner(owner);
                    view.host.set_context_key(SUPPORTED_KEY, false);
                }
                ConnectionState::Starting => {}
            });
        context.push_subscription(subscription);
    }

    fn detach(&self, context: &ClangdContext) {
        self.requests.cancel_owner(context.id());
        self.supported.lock().remove(&context.id());
        let owned = self
            .tree
            .lock()
            .as_ref()
            .is_some_and(|tree| tree.owner == context.id());
        if owned {
            self.set_root(None);
        }
    }

    fn commands(self: Arc<Self>) -> Vec<(&'static str, CommandHandler)> {
        let show = self.clone();
        let close = self;
        vec![
            (
                "clangd.memoryUsage",
                handler(move |manager, _| {
                    let view = show.clone();
                    async move { view.show(manager).await }
                }),
            ),
            (
                "clangd.memoryUsage.close",
                handler(move |_, _| {
                    let view = close.clone();
                    async move {
                        view.requests.cancel(&ViewId::MemoryUsage);
                        view.set_root(None);
                        Ok(())
                    }
                }),
            ),
        ]
    }
}

#[async_trait]
impl TreeDataProvider for MemoryUsageView {
    async fn children(&self, parent: Option<NodeId>) -> Vec<NodeId> {
        let tree = self.tree.lock();
        let Some(tree) = tree.as_ref() else {
            return Vec::new();
        };
        match parent {
            None => vec![0],
            Some(id) => tree.nodes.get(id).map(|(_, ids)| ids.clone()).unwrap_or_default(),
        }
    }

    fn item(&self, node: NodeId) -> Option<TreeItem> {
        let tree = self.tree.lock();
        let (memory, ids) = tree.as_ref()?.nodes.get(node)?;
        Some(memory.presentation(ids.len()))
    }
}
