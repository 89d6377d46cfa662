//! Type hierarchy view over clangd's `textDocument/typeHierarchy`
//! extension.
//!
//! The initial request resolves five levels in both directions. Parents
//! always arrive eagerly; children beyond that depth are fetched with
//! `typeHierarchy/resolve` when a node is expanded and cached on the node.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use lsp_types::{Position, TextDocumentIdentifier, TextDocumentPositionParams, Url};
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::commands::{CommandHandler, handler, parse_args};
use crate::context::{ClangdContext, ContextId};
use crate::editor::{
    Collapsible, EditorHost, ItemAction, MessageLevel, NodeId, OpenOptions, TreeDataProvider,
    TreeItem, ViewId,
};
use crate::error::CommandResult;
use crate::lsp::state::ConnectionState;
use crate::lsp::{ConnectionExt, LspResult};
use crate::lsp::protocol::{
    ResolveTypeHierarchyItemParams, TypeHierarchyDirection, TypeHierarchyItem,
    TypeHierarchyParams,
};
use crate::lsp::types::symbol_kind_icon;
use crate::manager::ContextManager;

use super::{Feature, LatestRequests, command_target};

const VISIBLE_KEY: &str = "clangd.typeHierarchy.visible";
const GOTO_ITEM: &str = "clangd.typeHierarchy.gotoItem";

struct Node {
    item: TypeHierarchyItem,
    parent_nodes: Option<Vec<NodeId>>,
    child_nodes: Option<Vec<NodeId>>,
}

struct Hierarchy {
    owner: ContextId,
    context: Weak<ClangdContext>,
    generation: u64,
    nodes: Vec<Node>,
}

impl Hierarchy {
    fn push(&mut self, item: TypeHierarchyItem) -> NodeId {
        self.nodes.push(Node {
            item,
            parent_nodes: None,
            child_nodes: None,
        });
        self.nodes.len() - 1
    }

    fn parents_of(&mut self, id: NodeId) -> Vec<NodeId> {
        let Some(node) = self.nodes.get(id) else {
            return Vec::new();
        };
        if let Some(ids) = &node.parent_nodes {
            return ids.clone();
        }
        let parents = node.item.parents.clone().unwrap_or_default();
        let ids: Vec<NodeId> = parents.into_iter().map(|item| self.push(item)).collect();
        self.nodes[id].parent_nodes = Some(ids.clone());
        ids
    }

    /// Child nodes of `id`; `None` if the children still need resolving.
    fn children_of(&mut self, id: NodeId) -> Option<Vec<NodeId>> {
        let node = self.nodes.get(id)?;
        if let Some(ids) = &node.child_nodes {
            return Some(ids.clone());
        }
        let children = node.item.children.clone()?;
        let ids: Vec<NodeId> = children.into_iter().map(|item| self.push(item)).collect();
        self.nodes[id].child_nodes = Some(ids.clone());
        Some(ids)
    }
}

fn tree_item(item: &TypeHierarchyItem) -> TreeItem {
    let collapsible = match &item.children {
        None => Collapsible::Collapsed,
        Some(children) if children.is_empty() => Collapsible::None,
        Some(_) => Collapsible::Expanded,
    };
    TreeItem {
        label: item.name.clone(),
        description: item.detail.clone(),
        tooltip: None,
        icon: Some(symbol_kind_icon(item.kind).to_string()),
        collapsible,
        action: Some(ItemAction::Command {
            command: GOTO_ITEM.to_string(),
            arguments: serde_json::to_value(item).unwrap_or(Value::Null),
        }),
    }
}

/// The "clangd.typeHierarchyView" view and its commands.
pub struct TypeHierarchyView {
    host: Arc<dyn EditorHost>,
    direction: Mutex<TypeHierarchyDirection>,
    tree: Mutex<Option<Hierarchy>>,
    generation: Mutex<u64>,
    requests: LatestRequests<ViewId>,
    // Keyed by tree generation and node.
    resolves: LatestRequests<(u64, NodeId)>,
}

impl TypeHierarchyView {
    /// An empty view showing children.
    pub fn new(host: Arc<dyn EditorHost>) -> Self {
        Self {
            host,
            direction: Mutex::new(TypeHierarchyDirection::Children),
            tree: Mutex::new(None),
            generation: Mutex::new(0),
            requests: LatestRequests::new(),
            resolves: LatestRequests::new(),
        }
    }

    /// Side of the hierarchy being shown.
    pub fn direction(&self) -> TypeHierarchyDirection {
        *self.direction.lock()
    }

    /// Whether a hierarchy is shown.
    pub fn has_root(&self) -> bool {
        self.tree.lock().is_some()
    }

    fn set_root(&self, root: Option<(&Arc<ClangdContext>, TypeHierarchyItem)>) {
        let tree = root.map(|(context, item)| {
            let mut generation = self.generation.lock();
            *generation += 1;
            let mut tree = Hierarchy {
                owner: context.id(),
                context: context.downgrade(),
                generation: *generation,
                nodes: Vec::new(),
            };
            tree.push(item);
            tree
        });
        *self.tree.lock() = tree;
        self.host.refresh_view(ViewId::TypeHierarchy);
    }

    fn set_direction(&self, direction: TypeHierarchyDirection) {
        *self.direction.lock() = direction;
        self.host.refresh_view(ViewId::TypeHierarchy);
    }

    async fn reveal(&self, manager: Arc<ContextManager>, args: Value) -> CommandResult<()> {
        let target = command_target(self.host.as_ref(), args)?
            .and_then(|(uri, range)| Some((manager.get_context_for_uri(&uri)?, uri, range.start)));
        let Some((context, uri, position)) = target else {
            self.host.show_message(
                MessageLevel::Info,
                "No clangd instance available for this document",
            );
            return Ok(());
        };
        self.host.set_context_key(VISIBLE_KEY, true);
        let ticket = self.requests.begin(ViewId::TypeHierarchy, context.id());
        let result = Self::request(&context, uri, position, ticket.token()).await;
        if !self.requests.finish(&ticket) || context.is_disposed() {
            debug!(context = %context.id(), "dropping superseded type hierarchy");
            return Ok(());
        }
        match result? {
            Some(item) => self.set_root(Some((&context, item))),
            None => self.host.show_message(
                MessageLevel::Info,
                "No type hierarchy available for selection",
            ),
        }
        Ok(())
    }

    async fn request(
        context: &ClangdContext,
        uri: Url,
        position: Position,
        cancel: CancellationToken,
    ) -> LspResult<Option<TypeHierarchyItem>> {
        let params = TypeHierarchyParams {
            text_document_position_params: TextDocumentPositionParams {
                text_document: TextDocumentIdentifier { uri },
                position,
            },
            resolve: Some(5),
            direction: TypeHierarchyDirection::Both,
        };
        context
            .connection()
            .request("textDocument/typeHierarchy", &params, cancel)
            .await
    }

    fn close(&self) {
        self.requests.cancel(&ViewId::TypeHierarchy);
        self.host.set_context_key(VISIBLE_KEY, false);
        self.set_root(None);
    }

    async fn goto_item(&self, args: Value) -> CommandResult<()> {
        let item: TypeHierarchyItem = parse_args(args)?;
        let options = OpenOptions {
            selection: Some(item.selection_range),
            ..OpenOptions::default()
        };
        if !self.host.open_document(&item.uri, options).await {
            debug!(uri = %item.uri, "could not open type hierarchy item");
        }
        Ok(())
    }

    /// Fetches the children of `id` and caches them on its item.
    async fn resolve_children(&self, id: NodeId) -> Vec<NodeId> {
        let (context, generation, item) = {
            let tree = self.tree.lock();
            let Some(tree) = tree.as_ref() else {
                return Vec::new();
            };
            let Some(node) = tree.nodes.get(id) else {
                return Vec::new();
            };
            (tree.context.clone(), tree.generation, node.item.clone())
        };
        let Some(context) = context.upgrade() else {
            return Vec::new();
        };
        let params = ResolveTypeHierarchyItemParams {
            item,
            resolve: 1,
            direction: TypeHierarchyDirection::Children,
        };
        let ticket = self.resolves.begin((generation, id), context.id());
        let result: LspResult<Option<TypeHierarchyItem>> = context
            .connection()
            .request("typeHierarchy/resolve", &params, ticket.token())
            .await;
        if !self.resolves.finish(&ticket) || context.is_disposed() {
            return Vec::new();
        }
        let resolved = match result {
            Ok(resolved) => resolved,
            Err(e) => {
                debug!(context = %context.id(), error = %e, "typeHierarchy/resolve failed");
                return Vec::new();
            }
        };

        let mut tree = self.tree.lock();
        let Some(tree) = tree.as_mut().filter(|t| t.generation == generation) else {
            return Vec::new();
        };
        if let Some(node) = tree.nodes.get_mut(id) {
            node.item.children = Some(resolved.and_then(|r| r.children).unwrap_or_default());
        }
        tree.children_of(id).unwrap_or_default()
    }
}

impl Feature for TypeHierarchyView {
    fn name(&self) -> &'static str {
        "type-hierarchy"
    }

    fn attach(self: Arc<Self>, context: &Arc<ClangdContext>) {
        let owner = context.id();
        let view = self;
        let subscription = context
            .connection()
            .state_machine()
            .on_change(move |change| {
                if change.new == ConnectionState::Stopped {
                    view.requests.cancel_owner(owner);
                    view.resolves.cancel_owner(owner);
                }
            });
        context.push_subscription(subscription);
    }

    fn detach(&self, context: &ClangdContext) {
        self.requests.cancel_owner(context.id());
        self.resolves.cancel_owner(context.id());
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
        let (reveal, close, parents, children) =
            (self.clone(), self.clone(), self.clone(), self.clone());
        let goto = self;
        vec![
            (
                "clangd.typeHierarchy",
                handler(move |manager, args| {
                    let view = reveal.clone();
                    async move { view.reveal(manager, args).await }
                }),
            ),
            (
                "clangd.typeHierarchy.close",
                handler(move |_, _| {
                    let view = close.clone();
                    async move {
                        view.close();
                        Ok(())
                    }
                }),
            ),
            (
                "clangd.typeHierarchy.viewParents",
                handler(move |_, _| {
                    let view = parents.clone();
                    async move {
                        view.set_direction(TypeHierarchyDirection::Parents);
                        Ok(())
                    }
                }),
            ),
            (
                "clangd.typeHierarchy.viewChildren",
                handler(move |_, _| {
                    let view = children.clone();
                    async move {
                        view.set_direction(TypeHierarchyDirection::Children);
                        Ok(())
                    }
                }),
            ),
            (
                GOTO_ITEM,
                handler(move |_, args| {
                    let view = goto.clone();
                    async move { view.goto_item(args).await }
                }),
            ),
        ]
    }
}

#[async_trait]
impl TreeDataProvider for TypeHierarchyView {
    async fn children(&self, parent: Option<NodeId>) -> Vec<NodeId> {
        let direction = self.direction();
        {
            let mut tree = self.tree.lock();
            let Some(tree) = tree.as_mut() else {
                return Vec::new();
            };
            let Some(id) = parent else {
                return vec![0];
            };
            if direction == TypeHierarchyDirection::Parents {
                return tree.parents_of(id);
            }
            if let Some(ids) = tree.children_of(id) {
                return ids;
            }
        }
        let Some(id) = parent else {
            return Vec::new();
        };
        self.resolve_children(id).await
    }

    fn item(&self, node: NodeId) -> Option<TreeItem> {
        let tree = self.tree.lock();
        Some(tree_item(&tree.as_ref()?.nodes.get(node)?.item))
    }
}
