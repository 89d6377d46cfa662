//! AST viewer backed by `textDocument/ast`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lsp_types::{Range, TextDocumentIdentifier, Url};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::commands::{CommandHandler, handler};
use crate::context::{ClangdContext, ContextId};
use crate::editor::{
    Collapsible, EditorHost, ItemAction, MessageLevel, NodeId, TreeDataProvider, TreeItem, ViewId,
};
use crate::error::CommandResult;
use crate::lsp::{ConnectionExt, LspResult};
use crate::lsp::protocol::{AstNode, AstParams};
use crate::lsp::state::ConnectionState;
use crate::manager::ContextManager;

use super::{Feature, Hook, LatestRequests, command_target, has_capability};

const SUPPORTED_KEY: &str = "clangd.ast.supported";
const HAS_DATA_KEY: &str = "clangd.ast.hasData";

// Kind takes precedence over role.
fn role_icon(role: &str) -> Option<&'static str> {
    Some(match role {
        "type" => "symbol-misc",
        "declaration" => "symbol-function",
        "expression" => "primitive-dot",
        "specifier" => "list-tree",
        "statement" => "symbol-event",
        "template argument" => "symbol-type-parameter",
        _ => return None,
    })
}

fn kind_icon(kind: &str) -> Option<&'static str> {
    Some(match kind {
        "Compound" => "json",
        "Recovery" => "error",
        "TranslationUnit" => "file-code",
        "PackExpansion" => "ellipsis",
        "TemplateTypeParm" | "TemplateTemplateParm" | "TemplateParamObject" => {
            "symbol-type-parameter"
        }
        _ => return None,
    })
}

/// Tree label of a node: the kind alone when the role is obvious from it.
pub fn describe(role: &str, kind: &str) -> String {
    match role {
        "expression" | "statement" | "declaration" | "template name" => kind.to_string(),
        _ => format!("{kind} {role}"),
    }
}

struct Node {
    role: String,
    kind: String,
    detail: Option<String>,
    arcana: Option<String>,
    range: Option<Range>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// An AST flattened into an arena; node 0 is the root.
struct AstTree {
    owner: ContextId,
    document: Url,
    nodes: Vec<Node>,
}

impl AstTree {
    fn new(owner: ContextId, document: Url, root: AstNode) -> Self {
        let mut tree = Self {
            owner,
            document,
            nodes: Vec::new(),
        };
        tree.insert(root, None);
        tree
    }

    fn insert(&mut self, node: AstNode, parent: Option<NodeId>) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            role: node.role,
            kind: node.kind,
            detail: node.detail,
            arcana: node.arcana,
            range: node.range,
            parent,
            children: Vec::new(),
        });
        let children: Vec<NodeId> = node
            .children
            .into_iter()
            .map(|child| self.insert(child, Some(id)))
            .collect();
        self.nodes[id].children = children;
        id
    }

    fn item(&self, id: NodeId) -> Option<TreeItem> {
        let node = self.nodes.get(id)?;
        Some(TreeItem {
            label: describe(&node.role, &node.kind),
            description: node.detail.clone(),
            tooltip: node.arcana.clone(),
            icon: kind_icon(&node.kind)
                .or_else(|| role_icon(&node.role))
                .map(str::to_string),
            collapsible: if node.children.is_empty() {
                Collapsible::None
            } else {
                Collapsible::Expanded
            },
            action: node.range.map(|selection| ItemAction::Open {
                uri: self.document.clone(),
                selection,
            }),
        })
    }
}

/// The "clangd.ast" view and its commands.
pub struct AstView {
    host: Arc<dyn EditorHost>,
    supported: Mutex<HashMap<ContextId, bool>>,
    tree: Mutex<Option<AstTree>>,
    requests: LatestRequests<ViewId>,
}

impl AstView {
    /// An empty view.
    pub fn new(host: Arc<dyn EditorHost>) -> Self {
        Self {
            host,
            supported: Mutex::new(HashMap::new()),
            tree: Mutex::new(None),
            requests: LatestRequests::new(),
        }
    }

    /// Whether a tree is shown.
    pub fn has_root(&self) -> bool {
        self.tree.lock().is_some()
    }

    /// Document of the shown tree.
    pub fn document(&self) -> Option<Url> {
        self.tree.lock().as_ref().map(|t| t.document.clone())
    }

    fn set_root(&self, tree: Option<AstTree>) {
        let has_data = tree.is_some();
        *self.tree.lock() = tree;
        self.host.set_context_key(HAS_DATA_KEY, has_data);
        self.host.refresh_view(ViewId::Ast);
    }

    async fn show(&self, manager: Arc<ContextManager>, args: Value) -> CommandResult<()> {
        let context = command_target(self.host.as_ref(), args)?
            .and_then(|(uri, range)| Some((manager.get_context_for_uri(&uri)?, uri, range)));
        let Some((context, uri, range)) = context else {
            self.host.show_message(
                MessageLevel::Info,
                "No clangd instance available for this document",
            );
            return Ok(());
        };
        let params = AstParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
            range,
        };
        let ticket = self.requests.begin(ViewId::Ast, context.id());
        let result: LspResult<Option<AstNode>> = context
            .connection()
            .request("textDocument/ast", &params, ticket.token())
            .await;
        if !self.requests.finish(&ticket) || context.is_disposed() {
            debug!(context = %context.id(), uri = %uri, "dropping superseded AST");
            return Ok(());
        }
        let root = result?;
        let tree = match root {
            Some(root) => Some(AstTree::new(context.id(), uri, root)),
            None => {
                self.host
                    .show_message(MessageLevel::Info, "No AST node at selection");
                None
            }
        };
        self.set_root(tree);
        Ok(())
    }
}

impl Feature for AstView {
    fn name(&self) -> &'static str {
        "ast"
    }

    fn attach(self: Arc<Self>, context: &Arc<ClangdContext>) {
        let owner = context.id();
        let view = self.clone();
        context
            .connection()
            .register_feature(Arc::new(Hook::new().on_initialize(move |caps| {
                view.supported
                    .lock()
                    .insert(owner, has_capability(caps, "astProvider"));
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
            debug!(context = %context.id(), "dropping AST of disposed context");
            self.set_root(None);
        }
    }

    fn commands(self: Arc<Self>) -> Vec<(&'static str, CommandHandler)> {
        let show = self.clone();
        let close = self;
        vec![
            (
                "clangd.ast",
                handler(move |manager, args| {
                    let view = show.clone();
                    async move { view.show(manager, args).await }
                }),
            ),
            (
                "clangd.ast.close",
                handler(move |_, _| {
                    let view = close.clone();
                    async move {
                        view.requests.cancel(&ViewId::Ast);
                        view.set_root(None);
                        Ok(())
                    }
                }),
            ),
        ]
    }
}

#[async_trait]
impl TreeDataProvider for AstView {
    async fn children(&self, parent: Option<NodeId>) -> Vec<NodeId> {
        let tree = self.tree.lock();
        let Some(tree) = tree.as_ref() else {
            return Vec::new();
        };
        match parent {
            None => vec![0],
            Some(id) => tree.nodes.get(id).map(|n| n.children.clone()).unwrap_or_default(),
        }
    }

    fn item(&self, node: NodeId) -> Option<TreeItem> {
        self.tree.lock().as_ref()?.item(node)
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.tree.lock().as_ref()?.nodes.get(node)?.parent
    }
}
