//! Wire bindings for the methods clangd-bridge sends, and payload shapes of
//! clangd's protocol extensions.
//!
//! Every method is bound to a marker type whose params and result are raw
//! JSON values; typed decoding happens in [`super::ConnectionExt`]. This
//! keeps [`super::Connection`] object safe while still going through
//! async-lsp's typed socket API.

use std::collections::HashMap;

use async_lsp::ServerSocket;
use futures::future::BoxFuture;
use lsp_types::{
    Position, Range, SymbolKind, TextDocumentIdentifier, TextDocumentPositionParams, Url,
    VersionedTextDocumentIdentifier,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

macro_rules! raw_requests {
    ($($(#[$meta:meta])* $name:ident => $method:literal),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug)]
            pub enum $name {}

            impl lsp_types::request::Request for $name {
                type Params = Value;
                type Result = Value;
                const METHOD: &'static str = $method;
            }
        )*

        /// Sends `method` over `socket`, or `None` if the method has no binding.
        pub(crate) fn dispatch_request(
            socket: &ServerSocket,
            method: &str,
            params: Value,
        ) -> Option<BoxFuture<'static, async_lsp::Result<Value>>> {
            match method {
                $(
                    $method => {
                        let socket = socket.clone();
                        Some(Box::pin(async move { socket.request::<$name>(params).await }))
                    }
                )*
                _ => None,
            }
        }
    };
}

macro_rules! raw_notifications {
    ($($(#[$meta:meta])* $name:ident => $method:literal),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug)]
            pub enum $name {}

            impl lsp_types::notification::Notification for $name {
                type Params = Value;
                const METHOD: &'static str = $method;
            }
        )*

        /// Sends `method` over `socket`, or `None` if the method has no binding.
        pub(crate) fn dispatch_notification(
            socket: &ServerSocket,
            method: &str,
            params: Value,
        ) -> Option<async_lsp::Result<()>> {
            match method {
                $( $method => Some(socket.notify::<$name>(params)), )*
                _ => None,
            }
        }
    };
}

raw_requests! {
    /// `initialize`, sent raw so features can extend client capabilities.
    Initialize => "initialize",
    /// `shutdown`.
    Shutdown => "shutdown",
    /// `textDocument/completion`.
    Completion => "textDocument/completion",
    /// `textDocument/hover`.
    Hover => "textDocument/hover",
    /// `workspace/symbol`.
    WorkspaceSymbol => "workspace/symbol",
    /// `textDocument/definition`.
    Definition => "textDocument/definition",
    /// `textDocument/typeDefinition`.
    TypeDefinition => "textDocument/typeDefinition",
    /// `textDocument/implementation`.
    Implementation => "textDocument/implementation",
    /// `textDocument/declaration`.
    Declaration => "textDocument/declaration",
    /// `textDocument/references`.
    References => "textDocument/references",
    /// `workspace/executeCommand`.
    ExecuteCommand => "workspace/executeCommand",
    /// `textDocument/ast`: selection range to AST subtree.
    Ast => "textDocument/ast",
    /// `textDocument/typeHierarchy`: position to hierarchy item.
    TypeHierarchy => "textDocument/typeHierarchy",
    /// `typeHierarchy/resolve`: lazily resolve more levels of an item.
    ResolveTypeHierarchy => "typeHierarchy/resolve",
    /// `$/memoryUsage`: server memory cost tree.
    MemoryUsage => "$/memoryUsage",
    /// `clangd/inlayHints`: hints for a document.
    InlayHints => "clangd/inlayHints",
    /// `textDocument/switchSourceHeader`: companion file of a document.
    SwitchSourceHeader => "textDocument/switchSourceHeader",
}

raw_notifications! {
    /// `initialized`.
    Initialized => "initialized",
    /// `exit`.
    Exit => "exit",
    /// `textDocument/didOpen`.
    DidOpen => "textDocument/didOpen",
    /// `textDocument/didChange`.
    DidChange => "textDocument/didChange",
    /// `textDocument/didClose`.
    DidClose => "textDocument/didClose",
    /// `workspace/didChangeConfiguration`.
    DidChangeConfiguration => "workspace/didChangeConfiguration",
}

/// Server-pushed notification methods the bridge listens to.
pub mod pushed {
    /// Standard diagnostics push.
    pub const PUBLISH_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";
    /// Per-file status updates (`clangdFileStatus` init option).
    pub const FILE_STATUS: &str = "textDocument/clangd.fileStatus";
    /// Preprocessor-inactive regions of a document.
    pub const INACTIVE_REGIONS: &str = "textDocument/inactiveRegions";
}

/// Params of `textDocument/ast`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AstParams {
    /// Document the selection belongs to.
    pub text_document: TextDocumentIdentifier,
    /// Selected range.
    pub range: Range,
}

/// A node of the tree returned by `textDocument/ast`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AstNode {
    /// Base node type, e.g. `expression`.
    #[serde(default)]
    pub role: String,
    /// Node subtype, e.g. `BinaryOperator`.
    #[serde(default)]
    pub kind: String,
    /// Short detail, e.g. `||`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Full dump of the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arcana: Option<String>,
    /// Ordered child nodes.
    #[serde(default)]
    pub children: Vec<AstNode>,
    /// Source range covered by the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
}

/// Which side of a type hierarchy to resolve.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TypeHierarchyDirection {
    /// Derived types.
    Children = 0,
    /// Base types.
    Parents = 1,
    /// Both sides.
    Both = 2,
}

impl Serialize for TypeHierarchyDirection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for TypeHierarchyDirection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(Self::Children),
            1 => Ok(Self::Parents),
            2 => Ok(Self::Both),
            other => Err(serde::de::Error::custom(format!(
                "invalid type hierarchy direction: {other}"
            ))),
        }
    }
}

/// Params of `textDocument/typeHierarchy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeHierarchyParams {
    /// Position of the symbol.
    #[serde(flatten)]
    pub text_document_position_params: TextDocumentPositionParams,
    /// Number of levels to resolve eagerly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolve: Option<u32>,
    /// Sides to resolve.
    pub direction: TypeHierarchyDirection,
}

/// A type hierarchy item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeHierarchyItem {
    /// Type name.
    pub name: String,
    /// Extra detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Symbol kind.
    pub kind: SymbolKind,
    /// Deprecation flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<bool>,
    /// Document defining the type.
    pub uri: Url,
    /// Full range of the definition.
    pub range: Range,
    /// Range to select when navigating.
    pub selection_range: Range,
    /// Base types, when resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parents: Option<Vec<TypeHierarchyItem>>,
    /// Derived types, when resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<TypeHierarchyItem>>,
    /// Opaque server data round-tripped on resolve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Params of `typeHierarchy/resolve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveTypeHierarchyItemParams {
    /// Item to resolve.
    pub item: TypeHierarchyItem,
    /// Number of levels to resolve.
    pub resolve: u32,
    /// Side to resolve.
    pub direction: TypeHierarchyDirection,
}

/// Params of `clangd/inlayHints`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlayHintsParams {
    /// Document to annotate.
    pub text_document: TextDocumentIdentifier,
    /// Restrict hints to this range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
}

/// One hint returned by `clangd/inlayHints`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClangdInlayHint {
    /// Range the hint annotates.
    pub range: Range,
    /// Anchor position; omitted by old servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// `type`, `parameter` or another server-defined kind.
    #[serde(default)]
    pub kind: String,
    /// Hint text, possibly padded with spaces.
    #[serde(default)]
    pub label: String,
}

/// Params of the `textDocument/inactiveRegions` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InactiveRegionsParams {
    /// Document the regions belong to.
    pub text_document: VersionedTextDocumentIdentifier,
    /// Complete list of inactive regions.
    #[serde(default)]
    pub regions: Vec<Range>,
}

/// Params of the `textDocument/clangd.fileStatus` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStatusParams {
    /// File the status is about.
    pub uri: Url,
    /// Human readable state, e.g. `parsing includes`.
    pub state: String,
}

/// A compile command override pushed through
/// `workspace/didChangeConfiguration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileCommand {
    /// Directory the command runs in.
    pub working_directory: String,
    /// Full command line.
    pub compilation_command: Vec<String>,
}

/// clangd's `settings` payload for `workspace/didChangeConfiguration`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClangdSettings {
    /// Per-file compile command overrides keyed by file path.
    pub compilation_database_changes: HashMap<String, CompileCommand>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ast_node_defaults_missing_fields() {
        let node: AstNode = serde_json::from_value(json!({
            "role": "expression",
            "kind": "BinaryOperator",
        }))
        .unwrap();
        assert!(node.children.is_empty());
        assert!(node.range.is_none());
        assert!(node.detail.is_none());
    }

    #[test]
    fn test_type_hierarchy_params_wire_shape() {
        let params = TypeHierarchyParams {
            text_document_position_params: TextDocumentPositionParams {
                text_document: TextDocumentIdentifier {
                    uri: Url::parse("file:///a.cpp").unwrap(),
                },
                position: Position::new(3, 4),
            },
            resolve: Some(5),
            direction: TypeHierarchyDirection::Both,
        };
        let value = serde_json::to_value(params).unwrap();
        assert_eq!(value["direction"], json!(2));
        assert_eq!(value["resolve"], json!(5));
        assert_eq!(value["textDocument"]["uri"], json!("file:///a.cpp"));
        assert_eq!(value["position"]["line"], json!(3));
    }

    #[test]
    fn test_direction_rejects_unknown() {
        assert!(serde_json::from_value::<TypeHierarchyDirection>(json!(7)).is_err());
    }

    #[test]
    fn test_clangd_settings_wire_shape() {
        let mut settings = ClangdSettings::default();
        settings.compilation_database_changes.insert(
            "/src/a.cpp".to_string(),
            CompileCommand {
                working_directory: "/src".to_string(),
                compilation_command: vec!["clang++".to_string(), "a.cpp".to_string()],
            },
        );
        let value = serde_json::to_value(settings).unwrap();
        assert_eq!(
            value["compilationDatabaseChanges"]["/src/a.cpp"]["workingDirectory"],
            json!("/src")
        );
    }
}
