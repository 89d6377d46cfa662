//! The editor boundary.
//!
//! [`EditorHost`] is everything clangd-bridge needs from the editor: workspace
//! and document queries plus write-only UI sinks. Editor activity flows the
//! other way as [`EditorEvent`]s.

use async_trait::async_trait;
use lsp_types::{Diagnostic, Position, Range, Url};
pub use lsp_types::WorkspaceFolder;

/// An open text document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextDocument {
    /// Document URI.
    pub uri: Url,
    /// Editor language identifier, e.g. `cpp`.
    pub language_id: String,
    /// Version, incremented on every edit.
    pub version: i32,
}

impl TextDocument {
    /// Creates a document description.
    pub fn new(uri: Url, language_id: impl Into<String>, version: i32) -> Self {
        Self {
            uri,
            language_id: language_id.into(),
            version,
        }
    }
}

/// Severity of a message shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    /// Informational.
    Info,
    /// Warning.
    Warning,
    /// Error.
    Error,
}

/// Tree views the bridge provides data for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewId {
    /// `clangd.ast`.
    Ast,
    /// `clangd.typeHierarchyView`.
    TypeHierarchy,
    /// `clangd.memoryUsage`.
    MemoryUsage,
}

impl ViewId {
    /// The editor-side view identifier.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ast => "clangd.ast",
            Self::TypeHierarchy => "clangd.typeHierarchyView",
            Self::MemoryUsage => "clangd.memoryUsage",
        }
    }
}

/// Expansion state of a tree item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Collapsible {
    /// Leaf.
    #[default]
    None,
    /// Has children, shown collapsed.
    Collapsed,
    /// Has children, shown expanded.
    Expanded,
}

/// A command bound to a tree item click.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemAction {
    /// Reveal `selection` in `uri` without taking focus.
    Open {
        /// Document to show.
        uri: Url,
        /// Range to select.
        selection: Range,
    },
    /// Run a registered command with arguments.
    Command {
        /// Command identifier.
        command: String,
        /// JSON arguments.
        arguments: serde_json::Value,
    },
}

/// Presentation of one tree node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeItem {
    /// Primary text.
    pub label: String,
    /// Secondary text.
    pub description: Option<String>,
    /// Hover text.
    pub tooltip: Option<String>,
    /// Theme icon identifier.
    pub icon: Option<String>,
    /// Expansion state.
    pub collapsible: Collapsible,
    /// Click action.
    pub action: Option<ItemAction>,
}

/// Opaque handle of a node in a tree provider.
pub type NodeId = usize;

/// Data source of a tree view.
#[async_trait]
pub trait TreeDataProvider: Send + Sync {
    /// Children of `parent`, or the roots for `None`.
    async fn children(&self, parent: Option<NodeId>) -> Vec<NodeId>;

    /// Presentation of `node`, or `None` if the node no longer exists.
    fn item(&self, node: NodeId) -> Option<TreeItem>;

    /// Parent of `node`.
    fn parent(&self, _node: NodeId) -> Option<NodeId> {
        None
    }
}

/// Style of a decoration set.
#[derive(Debug, Clone, PartialEq)]
pub enum DecorationStyle {
    /// Whole-line background color from a theme color id.
    Background {
        /// Theme color identifier.
        theme_color: String,
    },
    /// Whole-line reduced opacity.
    Opacity(f64),
}

/// Decorations applied to one document.
#[derive(Debug, Clone, PartialEq)]
pub struct Decorations {
    /// How the ranges are drawn.
    pub style: DecorationStyle,
    /// Decorated ranges.
    pub ranges: Vec<Range>,
}

/// Kind of an editor inlay hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlayHintKind {
    /// Deduced type.
    Type,
    /// Parameter name.
    Parameter,
}

/// An inline annotation shown by the editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlayHint {
    /// Anchor position.
    pub position: Position,
    /// Hint text without padding spaces.
    pub label: String,
    /// Hint kind, if known.
    pub kind: Option<InlayHintKind>,
    /// Render a space before the label.
    pub padding_left: bool,
    /// Render a space after the label.
    pub padding_right: bool,
}

/// How to show a document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenOptions {
    /// Range to select and reveal.
    pub selection: Option<Range>,
    /// Keep focus where it is.
    pub preserve_focus: bool,
    /// Open as unsaved scratch content instead of reading the file.
    pub untitled: bool,
    /// Language to assign to the opened document.
    pub language: Option<String>,
}

/// Kind of a watched file change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    /// File created.
    Created,
    /// File contents changed.
    Changed,
    /// File deleted.
    Deleted,
}

/// Settings keys touched by a configuration change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigurationChange {
    /// Dotted keys that changed.
    pub keys: Vec<String>,
}

impl ConfigurationChange {
    /// Creates a change touching `keys`.
    pub fn new(keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the change touches `section` or anything below or above it.
    pub fn affects(&self, section: &str) -> bool {
        self.keys.iter().any(|key| {
            key == section
                || key
                    .strip_prefix(section)
                    .is_some_and(|rest| rest.starts_with('.'))
                || section
                    .strip_prefix(key.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }
}

/// Editor activity delivered to the context manager.
#[derive(Debug, Clone, PartialEq)]
pub enum EditorEvent {
    /// A document was opened.
    DocumentOpened(TextDocument),
    /// A document was edited; `text` is its full new content.
    DocumentChanged {
        /// Document after the edit.
        document: TextDocument,
        /// Full text after the edit.
        text: String,
    },
    /// A document was closed.
    DocumentClosed(TextDocument),
    /// Focus moved to another editor, or to none.
    ActiveEditorChanged(Option<TextDocument>),
    /// The set of visible editors changed.
    VisibleEditorsChanged(Vec<Url>),
    /// Workspace folders were added or removed.
    WorkspaceFoldersChanged {
        /// New folders.
        added: Vec<WorkspaceFolder>,
        /// Removed folders.
        removed: Vec<WorkspaceFolder>,
    },
    /// Settings changed.
    ConfigurationChanged(ConfigurationChange),
    /// A watched file changed on disk.
    WatchedFileChanged {
        /// File URI.
        uri: Url,
        /// What happened.
        kind: FileChangeKind,
    },
}

/// The editor, as seen from clangd-bridge.
#[async_trait]
pub trait EditorHost: Send + Sync {
    /// Current workspace folders, in editor order.
    fn workspace_folders(&self) -> Vec<WorkspaceFolder>;

    /// The workspace folder containing `uri`; the innermost one wins.
    fn workspace_folder_for(&self, uri: &Url) -> Option<WorkspaceFolder> {
        let target = uri.as_str();
        self.workspace_folders()
            .into_iter()
            .filter(|folder| {
                let base = folder.uri.as_str().trim_end_matches('/');
                target == base
                    || target
                        .strip_prefix(base)
                        .is_some_and(|rest| rest.starts_with('/'))
            })
            .max_by_key(|folder| folder.uri.as_str().len())
    }

    /// Every open document.
    fn open_documents(&self) -> Vec<TextDocument>;

    /// URIs of documents shown in visible editors.
    fn visible_documents(&self) -> Vec<Url>;

    /// The document of the focused editor.
    fn active_document(&self) -> Option<TextDocument>;

    /// Selection of the focused editor.
    fn active_selection(&self) -> Option<Range> {
        None
    }

    /// Full text of an open document.
    fn document_text(&self, uri: &Url) -> Option<String>;

    /// Status bar text; `None` hides the item.
    fn set_status(&self, text: Option<String>);

    /// Sets a boolean context key (command enablement and view visibility).
    fn set_context_key(&self, key: &str, value: bool);

    /// Asks a tree view to re-query its provider.
    fn refresh_view(&self, view: ViewId);

    /// Replaces the decorations of `uri`; `None` clears them.
    fn set_decorations(&self, uri: &Url, decorations: Option<Decorations>);

    /// Replaces the visible diagnostics of `uri`.
    fn publish_diagnostics(&self, uri: &Url, diagnostics: Vec<Diagnostic>);

    /// Replaces the inlay hints of `uri`.
    fn set_inlay_hints(&self, uri: &Url, hints: Vec<InlayHint>);

    /// Shows a message.
    fn show_message(&self, level: MessageLevel, message: &str);

    /// Shows a message with choices; resolves to the picked choice.
    async fn prompt(&self, message: &str, choices: Vec<String>) -> Option<String>;

    /// Opens and shows a document. Returns whether it could be shown.
    async fn open_document(&self, uri: &Url, options: OpenOptions) -> bool;
}

/// Text of `range` in `text`, with positions counted in UTF-16 code units.
pub fn text_in_range(text: &str, range: Range) -> Option<String> {
    let start = offset_of(text, range.start)?;
    let end = offset_of(text, range.end)?;
    (start <= end).then(|| text[start..end].to_string())
}

fn offset_of(text: &str, position: Position) -> Option<usize> {
    let mut line_start = 0;
    for _ in 0..position.line {
        line_start += text[line_start..].find('\n')? + 1;
    }
    let line = &text[line_start..];
    let line = line.split('\n').next().unwrap_or_default();
    let mut units = 0u32;
    for (idx, ch) in line.char_indices() {
        if units >= position.character {
            return Some(line_start + idx);
        }
        units += ch.len_utf16() as u32;
    }
    (units >= position.character).then_some(line_start + line.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_change_affects() {
        let change = ConfigurationChange::new(["clangd.inactiveRegions.opacity"]);
        assert!(change.affects("clangd.inactiveRegions.opacity"));
        assert!(change.affects("clangd.inactiveRegions"));
        assert!(change.affects("clangd"));
        assert!(!change.affects("clangd.inactiveRegions.useBackgroundHighlight"));
        assert!(!change.affects("clangd.inactive"));

        let whole = ConfigurationChange::new(["clangd"]);
        assert!(whole.affects("clangd.enablePerFolderServer"));
    }

    #[test]
    fn test_text_in_range() {
        let text = "int main() {\n  return foo(1);\n}\n";
        let range = Range::new(Position::new(1, 2), Position::new(1, 12));
        assert_eq!(text_in_range(text, range).as_deref(), Some("return foo"));
        let empty = Range::new(Position::new(1, 2), Position::new(1, 2));
        assert_eq!(text_in_range(text, empty).as_deref(), Some(""));
        let past = Range::new(Position::new(9, 0), Position::new(9, 1));
        assert_eq!(text_in_range(text, past), None);
    }

    #[test]
    fn test_text_in_range_counts_utf16() {
        let text = "auto s = \"é😀x\";";
        // 'é' is one unit, the emoji two.
        let range = Range::new(Position::new(0, 10), Position::new(0, 13));
        assert_eq!(text_in_range(text, range).as_deref(), Some("é😀"));
    }

    struct Folders(Vec<WorkspaceFolder>);

    #[async_trait]
    impl EditorHost for Folders {
        fn workspace_folders(&self) -> Vec<WorkspaceFolder> {
            self.0.clone()
        }
        fn open_documents(&self) -> Vec<TextDocument> {
            Vec::new()
        }
        fn visible_documents(&self) -> Vec<Url> {
            Vec::new()
        }
        fn active_document(&self) -> Option<TextDocument> {
            None
        }
        fn document_text(&self, _uri: &Url) -> Option<String> {
            None
        }
        fn set_status(&self, _text: Option<String>) {}
        fn set_context_key(&self, _key: &str, _value: bool) {}
        fn refresh_view(&self, _view: ViewId) {}
        fn set_decorations(&self, _uri: &Url, _decorations: Option<Decorations>) {}
        fn publish_diagnostics(&self, _uri: &Url, _diagnostics: Vec<Diagnostic>) {}
        fn set_inlay_hints(&self, _uri: &Url, _hints: Vec<InlayHint>) {}
        fn show_message(&self, _level: MessageLevel, _message: &str) {}
        async fn prompt(&self, _message: &str, _choices: Vec<String>) -> Option<String> {
            None
        }
        async fn open_document(&self, _uri: &Url, _options: OpenOptions) -> bool {
            false
        }
    }

    fn folder(uri: &str) -> WorkspaceFolder {
        WorkspaceFolder {
            uri: Url::parse(uri).unwrap(),
            name: uri.rsplit('/').next().unwrap().to_string(),
        }
    }

    #[test]
    fn test_workspace_folder_for_picks_innermost() {
        let host = Folders(vec![folder("file:///work"), folder("file:///work/sub")]);
        let uri = Url::parse("file:///work/sub/a.cpp").unwrap();
        assert_eq!(host.workspace_folder_for(&uri).unwrap().name, "sub");

        let uri = Url::parse("file:///work/other/a.cpp").unwrap();
        assert_eq!(host.workspace_folder_for(&uri).unwrap().name, "work");

        let uri = Url::parse("file:///workspace2/a.cpp").unwrap();
        assert!(host.workspace_folder_for(&uri).is_none());
    }
}
