//! An [`EditorHost`] without a user interface.
//!
//! Documents are read from disk, UI sinks are logged and recorded so the
//! binary can print them, and prompts are answered from a fixed choice.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use lsp_types::{Diagnostic, Range, Url, WorkspaceFolder};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::editor::{
    Collapsible, Decorations, EditorHost, InlayHint, MessageLevel, OpenOptions, TextDocument,
    TreeDataProvider, ViewId,
};
use crate::error::ConnectionResult;
use crate::lsp::types::{path_to_url, url_basename, url_to_path};

/// Editor language of `path`, judged by its extension.
pub fn language_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("c") => "c",
        Some("cc" | "cpp" | "cxx" | "c++" | "h" | "hh" | "hpp" | "hxx" | "inl" | "ipp") => "cpp",
        Some("cu" | "cuh") => "cuda-cpp",
        Some("m") => "objective-c",
        Some("mm") => "objective-cpp",
        _ => "plaintext",
    }
}

#[derive(Default)]
struct State {
    documents: Vec<(TextDocument, String)>,
    active: Option<Url>,
    selection: Option<Range>,
    status: Option<String>,
    context_keys: HashMap<String, bool>,
    diagnostics: HashMap<Url, Vec<Diagnostic>>,
    inlay_hints: HashMap<Url, Vec<InlayHint>>,
    decorations: HashMap<Url, Decorations>,
}

/// A host that keeps documents in memory and logs every UI update.
pub struct HeadlessHost {
    folders: Vec<WorkspaceFolder>,
    prompt_answer: Option<String>,
    state: Mutex<State>,
}

impl HeadlessHost {
    /// A host with `folders` open.
    ///
    /// # Errors
    ///
    /// Fails if a folder path cannot be expressed as a URI.
    pub fn new(folders: &[PathBuf]) -> ConnectionResult<Self> {
        let folders = folders
            .iter()
            .map(|path| {
                let uri = path_to_url(path)?;
                Ok(WorkspaceFolder {
                    name: url_basename(&uri),
                    uri,
                })
            })
            .collect::<ConnectionResult<Vec<_>>>()?;
        Ok(Self {
            folders,
            prompt_answer: None,
            state: Mutex::new(State::default()),
        })
    }

    /// Answers every prompt with `answer`.
    #[must_use]
    pub fn with_prompt_answer(mut self, answer: Option<String>) -> Self {
        self.prompt_answer = answer;
        self
    }

    /// Reads `path` and makes it the focused, visible document.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read.
    pub fn open(&self, path: &Path) -> std::io::Result<TextDocument> {
        let text = std::fs::read_to_string(path)?;
        let uri = path_to_url(path).map_err(std::io::Error::other)?;
        let document = TextDocument::new(uri.clone(), language_for(path), 1);
        let mut state = self.state.lock();
        state.documents.retain(|(d, _)| d.uri != uri);
        state.documents.push((document.clone(), text));
        state.active = Some(uri);
        state.selection = None;
        Ok(document)
    }

    /// Selects `range` in the focused document.
    pub fn select(&self, range: Range) {
        self.state.lock().selection = Some(range);
    }

    /// The status line.
    pub fn status(&self) -> Option<String> {
        self.state.lock().status.clone()
    }

    /// Value of an editor context key.
    pub fn context_key(&self, key: &str) -> Option<bool> {
        self.state.lock().context_keys.get(key).copied()
    }

    /// Diagnostics shown for `uri`.
    pub fn diagnostics(&self, uri: &Url) -> Vec<Diagnostic> {
        self.state.lock().diagnostics.get(uri).cloned().unwrap_or_default()
    }

    /// Every document with diagnostics, sorted.
    pub fn diagnosed_documents(&self) -> Vec<Url> {
        let mut uris: Vec<Url> = self.state.lock().diagnostics.keys().cloned().collect();
        uris.sort();
        uris
    }
}

#[async_trait]
impl EditorHost for HeadlessHost {
    fn workspace_folders(&self) -> Vec<WorkspaceFolder> {
        self.folders.clone()
    }

    fn open_documents(&self) -> Vec<TextDocument> {
        self.state.lock().documents.iter().map(|(d, _)| d.clone()).collect()
    }

    fn visible_documents(&self) -> Vec<Url> {
        self.state.lock().active.iter().cloned().collect()
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
        debug!(status = ?text, "status");
        self.state.lock().status = text;
    }

    fn set_context_key(&self, key: &str, value: bool) {
        debug!(key, value, "context key");
        self.state.lock().context_keys.insert(key.to_string(), value);
    }

    fn refresh_view(&self, view: ViewId) {
        debug!(view = view.as_str(), "view changed");
    }

    fn set_decorations(&self, uri: &Url, decorations: Option<Decorations>) {
        let mut state = self.state.lock();
        match decorations {
            Some(decorations) => {
                info!(uri = %uri, ranges = decorations.ranges.len(), "inactive regions");
                state.decorations.insert(uri.clone(), decorations);
            }
            None => {
                state.decorations.remove(uri);
            }
        }
    }

    fn publish_diagnostics(&self, uri: &Url, diagnostics: Vec<Diagnostic>) {
        info!(uri = %uri, count = diagnostics.len(), "diagnostics");
        let mut state = self.state.lock();
        if diagnostics.is_empty() {
            state.diagnostics.remove(uri);
        } else {
            state.diagnostics.insert(uri.clone(), diagnostics);
        }
    }

    fn set_inlay_hints(&self, uri: &Url, hints: Vec<InlayHint>) {
        info!(uri = %uri, count = hints.len(), "inlay hints");
        self.state.lock().inlay_hints.insert(uri.clone(), hints);
    }

    fn show_message(&self, level: MessageLevel, message: &str) {
        match level {
            MessageLevel::Info => info!("{message}"),
            MessageLevel::Warning => warn!("{message}"),
            MessageLevel::Error => error!("{message}"),
        }
    }

    async fn prompt(&self, message: &str, choices: Vec<String>) -> Option<String> {
        let answer = self
            .prompt_answer
            .clone()
            .filter(|answer| choices.contains(answer));
        info!(?choices, ?answer, "{message}");
        answer
    }

    async fn open_document(&self, uri: &Url, options: OpenOptions) -> bool {
        info!(uri = %uri, untitled = options.untitled, selection = ?options.selection, "open document");
        if options.untitled {
            return true;
        }
        match url_to_path(uri) {
            Some(path) => match self.open(&path) {
                Ok(_) => true,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot open document");
                    false
                }
            },
            None => false,
        }
    }
}

/// Renders `provider` as an indented outline, descending at most
/// `max_depth` levels.
pub async fn render_tree(provider: &dyn TreeDataProvider, max_depth: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut stack: Vec<(usize, usize)> = provider
        .children(None)
        .await
        .into_iter()
        .rev()
        .map(|node| (node, 0))
        .collect();
    while let Some((node, depth)) = stack.pop() {
        let Some(item) = provider.item(node) else {
            continue;
        };
        let mut line = format!("{}{}", "  ".repeat(depth), item.label);
        if let Some(description) = &item.description {
            line.push_str("  ");
            line.push_str(description);
        }
        lines.push(line);
        if item.collapsible != Collapsible::None && depth + 1 < max_depth {
            let children = provider.children(Some(node)).await;
            stack.extend(children.into_iter().rev().map(|child| (child, depth + 1)));
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_language_for() {
        assert_eq!(language_for(Path::new("a.c")), "c");
        assert_eq!(language_for(Path::new("a.CPP")), "cpp");
        assert_eq!(language_for(Path::new("a.h")), "cpp");
        assert_eq!(language_for(Path::new("k.cu")), "cuda-cpp");
        assert_eq!(language_for(Path::new("v.mm")), "objective-cpp");
        assert_eq!(language_for(Path::new("README.md")), "plaintext");
    }

    #[test]
    fn test_open_focuses_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.cpp");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "int main() {{ return 0; }}").unwrap();

        let host = HeadlessHost::new(&[dir.path().to_path_buf()]).unwrap();
        let document = host.open(&path).unwrap();
        assert_eq!(document.language_id, "cpp");
        assert_eq!(host.active_document(), Some(document.clone()));
        assert_eq!(host.visible_documents(), vec![document.uri.clone()]);
        assert!(host.document_text(&document.uri).unwrap().contains("main"));
        assert_eq!(
            host.workspace_folder_for(&document.uri).map(|f| f.uri),
            Some(host.workspace_folders()[0].uri.clone())
        );
    }

    #[test]
    fn test_prompt_answers_only_offered_choices() {
        let host = HeadlessHost::new(&[])
            .unwrap()
            .with_prompt_answer(Some("Yes".to_string()));
        let choices = vec!["Yes".to_string(), "No, never".to_string()];
        let answer = tokio_test::block_on(host.prompt("restart?", choices));
        assert_eq!(answer.as_deref(), Some("Yes"));
        assert_eq!(
            tokio_test::block_on(host.prompt("restart?", vec!["Ok".to_string()])),
            None
        );
    }
}
