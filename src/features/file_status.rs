//! `clangd: <state>` in the status line for the focused document.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::context::{ClangdContext, ContextId};
use crate::editor::{EditorEvent, EditorHost};
use crate::lsp::protocol::{FileStatusParams, pushed};
use crate::lsp::state::ConnectionState;
use crate::lsp::types::url_to_path;
use crate::manager::ContextManager;

use super::Feature;

/// Tracks `textDocument/clangd.fileStatus` per context.
pub struct FileStatus {
    host: Arc<dyn EditorHost>,
    statuses: Mutex<HashMap<ContextId, HashMap<PathBuf, String>>>,
}

impl FileStatus {
    /// No statuses yet.
    pub fn new(host: Arc<dyn EditorHost>) -> Self {
        Self {
            host,
            statuses: Mutex::new(HashMap::new()),
        }
    }

    /// Last reported state of `path`, from whichever context reported it.
    pub fn status_of(&self, path: &std::path::Path) -> Option<String> {
        self.statuses
            .lock()
            .values()
            .find_map(|files| files.get(path).cloned())
    }

    fn record(&self, owner: ContextId, params: FileStatusParams) {
        let Some(path) = url_to_path(&params.uri) else {
            return;
        };
        self.statuses
            .lock()
            .entry(owner)
            .or_default()
            .insert(path, params.state);
        self.update_status();
    }

    fn clear(&self, owner: ContextId) {
        if self.statuses.lock().remove(&owner).is_some() {
            self.host.set_status(None);
            self.update_status();
        }
    }

    fn forget(&self, path: &std::path::Path) {
        for files in self.statuses.lock().values_mut() {
            files.remove(path);
        }
    }

    fn update_status(&self) {
        let Some(active) = self.host.active_document() else {
            return;
        };
        if active.uri.scheme() == "output" {
            return;
        }
        let status = url_to_path(&active.uri)
            .and_then(|path| self.status_of(&path))
            .map(|state| format!("clangd: {state}"));
        self.host.set_status(status);
    }
}

impl Feature for FileStatus {
    fn name(&self) -> &'static str {
        "file-status"
    }

    fn attach(self: Arc<Self>, context: &Arc<ClangdContext>) {
        let owner = context.id();
        let feature = self.clone();
        context.subscribe_notification(pushed::FILE_STATUS, move |params| {
            match serde_json::from_value::<FileStatusParams>(params) {
                Ok(params) => feature.record(owner, params),
                Err(e) => debug!(context = %owner, error = %e, "malformed file status"),
            }
        });
        let feature = self;
        let subscription = context.connection().state_machine().on_change(move |change| {
            if change.new == ConnectionState::Stopped {
                feature.clear(owner);
            }
        });
        context.push_subscription(subscription);
    }

    fn detach(&self, context: &ClangdContext) {
        self.clear(context.id());
    }

    fn on_editor_event(self: Arc<Self>, _manager: &Arc<ContextManager>, event: &EditorEvent) {
        match event {
            EditorEvent::ActiveEditorChanged(_) => self.update_status(),
            EditorEvent::DocumentClosed(document) => {
                if let Some(path) = url_to_path(&document.uri) {
                    self.forget(&path);
                    self.update_status();
                }
            }
            _ => {}
        }
    }
}
