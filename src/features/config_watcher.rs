//! Offers a restart when the compilation database or the server settings
//! change.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lsp_types::Url;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::{ChangePolicy, ConfigTarget, ConfigurationExt, settings};
use crate::context::ClangdContext;
use crate::debounce::Debouncer;
use crate::editor::{EditorEvent, EditorHost, FileChangeKind};
use crate::lsp::types::url_to_path;
use crate::manager::ContextManager;

use super::Feature;

/// Files, relative to a workspace folder, whose changes affect compile flags.
pub const WATCHED_FILES: &[&str] = &[
    "compile_commands.json",
    "compile_flags.txt",
    "build/compile_commands.json",
];

/// Settings whose change requires a new server process.
pub const RESTART_SETTINGS: &[&str] = &["clangd.path", "clangd.arguments"];

/// Delay between the last change of a watched file and the prompt.
pub const DEBOUNCE: Duration = Duration::from_secs(2);

const YES: &str = "Yes";
const ALWAYS: &str = "Yes, always";
const NEVER: &str = "No, never";

/// Whether `path` is one of [`WATCHED_FILES`] under one of `folders`.
pub fn is_watched(path: &Path, folders: &[PathBuf]) -> bool {
    folders.iter().any(|folder| {
        path.strip_prefix(folder)
            .is_ok_and(|relative| WATCHED_FILES.iter().any(|f| relative == Path::new(f)))
    })
}

/// Applies the `setting` policy (`onConfigChanged` or `onSettingsChanged`),
/// asking the user with `message` under [`ChangePolicy::Prompt`].
pub async fn prompt_restart(manager: Arc<ContextManager>, setting: &str, message: String) {
    let services = manager.services().clone();
    let key = settings::key(setting);
    let policy: ChangePolicy = services.config.get_or(&key, None, ChangePolicy::Prompt);
    let restart = match policy {
        ChangePolicy::Restart => true,
        ChangePolicy::Ignore => false,
        ChangePolicy::Prompt => {
            let choices = vec![YES.to_string(), ALWAYS.to_string(), NEVER.to_string()];
            let persist = |policy: ChangePolicy| {
                if let Err(e) = services.config.update(&key, json!(policy), ConfigTarget::User) {
                    warn!(setting = %key, error = %e, "could not persist policy");
                }
            };
            match services.host.prompt(&message, choices).await.as_deref() {
                Some(YES) => true,
                Some(ALWAYS) => {
                    persist(ChangePolicy::Restart);
                    true
                }
                Some(NEVER) => {
                    persist(ChangePolicy::Ignore);
                    false
                }
                _ => false,
            }
        }
    };
    if restart {
        info!(setting = %key, "restarting after configuration change");
        if let Err(e) = manager.restart().await {
            warn!(error = %e, "restart failed");
        }
    }
}

/// Watches compile flag files and restart-relevant settings.
pub struct ConfigWatcher {
    host: Arc<dyn EditorHost>,
    debouncer: Debouncer,
}

impl ConfigWatcher {
    /// A watcher with nothing pending.
    pub fn new(host: Arc<dyn EditorHost>) -> Self {
        Self {
            host,
            debouncer: Debouncer::new(),
        }
    }

    /// Whether a prompt is waiting for its debounce deadline.
    pub fn is_pending(&self) -> bool {
        self.debouncer.is_pending()
    }

    fn file_changed(self: Arc<Self>, manager: &Arc<ContextManager>, uri: &Url) {
        let Some(path) = url_to_path(uri) else {
            return;
        };
        let folders: Vec<PathBuf> = self
            .host
            .workspace_folders()
            .iter()
            .filter_map(|f| url_to_path(&f.uri))
            .collect();
        if !is_watched(&path, &folders) {
            return;
        }
        let manager = Arc::downgrade(manager);
        tokio::spawn(async move {
            // Generators often truncate the file before writing it.
            let size = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            if size == 0 {
                debug!(path = %path.display(), "ignoring empty compile configuration");
                self.debouncer.cancel();
                return;
            }
            let message = format!(
                "Clangd configuration file at '{}' has been changed. Do you want to restart it?",
                path.display()
            );
            self.debouncer.schedule(DEBOUNCE, move || {
                if let Some(manager) = manager.upgrade() {
                    tokio::spawn(prompt_restart(manager, "onConfigChanged", message));
                }
            });
        });
    }
}

impl Feature for ConfigWatcher {
    fn name(&self) -> &'static str {
        "config-watcher"
    }

    fn attach(self: Arc<Self>, _context: &Arc<ClangdContext>) {}

    fn detach(&self, _context: &ClangdContext) {}

    fn on_editor_event(self: Arc<Self>, manager: &Arc<ContextManager>, event: &EditorEvent) {
        match event {
            EditorEvent::WatchedFileChanged { uri, kind } if *kind != FileChangeKind::Deleted => {
                self.file_changed(manager, uri);
            }
            EditorEvent::ConfigurationChanged(change) => {
                for setting in RESTART_SETTINGS.iter().filter(|s| change.affects(s)) {
                    let message =
                        format!("setting '{setting}' has changed. Do you want to reload the server?");
                    tokio::spawn(prompt_restart(manager.clone(), "onSettingsChanged", message));
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_watched() {
        let folders = vec![PathBuf::from("/w/f1"), PathBuf::from("/w/f2")];
        assert!(is_watched(Path::new("/w/f1/compile_commands.json"), &folders));
        assert!(is_watched(Path::new("/w/f2/compile_flags.txt"), &folders));
        assert!(is_watched(Path::new("/w/f1/build/compile_commands.json"), &folders));
        assert!(!is_watched(Path::new("/w/f1/src/compile_commands.json"), &folders));
        assert!(!is_watched(Path::new("/w/f1/out/compile_commands.json"), &folders));
        assert!(!is_watched(Path::new("/other/compile_commands.json"), &folders));
        assert!(!is_watched(Path::new("/w/f1/CMakeLists.txt"), &folders));
    }
}
