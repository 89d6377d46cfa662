//! Opens the project `.clangd` file or the user `config.yaml`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::commands::{CommandHandler, handler};
use crate::context::ClangdContext;
use crate::editor::{EditorHost, MessageLevel, OpenOptions};
use crate::error::CommandResult;
use crate::lsp::types::{path_to_url, url_to_path};
use crate::manager::ContextManager;

use super::Feature;

/// The directory clangd reads its user configuration from.
pub fn user_config_directory() -> Option<PathBuf> {
    if cfg!(windows) {
        dirs::data_local_dir()
    } else if cfg!(target_os = "macos") {
        dirs::home_dir().map(|home| home.join("Library").join("Preferences"))
    } else {
        dirs::config_dir()
    }
}

/// `<user config dir>/clangd/config.yaml`.
pub fn user_config_file() -> Option<PathBuf> {
    user_config_directory().map(|dir| dir.join("clangd").join("config.yaml"))
}

/// Shows `path` as YAML, as an unsaved buffer if it does not exist yet.
async fn open_config_file(host: &dyn EditorHost, path: &Path) -> CommandResult<()> {
    let exists = tokio::fs::metadata(path).await.is_ok();
    let uri = path_to_url(path)?;
    let options = OpenOptions {
        untitled: !exists,
        language: Some("yaml".to_string()),
        ..OpenOptions::default()
    };
    if !host.open_document(&uri, options).await {
        debug!(path = %path.display(), "could not open config file");
    }
    Ok(())
}

/// Registers `clangd.projectConfig` and `clangd.userConfig`.
pub struct OpenConfig;

impl OpenConfig {
    async fn project(manager: Arc<ContextManager>, _args: Value) -> CommandResult<()> {
        let host = manager.services().host.clone();
        let root = host
            .workspace_folders()
            .first()
            .and_then(|folder| url_to_path(&folder.uri));
        match root {
            Some(root) => open_config_file(host.as_ref(), &root.join(".clangd")).await,
            None => {
                host.show_message(MessageLevel::Error, "No project is open");
                Ok(())
            }
        }
    }

    async fn user(manager: Arc<ContextManager>, _args: Value) -> CommandResult<()> {
        let host = manager.services().host.clone();
        match user_config_file() {
            Some(file) => open_config_file(host.as_ref(), &file).await,
            None => {
                host.show_message(
                    MessageLevel::Error,
                    "Couldn't get global configuration directory",
                );
                Ok(())
            }
        }
    }
}

impl Feature for OpenConfig {
    fn name(&self) -> &'static str {
        "open-config"
    }

    fn attach(self: Arc<Self>, _context: &Arc<ClangdContext>) {}

    fn detach(&self, _context: &ClangdContext) {}

    fn commands(self: Arc<Self>) -> Vec<(&'static str, CommandHandler)> {
        vec![
            ("clangd.projectConfig", handler(Self::project)),
            ("clangd.userConfig", handler(Self::user)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_config_file_layout() {
        if let Some(file) = user_config_file() {
            assert!(file.ends_with("clangd/config.yaml"));
            assert_eq!(file.parent().and_then(Path::parent), user_config_directory().as_deref());
        }
    }
}
