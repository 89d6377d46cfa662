//! File-backed [`Configuration`].

use std::fs;
use std::path::{Path, PathBuf};

use lsp_types::Url;
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{ConfigError, ConfigResult};

use super::{ConfigTarget, Configuration};

/// Settings stored as JSON objects of dotted keys, e.g.
/// `{"clangd.arguments": ["--log=verbose"]}`.
///
/// A workspace file, when set, takes precedence over the user file. Both are
/// re-read on every lookup.
#[derive(Debug, Clone)]
pub struct JsonSettings {
    user: PathBuf,
    workspace: Option<PathBuf>,
}

impl JsonSettings {
    /// Settings backed by a user file. The file need not exist yet.
    pub fn new(user: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            workspace: None,
        }
    }

    /// Adds a workspace settings file.
    #[must_use]
    pub fn with_workspace(mut self, path: impl Into<PathBuf>) -> Self {
        self.workspace = Some(path.into());
        self
    }

    fn read(path: &Path) -> ConfigResult<Map<String, Value>> {
        if !path.exists() {
            return Ok(Map::new());
        }
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {e}", path.display())))?;
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str(&content) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(ConfigError::Parse(format!(
                "{}: expected a JSON object",
                path.display()
            ))),
            Err(e) => Err(ConfigError::Parse(format!("{}: {e}", path.display()))),
        }
    }

    fn lookup(path: &Path, key: &str) -> Option<Value> {
        match Self::read(path) {
            Ok(mut map) => map.remove(key),
            Err(e) => {
                warn!(error = %e, "ignoring unreadable settings file");
                None
            }
        }
    }
}

impl Configuration for JsonSettings {
    fn get_raw(&self, key: &str, _scope: Option<&Url>) -> Option<Value> {
        self.workspace
            .as_deref()
            .and_then(|path| Self::lookup(path, key))
            .or_else(|| Self::lookup(&self.user, key))
    }

    fn update(&self, key: &str, value: Value, target: ConfigTarget) -> ConfigResult<()> {
        let path = match target {
            ConfigTarget::Workspace => self.workspace.as_deref().unwrap_or(&self.user),
            ConfigTarget::User => &self.user,
        };
        let mut map = Self::read(path)?;
        map.insert(key.to_string(), value);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write atomically (temp file + rename)
        let temp_file = path.with_extension("tmp");
        let json_str = serde_json::to_string_pretty(&Value::Object(map))
            .map_err(|e| ConfigError::Write(e.to_string()))?;
        fs::write(&temp_file, json_str)
            .map_err(|e| ConfigError::Write(format!("{}: {e}", temp_file.display())))?;
        fs::rename(&temp_file, path)
            .map_err(|e| ConfigError::Write(format!("{}: {e}", path.display())))?;
        Ok(())
    }
}
