//! `${variable}` placeholder substitution in setting values.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use super::Configuration;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{(.*?)\}").expect("valid placeholder pattern"));

/// Values the recognized placeholders expand to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variables {
    /// `${userHome}`.
    pub user_home: Option<PathBuf>,
    /// `${workspaceRoot}` and `${workspaceFolder}`.
    pub workspace_root: PathBuf,
    /// `${cwd}`.
    pub cwd: PathBuf,
}

impl Variables {
    /// Variables for a workspace rooted at `root`.
    ///
    /// Without a root, the directory of `active_document` is used, then the
    /// process working directory.
    pub fn new(root: Option<&Path>, active_document: Option<&Path>) -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let workspace_root = root
            .map(Path::to_path_buf)
            .or_else(|| active_document.and_then(Path::parent).map(Path::to_path_buf))
            .unwrap_or_else(|| cwd.clone());
        Self {
            user_home: dirs::home_dir(),
            workspace_root,
            cwd,
        }
    }

    fn replacement(&self, name: &str, config: &dyn Configuration) -> Option<String> {
        match name {
            "userHome" => self.user_home.as_ref().map(|p| p.display().to_string()),
            "workspaceRoot" | "workspaceFolder" => Some(self.workspace_root.display().to_string()),
            "workspaceFolderBasename" => self
                .workspace_root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            "cwd" => Some(self.cwd.display().to_string()),
            _ => {
                if let Some(var) = name.strip_prefix("env:") {
                    return Some(std::env::var(var).unwrap_or_default());
                }
                if let Some(key) = name.strip_prefix("config:") {
                    return config
                        .get_raw(key, None)
                        .and_then(|v| v.as_str().map(str::to_string));
                }
                None
            }
        }
    }

    /// Expands placeholders in one string. Unknown placeholders are kept.
    pub fn substitute_str(&self, input: &str, config: &dyn Configuration) -> String {
        PLACEHOLDER
            .replace_all(input, |caps: &Captures<'_>| {
                self.replacement(&caps[1], config)
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    /// Expands placeholders in every string of `value`, recursing through
    /// arrays and object values. Object keys are left alone.
    pub fn substitute(&self, value: Value, config: &dyn Configuration) -> Value {
        match value {
            Value::String(s) => Value::String(self.substitute_str(&s, config)),
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| self.substitute(item, config))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, self.substitute(v, config)))
                    .collect(),
            ),
            other => other,
        }
    }
}
