//! The `clangd.*` settings surface.

use std::path::Path;
use std::path::PathBuf;

use lsp_types::Url;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::lsp::ServerSpec;

use super::{Configuration, Variables};

/// Settings section every key below lives in.
pub const SECTION: &str = "clangd";

/// Full dotted key of a `clangd.*` setting.
pub fn key(name: &str) -> String {
    format!("{SECTION}.{name}")
}

/// What to do when compile flags or server settings change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChangePolicy {
    /// Ask the user.
    #[default]
    Prompt,
    /// Restart the server without asking.
    Restart,
    /// Do nothing.
    Ignore,
}

/// Styling of preprocessor-inactive regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct InactiveRegionsSettings {
    /// Use a background highlight instead of reduced opacity.
    pub use_background_highlight: bool,
    /// Opacity of inactive code.
    pub opacity: f64,
}

impl Default for InactiveRegionsSettings {
    fn default() -> Self {
        Self {
            use_background_highlight: false,
            opacity: 0.55,
        }
    }
}

/// Every setting the bridge reads, with its documented default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// The path to the clangd executable.
    pub path: String,
    /// Arguments for clangd server.
    pub arguments: Vec<String>,
    /// Run `path` through a shell, quoting command and arguments.
    pub use_script_as_executable: bool,
    /// File to write a clangd trace to (`CLANGD_TRACE`).
    pub trace: String,
    /// Extra clang flags used when no compile command is known.
    pub fallback_flags: Vec<String>,
    /// Run one clangd per workspace folder instead of one shared instance.
    pub enable_per_folder_server: bool,
    /// Milliseconds to withhold non-empty diagnostics after an edit.
    pub diagnostics_delay: u64,
    /// Keep clangd's completion ranking instead of the editor's.
    pub server_completion_ranking: bool,
    /// Offer code completion.
    pub enable_code_completion: bool,
    /// Offer hovers.
    pub enable_hover: bool,
    /// Resolve symlinks in navigation results.
    pub follow_symlinks: bool,
    /// Reaction to changed `compile_commands.json` / `compile_flags.txt`.
    pub on_config_changed: ChangePolicy,
    /// Reaction to changed `clangd.path` / `clangd.arguments`.
    pub on_settings_changed: ChangePolicy,
    /// Inactive region styling.
    pub inactive_regions: InactiveRegionsSettings,
    /// `--compile-commands-dir`.
    pub compile_commands_dir: String,
    /// `--query-driver` globs.
    pub query_drivers: Vec<String>,
    /// `--background-index`.
    pub background_index: bool,
    /// `--clang-tidy`.
    pub clang_tidy: bool,
    /// `--header-insertion`.
    pub header_insertion: String,
    /// `--limit-results`.
    pub limit_results: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            path: "clangd".to_string(),
            arguments: Vec::new(),
            use_script_as_executable: false,
            trace: String::new(),
            fallback_flags: Vec::new(),
            enable_per_folder_server: false,
            diagnostics_delay: 750,
            server_completion_ranking: true,
            enable_code_completion: true,
            enable_hover: true,
            follow_symlinks: false,
            on_config_changed: ChangePolicy::Prompt,
            on_settings_changed: ChangePolicy::Prompt,
            inactive_regions: InactiveRegionsSettings::default(),
            compile_commands_dir: String::new(),
            query_drivers: Vec::new(),
            background_index: true,
            clang_tidy: false,
            header_insertion: "iwyu".to_string(),
            limit_results: 100,
        }
    }
}

impl Settings {
    /// Reads the current settings from `config`, expanding placeholders.
    ///
    /// Each key is taken from `config` when present and valid for its type;
    /// anything else keeps its default.
    pub fn load(config: &dyn Configuration, vars: &Variables, scope: Option<&Url>) -> Self {
        let defaults = Self::default();
        let Ok(mut working) = serde_json::to_value(&defaults) else {
            return defaults;
        };

        let mut leaves = Vec::new();
        collect_leaves(&working, String::new(), &mut leaves);

        for leaf in leaves {
            let Some(raw) = config.get_raw(&key(&leaf), scope) else {
                continue;
            };
            let value = vars.substitute(raw, config);
            let previous = replace_leaf(&mut working, &leaf, value);
            if serde_json::from_value::<Self>(working.clone()).is_err() {
                warn!(key = %key(&leaf), "ignoring setting with unexpected type");
                if let Some(previous) = previous {
                    replace_leaf(&mut working, &leaf, previous);
                }
            }
        }

        serde_json::from_value(working).unwrap_or(defaults)
    }

    /// JSON schema of the settings object.
    pub fn schema() -> Value {
        serde_json::to_value(schemars::schema_for!(Settings)).unwrap_or(Value::Null)
    }

    /// Server arguments: `arguments` plus a derived flag for every setting
    /// whose flag `arguments` does not already contain.
    pub fn server_arguments(&self) -> Vec<String> {
        let mut args = self.arguments.clone();
        let mut push_unless_present = |flag: &str, value: Option<String>| {
            if args.iter().any(|arg| arg.starts_with(flag)) {
                return;
            }
            if let Some(value) = value {
                args.push(format!("{flag}={value}"));
            }
        };

        push_unless_present(
            "--compile-commands-dir",
            (!self.compile_commands_dir.is_empty()).then(|| self.compile_commands_dir.clone()),
        );
        push_unless_present(
            "--query-driver",
            (!self.query_drivers.is_empty()).then(|| self.query_drivers.join(",")),
        );
        push_unless_present("--background-index", Some(self.background_index.to_string()));
        push_unless_present("--clang-tidy", Some(self.clang_tidy.to_string()));
        push_unless_present("--header-insertion", Some(self.header_insertion.clone()));
        push_unless_present("--limit-results", Some(self.limit_results.to_string()));
        args
    }

    /// How to launch `executable` with these settings.
    pub fn server_spec(&self, executable: &Path, cwd: PathBuf) -> ServerSpec {
        let mut command = executable.display().to_string();
        let mut args = self.server_arguments();
        if self.use_script_as_executable {
            let quote = |s: &str| format!("\"{s}\"");
            command = quote(&command);
            args = args.iter().map(|a| quote(a)).collect();
        }
        let env = if self.trace.is_empty() {
            Vec::new()
        } else {
            vec![("CLANGD_TRACE".to_string(), self.trace.clone())]
        };
        ServerSpec {
            command,
            args,
            cwd,
            env,
            shell: self.use_script_as_executable,
        }
    }

    /// `initializationOptions` of the initialize request.
    pub fn initialization_options(&self) -> Value {
        json!({
            "clangdFileStatus": true,
            "fallbackFlags": self.fallback_flags,
        })
    }
}

fn collect_leaves(value: &Value, prefix: String, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let path = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                collect_leaves(v, path, out);
            }
        }
        _ => out.push(prefix),
    }
}

fn replace_leaf(root: &mut Value, path: &str, value: Value) -> Option<Value> {
    let mut node = root;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        let map: &mut Map<String, Value> = node.as_object_mut()?;
        if parts.peek().is_none() {
            return map.insert(part.to_string(), value);
        }
        node = map.get_mut(part)?;
    }
    None
}
