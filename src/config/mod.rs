//! Settings access.
//!
//! [`Configuration`] is the editor's settings store. [`Settings`] is the typed
//! view of the `clangd.*` section, re-read on every use since the user may
//! change it at any time. [`JsonSettings`] backs the binary with JSON files.

mod json;
pub mod settings;
pub mod substitute;

pub use json::JsonSettings;
pub use settings::{ChangePolicy, InactiveRegionsSettings, Settings};
pub use substitute::Variables;

use lsp_types::Url;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::ConfigResult;

/// Where a settings update is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigTarget {
    /// User (global) settings.
    User,
    /// Settings of the current workspace.
    Workspace,
}

/// The editor's settings store.
pub trait Configuration: Send + Sync {
    /// Current value of a dotted `key`, optionally scoped to a folder.
    fn get_raw(&self, key: &str, scope: Option<&Url>) -> Option<Value>;

    /// Writes `value` for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the setting could not be persisted.
    fn update(&self, key: &str, value: Value, target: ConfigTarget) -> ConfigResult<()>;
}

/// Typed reads over [`Configuration`].
pub trait ConfigurationExt {
    /// Decodes `key`, or `None` when unset or of the wrong type.
    fn get<T: DeserializeOwned>(&self, key: &str, scope: Option<&Url>) -> Option<T>;

    /// Decodes `key`, falling back to `default`.
    fn get_or<T: DeserializeOwned>(&self, key: &str, scope: Option<&Url>, default: T) -> T {
        self.get(key, scope).unwrap_or(default)
    }
}

impl<C: Configuration + ?Sized> ConfigurationExt for C {
    fn get<T: DeserializeOwned>(&self, key: &str, scope: Option<&Url>) -> Option<T> {
        let value = self.get_raw(key, scope)?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(key, error = %e, "setting has unexpected type");
                None
            }
        }
    }
}
