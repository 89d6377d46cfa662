//! Locating the clangd executable.
//!
//! Downloading releases is left to the editor; [`PathInstaller`] only finds an
//! existing binary.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::editor::{EditorHost, MessageLevel};

/// Finds (or installs) a usable clangd.
#[async_trait]
pub trait Installer: Send + Sync {
    /// Returns the executable to run, or `None` when there is none. Any
    /// user-facing recovery has already happened when this returns `None`.
    async fn resolve(&self, storage_root: &Path, settings: &Settings) -> Option<PathBuf>;
}

/// Resolves `clangd.path` on disk, on `PATH`, then among binaries previously
/// installed under the storage root.
pub struct PathInstaller {
    host: Arc<dyn EditorHost>,
    reported: AtomicBool,
}

impl PathInstaller {
    /// Creates an installer reporting failures through `host`.
    pub fn new(host: Arc<dyn EditorHost>) -> Self {
        Self {
            host,
            reported: AtomicBool::new(false),
        }
    }

    fn executable_name(name: &str) -> String {
        if cfg!(windows) && Path::new(name).extension().is_none() {
            format!("{name}.exe")
        } else {
            name.to_string()
        }
    }

    fn search_path(name: &str) -> Option<PathBuf> {
        let name = Self::executable_name(name);
        let paths = std::env::var_os("PATH")?;
        std::env::split_paths(&paths)
            .map(|dir| dir.join(&name))
            .find(|candidate| candidate.is_file())
    }

    fn search_storage(storage_root: &Path) -> Option<PathBuf> {
        let install = storage_root.join("install");
        let name = Self::executable_name("clangd");
        let mut found: Vec<PathBuf> = std::fs::read_dir(&install)
            .ok()?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter_map(|dir| {
                std::fs::read_dir(&dir)
                    .ok()?
                    .filter_map(Result::ok)
                    .map(|entry| entry.path().join("bin").join(&name))
                    .find(|candidate| candidate.is_file())
            })
            .collect();
        // Newest release directory sorts last.
        found.sort();
        found.pop()
    }

    /// Lookup without any user interaction.
    pub fn locate(configured: &str, storage_root: &Path) -> Option<PathBuf> {
        let configured_path = Path::new(configured);
        if configured_path.components().count() > 1 || configured_path.is_absolute() {
            return configured_path.is_file().then(|| configured_path.to_path_buf());
        }
        Self::search_path(configured).or_else(|| Self::search_storage(storage_root))
    }
}

#[async_trait]
impl Installer for PathInstaller {
    async fn resolve(&self, storage_root: &Path, settings: &Settings) -> Option<PathBuf> {
        if let Some(path) = Self::locate(&settings.path, storage_root) {
            debug!(path = %path.display(), "using clangd");
            return Some(path);
        }
        warn!(path = %settings.path, "clangd executable not found");
        if !self.reported.swap(true, Ordering::SeqCst) {
            self.host.show_message(
                MessageLevel::Error,
                &format!(
                    "The clangd language server was not found ('{}'). \
                     Install clangd or set clangd.path.",
                    settings.path
                ),
            );
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_configured_absolute_path() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("clangd-18");
        std::fs::write(&exe, "").unwrap();

        let found = PathInstaller::locate(exe.to_str().unwrap(), dir.path());
        assert_eq!(found, Some(exe));
        let missing = dir.path().join("nope");
        assert!(PathInstaller::locate(missing.to_str().unwrap(), dir.path()).is_none());
    }

    #[test]
    fn test_locate_in_storage_root() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("install/17.0.3/clangd_17.0.3/bin");
        std::fs::create_dir_all(&bin).unwrap();
        let exe = bin.join(PathInstaller::executable_name("clangd"));
        std::fs::write(&exe, "").unwrap();

        let found = PathInstaller::locate("clangd-bridge-test-no-such-binary", dir.path());
        assert_eq!(found, Some(exe.clone()));
        assert_eq!(PathInstaller::search_storage(dir.path()), Some(exe));
    }
}
