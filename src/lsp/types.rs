//! Conversions between paths, URIs and positions.

use std::path::{Path, PathBuf};

use lsp_types::{Position, SymbolKind, Url};

use crate::error::ConnectionError;

use super::LspResult;

/// Converts a path to an LSP file:// URI.
///
/// Relative paths are resolved against the current directory. The path is
/// not required to exist.
///
/// # Errors
///
/// Returns an error if the current directory is unavailable or the path
/// cannot be expressed as a URI.
pub fn path_to_url(path: &Path) -> LspResult<Url> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| ConnectionError::ParseError(format!("failed to get current directory: {e}")))?
            .join(path)
    };
    Url::from_file_path(&absolute)
        .map_err(|()| ConnectionError::ParseError(format!("invalid path: {}", absolute.display())))
}

/// The local path of a `file` URI.
pub fn url_to_path(url: &Url) -> Option<PathBuf> {
    if url.scheme() != "file" {
        return None;
    }
    url.to_file_path().ok()
}

/// Resolves symlinks in a `file` URI through the filesystem.
///
/// Returns the URI unchanged when it is not a file URI or the file cannot be
/// resolved.
pub async fn canonicalize_url(url: &Url) -> Url {
    let Some(path) = url_to_path(url) else {
        return url.clone();
    };
    match tokio::fs::canonicalize(&path).await {
        Ok(real) => Url::from_file_path(real).unwrap_or_else(|()| url.clone()),
        Err(_) => url.clone(),
    }
}

/// Last path segment of a URI, used as a folder's display name.
pub fn url_basename(url: &Url) -> String {
    if let Some(name) = url_to_path(url)
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
    {
        return name;
    }
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .unwrap_or_default()
        .to_string()
}

/// Converts user-facing 1-indexed position to LSP 0-indexed position.
///
/// # Errors
///
/// Returns error if line or column is 0.
pub fn to_lsp_position(line: u32, column: u32) -> LspResult<Position> {
    if line == 0 || column == 0 {
        return Err(ConnectionError::ParseError(format!(
            "invalid position {line}:{column} (positions are 1-indexed)"
        )));
    }
    Ok(Position {
        line: line - 1,
        character: column - 1,
    })
}

/// Converts LSP 0-indexed position to user-facing 1-indexed position.
pub fn from_lsp_position(position: Position) -> (u32, u32) {
    (position.line + 1, position.character + 1)
}

/// Icon name of a symbol kind, as shown in tree views.
pub fn symbol_kind_icon(kind: SymbolKind) -> &'static str {
    match kind {
        SymbolKind::FILE => "symbol-file",
        SymbolKind::MODULE => "symbol-module",
        SymbolKind::NAMESPACE => "symbol-namespace",
        SymbolKind::PACKAGE => "symbol-package",
        SymbolKind::CLASS => "symbol-class",
        SymbolKind::METHOD => "symbol-method",
        SymbolKind::PROPERTY => "symbol-property",
        SymbolKind::FIELD => "symbol-field",
        SymbolKind::CONSTRUCTOR => "symbol-constructor",
        SymbolKind::ENUM => "symbol-enum",
        SymbolKind::INTERFACE => "symbol-interface",
        SymbolKind::FUNCTION => "symbol-function",
        SymbolKind::VARIABLE => "symbol-variable",
        SymbolKind::CONSTANT => "symbol-constant",
        SymbolKind::ENUM_MEMBER => "symbol-enum-member",
        SymbolKind::STRUCT => "symbol-struct",
        SymbolKind::OPERATOR => "symbol-operator",
        SymbolKind::TYPE_PARAMETER => "symbol-type-parameter",
        _ => "symbol-misc",
    }
}
