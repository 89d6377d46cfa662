//! Rewrites applied to server responses before the editor sees them.

use std::collections::HashMap;
use std::sync::LazyLock;

use lsp_types::{
    Command, CompletionItem, CompletionList, CompletionResponse, CompletionTextEdit,
    GotoDefinitionResponse, InsertTextFormat, Location, LocationLink, Position, Range, Url,
    WorkspaceSymbolResponse,
};
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::lsp::types::canonicalize_url;

/// A snippet opening its first placeholder right after a bracket or comma.
static PLACEHOLDER_AFTER_BRACKET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[(\[{<,] ?\$\{?[01]\D").expect("valid snippet pattern"));

/// Command the editor runs to show signature help.
pub const TRIGGER_PARAMETER_HINTS: &str = "editor.action.triggerParameterHints";

fn item_range(item: &CompletionItem) -> Option<Range> {
    match item.text_edit.as_ref()? {
        CompletionTextEdit::Edit(edit) => Some(edit.range),
        CompletionTextEdit::InsertAndReplace(edit) => Some(edit.insert),
    }
}

fn snippet_text(item: &CompletionItem) -> Option<&str> {
    if item.insert_text_format != Some(InsertTextFormat::SNIPPET) {
        return None;
    }
    match item.text_edit.as_ref() {
        Some(CompletionTextEdit::Edit(edit)) => Some(&edit.new_text),
        Some(CompletionTextEdit::InsertAndReplace(edit)) => Some(&edit.new_text),
        None => item.insert_text.as_deref(),
    }
}

/// Post-processes a completion response so that ranking follows the server.
///
/// `prefix_of` returns the document text between an item's edit start and
/// the cursor `position`. Every item's filter text becomes
/// `<prefix>_<filter text>`, commit characters are cleared and the list is
/// marked incomplete.
pub fn rank_by_server(
    response: Option<CompletionResponse>,
    position: Position,
    prefix_of: impl Fn(Range) -> Option<String>,
) -> CompletionList {
    let items = match response {
        None => Vec::new(),
        Some(CompletionResponse::Array(items)) => items,
        Some(CompletionResponse::List(list)) => list.items,
    };
    let items = items
        .into_iter()
        .map(|mut item| {
            let prefix = item_range(&item)
                .and_then(|range| prefix_of(Range::new(range.start, position)))
                .filter(|prefix| !prefix.is_empty());
            if let Some(prefix) = prefix {
                let original = item.filter_text.take().unwrap_or_else(|| item.label.clone());
                item.filter_text = Some(format!("{prefix}_{original}"));
            }
            item.commit_characters = Some(Vec::new());
            let opens_placeholder = snippet_text(&item)
                .is_some_and(|text| PLACEHOLDER_AFTER_BRACKET.is_match(text));
            if item.command.is_none() && opens_placeholder {
                item.command = Some(Command {
                    title: "Signature help".to_string(),
                    command: TRIGGER_PARAMETER_HINTS.to_string(),
                    arguments: None,
                });
            }
            item
        })
        .collect();
    CompletionList {
        is_incomplete: true,
        items,
    }
}

/// Folds container names into symbol names for qualified queries.
pub fn qualify_symbols(
    query: &str,
    response: Option<WorkspaceSymbolResponse>,
) -> Option<WorkspaceSymbolResponse> {
    if !query.contains("::") {
        return response;
    }
    let leading = query.starts_with("::");
    let qualify = |name: &mut String, container: &mut Option<String>| {
        if let Some(container) = container.as_deref().filter(|c| !c.is_empty()) {
            *name = format!("{container}::{name}");
        }
        if leading {
            *name = format!("::{name}");
        }
        *container = Some(String::new());
    };
    Some(match response? {
        WorkspaceSymbolResponse::Flat(mut symbols) => {
            for symbol in &mut symbols {
                qualify(&mut symbol.name, &mut symbol.container_name);
            }
            WorkspaceSymbolResponse::Flat(symbols)
        }
        WorkspaceSymbolResponse::Nested(mut symbols) => {
            for symbol in &mut symbols {
                qualify(&mut symbol.name, &mut symbol.container_name);
            }
            WorkspaceSymbolResponse::Nested(symbols)
        }
    })
}

/// Resolves symlinked file URIs in navigation results.
///
/// Lookups are memoized for the lifetime of one instance, which covers one
/// request.
#[derive(Debug, Default)]
pub struct SymlinkResolver {
    cache: HashMap<Url, Url>,
}

impl SymlinkResolver {
    /// Creates a resolver with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    async fn resolve(&mut self, uri: Url, cancel: &CancellationToken) -> Url {
        if cancel.is_cancelled() || uri.scheme() != "file" {
            return uri;
        }
        if let Some(cached) = self.cache.get(&uri) {
            return cached.clone();
        }
        let resolved = canonicalize_url(&uri).await;
        self.cache.insert(uri, resolved.clone());
        resolved
    }

    /// Canonicalizes every location.
    pub async fn locations(
        &mut self,
        locations: Vec<Location>,
        cancel: &CancellationToken,
    ) -> Vec<Location> {
        let mut out = Vec::with_capacity(locations.len());
        for mut location in locations {
            location.uri = self.resolve(location.uri, cancel).await;
            out.push(location);
        }
        out
    }

    async fn links(&mut self, links: Vec<LocationLink>, cancel: &CancellationToken) -> Vec<LocationLink> {
        let mut out = Vec::with_capacity(links.len());
        for mut link in links {
            link.target_uri = self.resolve(link.target_uri, cancel).await;
            out.push(link);
        }
        out
    }

    /// Canonicalizes a definition-style response.
    pub async fn navigation(
        &mut self,
        response: GotoDefinitionResponse,
        cancel: &CancellationToken,
    ) -> GotoDefinitionResponse {
        match response {
            GotoDefinitionResponse::Scalar(mut location) => {
                location.uri = self.resolve(location.uri, cancel).await;
                GotoDefinitionResponse::Scalar(location)
            }
            GotoDefinitionResponse::Array(locations) => {
                GotoDefinitionResponse::Array(self.locations(locations, cancel).await)
            }
            GotoDefinitionResponse::Link(links) => {
                GotoDefinitionResponse::Link(self.links(links, cancel).await)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsp_types::{SymbolInformation, SymbolKind, TextEdit};

    fn item(label: &str, filter: Option<&str>, start: u32) -> CompletionItem {
        CompletionItem {
            label: label.to_string(),
            filter_text: filter.map(str::to_string),
            commit_characters: Some(vec![".".to_string()]),
            text_edit: Some(CompletionTextEdit::Edit(TextEdit {
                range: Range::new(Position::new(0, start), Position::new(0, 7)),
                new_text: label.to_string(),
            })),
            ..CompletionItem::default()
        }
    }

    #[test]
    fn test_rank_by_server_prefixes_filter_text() {
        let line = "  foo.ba";
        let response = CompletionResponse::List(CompletionList {
            is_incomplete: false,
            items: vec![item("bar", Some("bar"), 6), item("baz", None, 6)],
        });
        let list = rank_by_server(Some(response), Position::new(0, 8), |range| {
            Some(line[range.start.character as usize..range.end.character as usize].to_string())
        });

        assert!(list.is_incomplete);
        assert_eq!(list.items[0].filter_text.as_deref(), Some("ba_bar"));
        assert_eq!(list.items[1].filter_text.as_deref(), Some("ba_baz"));
        assert!(list.items.iter().all(|i| i.commit_characters == Some(Vec::new())));
    }

    #[test]
    fn test_rank_by_server_keeps_filter_without_prefix() {
        let list = rank_by_server(
            Some(CompletionResponse::Array(vec![item("bar", Some("bar"), 8)])),
            Position::new(0, 8),
            |_| Some(String::new()),
        );
        assert_eq!(list.items[0].filter_text.as_deref(), Some("bar"));
        assert!(rank_by_server(None, Position::new(0, 0), |_| None).items.is_empty());
    }

    #[test]
    fn test_signature_help_attached_to_call_snippets() {
        let mut call = item("foo(int x)", None, 0);
        call.insert_text_format = Some(InsertTextFormat::SNIPPET);
        call.text_edit = Some(CompletionTextEdit::Edit(TextEdit {
            range: Range::default(),
            new_text: "foo(${1:int x})".to_string(),
        }));
        let mut plain = call.clone();
        plain.insert_text_format = Some(InsertTextFormat::PLAIN_TEXT);
        let mut no_args = call.clone();
        no_args.text_edit = Some(CompletionTextEdit::Edit(TextEdit {
            range: Range::default(),
            new_text: "foo()".to_string(),
        }));

        let list = rank_by_server(
            Some(CompletionResponse::Array(vec![call, plain, no_args])),
            Position::new(0, 0),
            |_| None,
        );
        let commands: Vec<_> = list
            .items
            .iter()
            .map(|i| i.command.as_ref().map(|c| c.command.as_str()))
            .collect();
        assert_eq!(commands, vec![Some(TRIGGER_PARAMETER_HINTS), None, None]);
    }

    #[allow(deprecated)]
    fn symbol(name: &str, container: Option<&str>) -> SymbolInformation {
        SymbolInformation {
            name: name.to_string(),
            kind: SymbolKind::CLASS,
            tags: None,
            deprecated: None,
            location: Location::new(Url::parse("file:///a.h").unwrap(), Range::default()),
            container_name: container.map(str::to_string),
        }
    }

    fn names(response: Option<WorkspaceSymbolResponse>) -> Vec<(String, Option<String>)> {
        match response {
            Some(WorkspaceSymbolResponse::Flat(symbols)) => symbols
                .into_iter()
                .map(|s| (s.name, s.container_name))
                .collect(),
            _ => Vec::new(),
        }
    }

    #[test]
    fn test_qualify_symbols_only_for_qualified_queries() {
        let response = || {
            Some(WorkspaceSymbolResponse::Flat(vec![
                symbol("vector", Some("std")),
                symbol("Global", None),
            ]))
        };

        let unchanged = names(qualify_symbols("vec", response()));
        assert_eq!(unchanged[0], ("vector".to_string(), Some("std".to_string())));

        let qualified = names(qualify_symbols("std::vec", response()));
        assert_eq!(qualified[0], ("std::vector".to_string(), Some(String::new())));
        assert_eq!(qualified[1], ("Global".to_string(), Some(String::new())));

        let rooted = names(qualify_symbols("::std::vec", response()));
        assert_eq!(rooted[0].0, "::std::vector");
        assert_eq!(rooted[1].0, "::Global");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_resolver_canonicalizes_file_uris() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real.h");
        std::fs::write(&real, "").unwrap();
        let link = dir.path().join("link.h");
        std::os::unix::fs::symlink(&real, &link).unwrap();
        let real = std::fs::canonicalize(&real).unwrap();

        let mut resolver = SymlinkResolver::new();
        let cancel = CancellationToken::new();
        let link_uri = Url::from_file_path(&link).unwrap();
        let remote = Url::parse("untitled:Untitled-1").unwrap();
        let out = resolver
            .locations(
                vec![
                    Location::new(link_uri.clone(), Range::default()),
                    Location::new(remote.clone(), Range::default()),
                ],
                &cancel,
            )
            .await;

        assert_eq!(out[0].uri, Url::from_file_path(&real).unwrap());
        assert_eq!(out[1].uri, remote);

        cancel.cancel();
        let skipped = resolver
            .navigation(
                GotoDefinitionResponse::Scalar(Location::new(link_uri.clone(), Range::default())),
                &cancel,
            )
            .await;
        assert_eq!(
            skipped,
            GotoDefinitionResponse::Scalar(Location::new(link_uri, Range::default()))
        );
    }
}
