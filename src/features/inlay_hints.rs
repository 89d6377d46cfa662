//! `clangd/inlayHints`: parameter names and deduced types shown inline.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use lsp_types::{TextDocumentIdentifier, Url};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::commands::{CommandHandler, handler};
use crate::config::{ConfigTarget, ConfigurationExt};
use crate::context::{ClangdContext, ContextId, is_clangd_document};
use crate::editor::{EditorEvent, EditorHost, InlayHint, InlayHintKind};
use crate::lsp::ConnectionExt;
use crate::lsp::protocol::{ClangdInlayHint, InlayHintsParams};
use crate::lsp::state::ConnectionState;
use crate::manager::ContextManager;

use super::{Feature, Hook, LatestRequests, has_capability};

/// Editor setting flipped by `clangd.inlayHints.toggle`.
pub const ENABLED_SETTING: &str = "editor.inlayHints.enabled";

/// Converts a server hint into the editor's form.
pub fn decode(hint: ClangdInlayHint) -> InlayHint {
    let kind = match hint.kind.as_str() {
        "type" => Some(InlayHintKind::Type),
        "parameter" => Some(InlayHintKind::Parameter),
        _ => None,
    };
    InlayHint {
        position: hint.position.unwrap_or(hint.range.start),
        padding_left: hint.label.starts_with(' '),
        padding_right: hint.label.ends_with(' '),
        label: hint.label.trim().to_string(),
        kind,
    }
}

/// Fetches hints for visible documents of contexts that provide them.
pub struct InlayHints {
    host: Arc<dyn EditorHost>,
    enabled: Mutex<HashMap<ContextId, bool>>,
    requests: LatestRequests<Url>,
    shown: Mutex<HashMap<ContextId, HashSet<Url>>>,
}

impl InlayHints {
    /// Nothing fetched yet.
    pub fn new(host: Arc<dyn EditorHost>) -> Self {
        Self {
            host,
            enabled: Mutex::new(HashMap::new()),
            requests: LatestRequests::new(),
            shown: Mutex::new(HashMap::new()),
        }
    }

    fn is_enabled(&self, context: ContextId) -> bool {
        self.enabled.lock().get(&context).copied().unwrap_or(false)
    }

    /// Whether a request for `uri` is in flight.
    pub fn is_pending(&self, uri: &Url) -> bool {
        self.requests.is_pending(uri)
    }

    /// Requests hints for `uri` from `context`, superseding any request
    /// still in flight for the document.
    pub fn refresh(self: &Arc<Self>, context: &Arc<ClangdContext>, uri: Url) {
        if !self.is_enabled(context.id()) || !context.client_is_running() {
            return;
        }
        let ticket = self.requests.begin(uri.clone(), context.id());
        let feature = self.clone();
        let context = context.clone();
        tokio::spawn(async move {
            let params = InlayHintsParams {
                text_document: TextDocumentIdentifier { uri: uri.clone() },
                range: None,
            };
            let result: crate::lsp::LspResult<Option<Vec<ClangdInlayHint>>> = context
                .connection()
                .request("clangd/inlayHints", &params, ticket.token())
                .await;
            let current = feature.requests.finish(&ticket) && !context.is_disposed();
            match result {
                Ok(hints) if current => {
                    let hints = hints.unwrap_or_default().into_iter().map(decode).collect();
                    feature
                        .shown
                        .lock()
                        .entry(ticket.owner())
                        .or_default()
                        .insert(uri.clone());
                    feature.host.set_inlay_hints(&uri, hints);
                }
                Ok(_) => debug!(uri = %uri, "dropping superseded inlay hints"),
                Err(e) => debug!(context = %ticket.owner(), uri = %uri, error = %e, "inlay hints failed"),
            }
        });
    }

    /// Removes every hint `owner` put up.
    fn clear(&self, owner: ContextId) {
        let shown = self.shown.lock().remove(&owner).unwrap_or_default();
        for uri in shown {
            self.host.set_inlay_hints(&uri, Vec::new());
        }
    }

    fn refresh_all(self: &Arc<Self>, context: &Arc<ClangdContext>) {
        for uri in context.visible_clangd_documents() {
            self.refresh(context, uri);
        }
    }

    fn refresh_uri(self: &Arc<Self>, manager: &ContextManager, uri: &Url) {
        if let Some(context) = manager.get_context_for_uri(uri) {
            self.refresh(&context, uri.clone());
        }
    }
}

impl Feature for InlayHints {
    fn name(&self) -> &'static str {
        "inlay-hints"
    }

    fn attach(self: Arc<Self>, context: &Arc<ClangdContext>) {
        let owner = context.id();
        let feature = self.clone();
        context
            .connection()
            .register_feature(Arc::new(Hook::new().on_initialize(move |caps| {
                feature
                    .enabled
                    .lock()
                    .insert(owner, has_capability(caps, "clangdInlayHintsProvider"));
            })));
        let feature = self;
        let weak: Weak<ClangdContext> = context.downgrade();
        let subscription = context
            .connection()
            .state_machine()
            .on_change(move |change| match change.new {
                ConnectionState::Running => {
                    if let Some(context) = weak.upgrade() {
                        feature.refresh_all(&context);
                    }
                }
                ConnectionState::Stopped => {
                    feature.requests.cancel_owner(owner);
                    feature.clear(owner);
                }
                ConnectionState::Starting => {}
            });
        context.push_subscription(subscription);
    }

    fn detach(&self, context: &ClangdContext) {
        self.requests.cancel_owner(context.id());
        self.enabled.lock().remove(&context.id());
        self.clear(context.id());
    }

    fn on_editor_event(self: Arc<Self>, manager: &Arc<ContextManager>, event: &EditorEvent) {
        match event {
            EditorEvent::ActiveEditorChanged(Some(document))
            | EditorEvent::DocumentChanged { document, .. }
                if is_clangd_document(document) =>
            {
                self.refresh_uri(manager, &document.uri);
            }
            EditorEvent::DocumentClosed(document) => {
                self.requests.cancel(&document.uri);
                for shown in self.shown.lock().values_mut() {
                    shown.remove(&document.uri);
                }
            }
            EditorEvent::VisibleEditorsChanged(uris) => {
                let qualifying: Vec<Url> = manager
                    .services()
                    .host
                    .open_documents()
                    .into_iter()
                    .filter(|d| is_clangd_document(d) && uris.contains(&d.uri))
                    .map(|d| d.uri)
                    .collect();
                for uri in qualifying {
                    self.refresh_uri(manager, &uri);
                }
            }
            _ => {}
        }
    }

    fn commands(self: Arc<Self>) -> Vec<(&'static str, CommandHandler)> {
        vec![(
            "clangd.inlayHints.toggle",
            handler(|manager, _| async move {
                let config = manager.services().config.clone();
                let current: bool = config.get_or(ENABLED_SETTING, None, false);
                config.update(ENABLED_SETTING, Value::Bool(!current), ConfigTarget::User)?;
                Ok(())
            }),
        )]
    }
}
