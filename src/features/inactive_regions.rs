//! Dims preprocessor-disabled code reported through
//! `textDocument/inactiveRegions`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use lsp_types::{Range, Url};
use parking_lot::Mutex;
use serde_json::json;
use tracing::debug;

use crate::config::InactiveRegionsSettings;
use crate::context::{ClangdContext, ContextId};
use crate::editor::{DecorationStyle, Decorations, EditorEvent, EditorHost};
use crate::lsp::protocol::{InactiveRegionsParams, pushed};
use crate::lsp::state::ConnectionState;
use crate::manager::ContextManager;

use super::{Feature, Hook, has_capability};

/// Theme color of the background highlight.
pub const BACKGROUND_COLOR: &str = "clangd.inactiveRegions.background";

const WATCHED_SETTINGS: &[&str] = &[
    "clangd.inactiveRegions.useBackgroundHighlight",
    "clangd.inactiveRegions.opacity",
    "workbench.colorTheme",
];

/// How inactive code is drawn under `settings`.
pub fn style_of(settings: &InactiveRegionsSettings) -> DecorationStyle {
    if settings.use_background_highlight {
        DecorationStyle::Background {
            theme_color: BACKGROUND_COLOR.to_string(),
        }
    } else {
        DecorationStyle::Opacity(settings.opacity)
    }
}

#[derive(Default)]
struct Regions {
    supported: bool,
    context: Weak<ClangdContext>,
    files: HashMap<Url, Vec<Range>>,
    decorated: HashSet<Url>,
}

/// Per-context inactive region decorations.
pub struct InactiveRegions {
    host: Arc<dyn EditorHost>,
    contexts: Mutex<HashMap<ContextId, Regions>>,
}

impl InactiveRegions {
    /// No regions known.
    pub fn new(host: Arc<dyn EditorHost>) -> Self {
        Self {
            host,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Last reported regions of `uri`.
    pub fn regions(&self, uri: &Url) -> Option<Vec<Range>> {
        self.contexts
            .lock()
            .values()
            .find_map(|regions| regions.files.get(uri).cloned())
    }

    fn update(&self, owner: ContextId, params: InactiveRegionsParams) {
        let uri = params.text_document.uri;
        {
            let mut contexts = self.contexts.lock();
            let Some(regions) = contexts.get_mut(&owner) else {
                return;
            };
            regions.files.insert(uri.clone(), params.regions);
        }
        self.apply(owner, Some(&uri));
    }

    /// Decorates the visible documents of `owner`, or only `only` if given.
    fn apply(&self, owner: ContextId, only: Option<&Url>) {
        let Some(context) = self
            .contexts
            .lock()
            .get(&owner)
            .filter(|r| r.supported)
            .and_then(|r| r.context.upgrade())
        else {
            return;
        };
        let style = style_of(&context.settings().inactive_regions);
        let visible = context.visible_clangd_documents();

        let updates: Vec<(Url, Vec<Range>)> = {
            let mut contexts = self.contexts.lock();
            let Some(regions) = contexts.get_mut(&owner) else {
                return;
            };
            let updates: Vec<_> = visible
                .into_iter()
                .filter(|uri| only.is_none_or(|only| only == uri))
                .filter_map(|uri| {
                    let ranges = regions.files.get(&uri)?.clone();
                    Some((uri, ranges))
                })
                .collect();
            regions.decorated.extend(updates.iter().map(|(uri, _)| uri.clone()));
            updates
        };
        for (uri, ranges) in updates {
            let decorations = Decorations {
                style: style.clone(),
                ranges,
            };
            self.host.set_decorations(&uri, Some(decorations));
        }
    }

    fn clear(&self, owner: ContextId) {
        let decorated = match self.contexts.lock().get_mut(&owner) {
            Some(regions) => {
                regions.files.clear();
                std::mem::take(&mut regions.decorated)
            }
            None => return,
        };
        for uri in decorated {
            self.host.set_decorations(&uri, None);
        }
    }

    /// Drops what is known about `uri` once it is closed.
    fn forget(&self, uri: &Url) {
        let mut decorated = false;
        for regions in self.contexts.lock().values_mut() {
            regions.files.remove(uri);
            decorated |= regions.decorated.remove(uri);
        }
        if decorated {
            self.host.set_decorations(uri, None);
        }
    }

    fn owners(&self) -> Vec<ContextId> {
        self.contexts.lock().keys().copied().collect()
    }
}

impl Feature for InactiveRegions {
    fn name(&self) -> &'static str {
        "inactive-regions"
    }

    fn attach(self: Arc<Self>, context: &Arc<ClangdContext>) {
        let owner = context.id();
        self.contexts.lock().insert(
            owner,
            Regions {
                context: context.downgrade(),
                ..Regions::default()
            },
        );

        let feature = self.clone();
        let hook = Hook::new()
            .on_fill(|caps| {
                caps["textDocument"]["inactiveRegionsCapabilities"] = json!({"inactiveRegions": true});
            })
            .on_initialize(move |caps| {
                if let Some(regions) = feature.contexts.lock().get_mut(&owner) {
                    regions.supported = has_capability(caps, "inactiveRegionsProvider");
                }
            });
        context.connection().register_feature(Arc::new(hook));

        let feature = self.clone();
        context.subscribe_notification(pushed::INACTIVE_REGIONS, move |params| {
            match serde_json::from_value::<InactiveRegionsParams>(params) {
                Ok(params) => feature.update(owner, params),
                Err(e) => debug!(context = %owner, error = %e, "malformed inactive regions"),
            }
        });

        let feature = self;
        let subscription = context.connection().state_machine().on_change(move |change| {
            if change.new == ConnectionState::Stopped {
                feature.clear(owner);
            }
        });
        context.push_subscription(subscription);
    }

    fn detach(&self, context: &ClangdContext) {
        self.clear(context.id());
        self.contexts.lock().remove(&context.id());
    }

    fn on_editor_event(self: Arc<Self>, _manager: &Arc<ContextManager>, event: &EditorEvent) {
        if let EditorEvent::DocumentClosed(document) = event {
            self.forget(&document.uri);
            return;
        }
        let refresh = match event {
            EditorEvent::VisibleEditorsChanged(_) => true,
            EditorEvent::ConfigurationChanged(change) => {
                WATCHED_SETTINGS.iter().any(|key| change.affects(key))
            }
            _ => false,
        };
        if refresh {
            for owner in self.owners() {
                self.apply(owner, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_style_of() {
        let mut settings = InactiveRegionsSettings::default();
        assert_eq!(style_of(&settings), DecorationStyle::Opacity(0.55));

        settings.use_background_highlight = true;
        assert_eq!(
            style_of(&settings),
            DecorationStyle::Background {
                theme_color: BACKGROUND_COLOR.to_string()
            }
        );
    }
}
