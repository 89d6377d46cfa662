//! Deferred display of diagnostics while the user is editing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use lsp_types::{Diagnostic, PublishDiagnosticsParams, Url};
use parking_lot::Mutex;
use tracing::trace;

use crate::debounce::Debouncer;
use crate::editor::EditorHost;

#[derive(Default)]
struct Pending {
    cache: HashMap<Url, Vec<Diagnostic>>,
    shown: HashSet<Url>,
}

/// Withholds non-empty diagnostics until no edit happened for `delay`.
///
/// A clean (empty) push is shown at once and drops every withheld push.
/// Withheld diagnostics are only ever deferred: the flush after the delay
/// shows all of them and empties the cache.
pub struct DelayedDiagnostics {
    host: Arc<dyn EditorHost>,
    delay: Duration,
    pending: Arc<Mutex<Pending>>,
    timer: Debouncer,
}

impl DelayedDiagnostics {
    /// Creates the policy; a zero `delay` shows everything immediately.
    pub fn new(host: Arc<dyn EditorHost>, delay: Duration) -> Self {
        Self {
            host,
            delay,
            pending: Arc::new(Mutex::new(Pending::default())),
            timer: Debouncer::new(),
        }
    }

    /// Configured delay.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Handles a `textDocument/publishDiagnostics` push.
    pub fn push(&self, params: PublishDiagnosticsParams) {
        let PublishDiagnosticsParams { uri, diagnostics, .. } = params;
        if diagnostics.is_empty() {
            {
                let mut pending = self.pending.lock();
                pending.cache.clear();
                pending.shown.remove(&uri);
            }
            self.timer.cancel();
            trace!(uri = %uri, "clean diagnostics shown");
            self.host.publish_diagnostics(&uri, diagnostics);
            return;
        }
        if self.delay.is_zero() {
            self.pending.lock().shown.insert(uri.clone());
            self.host.publish_diagnostics(&uri, diagnostics);
            return;
        }

        trace!(uri = %uri, count = diagnostics.len(), "diagnostics deferred");
        self.pending.lock().cache.insert(uri, diagnostics);
        if !self.timer.is_pending() {
            self.schedule_flush();
        }
    }

    /// Restarts the countdown after an edit.
    pub fn on_edit(&self) {
        if !self.delay.is_zero() {
            self.schedule_flush();
        }
    }

    fn schedule_flush(&self) {
        let host = self.host.clone();
        let pending = self.pending.clone();
        self.timer
            .schedule(self.delay, move || flush(host.as_ref(), &pending));
    }

    /// Shows every withheld push now.
    pub fn flush(&self) {
        self.timer.cancel();
        flush(self.host.as_ref(), &self.pending);
    }

    /// Number of documents whose diagnostics are withheld.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().cache.len()
    }

    /// Cancels the countdown and clears everything this instance showed.
    pub fn dispose(&self) {
        self.timer.cancel();
        let shown = {
            let mut pending = self.pending.lock();
            pending.cache.clear();
            std::mem::take(&mut pending.shown)
        };
        for uri in shown {
            self.host.publish_diagnostics(&uri, Vec::new());
        }
    }
}

fn flush(host: &dyn EditorHost, pending: &Mutex<Pending>) {
    let drained: Vec<(Url, Vec<Diagnostic>)> = {
        let mut pending = pending.lock();
        let drained: Vec<_> = pending.cache.drain().collect();
        pending.shown.extend(drained.iter().map(|(uri, _)| uri.clone()));
        drained
    };
    trace!(count = drained.len(), "flushing deferred diagnostics");
    for (uri, diagnostics) in drained {
        host.publish_diagnostics(&uri, diagnostics);
    }
}
