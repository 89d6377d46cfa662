//! `clangd.switchheadersource`: jump between a source file and its header.

use std::sync::Arc;

use lsp_types::{TextDocumentIdentifier, Url};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::commands::{CommandHandler, handler};
use crate::context::ClangdContext;
use crate::editor::{MessageLevel, OpenOptions};
use crate::error::CommandResult;
use crate::lsp::ConnectionExt;
use crate::manager::ContextManager;

use super::{Feature, command_target};

/// Registers the source/header switch command.
pub struct SwitchSourceHeader;

impl SwitchSourceHeader {
    async fn switch(manager: Arc<ContextManager>, args: Value) -> CommandResult<()> {
        let host = manager.services().host.clone();
        let Some((uri, _)) = command_target(host.as_ref(), args)? else {
            return Ok(());
        };
        let Some(context) = manager.get_context_for_uri(&uri) else {
            host.show_message(
                MessageLevel::Info,
                "No clangd instance available for this document",
            );
            return Ok(());
        };
        let companion: Option<Url> = context
            .connection()
            .request(
                "textDocument/switchSourceHeader",
                &TextDocumentIdentifier { uri: uri.clone() },
                CancellationToken::new(),
            )
            .await?;
        let Some(companion) = companion else {
            debug!(uri = %uri, "no companion file");
            return Ok(());
        };
        if !host.open_document(&companion, OpenOptions::default()).await {
            debug!(uri = %companion, "could not open companion file");
        }
        Ok(())
    }
}

impl Feature for SwitchSourceHeader {
    fn name(&self) -> &'static str {
        "switch-source-header"
    }

    fn attach(self: Arc<Self>, _context: &Arc<ClangdContext>) {}

    fn detach(&self, _context: &ClangdContext) {}

    fn commands(self: Arc<Self>) -> Vec<(&'static str, CommandHandler)> {
        vec![("clangd.switchheadersource", handler(Self::switch))]
    }
}
