//! clangd-bridge
//!
//! An editor integration layer that runs one clangd language server for the
//! whole workspace, or one per workspace folder, and keeps every server in
//! step with the editor.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  EditorEvent   ┌──────────────────┐
//! │     Editor      │───────────────►│  ContextManager  │
//! │  (EditorHost)   │◄───────────────│ routing, sweeps  │
//! └─────────────────┘   UI sinks     └────────┬─────────┘
//!                                             │ one per routing key
//!                                      ┌──────▼───────┐
//!                                      │ ClangdContext│◄── Features
//!                                      └──────┬───────┘
//!                                             │ JSON-RPC
//!                                      ┌──────▼───────┐
//!                                      │    clangd    │
//!                                      └──────────────┘
//! ```
//!
//! # Modules
//!
//! - [`manager`] - registry of contexts and the lifecycle policy
//! - [`context`] - one clangd session and its middleware
//! - [`features`] - built-in protocol extensions
//! - [`lsp`] - connection abstraction and the async-lsp client
//! - [`editor`] - the editor boundary
//! - [`config`] - settings access
//! - [`error`] - error types
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use clangd_bridge::{Builtin, ContextManager, Services};
//!
//! let builtin = Builtin::new(host.clone());
//! let manager = ContextManager::new(services, builtin.all());
//! manager.activate().await?;
//! manager.send_event(EditorEvent::DocumentOpened(document));
//! ```

pub mod api;
pub mod commands;
pub mod config;
pub mod context;
pub mod debounce;
pub mod editor;
pub mod error;
pub mod event;
pub mod features;
pub mod headless;
pub mod install;
pub mod lsp;
pub mod manager;

pub use api::ClientApi;
pub use context::{ClangdContext, ContextId, RoutingKey, Services};
pub use editor::{EditorEvent, EditorHost, TextDocument};
pub use error::{Error, Result};
pub use features::{Builtin, Feature};
pub use manager::ContextManager;
