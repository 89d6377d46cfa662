//! async-lsp backed [`Connection`] to a clangd process.
//!
//! The process is spawned on [`Connection::start`], wired to an async-lsp
//! client main loop, and initialized with the registered features' client
//! capabilities. When the main loop ends (process exit, broken pipe) the
//! connection moves to Stopped.
//!
//! # Example
//!
//! ```ignore
//! use clangd_bridge::lsp::{ClientOptions, Connection, Launcher, ServerSpec};
//! use clangd_bridge::lsp::client::LspLauncher;
//!
//! let connection = LspLauncher.launch(spec, ClientOptions::default())?;
//! connection.start().await?;
//! connection.stop().await?;
//! ```

use std::ops::ControlFlow;
use std::process::Stdio;
use std::sync::Arc;

use async_lsp::concurrency::ConcurrencyLayer;
use async_lsp::panic::CatchUnwindLayer;
use async_lsp::router::Router;
use async_lsp::tracing::TracingLayer;
use async_lsp::{AnyNotification, AnyRequest, ResponseError, ServerSocket};
use async_trait::async_trait;
use futures::FutureExt;
use lsp_types::{
    ClientCapabilities, ClientInfo, CompletionClientCapabilities, CompletionItemCapability,
    DynamicRegistrationClientCapabilities, GotoCapability, HoverClientCapabilities,
    InitializeParams, MarkupKind, PublishDiagnosticsClientCapabilities,
    SignatureHelpClientCapabilities, TextDocumentClientCapabilities,
    TextDocumentSyncClientCapabilities, TraceValue, WindowClientCapabilities,
    WorkspaceClientCapabilities, WorkspaceSymbolClientCapabilities,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tracing::{debug, info, warn};

use crate::error::ConnectionError;

use super::protocol::{dispatch_notification, dispatch_request};
use super::state::ConnectionState;
use super::{ClientOptions, Connection, ConnectionCore, Launcher, LspResult, ServerSpec};

/// Creates [`LspConnection`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct LspLauncher;

impl Launcher for LspLauncher {
    fn launch(&self, spec: ServerSpec, options: ClientOptions) -> LspResult<Arc<dyn Connection>> {
        Ok(Arc::new(LspConnection::new(spec, options)))
    }
}

/// A connection to one language server process.
pub struct LspConnection {
    spec: ServerSpec,
    options: ClientOptions,
    core: Arc<ConnectionCore>,
    socket: Mutex<Option<ServerSocket>>,
    child: Mutex<Option<async_process::Child>>,
    mainloop: Mutex<Option<JoinHandle<()>>>,
}

impl LspConnection {
    /// Creates an unstarted connection.
    pub fn new(spec: ServerSpec, options: ClientOptions) -> Self {
        Self {
            spec,
            options,
            core: Arc::new(ConnectionCore::new()),
            socket: Mutex::new(None),
            child: Mutex::new(None),
            mainloop: Mutex::new(None),
        }
    }

    fn command(&self) -> async_process::Command {
        let mut cmd = if self.spec.shell {
            let line = std::iter::once(self.spec.command.as_str())
                .chain(self.spec.args.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" ");
            let (shell, flag) = if cfg!(windows) { ("cmd", "/C") } else { ("sh", "-c") };
            let mut cmd = async_process::Command::new(shell);
            cmd.arg(flag).arg(line);
            cmd
        } else {
            let mut cmd = async_process::Command::new(&self.spec.command);
            cmd.args(&self.spec.args);
            cmd
        };
        cmd.current_dir(&self.spec.cwd)
            .envs(self.spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }

    fn spawn(&self) -> LspResult<ServerSocket> {
        let mut child = self.command().spawn().map_err(|e| {
            ConnectionError::ServerStartFailed(format!("failed to spawn '{}': {e}", self.spec.command))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConnectionError::ServerStartFailed("failed to capture stdout".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConnectionError::ServerStartFailed("failed to capture stdin".to_string()))?;

        let notifications = self.core.notifications().clone();
        let (mainloop, socket) = async_lsp::MainLoop::new_client(|_server| {
            let mut router = Router::new(notifications);
            router.unhandled_notification(|table, AnyNotification { method, params, .. }| {
                table.dispatch(&method, params);
                ControlFlow::Continue(())
            });
            // Server-to-client requests (progress tokens, configuration) get
            // an empty success so the server never blocks on us.
            router.unhandled_request(|_table, AnyRequest { method, .. }| {
                debug!(method = %method, "answering server request with null");
                async { Ok::<_, ResponseError>(Value::Null) }.boxed()
            });

            ServiceBuilder::new()
                .layer(TracingLayer::default())
                .layer(CatchUnwindLayer::default())
                .layer(ConcurrencyLayer::default())
                .service(router)
        });

        let core = self.core.clone();
        let command = self.spec.command.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = mainloop.run_buffered(stdout, stdin).await {
                debug!(command = %command, error = ?e, "main loop ended with error");
            }
            if core.state().stop() {
                info!(command = %command, "language server exited");
            }
        });

        *self.child.lock() = Some(child);
        *self.mainloop.lock() = Some(handle);
        *self.socket.lock() = Some(socket.clone());
        Ok(socket)
    }

    fn initialize_params(&self) -> LspResult<Value> {
        #[allow(deprecated)]
        let params = InitializeParams {
            process_id: Some(std::process::id()),
            root_uri: self.options.workspace_folders.first().map(|f| f.uri.clone()),
            workspace_folders: (!self.options.workspace_folders.is_empty())
                .then(|| self.options.workspace_folders.clone()),
            capabilities: client_capabilities(),
            trace: Some(TraceValue::Off),
            client_info: Some(ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            ..Default::default()
        };

        let mut value = serde_json::to_value(params)
            .map_err(|e| ConnectionError::InitializationFailed(format!("initialize params: {e}")))?;
        self.core.fill_client_capabilities(&mut value["capabilities"]);
        if !self.options.initialization_options.is_null() {
            value["initializationOptions"] = self.options.initialization_options.clone();
        }
        Ok(value)
    }

    async fn handshake(&self, socket: &ServerSocket) -> LspResult<()> {
        let params = self.initialize_params()?;
        let pending = dispatch_request(socket, "initialize", params)
            .ok_or_else(|| ConnectionError::UnsupportedMethod("initialize".to_string()))?;

        let result = tokio::time::timeout(self.options.init_timeout, pending)
            .await
            .map_err(|_| ConnectionError::Timeout(self.options.init_timeout))?
            .map_err(|e| ConnectionError::InitializationFailed(format!("initialize request failed: {e:?}")))?;

        let capabilities = result.get("capabilities").cloned().unwrap_or(Value::Null);
        self.core.initialize_features(capabilities);

        dispatch_notification(socket, "initialized", json!({}))
            .unwrap_or(Ok(()))
            .map_err(|e| {
                ConnectionError::InitializationFailed(format!("initialized notification failed: {e:?}"))
            })
    }

    fn running_socket(&self) -> LspResult<ServerSocket> {
        if self.core.state().get() != ConnectionState::Running {
            return Err(ConnectionError::NotRunning);
        }
        self.socket.lock().clone().ok_or(ConnectionError::NotRunning)
    }

    fn teardown(&self) {
        self.socket.lock().take();
        if let Some(mut child) = self.child.lock().take() {
            if let Err(e) = child.kill() {
                debug!(error = %e, "failed to kill language server");
            }
        }
        if let Some(handle) = self.mainloop.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Connection for LspConnection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    async fn start(&self) -> LspResult<()> {
        if self.core.state().get() != ConnectionState::Starting || self.socket.lock().is_some() {
            return Err(ConnectionError::InitializationFailed(
                "connection was already started".to_string(),
            ));
        }
        info!(command = %self.spec.command, cwd = %self.spec.cwd.display(), "starting language server");

        let result = match self.spawn() {
            Ok(socket) => self.handshake(&socket).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(error = %e, "language server failed to start");
            self.core.state().stop();
            self.teardown();
            return Err(e);
        }
        self.core.state().transition(ConnectionState::Running)
    }

    async fn stop(&self) -> LspResult<()> {
        let was = self.core.state().get();
        if was == ConnectionState::Running {
            let socket = self.socket.lock().clone();
            if let Some(socket) = socket {
                if let Some(pending) = dispatch_request(&socket, "shutdown", Value::Null) {
                    match tokio::time::timeout(self.options.request_timeout, pending).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => debug!(error = ?e, "shutdown request failed"),
                        Err(_) => debug!("shutdown request timed out"),
                    }
                }
                if let Some(Err(e)) = dispatch_notification(&socket, "exit", Value::Null) {
                    debug!(error = ?e, "exit notification failed");
                }
            }
        }
        if self.core.state().stop() {
            info!(command = %self.spec.command, "language server stopped");
        }
        self.teardown();
        Ok(())
    }

    async fn send_request(
        &self,
        method: &str,
        params: Value,
        cancel: CancellationToken,
    ) -> LspResult<Value> {
        let socket = self.running_socket()?;
        let pending = dispatch_request(&socket, method, params)
            .ok_or_else(|| ConnectionError::UnsupportedMethod(method.to_string()))?;
        let timeout = self.options.request_timeout;

        tokio::select! {
            () = cancel.cancelled() => Err(ConnectionError::Cancelled),
            result = tokio::time::timeout(timeout, pending) => match result {
                Err(_) => Err(ConnectionError::Timeout(timeout)),
                Ok(Err(e)) => Err(ConnectionError::RequestFailed(format!("{method} failed: {e:?}"))),
                Ok(Ok(value)) => Ok(value),
            },
        }
    }

    fn send_notification(&self, method: &str, params: Value) -> LspResult<()> {
        let socket = self.running_socket()?;
        dispatch_notification(&socket, method, params)
            .ok_or_else(|| ConnectionError::UnsupportedMethod(method.to_string()))?
            .map_err(|e| ConnectionError::RequestFailed(format!("{method} notification failed: {e:?}")))
    }
}

impl Drop for LspConnection {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for LspConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LspConnection")
            .field("spec", &self.spec)
            .field("state", &self.core.state().get())
            .finish_non_exhaustive()
    }
}

/// Baseline client capabilities; features add their own on top.
fn client_capabilities() -> ClientCapabilities {
    ClientCapabilities {
        workspace: Some(WorkspaceClientCapabilities {
            did_change_configuration: Some(DynamicRegistrationClientCapabilities {
                dynamic_registration: Some(false),
            }),
            symbol: Some(WorkspaceSymbolClientCapabilities {
                dynamic_registration: Some(false),
                ..Default::default()
            }),
            execute_command: Some(DynamicRegistrationClientCapabilities {
                dynamic_registration: Some(false),
            }),
            workspace_folders: Some(true),
            ..Default::default()
        }),
        text_document: Some(TextDocumentClientCapabilities {
            synchronization: Some(TextDocumentSyncClientCapabilities {
                dynamic_registration: Some(false),
                will_save: Some(false),
                will_save_wait_until: Some(false),
                did_save: Some(false),
            }),
            completion: Some(CompletionClientCapabilities {
                dynamic_registration: Some(false),
                completion_item: Some(CompletionItemCapability {
                    snippet_support: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            hover: Some(HoverClientCapabilities {
                dynamic_registration: Some(false),
                content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
            }),
            signature_help: Some(SignatureHelpClientCapabilities {
                dynamic_registration: Some(false),
                ..Default::default()
            }),
            definition: Some(GotoCapability {
                dynamic_registration: Some(false),
                link_support: Some(false),
            }),
            declaration: Some(GotoCapability {
                dynamic_registration: Some(false),
                link_support: Some(false),
            }),
            type_definition: Some(GotoCapability {
                dynamic_registration: Some(false),
                link_support: Some(false),
            }),
            implementation: Some(GotoCapability {
                dynamic_registration: Some(false),
                link_support: Some(false),
            }),
            references: Some(DynamicRegistrationClientCapabilities {
                dynamic_registration: Some(false),
            }),
            publish_diagnostics: Some(PublishDiagnosticsClientCapabilities {
                related_information: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }),
        window: Some(WindowClientCapabilities {
            work_done_progress: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsp_types::{Url, WorkspaceFolder};
    use std::path::PathBuf;

    fn spec(shell: bool) -> ServerSpec {
        ServerSpec {
            command: "clangd".to_string(),
            args: vec!["--log=verbose".to_string()],
            cwd: PathBuf::from("/tmp"),
            env: vec![("CLANGD_TRACE".to_string(), "/tmp/trace.json".to_string())],
            shell,
        }
    }

    #[test]
    fn test_initialize_params_carry_options_and_folders() {
        let options = ClientOptions {
            initialization_options: json!({"clangdFileStatus": true, "fallbackFlags": []}),
            workspace_folders: vec![WorkspaceFolder {
                uri: Url::parse("file:///work/a").unwrap(),
                name: "a".to_string(),
            }],
            ..ClientOptions::default()
        };
        let connection = LspConnection::new(spec(false), options);
        let params = connection.initialize_params().unwrap();

        assert_eq!(params["initializationOptions"]["clangdFileStatus"], json!(true));
        assert_eq!(params["workspaceFolders"][0]["name"], json!("a"));
        assert_eq!(params["rootUri"], json!("file:///work/a"));
        assert_eq!(
            params["capabilities"]["textDocument"]["completion"]["completionItem"]["snippetSupport"],
            json!(true)
        );
    }

    #[tokio::test]
    async fn test_requests_fail_before_start() {
        let connection = LspConnection::new(spec(false), ClientOptions::default());
        let err = connection
            .send_request("textDocument/hover", json!({}), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::NotRunning));
        assert!(matches!(
            connection.send_notification("textDocument/didClose", json!({})),
            Err(ConnectionError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure_stops_connection() {
        let mut missing = spec(false);
        missing.command = "/nonexistent/clangd-bridge-test-binary".to_string();
        let connection = LspConnection::new(missing, ClientOptions::default());

        let err = connection.start().await.unwrap_err();
        assert!(matches!(err, ConnectionError::ServerStartFailed(_)));
        assert_eq!(connection.state(), ConnectionState::Stopped);

        // Stopping an already stopped connection is fine.
        connection.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_runs_on_another_task() {
        let connection = Arc::new(LspConnection::new(spec(false), ClientOptions::default()));
        let stopping = connection.clone();
        tokio::spawn(async move { stopping.stop().await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::Stopped);
    }
}
