//! Error types for clangd-bridge.
//!
//! Errors are organized by subsystem: connections to the language server,
//! context lifecycle, editor commands and configuration.

use std::time::Duration;

use thiserror::Error;

use crate::lsp::state::ConnectionState;

/// Errors related to a single language server connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The language server process failed to start.
    #[error("failed to start language server: {0}")]
    ServerStartFailed(String),

    /// The language server process exited unexpectedly.
    #[error("language server exited unexpectedly: {0}")]
    ServerExited(String),

    /// Failed to initialize the language server.
    #[error("language server initialization failed: {0}")]
    InitializationFailed(String),

    /// A request to the language server timed out.
    #[error("language server request timed out after {0:?}")]
    Timeout(Duration),

    /// The connection is not in the running state.
    #[error("language server is not running")]
    NotRunning,

    /// Failed to send a request to the language server.
    #[error("failed to send request to language server: {0}")]
    RequestFailed(String),

    /// The request was cancelled before a response arrived.
    #[error("request cancelled")]
    Cancelled,

    /// Failed to parse the response from the language server.
    #[error("failed to parse language server response: {0}")]
    ParseError(String),

    /// The method has no wire binding on this connection.
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    /// A state transition that the connection state machine forbids.
    #[error("invalid connection state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// State the connection was in.
        from: ConnectionState,
        /// State that was requested.
        to: ConnectionState,
    },
}

/// Errors related to context lifecycle.
#[derive(Debug, Error)]
pub enum ContextError {
    /// A context already serves this routing key.
    #[error("a context already exists for {0}")]
    DuplicateContext(String),

    /// The context was disposed before.
    #[error("context {0} is already disposed")]
    AlreadyDisposed(u64),

    /// The manager was disposed before.
    #[error("context manager is already disposed")]
    ManagerDisposed,

    /// Connection failure while bringing a context up or down.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
}

/// Errors related to editor command execution.
#[derive(Debug, Error)]
pub enum CommandError {
    /// No handler is registered for the command.
    #[error("command not found: {0}")]
    NotFound(String),

    /// A handler is already registered for the command.
    #[error("command already registered: {0}")]
    AlreadyRegistered(String),

    /// The arguments passed to the command could not be decoded.
    #[error("invalid command arguments: {0}")]
    InvalidArguments(String),

    /// No context serves the document the command targets.
    #[error("no clangd context available")]
    NoContext,

    /// The request behind the command failed.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Writing a setting failed.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A lifecycle operation triggered by the command failed.
    #[error("context error: {0}")]
    Context(#[from] ContextError),
}

/// Errors related to reading and writing settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The settings source could not be read.
    #[error("failed to read settings: {0}")]
    Read(String),

    /// The settings source is not valid JSON.
    #[error("failed to parse settings: {0}")]
    Parse(String),

    /// The settings could not be written back.
    #[error("failed to write settings: {0}")]
    Write(String),

    /// Generic IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A unified error type for the entire crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection-related error.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Context lifecycle error.
    #[error("context error: {0}")]
    Context(#[from] ContextError),

    /// Command error.
    #[error("command error: {0}")]
    Command(#[from] CommandError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Generic IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized Result type for clangd-bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Result of connection operations.
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

/// Result of context and manager lifecycle operations.
pub type ContextResult<T> = std::result::Result<T, ContextError>;

/// Result of editor command handlers.
pub type CommandResult<T> = std::result::Result<T, CommandError>;

/// Result of settings access.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::ServerStartFailed("connection refused".to_string());
        assert_eq!(
            err.to_string(),
            "failed to start language server: connection refused"
        );
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = ConnectionError::InvalidTransition {
            from: ConnectionState::Stopped,
            to: ConnectionState::Running,
        };
        assert_eq!(
            err.to_string(),
            "invalid connection state transition: Stopped -> Running"
        );
    }

    #[test]
    fn test_error_conversion() {
        let err: Error = ContextError::ManagerDisposed.into();
        assert!(matches!(err, Error::Context(ContextError::ManagerDisposed)));
    }

    #[test]
    fn test_command_error_from_connection_error() {
        let cmd_err: CommandError = ConnectionError::NotRunning.into();
        assert!(matches!(cmd_err, CommandError::Connection(_)));
    }
}
