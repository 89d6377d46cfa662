//! clangd-bridge - Entry Point
//!
//! Drives the context manager from a headless editor: opens the given
//! files, optionally runs one command, prints what the editor would show
//! and shuts everything down again.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use lsp_types::Range;
use serde_json::Value;
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use clangd_bridge::config::{JsonSettings, Settings};
use clangd_bridge::editor::{EditorEvent, ViewId};
use clangd_bridge::headless::{HeadlessHost, render_tree};
use clangd_bridge::install::PathInstaller;
use clangd_bridge::lsp::client::LspLauncher;
use clangd_bridge::lsp::types::{from_lsp_position, to_lsp_position};
use clangd_bridge::{Builtin, ContextManager, Services};

/// Runs clangd for a workspace without an editor.
#[derive(Parser, Debug)]
#[command(name = "clangd-bridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level: trace, debug, info, warn, error.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open files in a workspace and report what clangd says about them.
    Run(RunArgs),
    /// Print the JSON schema of the `clangd.*` settings.
    Schema,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Workspace folder; repeat for a multi-root workspace.
    #[arg(short, long = "folder")]
    folders: Vec<PathBuf>,

    /// User settings file (JSON object of dotted keys).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Workspace settings file, overriding the user settings.
    #[arg(long)]
    workspace_settings: Option<PathBuf>,

    /// Directory for downloaded servers and other state.
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Command to execute once the files are open, e.g. `clangd.ast`.
    #[arg(long)]
    command: Option<String>,

    /// Target of the command as `file:line:column` (1-indexed).
    #[arg(long)]
    position: Option<String>,

    /// Answer given to every prompt.
    #[arg(long)]
    answer: Option<String>,

    /// How long to let clangd work before reporting, in milliseconds.
    #[arg(long, default_value_t = 3000)]
    wait_ms: u64,

    /// Files to open.
    files: Vec<PathBuf>,
}

impl Cli {
    /// Parses the log level string into a tracing Level.
    fn parse_log_level(&self) -> Result<Level> {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Ok(Level::TRACE),
            "debug" => Ok(Level::DEBUG),
            "info" => Ok(Level::INFO),
            "warn" => Ok(Level::WARN),
            "error" => Ok(Level::ERROR),
            other => anyhow::bail!("invalid log level: {}", other),
        }
    }
}

/// Initializes the tracing subscriber for logging.
fn init_tracing(level: Level) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "clangd_bridge={},tower={},async_lsp={}",
            level, level, level
        ))
    });

    // stdout carries the report
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .context("failed to initialize tracing subscriber")?;

    Ok(())
}

/// Splits `file:line:column`, tolerating colons in the file part.
fn parse_position(spec: &str) -> Result<(PathBuf, u32, u32)> {
    let mut parts = spec.rsplitn(3, ':');
    let (Some(column), Some(line), Some(file)) = (parts.next(), parts.next(), parts.next()) else {
        anyhow::bail!("expected file:line:column, got {spec}");
    };
    let line = line.parse().with_context(|| format!("invalid line in {spec}"))?;
    let column = column.parse().with_context(|| format!("invalid column in {spec}"))?;
    Ok((PathBuf::from(file), line, column))
}

fn view_of(command: &str) -> Option<ViewId> {
    match command {
        "clangd.ast" => Some(ViewId::Ast),
        "clangd.typeHierarchy" => Some(ViewId::TypeHierarchy),
        "clangd.memoryUsage" => Some(ViewId::MemoryUsage),
        _ => None,
    }
}

fn canonical(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .with_context(|| format!("failed to canonicalize path: {}", path.display()))
}

async fn run(args: RunArgs) -> Result<()> {
    let folders = if args.folders.is_empty() {
        vec![canonical(Path::new("."))?]
    } else {
        args.folders.iter().map(|f| canonical(f)).collect::<Result<_>>()?
    };
    let settings_path = match args.settings {
        Some(path) => path,
        None => dirs::config_dir()
            .context("no user configuration directory")?
            .join("clangd-bridge")
            .join("settings.json"),
    };
    let mut config = JsonSettings::new(settings_path);
    if let Some(path) = args.workspace_settings {
        config = config.with_workspace(path);
    }
    let storage_root = match args.storage {
        Some(path) => path,
        None => dirs::data_local_dir()
            .context("no local data directory")?
            .join("clangd-bridge"),
    };

    let host = Arc::new(HeadlessHost::new(&folders)?.with_prompt_answer(args.answer));
    let services = Services {
        host: host.clone(),
        config: Arc::new(config),
        installer: Arc::new(PathInstaller::new(host.clone())),
        launcher: Arc::new(LspLauncher),
        storage_root,
    };
    let builtin = Builtin::new(host.clone());
    let manager = ContextManager::new(services, builtin.all());
    manager.activate().await.context("failed to activate")?;
    info!(folders = folders.len(), files = args.files.len(), "workspace ready");

    let target = args.position.as_deref().map(parse_position).transpose()?;
    let mut files = args.files;
    if let Some((file, _, _)) = &target {
        files.push(file.clone());
    }
    for file in &files {
        let document = host
            .open(&canonical(file)?)
            .with_context(|| format!("failed to open {}", file.display()))?;
        manager.send_event(EditorEvent::DocumentOpened(document.clone()));
        manager.send_event(EditorEvent::VisibleEditorsChanged(vec![document.uri.clone()]));
        manager.send_event(EditorEvent::ActiveEditorChanged(Some(document)));
    }
    if let Some((_, line, column)) = target {
        let position = to_lsp_position(line, column)?;
        host.select(Range::new(position, position));
    }

    tokio::time::sleep(Duration::from_millis(args.wait_ms)).await;

    if let Some(command) = &args.command {
        match manager.execute_command(command, Value::Null).await {
            Ok(()) => info!(command, "command finished"),
            Err(e) => warn!(command, error = %e, "command failed"),
        }
        if let Some(view) = view_of(command) {
            println!("{}:", view.as_str());
            for line in render_tree(builtin.tree(view).as_ref(), 8).await {
                println!("  {line}");
            }
        }
    }

    if let Some(status) = host.status() {
        println!("{status}");
    }
    for uri in host.diagnosed_documents() {
        for diagnostic in host.diagnostics(&uri) {
            let (line, column) = from_lsp_position(diagnostic.range.start);
            println!("{}:{line}:{column}: {}", uri.path(), diagnostic.message);
        }
    }

    manager.dispose().await?;
    info!("clangd-bridge shut down");
    Ok(())
}

/// Main entry point.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = cli.parse_log_level()?;
    init_tracing(log_level)?;

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Schema => {
            println!("{}", serde_json::to_string_pretty(&Settings::schema())?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_log_level() {
        let cli = Cli::parse_from(["clangd-bridge", "--log-level", "debug", "schema"]);
        assert_eq!(cli.parse_log_level().unwrap(), Level::DEBUG);
    }

    #[test]
    fn test_parse_position() {
        let (file, line, column) = parse_position("src/main.cpp:12:5").unwrap();
        assert_eq!(file, PathBuf::from("src/main.cpp"));
        assert_eq!((line, column), (12, 5));

        let (file, _, _) = parse_position("C:\\w\\a.cpp:1:1").unwrap();
        assert_eq!(file, PathBuf::from("C:\\w\\a.cpp"));

        assert!(parse_position("main.cpp:12").is_err());
        assert!(parse_position("main.cpp:x:1").is_err());
    }

    #[test]
    fn test_run_args() {
        let cli = Cli::parse_from([
            "clangd-bridge", "run", "-f", "/w/f1", "-f", "/w/f2", "--command", "clangd.ast",
            "--position", "a.cpp:1:1", "a.cpp",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.folders.len(), 2);
        assert_eq!(args.command.as_deref(), Some("clangd.ast"));
        assert_eq!(args.files, vec![PathBuf::from("a.cpp")]);
        assert_eq!(view_of("clangd.ast"), Some(ViewId::Ast));
    }
}
