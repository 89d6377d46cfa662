//! End-to-end against a real clangd.
//!
//! Ignored by default since they need clangd installed:
//! - `cargo test --test clangd_test -- --ignored`
//! - `CLANGD_PATH=/opt/llvm/bin/clangd cargo test --test clangd_test -- --ignored`

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lsp_types::{Position, Range};
use serde_json::{Value, json};
use serial_test::serial;
use tempfile::TempDir;

use clangd_bridge::config::JsonSettings;
use clangd_bridge::editor::{EditorEvent, EditorHost};
use clangd_bridge::headless::HeadlessHost;
use clangd_bridge::install::PathInstaller;
use clangd_bridge::lsp::client::LspLauncher;
use clangd_bridge::{Builtin, ContextManager, Services};

const MAIN_CPP: &str = "int add(int a, int b) { return a + b; }\n\nint main() {\n  return add(1);\n}\n";

fn find_clangd() -> String {
    std::env::var("CLANGD_PATH").unwrap_or_else(|_| "clangd".to_string())
}

fn project() -> TempDir {
    let dir = tempfile::tempdir().expect("temp dir");
    std::fs::write(dir.path().join("main.cpp"), MAIN_CPP).unwrap();
    std::fs::write(dir.path().join("compile_flags.txt"), "-std=c++17\n").unwrap();
    let settings = json!({
        "clangd.path": find_clangd(),
        "clangd.diagnosticsDelay": 0,
        "clangd.arguments": ["--background-index=false"],
    });
    std::fs::write(dir.path().join("settings.json"), settings.to_string()).unwrap();
    dir
}

fn start(dir: &Path) -> (Arc<HeadlessHost>, Builtin, Arc<ContextManager>) {
    let root = dir.canonicalize().unwrap();
    let host = Arc::new(HeadlessHost::new(&[root.clone()]).unwrap());
    let services = Services {
        host: host.clone(),
        config: Arc::new(JsonSettings::new(root.join("settings.json"))),
        installer: Arc::new(PathInstaller::new(host.clone())),
        launcher: Arc::new(LspLauncher),
        storage_root: root.join(".storage"),
    };
    let builtin = Builtin::new(host.clone());
    let manager = ContextManager::new(services, builtin.all());
    (host, builtin, manager)
}

async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
#[serial]
#[ignore = "requires clangd"]
async fn test_diagnostics_from_clangd() {
    let dir = project();
    let (host, _builtin, manager) = start(dir.path());
    manager.activate().await.unwrap();

    let path = dir.path().canonicalize().unwrap().join("main.cpp");
    let document = host.open(&path).unwrap();
    manager
        .handle_event(EditorEvent::DocumentOpened(document.clone()))
        .await;

    let context = manager.get_context_for_document(&document).expect("context");
    assert!(context.client_is_running());
    assert!(eventually(|| !host.diagnostics(&document.uri).is_empty()).await);
    let diagnostics = host.diagnostics(&document.uri);
    assert_eq!(diagnostics[0].range.start.line, 3);

    manager.dispose().await.unwrap();
    assert!(host.diagnostics(&document.uri).is_empty());
    assert!(context.is_disposed());
}

#[tokio::test]
#[serial]
#[ignore = "requires clangd"]
async fn test_ast_from_clangd() {
    let dir = project();
    let (host, builtin, manager) = start(dir.path());
    manager.activate().await.unwrap();

    let path = dir.path().canonicalize().unwrap().join("main.cpp");
    let document = host.open(&path).unwrap();
    manager
        .handle_event(EditorEvent::DocumentOpened(document.clone()))
        .await;
    assert!(eventually(|| host.context_key("clangd.ast.supported") == Some(true)).await);

    // `return a + b;`
    host.select(Range::new(Position::new(0, 24), Position::new(0, 37)));
    manager.execute_command("clangd.ast", Value::Null).await.unwrap();

    assert!(builtin.ast.has_root());
    assert_eq!(builtin.ast.document(), Some(document.uri.clone()));
    assert_eq!(host.active_document(), Some(document));

    manager.dispose().await.unwrap();
    assert!(!builtin.ast.has_root());
}
