//! Tool-level behavior over the sandbox surface: workspace containment,
//! read/write round trips, output shaping, and the re-ensure retry.

mod common;

use anemone::agent::tools::base::{SessionContext, Tool};
use anemone::agent::tools::sandbox_tools::{ReadFileTool, ShellExecTool, WriteFileTool};
use anemone::config::SandboxSettings;
use anemone::sandbox::SandboxSurface;
use common::MemorySandbox;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;

fn ctx(user: &str) -> SessionContext {
    SessionContext::detached(user, "t-test")
}

#[tokio::test]
async fn write_then_read_round_trips() {
    let sandbox = MemorySandbox::new();
    let sandbox_dyn: Arc<dyn SandboxSurface> = sandbox.clone();
    let write = WriteFileTool::new(sandbox_dyn.clone());
    let read = ReadFileTool::new(sandbox_dyn);

    let result = write
        .execute(
            json!({"path": "notes/report.md", "content": "# Findings\n"}),
            &ctx("alice"),
        )
        .await
        .unwrap();
    assert!(!result.is_error, "{}", result.content);

    let result = read
        .execute(json!({"path": "notes/report.md"}), &ctx("alice"))
        .await
        .unwrap();
    assert!(!result.is_error);
    assert_eq!(result.content, "# Findings\n");
}

#[tokio::test]
async fn append_mode_extends_the_file() {
    let sandbox = MemorySandbox::new();
    let sandbox_dyn: Arc<dyn SandboxSurface> = sandbox.clone();
    let write = WriteFileTool::new(sandbox_dyn.clone());
    let read = ReadFileTool::new(sandbox_dyn);

    write
        .execute(json!({"path": "log.txt", "content": "one\n"}), &ctx("alice"))
        .await
        .unwrap();
    write
        .execute(
            json!({"path": "log.txt", "content": "two\n", "mode": "append"}),
            &ctx("alice"),
        )
        .await
        .unwrap();
    // Appending to a missing file starts from nothing
    write
        .execute(
            json!({"path": "fresh.txt", "content": "first\n", "mode": "append"}),
            &ctx("alice"),
        )
        .await
        .unwrap();

    let result = read
        .execute(json!({"path": "log.txt"}), &ctx("alice"))
        .await
        .unwrap();
    assert_eq!(result.content, "one\ntwo\n");
    let result = read
        .execute(json!({"path": "fresh.txt"}), &ctx("alice"))
        .await
        .unwrap();
    assert_eq!(result.content, "first\n");
}

#[tokio::test]
async fn workspaces_are_isolated_per_user() {
    let sandbox = MemorySandbox::new();
    let sandbox_dyn: Arc<dyn SandboxSurface> = sandbox.clone();
    let write = WriteFileTool::new(sandbox_dyn.clone());
    let read = ReadFileTool::new(sandbox_dyn);

    write
        .execute(json!({"path": "secret.txt", "content": "alice's"}), &ctx("alice"))
        .await
        .unwrap();

    let result = read
        .execute(json!({"path": "secret.txt"}), &ctx("bob"))
        .await
        .unwrap();
    assert!(result.is_error, "bob must not read alice's file");
}

#[tokio::test]
async fn escape_attempts_are_rejected_with_kind() {
    let sandbox = MemorySandbox::new();
    let sandbox_dyn: Arc<dyn SandboxSurface> = sandbox.clone();
    let read = ReadFileTool::new(sandbox_dyn.clone());
    let write = WriteFileTool::new(sandbox_dyn);

    for path in ["../../etc/hosts", "/etc/passwd", "a/../../peer"] {
        let result = read
            .execute(json!({"path": path}), &ctx("alice"))
            .await
            .unwrap();
        assert!(result.is_error, "path {} must fail", path);
        assert!(
            result.content.contains("path-escape"),
            "diagnostic for {} must carry the kind: {}",
            path,
            result.content
        );

        let result = write
            .execute(json!({"path": path, "content": "x"}), &ctx("alice"))
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.content.contains("path-escape"));
    }
}

#[tokio::test]
async fn read_file_truncates_with_marker() {
    let sandbox = MemorySandbox::new();
    let sandbox_dyn: Arc<dyn SandboxSurface> = sandbox.clone();
    sandbox_dyn
        .put_file("alice", "big.txt", "x".repeat(100_000).as_bytes())
        .await
        .unwrap();

    let read = ReadFileTool::new(sandbox_dyn);
    let result = read
        .execute(json!({"path": "big.txt"}), &ctx("alice"))
        .await
        .unwrap();
    assert!(!result.is_error);
    assert!(result.content.len() < 100_000);
    assert!(result.content.contains("[truncated, file is 100000 bytes]"));
}

#[tokio::test]
async fn shell_exec_renders_output() {
    let sandbox = MemorySandbox::new();
    let sandbox_dyn: Arc<dyn SandboxSurface> = sandbox.clone();
    let shell = ShellExecTool::new(sandbox_dyn, &SandboxSettings::default());

    let result = shell
        .execute(json!({"command": "echo hello"}), &ctx("alice"))
        .await
        .unwrap();
    assert!(!result.is_error);
    assert!(result.content.contains("ran: echo hello"));
}

#[tokio::test]
async fn sandbox_unavailable_is_retried_once() {
    let sandbox = MemorySandbox::new();
    sandbox.fail_next_execs.store(1, Ordering::SeqCst);
    let sandbox_dyn: Arc<dyn SandboxSurface> = sandbox.clone();
    let shell = ShellExecTool::new(sandbox_dyn, &SandboxSettings::default());

    // One failure, then the re-ensured retry succeeds
    let result = shell
        .execute(json!({"command": "pwd"}), &ctx("alice"))
        .await
        .unwrap();
    assert!(!result.is_error, "{}", result.content);

    // Two consecutive failures exhaust the single retry
    sandbox.fail_next_execs.store(2, Ordering::SeqCst);
    let result = shell
        .execute(json!({"command": "pwd"}), &ctx("alice"))
        .await
        .unwrap();
    assert!(result.is_error);
    assert!(result.content.contains("sandbox-unavailable"));
}
