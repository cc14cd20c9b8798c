// ABOUTME: Tests for the process launcher using small bash fake workers.
// ABOUTME: Covers event streaming, exit codes, stderr capture and termination.

#![cfg(unix)]

use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::events::WorkerEvent;
use super::process::{LaunchEvent, LaunchSpec, Launcher, ProcessLauncher};
use crate::error::SpawnError;

fn script(dir: &TempDir, body: &str) -> LaunchSpec {
    let path = dir.path().join("worker.sh");
    std::fs::write(&path, body).unwrap();
    LaunchSpec {
        program: "bash".into(),
        args: vec![path.display().to_string()],
        working_dir: dir.path().to_path_buf(),
    }
}

async fn collect(mut rx: mpsc::UnboundedReceiver<LaunchEvent>) -> Vec<LaunchEvent> {
    let mut out = Vec::new();
    while let Some(event) = rx.recv().await {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn test_streams_events_and_exit_code() {
    let dir = TempDir::new().unwrap();
    let spec = script(
        &dir,
        r#"
echo '{"type":"system","subtype":"init"}'
printf '{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}],'
printf '"usage":{"input_tokens":5,"output_tokens":7}}}\n'
echo 'noise that is not json'
echo '{"type":"result","result":"done","total_cost_usd":0.5}'
"#,
    );
    let (tx, rx) = mpsc::unbounded_channel();
    let run = ProcessLauncher::new()
        .launch(&spec, tx, CancellationToken::new())
        .await
        .unwrap();
    let events = collect(rx).await;

    assert_eq!(run.exit_code, Some(0));
    assert!(run.succeeded());
    assert!(matches!(events[0], LaunchEvent::Started { .. }));
    let decoded: Vec<&WorkerEvent> = events
        .iter()
        .filter_map(|e| match e {
            LaunchEvent::Event(ev) => Some(ev),
            _ => None,
        })
        .collect();
    assert_eq!(decoded.len(), 3);
    assert!(matches!(decoded[1], WorkerEvent::Assistant { output_tokens: 7, .. }));
    assert!(matches!(decoded[2], WorkerEvent::Result { .. }));
}

#[tokio::test]
async fn test_nonzero_exit_keeps_stderr() {
    let dir = TempDir::new().unwrap();
    let spec = script(&dir, "echo 'API error: 429 Too Many Requests' >&2\nexit 3\n");
    let (tx, _rx) = mpsc::unbounded_channel();
    let run = ProcessLauncher::new()
        .launch(&spec, tx, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(run.exit_code, Some(3));
    assert!(!run.succeeded());
    assert!(run.stderr.contains("429"));
}

#[tokio::test]
async fn test_missing_program_is_launch_error() {
    let dir = TempDir::new().unwrap();
    let spec = LaunchSpec {
        program: "/nonexistent/colony-worker".into(),
        args: vec![],
        working_dir: dir.path().to_path_buf(),
    };
    let (tx, _rx) = mpsc::unbounded_channel();
    let err = ProcessLauncher::new()
        .launch(&spec, tx, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SpawnError::Launch { .. }));
}

#[tokio::test]
async fn test_cancel_terminates_gracefully() {
    let dir = TempDir::new().unwrap();
    let spec = script(&dir, "exec sleep 30\n");
    let cancel = CancellationToken::new();
    let (tx, _rx) = mpsc::unbounded_channel();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let run = ProcessLauncher::new().launch(&spec, tx, cancel).await.unwrap();
    assert!(run.cancelled);
    assert!(!run.succeeded());
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_cancel_escalates_when_term_is_ignored() {
    let dir = TempDir::new().unwrap();
    let spec = script(&dir, "trap '' TERM\nexec sleep 30\n");
    let cancel = CancellationToken::new();
    let (tx, _rx) = mpsc::unbounded_channel();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let run = ProcessLauncher::new()
        .grace_period(Duration::from_millis(300))
        .launch(&spec, tx, cancel)
        .await
        .unwrap();
    assert!(run.cancelled);
    assert_eq!(run.exit_code, None);
    assert!(started.elapsed() >= Duration::from_millis(600));
    assert!(started.elapsed() < Duration::from_secs(10));
}
