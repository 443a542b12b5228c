#![cfg(unix)]

use pty_manager::{PtyManager, PtyOptions, PtyOutput};
use std::time::Duration;
use tokio::sync::broadcast;

fn sh_options() -> PtyOptions {
    PtyOptions {
        shell: Some("/bin/sh".to_string()),
        ..Default::default()
    }
}

/// Collect output until `needle` shows up or the deadline passes.
async fn read_until(rx: &mut broadcast::Receiver<PtyOutput>, needle: &str) -> String {
    let mut collected = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !collected.contains(needle) {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(PtyOutput::Data { data, .. })) => {
                collected.push_str(&String::from_utf8_lossy(&data));
            }
            Ok(Ok(PtyOutput::Exited { .. })) | Ok(Err(_)) | Err(_) => break,
        }
    }
    collected
}

async fn wait_for_exit(rx: &mut broadcast::Receiver<PtyOutput>) -> Option<Option<i32>> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(PtyOutput::Exited { exit_code })) => return Some(exit_code),
            Ok(Ok(PtyOutput::Data { .. })) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(_)) | Err(_) => return None,
        }
    }
}

#[tokio::test]
async fn write_echo_marker_produces_output() {
    let manager = PtyManager::new();
    let mut spawned = manager.spawn(sh_options()).await.unwrap();
    let id = spawned.session.id.clone();

    // The echoed command line holds the arithmetic unexpanded; only the
    // shell running it prints MARKER_42
    manager.write(&id, b"echo MARKER_$((40+2))\n").await.unwrap();
    let output = read_until(&mut spawned.output, "MARKER_42").await;
    assert!(output.contains("MARKER_42"), "output was: {:?}", output);

    manager.kill(&id).await.unwrap();
}

#[tokio::test]
async fn resize_is_visible_to_the_shell() {
    let manager = PtyManager::new();
    let mut spawned = manager.spawn(sh_options()).await.unwrap();
    let id = spawned.session.id.clone();

    manager.resize(&id, 120, 40).await.unwrap();
    manager.write(&id, b"stty size\n").await.unwrap();

    let output = read_until(&mut spawned.output, "40 120").await;
    assert!(output.contains("120"), "output was: {:?}", output);

    manager.kill(&id).await.unwrap();
}

#[tokio::test]
async fn spawned_session_is_registered_with_defaults() {
    let manager = PtyManager::new();
    let spawned = manager.spawn(sh_options()).await.unwrap();

    let session = manager.get(&spawned.session.id).await.unwrap();
    assert_eq!(session.shell, "/bin/sh");
    assert!(session.cwd.is_dir());
    assert!(session.pid.is_some());
    assert_eq!(manager.count().await, 1);

    manager.kill(&spawned.session.id).await.unwrap();
}

#[tokio::test]
async fn term_is_injected() {
    let manager = PtyManager::new();
    let mut spawned = manager.spawn(sh_options()).await.unwrap();
    let id = spawned.session.id.clone();

    manager.write(&id, b"echo TERM=$TERM\n").await.unwrap();
    let output = read_until(&mut spawned.output, "TERM=xterm-256color").await;
    assert!(output.contains("TERM=xterm-256color"), "output was: {:?}", output);

    manager.kill(&id).await.unwrap();
}

#[tokio::test]
async fn ids_are_unique_per_spawn() {
    let manager = PtyManager::new();
    let a = manager.spawn(sh_options()).await.unwrap();
    let b = manager.spawn(sh_options()).await.unwrap();
    assert_ne!(a.session.id, b.session.id);
    assert_eq!(manager.list().await.len(), 2);

    assert_eq!(manager.kill_all().await, 2);
    assert_eq!(manager.count().await, 0);
}

#[tokio::test]
async fn kill_removes_session_and_publishes_exit() {
    let manager = PtyManager::new();
    let mut spawned = manager.spawn(sh_options()).await.unwrap();
    let id = spawned.session.id.clone();

    manager.kill(&id).await.unwrap();

    assert!(manager.get(&id).await.is_none());
    assert!(wait_for_exit(&mut spawned.output).await.is_some());

    // Second teardown converges on not-found instead of failing
    assert!(manager.kill(&id).await.unwrap_err().is_not_found());
    assert!(manager.write(&id, b"x").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn shell_exit_removes_session() {
    let manager = PtyManager::new();
    let mut spawned = manager.spawn(sh_options()).await.unwrap();
    let id = spawned.session.id.clone();

    manager.write(&id, b"exit 3\n").await.unwrap();

    let exit_code = wait_for_exit(&mut spawned.output).await;
    assert_eq!(exit_code, Some(Some(3)));
    assert!(manager.get(&id).await.is_none());
}
