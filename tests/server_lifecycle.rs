//! Model-server supervision with a stand-in server binary.
//!
//! The "server" is a shell script that just sleeps; `/health` is answered
//! by an in-process axum router on the configured port.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use localmind::config::ServerConfig;
use localmind::error::InferenceError;
use localmind::process::{InferenceServer, ServerState};
use localmind::watchdog::TIMEOUT_ENV;

async fn health(State(ready): State<Arc<AtomicBool>>) -> (StatusCode, Json<Value>) {
    if ready.load(Ordering::SeqCst) {
        (StatusCode::OK, Json(json!({"status": "ok"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "loading model"})),
        )
    }
}

async fn serve_health(ready: bool) -> u16 {
    let app = Router::new()
        .route("/health", get(health))
        .with_state(Arc::new(AtomicBool::new(ready)));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

fn fake_server(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-server.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn server_config(binary: PathBuf, port: u16) -> ServerConfig {
    ServerConfig {
        binary,
        port,
        health_interval_ms: 50,
        startup_timeout_secs: 5,
        watchdog: false,
        ..ServerConfig::default()
    }
}

fn process_exists(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn kill(pid: u32) {
    std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
}

#[tokio::test]
async fn test_start_is_idempotent_while_ready() {
    let tmp = TempDir::new().unwrap();
    let port = serve_health(true).await;
    let server = InferenceServer::new(server_config(fake_server(tmp.path(), "exec sleep 30"), port)).unwrap();
    let model = tmp.path().join("tiny.gguf");

    assert_eq!(server.state().await, ServerState::Stopped);
    server.start(&model, 512, false).await.unwrap();
    assert_eq!(server.state().await, ServerState::Ready);
    let pid = server.pid().await;
    assert!(pid.is_some());

    server.start(&model, 512, false).await.unwrap();
    assert_eq!(server.pid().await, pid);
    assert!(server.check_alive().await);

    server.stop().await;
    assert_eq!(server.state().await, ServerState::Stopped);
    assert_eq!(server.pid().await, None);
    server.stop().await;
    assert_eq!(server.state().await, ServerState::Stopped);
}

#[tokio::test]
async fn test_crash_is_detected_and_start_respawns() {
    let tmp = TempDir::new().unwrap();
    let port = serve_health(true).await;
    let server = InferenceServer::new(server_config(fake_server(tmp.path(), "exec sleep 30"), port)).unwrap();
    let model = tmp.path().join("tiny.gguf");

    server.start(&model, 512, false).await.unwrap();
    let first = server.pid().await.unwrap();
    kill(first);

    let mut alive = true;
    for _ in 0..50 {
        alive = server.check_alive().await;
        if !alive {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!alive);
    assert_eq!(server.state().await, ServerState::Stopped);

    server.start(&model, 512, false).await.unwrap();
    let second = server.pid().await.unwrap();
    assert_ne!(first, second);
    server.stop().await;
}

#[tokio::test]
async fn test_exit_during_startup_is_a_model_error() {
    let tmp = TempDir::new().unwrap();
    let port = serve_health(false).await;
    let server = InferenceServer::new(server_config(fake_server(tmp.path(), "exit 3"), port)).unwrap();

    let err = server
        .start(&tmp.path().join("tiny.gguf"), 512, false)
        .await
        .unwrap_err();
    match err {
        InferenceError::Model { model, message } => {
            assert_eq!(model, "tiny");
            assert!(message.contains("exited"), "got: {}", message);
        }
        other => panic!("expected a model error, got {:?}", other),
    }
    assert_eq!(server.state().await, ServerState::Stopped);
}

#[tokio::test]
async fn test_startup_timeout_kills_the_server() {
    let tmp = TempDir::new().unwrap();
    let port = serve_health(false).await;
    let config = ServerConfig {
        startup_timeout_secs: 1,
        ..server_config(fake_server(tmp.path(), "exec sleep 30"), port)
    };
    let server = InferenceServer::new(config).unwrap();

    let err = server
        .start(&tmp.path().join("tiny.gguf"), 512, false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("did not become ready"), "got: {}", err);
    assert_eq!(server.state().await, ServerState::Stopped);
    assert_eq!(server.pid().await, None);
}

#[tokio::test]
async fn test_stop_aborts_pending_start() {
    let tmp = TempDir::new().unwrap();
    let port = serve_health(false).await;
    let config = ServerConfig {
        startup_timeout_secs: 10,
        ..server_config(fake_server(tmp.path(), "exec sleep 30"), port)
    };
    let server = Arc::new(InferenceServer::new(config).unwrap());

    let starting = {
        let server = Arc::clone(&server);
        let model = tmp.path().join("tiny.gguf");
        tokio::spawn(async move { server.start(&model, 512, false).await })
    };

    let mut state = server.state().await;
    for _ in 0..100 {
        if state == ServerState::HealthChecking {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        state = server.state().await;
    }
    assert_eq!(state, ServerState::HealthChecking);

    let began = Instant::now();
    server.stop().await;
    assert!(began.elapsed() < Duration::from_secs(2), "stop waited for startup");

    let result = tokio::time::timeout(Duration::from_secs(2), starting)
        .await
        .expect("start should return once stopped")
        .unwrap();
    assert_eq!(result.unwrap_err(), InferenceError::Cancelled);
    assert_eq!(server.state().await, ServerState::Stopped);
    assert_eq!(server.pid().await, None);
}

#[tokio::test]
async fn test_requests_are_serialized() {
    let server = Arc::new(InferenceServer::new(ServerConfig::default()).unwrap());

    let first = server.acquire_request().await;
    let queued = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let guard = server.acquire_request().await;
            guard.token().is_cancelled()
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!queued.is_finished());

    server.interrupt();
    assert!(first.token().is_cancelled());
    drop(first);

    // The next request starts with a fresh token.
    assert!(!queued.await.unwrap());
}

// ============ Watchdog binary ============

#[test]
fn test_started_server_is_supervised_by_watchdog() {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async {
        let tmp = TempDir::new().unwrap();
        let port = serve_health(true).await;
        let config = ServerConfig {
            watchdog: true,
            watchdog_binary: Some(PathBuf::from(env!("CARGO_BIN_EXE_localmind-watchdog"))),
            heartbeat_interval_secs: 1,
            heartbeat_timeout_multiple: 2,
            ..server_config(fake_server(tmp.path(), "exec sleep 30"), port)
        };
        let server = InferenceServer::new(config).unwrap();
        server.start(&tmp.path().join("tiny.gguf"), 512, false).await.unwrap();

        let dog = server.watchdog_pid().await.expect("watchdog should be running");
        assert!(process_exists(dog));
        assert!(server.check_alive().await);

        // Block the only runtime thread so no heartbeat gets written.
        std::thread::sleep(Duration::from_secs(4));

        let mut alive = true;
        for _ in 0..50 {
            alive = server.check_alive().await;
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!alive, "watchdog should have killed the stalled app's server");
        server.stop().await;
    });
}

fn watchdog(pid: u32, timeout_ms: u64) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_localmind-watchdog"));
    cmd.arg(pid.to_string())
        .env(TIMEOUT_ENV, timeout_ms.to_string())
        .stdin(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    cmd
}

#[tokio::test]
async fn test_watchdog_kills_target_when_heartbeats_stop() {
    let mut target = Command::new("sleep").arg("30").kill_on_drop(true).spawn().unwrap();
    let pid = target.id().unwrap();

    let mut dog = watchdog(pid, 300).spawn().unwrap();
    let _stdin = dog.stdin.take();

    let status = tokio::time::timeout(Duration::from_secs(5), target.wait())
        .await
        .expect("target should be killed")
        .unwrap();
    assert!(!status.success());
}

#[tokio::test]
async fn test_watchdog_heartbeats_keep_target_alive() {
    let mut target = Command::new("sleep").arg("30").kill_on_drop(true).spawn().unwrap();
    let pid = target.id().unwrap();

    let mut dog = watchdog(pid, 300).spawn().unwrap();
    let mut stdin = dog.stdin.take().unwrap();

    for _ in 0..12 {
        stdin.write_all(b".").await.unwrap();
        stdin.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(target.try_wait().unwrap().is_none());

    // Closing the pipe means the parent is gone.
    drop(stdin);
    let status = tokio::time::timeout(Duration::from_secs(5), target.wait())
        .await
        .expect("target should be killed once the pipe closes")
        .unwrap();
    assert!(!status.success());
}
