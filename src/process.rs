//! Inference process manager.
//!
//! Owns the lifecycle of the local model-serving subprocess:
//!
//! ```text
//! Stopped ─▶ Starting ─▶ HealthChecking ─▶ Ready ─┬─▶ Stopping ─▶ Stopped
//!                                                 └─▶ Crashed  ─▶ Stopped
//! ```
//!
//! Once the server is ready a `localmind-watchdog` companion is spawned
//! with the server pid and fed heartbeats over its stdin (see
//! [`crate::watchdog`]), so the server never outlives a crashed app.
//!
//! Completion requests are serialized: [`InferenceServer::acquire_request`]
//! hands out a guard that a second caller queues behind, and
//! [`InferenceServer::interrupt`] cancels the guarded request without
//! touching the subprocess.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::InferenceError;
use crate::watchdog::{spawn_heartbeat, HeartbeatConfig, TIMEOUT_ENV};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    HealthChecking,
    Ready,
    Stopping,
    Crashed,
}

struct Heartbeat {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Lifecycle {
    state: ServerState,
    model: String,
    server: Option<Child>,
    watchdog: Option<Child>,
    heartbeat: Option<Heartbeat>,
    /// Set while `start` polls `/health`; cancelled by `stop`.
    startup: Option<CancellationToken>,
}

impl Lifecycle {
    /// Stop the heartbeat and kill both children.
    async fn release(&mut self) {
        if let Some(hb) = self.heartbeat.take() {
            hb.cancel.cancel();
            hb.task.abort();
        }
        if let Some(mut watchdog) = self.watchdog.take() {
            if let Err(e) = watchdog.kill().await {
                tracing::debug!(error = %e, "watchdog already gone");
            }
        }
        if let Some(mut server) = self.server.take() {
            if let Err(e) = server.kill().await {
                tracing::debug!(error = %e, "model server already gone");
            }
        }
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        // Children are `kill_on_drop`; only the heartbeat task needs stopping.
        if let Some(hb) = self.heartbeat.take() {
            hb.cancel.cancel();
            hb.task.abort();
        }
    }
}

/// Exclusive right to issue one completion request.
///
/// Dropping the guard releases the slot for the next queued request.
pub struct RequestGuard {
    _permit: OwnedMutexGuard<()>,
    token: CancellationToken,
    slot: Arc<StdMutex<Option<CancellationToken>>>,
}

impl RequestGuard {
    /// Cancelled by [`InferenceServer::interrupt`].
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}

pub struct InferenceServer {
    config: ServerConfig,
    http: reqwest::Client,
    lifecycle: Mutex<Lifecycle>,
    start_lock: Mutex<()>,
    request_lock: Arc<Mutex<()>>,
    in_flight: Arc<StdMutex<Option<CancellationToken>>>,
}

impl InferenceServer {
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.health_interval().max(Duration::from_secs(1)))
            .build()?;
        Ok(Self {
            config,
            http,
            lifecycle: Mutex::new(Lifecycle {
                state: ServerState::Stopped,
                model: String::new(),
                server: None,
                watchdog: None,
                heartbeat: None,
                startup: None,
            }),
            start_lock: Mutex::new(()),
            request_lock: Arc::new(Mutex::new(())),
            in_flight: Arc::new(StdMutex::new(None)),
        })
    }

    pub fn base_url(&self) -> String {
        self.config.base_url()
    }

    pub async fn state(&self) -> ServerState {
        self.lifecycle.lock().await.state
    }

    /// Pid of the running model server.
    pub async fn pid(&self) -> Option<u32> {
        self.lifecycle.lock().await.server.as_ref().and_then(|c| c.id())
    }

    pub async fn watchdog_pid(&self) -> Option<u32> {
        self.lifecycle.lock().await.watchdog.as_ref().and_then(|c| c.id())
    }

    /// Start the model server and wait until it reports ready.
    ///
    /// A no-op when the server is already `Ready` and still running. Any
    /// failure before readiness kills the child, returns to `Stopped`,
    /// and surfaces as [`InferenceError::Model`] naming the model. The
    /// lifecycle lock is not held while polling `/health`, so [`stop`]
    /// can abort a pending start, which then returns
    /// [`InferenceError::Cancelled`].
    ///
    /// [`stop`]: InferenceServer::stop
    pub async fn start(
        &self,
        model_path: &Path,
        context_length: u32,
        use_acceleration: bool,
    ) -> Result<(), InferenceError> {
        let _starting = self.start_lock.lock().await;
        let model = model_name(model_path);

        let (mut child, aborted) = {
            let mut lc = self.lifecycle.lock().await;
            if lc.state == ServerState::Ready {
                if child_running(lc.server.as_mut()) {
                    return Ok(());
                }
                tracing::warn!(model = %lc.model, "model server exited unexpectedly, restarting");
                lc.state = ServerState::Crashed;
            }
            lc.release().await;

            lc.model = model.clone();
            lc.state = ServerState::Starting;

            let threads = thread_count(use_acceleration, available_cores());
            let args = server_args(
                model_path,
                threads,
                context_length,
                self.config.port,
                use_acceleration,
            );
            tracing::info!(
                model = %model,
                threads,
                context_length,
                port = self.config.port,
                "starting model server"
            );

            let spawned = Command::new(&self.config.binary)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn();
            let child = match spawned {
                Ok(child) => child,
                Err(e) => {
                    lc.state = ServerState::Stopped;
                    return Err(InferenceError::model(
                        &model,
                        format!("failed to launch {}: {}", self.config.binary.display(), e),
                    ));
                }
            };

            let aborted = CancellationToken::new();
            lc.startup = Some(aborted.clone());
            lc.state = ServerState::HealthChecking;
            (child, aborted)
        };

        let polled = self.wait_until_ready(&model, &mut child, &aborted).await;

        let mut lc = self.lifecycle.lock().await;
        lc.startup = None;
        let polled = match polled {
            Ok(()) if aborted.is_cancelled() => Err(InferenceError::Cancelled),
            other => other,
        };
        if let Err(e) = polled {
            if let Err(kill_err) = child.kill().await {
                tracing::debug!(error = %kill_err, "model server already exited");
            }
            lc.state = ServerState::Stopped;
            return Err(e);
        }

        let pid = child.id();
        lc.server = Some(child);
        lc.state = ServerState::Ready;
        tracing::info!(model = %model, pid, "model server ready");

        if let Some(pid) = pid {
            self.spawn_watchdog(&mut lc, pid);
        }
        Ok(())
    }

    async fn wait_until_ready(
        &self,
        model: &str,
        child: &mut Child,
        aborted: &CancellationToken,
    ) -> Result<(), InferenceError> {
        let deadline = Instant::now() + self.config.startup_timeout();
        let mut ticker = tokio::time::interval(self.config.health_interval());

        loop {
            tokio::select! {
                biased;
                _ = aborted.cancelled() => {
                    tracing::info!(model, "startup aborted");
                    return Err(InferenceError::Cancelled);
                }
                _ = ticker.tick() => {}
            }

            if let Ok(Some(status)) = child.try_wait() {
                return Err(InferenceError::model(
                    model,
                    format!("server exited during startup ({})", status),
                ));
            }

            let score = tokio::select! {
                biased;
                _ = aborted.cancelled() => return Err(InferenceError::Cancelled),
                score = self.health_score() => score,
            };
            tracing::debug!(score, "health check");
            if score >= self.config.ready_threshold {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(InferenceError::model(
                    model,
                    format!(
                        "server did not become ready within {}s",
                        self.config.startup_timeout_secs
                    ),
                ));
            }
        }
    }

    /// Probe `/health` once. Unreachable servers score 0.
    pub async fn health_score(&self) -> f32 {
        let url = format!("{}/health", self.base_url());
        match self.http.get(&url).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                parse_health(status, &body)
            }
            Err(e) => {
                tracing::debug!(error = %e, "health probe failed");
                0.0
            }
        }
    }

    fn spawn_watchdog(&self, lc: &mut Lifecycle, server_pid: u32) {
        let Some(binary) = self.config.watchdog_path() else {
            tracing::debug!("watchdog disabled");
            return;
        };
        let hb = HeartbeatConfig::new(
            self.config.heartbeat_interval(),
            self.config.heartbeat_timeout_multiple,
        );

        let spawned = Command::new(&binary)
            .arg(server_pid.to_string())
            .env(TIMEOUT_ENV, hb.timeout.as_millis().to_string())
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(mut watchdog) => {
                if let Some(stdin) = watchdog.stdin.take() {
                    let cancel = CancellationToken::new();
                    let task = spawn_heartbeat(stdin, hb.period, cancel.clone());
                    lc.heartbeat = Some(Heartbeat { cancel, task });
                }
                tracing::info!(watchdog_pid = watchdog.id(), server_pid, "watchdog started");
                lc.watchdog = Some(watchdog);
            }
            Err(e) => {
                tracing::warn!(binary = %binary.display(), error = %e, "watchdog unavailable");
            }
        }
    }

    /// Detect a server that died after becoming ready.
    ///
    /// Returns `false` (and moves through `Crashed` to `Stopped`) when the
    /// child has exited.
    pub async fn check_alive(&self) -> bool {
        let mut lc = self.lifecycle.lock().await;
        if lc.state != ServerState::Ready {
            return false;
        }
        if child_running(lc.server.as_mut()) {
            return true;
        }
        tracing::warn!(model = %lc.model, "model server crashed");
        lc.state = ServerState::Crashed;
        lc.release().await;
        lc.state = ServerState::Stopped;
        false
    }

    /// Kill the server and its watchdog, aborting a pending start. Safe
    /// to call repeatedly.
    pub async fn stop(&self) {
        self.interrupt();
        let mut lc = self.lifecycle.lock().await;
        if let Some(startup) = lc.startup.take() {
            startup.cancel();
        }
        if lc.state == ServerState::Stopped && lc.server.is_none() {
            return;
        }
        lc.state = ServerState::Stopping;
        lc.release().await;
        lc.state = ServerState::Stopped;
        tracing::info!(model = %lc.model, "model server stopped");
    }

    /// Wait for exclusive use of the server for one request.
    pub async fn acquire_request(&self) -> RequestGuard {
        let permit = Arc::clone(&self.request_lock).lock_owned().await;
        let token = CancellationToken::new();
        if let Ok(mut slot) = self.in_flight.lock() {
            *slot = Some(token.clone());
        }
        RequestGuard {
            _permit: permit,
            token,
            slot: Arc::clone(&self.in_flight),
        }
    }

    /// Cancel the in-flight request, if any. The server keeps running.
    pub fn interrupt(&self) {
        if let Ok(slot) = self.in_flight.lock() {
            if let Some(token) = slot.as_ref() {
                tracing::debug!("interrupting in-flight request");
                token.cancel();
            }
        }
    }
}

fn child_running(child: Option<&mut Child>) -> bool {
    matches!(child.map(|c| c.try_wait()), Some(Ok(None)))
}

fn model_name(model_path: &Path) -> String {
    model_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| model_path.display().to_string())
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Threads for the model server: two thirds of the cores (rounded up) when
/// acceleration offloads compute, otherwise every core.
pub fn thread_count(use_acceleration: bool, cores: usize) -> usize {
    let cores = cores.max(1);
    if use_acceleration {
        (cores * 2).div_ceil(3)
    } else {
        cores
    }
}

pub fn server_args(
    model_path: &Path,
    threads: usize,
    context_length: u32,
    port: u16,
    use_acceleration: bool,
) -> Vec<String> {
    vec![
        "--model".to_string(),
        model_path.display().to_string(),
        "--threads".to_string(),
        threads.to_string(),
        "--threads-batch".to_string(),
        threads.to_string(),
        "--ctx-size".to_string(),
        context_length.to_string(),
        "--port".to_string(),
        port.to_string(),
        "--n-gpu-layers".to_string(),
        if use_acceleration { "99" } else { "0" }.to_string(),
    ]
}

/// Map a `/health` response to a readiness score in `[0, 1]`.
///
/// A numeric `progress` field wins; otherwise `status: "ok"` is ready and
/// any loading or error status is not. A bare 2xx with no JSON body counts
/// as ready.
pub fn parse_health(status: u16, body: &str) -> f32 {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(progress) = value.get("progress").and_then(|p| p.as_f64()) {
            return (progress as f32).clamp(0.0, 1.0);
        }
        if let Some(s) = value.get("status").and_then(|s| s.as_str()) {
            return match s {
                "ok" | "ready" => 1.0,
                _ => 0.0,
            };
        }
        if value.get("error").is_some() {
            return 0.0;
        }
    }
    if (200..300).contains(&status) {
        1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threads_reduced_when_accelerated() {
        assert_eq!(thread_count(true, 8), 6);
        assert_eq!(thread_count(true, 4), 3);
        assert_eq!(thread_count(true, 1), 1);
        assert_eq!(thread_count(false, 8), 8);
        assert_eq!(thread_count(false, 0), 1);
    }

    #[test]
    fn args_follow_server_cli() {
        let args = server_args(Path::new("/models/qwen.gguf"), 6, 8192, 8690, true);
        assert_eq!(
            args.join(" "),
            "--model /models/qwen.gguf --threads 6 --threads-batch 6 --ctx-size 8192 --port 8690 --n-gpu-layers 99"
        );
        let cpu = server_args(Path::new("m.gguf"), 8, 4096, 9000, false);
        assert_eq!(cpu.last().map(String::as_str), Some("0"));
    }

    #[test]
    fn health_scores() {
        assert_eq!(parse_health(200, r#"{"status":"ok"}"#), 1.0);
        assert_eq!(parse_health(503, r#"{"status":"loading model"}"#), 0.0);
        assert_eq!(parse_health(503, r#"{"progress":0.4}"#), 0.4);
        assert_eq!(parse_health(200, r#"{"progress":1.7}"#), 1.0);
        assert_eq!(
            parse_health(503, r#"{"error":{"code":503,"message":"Loading model"}}"#),
            0.0
        );
        assert_eq!(parse_health(200, "OK"), 1.0);
        assert_eq!(parse_health(500, ""), 0.0);
    }

    #[test]
    fn model_name_is_file_stem() {
        assert_eq!(model_name(Path::new("/m/llama-3.2-3b.Q4_K_M.gguf")), "llama-3.2-3b.Q4_K_M");
    }

    #[tokio::test]
    async fn interrupt_without_request_is_noop() {
        let server = InferenceServer::new(ServerConfig::default()).unwrap();
        server.interrupt();
        server.stop().await;
        assert_eq!(server.state().await, ServerState::Stopped);
    }

    #[tokio::test]
    async fn interrupt_cancels_only_current_request() {
        let server = InferenceServer::new(ServerConfig::default()).unwrap();
        let first = server.acquire_request().await;
        server.interrupt();
        assert!(first.token().is_cancelled());
        drop(first);

        let second = server.acquire_request().await;
        assert!(!second.token().is_cancelled());
    }

    #[tokio::test]
    async fn missing_binary_is_model_error() {
        let config = ServerConfig {
            binary: "/definitely/not/llama-server".into(),
            ..ServerConfig::default()
        };
        let server = InferenceServer::new(config).unwrap();
        let err = server
            .start(Path::new("/models/tiny.gguf"), 2048, false)
            .await
            .unwrap_err();
        match err {
            InferenceError::Model { model, .. } => assert_eq!(model, "tiny"),
            other => panic!("expected model error, got {:?}", other),
        }
        assert_eq!(server.state().await, ServerState::Stopped);
    }
}
