//! Heartbeat liveness protocol between the app and `localmind-watchdog`.
//!
//! The app writes one byte to the watchdog's stdin every `period`. The
//! watchdog kills the model server when nothing arrives for `timeout`
//! (a multiple of the period) or when stdin reaches EOF because the app
//! died.

use anyhow::{bail, Context, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const HEARTBEAT_BYTE: u8 = b'.';

/// Environment variable carrying the watchdog timeout in milliseconds.
/// The server pid stays the watchdog's only argument.
pub const TIMEOUT_ENV: &str = "LOCALMIND_WATCHDOG_TIMEOUT_MS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub period: Duration,
    pub timeout: Duration,
}

impl HeartbeatConfig {
    pub fn new(period: Duration, timeout_multiple: u32) -> Self {
        Self {
            period,
            timeout: period * timeout_multiple,
        }
    }
}

/// Why the watchdog fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// No heartbeat within the timeout.
    TimedOut,
    /// The heartbeat pipe closed.
    ParentGone,
}

/// Parent side: write a heartbeat byte every `period` until cancelled or
/// the pipe breaks.
pub fn spawn_heartbeat<W>(mut writer: W, period: Duration, cancel: CancellationToken) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let sent = async {
                        writer.write_all(&[HEARTBEAT_BYTE]).await?;
                        writer.flush().await
                    };
                    if let Err(e) = sent.await {
                        tracing::warn!(error = %e, "heartbeat pipe closed");
                        break;
                    }
                }
            }
        }
    })
}

/// Watchdog side: consume heartbeats from `reader` and call `terminate`
/// once they stop.
pub async fn run_watchdog<R, F>(mut reader: R, timeout: Duration, terminate: F) -> Result<WatchdogOutcome>
where
    R: AsyncRead + Unpin,
    F: FnOnce() -> Result<()>,
{
    let mut buf = [0u8; 64];
    let outcome = loop {
        match tokio::time::timeout(timeout, reader.read(&mut buf)).await {
            Err(_) => break WatchdogOutcome::TimedOut,
            Ok(Ok(0)) => break WatchdogOutcome::ParentGone,
            Ok(Ok(n)) => tracing::debug!(bytes = n, "heartbeat"),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "heartbeat read failed");
                break WatchdogOutcome::ParentGone;
            }
        }
    };

    tracing::warn!(?outcome, "heartbeat lost, terminating model server");
    terminate()?;
    Ok(outcome)
}

/// Forcefully kill `pid`.
pub fn kill_process(pid: u32) -> Result<()> {
    #[cfg(windows)]
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .status();
    #[cfg(not(windows))]
    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status();

    let status = status.with_context(|| format!("Failed to run kill for pid {}", pid))?;
    if !status.success() {
        bail!("kill for pid {} exited with {}", pid, status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn timeout_is_a_multiple_of_period() {
        let hb = HeartbeatConfig::new(Duration::from_secs(15), 4);
        assert_eq!(hb.timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn silence_triggers_kill() {
        let (_writer, reader) = tokio::io::duplex(64);
        let killed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&killed);

        let outcome = run_watchdog(reader, Duration::from_millis(50), move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(outcome, WatchdogOutcome::TimedOut);
        assert!(killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn heartbeats_keep_watchdog_alive_until_parent_exits() {
        let (writer, reader) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let sender = spawn_heartbeat(writer, Duration::from_millis(20), cancel.clone());

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stopper.cancel();
        });

        let started = std::time::Instant::now();
        let outcome = run_watchdog(reader, Duration::from_millis(100), || Ok(()))
            .await
            .unwrap();

        // Cancelling drops the writer, which the watchdog sees as EOF.
        assert_eq!(outcome, WatchdogOutcome::ParentGone);
        assert!(started.elapsed() >= Duration::from_millis(180));
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn kill_failure_is_reported() {
        let (writer, reader) = tokio::io::duplex(64);
        drop(writer);
        let result = run_watchdog(reader, Duration::from_secs(1), || bail!("no such process")).await;
        assert!(result.is_err());
    }
}
