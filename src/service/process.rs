use super::{LlamaService, ProcessHandle, ServiceError};
use crate::args::build_args;
use crate::logs::LogBuffer;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Strip ANSI escape sequences from a string.
pub(crate) fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // Skip until we hit a letter (end of escape sequence)
            for c2 in chars.by_ref() {
                if c2.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Send `signal` to the whole process group led by `pid`.
#[cfg(unix)]
pub(super) fn signal_group(pid: u32, signal: libc::c_int) {
    // SAFETY: the group was created by us via process_group(0), so pgid == pid.
    unsafe {
        libc::kill(-(pid as libc::pid_t), signal);
    }
}

/// Forward one output stream line-by-line to tracing (target `llama_server`)
/// and to the in-memory log buffer.
fn forward_output<R>(reader: R, stream: &'static str, logs: Option<Arc<LogBuffer>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let clean = strip_ansi(&line);
            if clean.trim().is_empty() {
                continue;
            }
            debug!(target: "llama_server", stream = stream, "{}", clean);
            if let Some(ref logs) = logs {
                logs.info("llama-server", clean);
            }
        }
    });
}

/// Resolves once the exit watcher has reaped the process.
pub(super) async fn wait_for_exit(exited: &mut watch::Receiver<Option<String>>) {
    // A dropped sender means the watcher is gone, which only happens after exit.
    let _ = exited.wait_for(|status| status.is_some()).await;
}

impl LlamaService {
    /// Spawn llama-server, register its handle and start the exit watcher.
    pub(super) fn spawn_process(
        &self,
    ) -> Result<(u32, watch::Receiver<Option<String>>), ServiceError> {
        let config = &self.inner.config;
        let args = build_args(config);

        info!(
            binary = %config.server_path,
            host = %config.host,
            port = config.port,
            "Spawning llama-server"
        );
        debug!(args = ?args, "llama-server command args");

        // Own process group so stop() can signal the whole tree.
        let mut cmd = Command::new(&config.server_path);
        cmd.args(&args)
            .env("NO_COLOR", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        // Die with the supervisor even if it is SIGKILLed. The death signal
        // follows the forking thread, a tokio worker here, so a worker that
        // exits early also takes the child down; kill_on_drop covers the
        // orderly paths.
        #[cfg(target_os = "linux")]
        // SAFETY: prctl is async-signal-safe and touches no parent state.
        unsafe {
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ServiceError::SpawnFailed(format!("{}: {}", config.server_path, e)))?;

        let pid = child.id().ok_or_else(|| {
            ServiceError::SpawnFailed("process exited before reporting a pid".to_string())
        })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout", self.inner.logs.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr", self.inner.logs.clone());
        }

        let (tx, rx) = watch::channel(None);
        self.lock_state().process = Some(ProcessHandle {
            pid,
            exited: rx.clone(),
        });

        let service = self.clone();
        tokio::spawn(async move {
            let description = match child.wait().await {
                Ok(status) => status.to_string(),
                Err(e) => format!("wait failed: {e}"),
            };
            debug!(pid, status = %description, "llama-server process reaped");
            // State first, so waiters on `exited` observe the cleared handle.
            service.handle_exit(pid, &description);
            let _ = tx.send(Some(description));
        });

        info!(pid, "llama-server spawned");
        Ok((pid, rx))
    }

    /// Poll `/health` until it succeeds, the process exits, or the startup
    /// deadline passes. On timeout the process is killed.
    pub(super) async fn wait_until_healthy(
        &self,
        pid: u32,
        mut exited: watch::Receiver<Option<String>>,
    ) -> Result<(), ServiceError> {
        let timeout = self.inner.config.startup_timeout();
        let interval = self.inner.config.health_poll_interval();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(status) = exited.borrow().clone() {
                return Err(ServiceError::ExitedDuringStartup(status));
            }

            if self.inner.api.health_check().await {
                return Ok(());
            }
            debug!(pid, "Health check not passing yet, retrying...");

            if tokio::time::Instant::now() + interval > deadline {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = exited.changed() => {}
            }
        }

        warn!(pid, timeout = ?timeout, "llama-server startup timed out, killing");
        signal_group(pid, libc::SIGKILL);
        if tokio::time::timeout(self.inner.config.stop_timeout(), wait_for_exit(&mut exited))
            .await
            .is_err()
        {
            warn!(pid, "llama-server did not exit after SIGKILL");
        }
        Err(ServiceError::StartupTimeout(timeout))
    }

    /// SIGTERM the process group, escalating to SIGKILL after the stop timeout.
    pub(super) async fn terminate(
        &self,
        pid: u32,
        exited: &mut watch::Receiver<Option<String>>,
    ) -> Result<(), ServiceError> {
        let grace = self.inner.config.stop_timeout();

        signal_group(pid, libc::SIGTERM);
        if tokio::time::timeout(grace, wait_for_exit(exited)).await.is_ok() {
            return Ok(());
        }

        warn!(pid, grace = ?grace, "llama-server ignored SIGTERM, sending SIGKILL");
        signal_group(pid, libc::SIGKILL);
        tokio::time::timeout(grace, wait_for_exit(exited))
            .await
            .map_err(|_| ServiceError::StopFailed(pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("hello"), "hello");
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m"), "red");
        assert_eq!(
            strip_ansi("\x1b[1;32mgreen bold\x1b[0m text"),
            "green bold text"
        );
    }

    #[tokio::test]
    async fn test_wait_for_exit_returns_on_dropped_sender() {
        let (tx, mut rx) = watch::channel::<Option<String>>(None);
        drop(tx);
        wait_for_exit(&mut rx).await;
    }
}
