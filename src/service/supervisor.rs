//! Optional auto-restart of a crashed llama-server.
//!
//! The service itself never restarts. This task listens for `crashed`
//! transitions and calls `start()` with exponential backoff until the server
//! is ready again or `max_retries` attempts have been made.

use super::LlamaService;
use crate::config::RestartConfig;
use crate::types::ServiceStatus;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Largest backoff exponent, caps the delay at `backoff * 64`
const MAX_BACKOFF_SHIFT: u32 = 6;

#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RestartPolicy {
    /// Delay before the attempt made with `retries` previous failures
    pub fn delay_for(&self, retries: u32) -> Duration {
        self.backoff * 2u32.pow(retries.min(MAX_BACKOFF_SHIFT))
    }
}

impl From<&RestartConfig> for RestartPolicy {
    fn from(config: &RestartConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }
}

/// Spawn the restart loop. It runs until `cancel` fires.
pub fn spawn_supervisor(
    service: LlamaService,
    policy: RestartPolicy,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    service.on_state_change(move |state| {
        if state.status == ServiceStatus::Crashed {
            let _ = tx.send(());
        }
    });

    info!(
        max_retries = policy.max_retries,
        backoff_ms = policy.backoff.as_millis() as u64,
        "Auto-restart enabled"
    );

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => if event.is_none() { break },
            }

            loop {
                let state = service.state();
                if !matches!(state.status, ServiceStatus::Crashed | ServiceStatus::Error) {
                    break;
                }
                if state.retries >= policy.max_retries {
                    error!(
                        retries = state.retries,
                        "llama-server restart attempts exhausted, giving up"
                    );
                    break;
                }

                let delay = policy.delay_for(state.retries);
                warn!(
                    retries = state.retries,
                    delay_ms = delay.as_millis() as u64,
                    "Restarting llama-server after crash"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                match service.start().await {
                    Ok(()) => {
                        info!("llama-server restarted");
                        break;
                    }
                    Err(e) => warn!(error = %e, "Restart attempt failed"),
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RestartPolicy {
            max_retries: 10,
            backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(6), Duration::from_millis(6400));
        assert_eq!(policy.delay_for(20), Duration::from_millis(6400));
    }

    #[test]
    fn test_policy_from_config() {
        let config = RestartConfig {
            enabled: true,
            max_retries: 5,
            backoff_ms: 250,
        };
        let policy = RestartPolicy::from(&config);
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.backoff, Duration::from_millis(250));
    }
}
