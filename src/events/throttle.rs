//! Rate limiting for knowledge-base progress updates.
//!
//! At most one snapshot is emitted per window; the terminal snapshot
//! (`current == total`) is always emitted immediately and cleared after a
//! short display delay.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

use crate::config::ThrottleConfig;

/// Partial completion of a long-running remote task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub current: u64,
    pub total: u64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub context: String,
}

impl ProgressSnapshot {
    /// Whether this snapshot reports completion.
    pub fn is_terminal(&self) -> bool {
        self.current == self.total
    }

    /// Completion as a percentage, 0 when the total is unknown.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        ((self.current.min(self.total) * 100) / self.total) as u8
    }
}

/// Handle to the throttle task.
pub struct ProgressThrottle {
    input: mpsc::UnboundedSender<ProgressSnapshot>,
    output: watch::Receiver<Option<ProgressSnapshot>>,
    task: JoinHandle<()>,
}

impl ProgressThrottle {
    /// Spawn the throttle on the current tokio runtime.
    pub fn spawn(config: ThrottleConfig) -> Self {
        let (input, rx) = mpsc::unbounded_channel();
        let (tx, output) = watch::channel(None);
        let task = tokio::spawn(run(config, rx, tx));
        Self {
            input,
            output,
            task,
        }
    }

    /// Feed one snapshot. Never blocks.
    pub fn push(&self, snapshot: ProgressSnapshot) {
        if self.input.send(snapshot).is_err() {
            trace!("Progress throttle stopped, dropping snapshot");
        }
    }

    /// Subscribe to emitted snapshots; `None` means nothing to display.
    pub fn subscribe(&self) -> watch::Receiver<Option<ProgressSnapshot>> {
        self.output.clone()
    }

    /// Currently displayed snapshot.
    pub fn current(&self) -> Option<ProgressSnapshot> {
        self.output.borrow().clone()
    }
}

impl Drop for ProgressThrottle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn run(
    config: ThrottleConfig,
    mut input: mpsc::UnboundedReceiver<ProgressSnapshot>,
    output: watch::Sender<Option<ProgressSnapshot>>,
) {
    let mut window_closes: Option<Instant> = None;
    let mut clear_at: Option<Instant> = None;
    let mut pending: Option<ProgressSnapshot> = None;

    loop {
        tokio::select! {
            received = input.recv() => {
                let Some(snapshot) = received else { break };
                let now = Instant::now();

                if snapshot.is_terminal() {
                    // Flush: whatever was buffered is superseded by completion.
                    pending = None;
                    window_closes = None;
                    clear_at = Some(now + config.clear_after());
                    output.send_replace(Some(snapshot));
                    continue;
                }

                clear_at = None;
                if window_closes.is_none() {
                    output.send_replace(Some(snapshot));
                    window_closes = Some(now + config.window());
                } else {
                    pending = Some(snapshot);
                }
            }
            _ = wait_for(window_closes) => {
                window_closes = None;
                if let Some(snapshot) = pending.take() {
                    output.send_replace(Some(snapshot));
                    window_closes = Some(Instant::now() + config.window());
                }
            }
            _ = wait_for(clear_at) => {
                clear_at = None;
                output.send_replace(None);
            }
        }
    }
}
