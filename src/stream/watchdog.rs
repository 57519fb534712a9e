//! Idle watchdog for one stream attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Single-shot idle timer bound to a stream attempt's lifetime.
///
/// If [`reset`](Self::reset) is not called within the idle window, the
/// watchdog cancels the lifetime token. Any read or backlog fetch selecting
/// on that token then unblocks. The timer task stops when the lifetime is
/// cancelled or the watchdog is dropped.
#[derive(Debug)]
pub struct IdleWatchdog {
    window: Duration,
    deadline_tx: watch::Sender<Instant>,
    expired: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl IdleWatchdog {
    /// Arms the timer. Must be called from within a tokio runtime.
    pub fn arm(window: Duration, lifetime: CancellationToken) -> Self {
        let (deadline_tx, deadline_rx) = watch::channel(Instant::now() + window);
        let expired = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_timer(
            window,
            deadline_rx,
            lifetime,
            Arc::clone(&expired),
        ));

        Self {
            window,
            deadline_tx,
            expired,
            task,
        }
    }

    /// Pushes the deadline one full window into the future.
    pub fn reset(&self) {
        let _ = self.deadline_tx.send(Instant::now() + self.window);
    }

    /// Whether the timer fired and cancelled the lifetime.
    pub fn expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Drop for IdleWatchdog {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_timer(
    window: Duration,
    mut deadline_rx: watch::Receiver<Instant>,
    lifetime: CancellationToken,
    expired: Arc<AtomicBool>,
) {
    loop {
        let deadline = *deadline_rx.borrow_and_update();
        tokio::select! {
            biased;
            () = lifetime.cancelled() => return,
            changed = deadline_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            () = tokio::time::sleep_until(deadline) => {
                expired.store(true, Ordering::SeqCst);
                warn!(
                    event = "stream_idle_timeout",
                    idle_ms = window.as_millis() as u64
                );
                lifetime.cancel();
                return;
            }
        }
    }
}
