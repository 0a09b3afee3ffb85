//! Resettable one-shot idle timer for active sessions.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
struct IdleState {
    deadline: Instant,
    fired: bool,
}

/// Fires once `idle_timeout` has passed since construction or the last
/// [`reset`](Self::reset).
///
/// The countdown runs on a background task started at construction and
/// cancelled when the timer is dropped. Once fired the timer stays fired;
/// later resets are ignored and every call to [`timeout`](Self::timeout)
/// resolves immediately.
#[derive(Debug)]
pub struct SessionIdleTimer {
    idle_timeout: Duration,
    state: Arc<Mutex<IdleState>>,
    fired: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl SessionIdleTimer {
    pub fn new(idle_timeout: Duration) -> Self {
        let state = Arc::new(Mutex::new(IdleState {
            deadline: Instant::now() + idle_timeout,
            fired: false,
        }));
        let (fired_tx, fired_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        let task_state = Arc::clone(&state);
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let deadline = with_state(&task_state, |state| state.deadline);

                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => {}
                }

                // A reset may have moved the deadline while we slept
                let fired = with_state(&task_state, |state| {
                    if Instant::now() >= state.deadline {
                        state.fired = true;
                    }
                    state.fired
                });

                if fired {
                    debug!("Session idle timeout elapsed");
                    let _ = fired_tx.send(true);
                    return;
                }
            }
        });

        Self {
            idle_timeout,
            state,
            fired: fired_rx,
            cancel,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Push the deadline to `idle_timeout` from now.
    ///
    /// Returns `false` without effect once the timer has fired.
    pub fn reset(&self) -> bool {
        with_state(&self.state, |state| {
            if state.fired {
                return false;
            }
            state.deadline = Instant::now() + self.idle_timeout;
            true
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.fired.borrow()
    }

    /// Wait for the timer to fire.
    ///
    /// Returns `true` when the idle timeout elapsed and `false` if the timer
    /// was disposed first.
    pub async fn timeout(&self) -> bool {
        let mut fired = self.fired.clone();
        let result = fired.wait_for(|fired| *fired).await.is_ok();
        result
    }

    /// Stop the countdown without firing. Idempotent.
    pub fn dispose(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SessionIdleTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn with_state<R>(state: &Mutex<IdleState>, f: impl FnOnce(&mut IdleState) -> R) -> R {
    match state.lock() {
        Ok(mut guard) => f(&mut guard),
        Err(poisoned) => f(&mut poisoned.into_inner()),
    }
}

#[cfg(test)]
#[path = "idle_timer_tests.rs"]
mod tests;
