//! Automatic lock renewal.
//!
//! A renewal registration is a background task that sleeps until shortly
//! before a lock lapses, renews it, and repeats until the registration is
//! released, a renewal fails, or the configured maximum renewal duration is
//! reached. The same loop keeps message locks and session locks alive.
//!
//! [`LockRenewalOperator`] applies message-lock renewal to a stream: every
//! message it passes downstream is registered in a [`LockContainer`] under its
//! lock token, and stays registered until it is settled.

use crate::error::ReceiverError;
use crate::link::{LockRenewer, MessageSettler, MessageSource};
use crate::lock_container::{LockContainer, LockHandle};
use crate::message::{ReceivedMessage, Timestamp};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "renewal_tests.rs"]
mod tests;

/// Renewal never waits closer than this to the lock's expiry
const MAX_RENEWAL_BUFFER: Duration = Duration::from_secs(10);

/// Minimum gap between consecutive renewals of one lock, so a renewer
/// reporting an expiry at or before now cannot drive back-to-back calls
const MIN_RENEWAL_INTERVAL: Duration = Duration::from_secs(1);

static NEXT_RENEWAL_ID: AtomicU64 = AtomicU64::new(1);

/// Delay before the next renewal of a lock expiring at `locked_until`.
///
/// Renews once half the remaining time has passed, but never later than
/// [`MAX_RENEWAL_BUFFER`] before expiry. A lapsed lock renews immediately;
/// the renewal loop still keeps [`MIN_RENEWAL_INTERVAL`] between renewals.
pub fn renewal_delay(locked_until: Timestamp) -> Duration {
    let remaining = locked_until.remaining();
    let buffer = (remaining / 2).min(MAX_RENEWAL_BUFFER);
    remaining - buffer
}

/// Lifecycle of a renewal registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalStatus {
    Running,
    /// The maximum renewal duration elapsed
    Completed,
    /// Released by settlement or disposal
    Cancelled,
    /// A renewal attempt failed; the lock is left to lapse
    Failed,
}

#[derive(Debug)]
struct RenewalState {
    status: RenewalStatus,
    renewals: u32,
    last_error: Option<String>,
}

/// Handle to a renewal registration
#[derive(Debug, Clone)]
pub struct RenewalHandle {
    id: u64,
    cancel: CancellationToken,
    state: Arc<Mutex<RenewalState>>,
}

impl RenewalHandle {
    /// Create a handle that is cancelled together with `parent`
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            id: NEXT_RENEWAL_ID.fetch_add(1, Ordering::Relaxed),
            cancel: parent.child_token(),
            state: Arc::new(Mutex::new(RenewalState {
                status: RenewalStatus::Running,
                renewals: 0,
                last_error: None,
            })),
        }
    }

    /// Unique id distinguishing registrations made under the same lock token
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> RenewalStatus {
        self.with_state(|state| state.status)
    }

    /// Number of successful renewals so far
    pub fn renewal_count(&self) -> u32 {
        self.with_state(|state| state.renewals)
    }

    pub fn last_error(&self) -> Option<String> {
        self.with_state(|state| state.last_error.clone())
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut RenewalState) -> R) -> R {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn finish(&self, status: RenewalStatus, error: Option<String>) {
        self.with_state(|state| {
            if state.status == RenewalStatus::Running {
                state.status = status;
                state.last_error = error;
            }
        });
    }

    /// Run the renewal loop on the current runtime.
    ///
    /// `renew` performs one renewal and yields the new expiry, `on_renewed`
    /// observes each new expiry, and `on_finished` runs once when the loop
    /// exits for any reason.
    pub fn start<R, Fut, N, F>(
        &self,
        label: String,
        locked_until: Timestamp,
        max_duration: Duration,
        renew: R,
        on_renewed: N,
        on_finished: F,
    ) where
        R: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Timestamp, ReceiverError>> + Send + 'static,
        N: Fn(Timestamp) + Send + 'static,
        F: FnOnce(&RenewalHandle) + Send + 'static,
    {
        let handle = self.clone();

        tokio::spawn(async move {
            let deadline = Instant::now() + max_duration;
            let mut locked_until = locked_until;
            let mut renewed = false;

            loop {
                let now = Instant::now();
                if now >= deadline {
                    debug!(lock = %label, "Maximum lock renewal duration reached");
                    handle.finish(RenewalStatus::Completed, None);
                    break;
                }

                let mut delay = renewal_delay(locked_until);
                if renewed {
                    delay = delay.max(MIN_RENEWAL_INTERVAL);
                }
                let wake_at = now + delay;
                tokio::select! {
                    biased;
                    _ = handle.cancel.cancelled() => {
                        handle.finish(RenewalStatus::Cancelled, None);
                        break;
                    }
                    _ = tokio::time::sleep_until(wake_at.min(deadline)) => {}
                }

                if Instant::now() >= deadline {
                    continue;
                }

                let result = tokio::select! {
                    biased;
                    _ = handle.cancel.cancelled() => {
                        handle.finish(RenewalStatus::Cancelled, None);
                        break;
                    }
                    result = renew() => result,
                };

                match result {
                    Ok(renewed_until) => {
                        locked_until = renewed_until;
                        renewed = true;
                        handle.with_state(|state| state.renewals += 1);
                        on_renewed(renewed_until);
                        debug!(lock = %label, locked_until = %renewed_until, "Lock renewed");
                    }
                    Err(e) => {
                        warn!(lock = %label, error = %e, "Lock renewal failed; renewal stopped");
                        handle.finish(RenewalStatus::Failed, Some(e.to_string()));
                        break;
                    }
                }
            }

            on_finished(&handle);
        });
    }
}

impl LockHandle for RenewalHandle {
    fn release(&self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// Lock Renewal Operator
// ============================================================================

/// Pass-through stream that keeps the lock of every delivered message alive
/// while it is in flight downstream.
///
/// Messages are yielded unchanged and in upstream order. A message's
/// registration ends when it is released through [`LockRenewalOperator::release`]
/// (or removed from the shared container by a settlement path), when a
/// renewal fails, or after the maximum renewal duration.
pub struct LockRenewalOperator<S: MessageSource> {
    upstream: S,
    renewer: Arc<dyn LockRenewer>,
    container: Arc<LockContainer<RenewalHandle>>,
    max_auto_renew: Duration,
    cancel: CancellationToken,
}

impl<S: MessageSource> LockRenewalOperator<S> {
    pub fn builder() -> LockRenewalOperatorBuilder<S> {
        LockRenewalOperatorBuilder::default()
    }

    /// Container holding the active registrations
    pub fn container(&self) -> &Arc<LockContainer<RenewalHandle>> {
        &self.container
    }

    /// End the registration for a settled message
    pub fn release(&self, message: &ReceivedMessage) -> bool {
        self.container.remove(message.lock_token().as_str())
    }

    /// Cancel every pending renewal and stop yielding messages. Idempotent.
    pub fn dispose(&self) {
        if !self.cancel.is_cancelled() {
            debug!(active = self.container.len(), "Disposing lock renewal operator");
        }
        self.cancel.cancel();
        self.container.clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn begin_renewal(&self, message: &ReceivedMessage) {
        if self.max_auto_renew.is_zero() {
            return;
        }

        let token = message.lock_token().clone();
        let handle = RenewalHandle::new(&self.cancel);
        self.container
            .add_or_update(token.as_str(), message.locked_until(), handle.clone());

        let renewer = Arc::clone(&self.renewer);
        let renew_token = token.clone();
        let renewed_message = message.clone();
        let update_container = Arc::clone(&self.container);
        let finish_container = Arc::clone(&self.container);
        let finish_token = token.clone();

        handle.start(
            token.to_string(),
            message.locked_until(),
            self.max_auto_renew,
            move || {
                let renewer = Arc::clone(&renewer);
                let token = renew_token.clone();
                async move { renewer.renew_message_lock(&token).await }
            },
            move |locked_until| {
                renewed_message.set_locked_until(locked_until);
                update_container.update_expiration(renewed_message.lock_token().as_str(), locked_until);
            },
            move |finished| {
                let id = finished.id();
                finish_container.remove_if(finish_token.as_str(), |current| current.id() == id);
            },
        );
    }
}

#[async_trait]
impl<S: MessageSource> MessageSource for LockRenewalOperator<S> {
    fn request(&mut self, credits: u64) {
        self.upstream.request(credits);
    }

    async fn next_message(&mut self) -> Option<Result<ReceivedMessage, ReceiverError>> {
        if self.cancel.is_cancelled() {
            return None;
        }

        let next = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            next = self.upstream.next_message() => next,
        };

        if let Some(Ok(message)) = &next {
            if message.is_lock_expired() {
                debug!(lock_token = %message.lock_token(), "Lock already expired on delivery; not renewing");
            } else {
                self.begin_renewal(message);
            }
        }
        next
    }
}

impl<S: MessageSource> Drop for LockRenewalOperator<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// Settlement
// ============================================================================

/// [`MessageSettler`] that ends a message's renewal registration once the
/// message has been settled, whatever the settlement outcome.
pub struct ReleasingSettler {
    inner: Arc<dyn MessageSettler>,
    container: Arc<LockContainer<RenewalHandle>>,
}

impl ReleasingSettler {
    pub fn new(inner: Arc<dyn MessageSettler>, container: Arc<LockContainer<RenewalHandle>>) -> Self {
        Self { inner, container }
    }

    pub fn container(&self) -> &Arc<LockContainer<RenewalHandle>> {
        &self.container
    }

    fn release(&self, message: &ReceivedMessage) {
        if self.container.remove(message.lock_token().as_str()) {
            debug!(lock_token = %message.lock_token(), "Lock renewal released on settlement");
        }
    }
}

#[async_trait]
impl MessageSettler for ReleasingSettler {
    async fn complete(&self, message: &ReceivedMessage) -> Result<(), ReceiverError> {
        let result = self.inner.complete(message).await;
        self.release(message);
        result
    }

    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), ReceiverError> {
        let result = self.inner.abandon(message).await;
        self.release(message);
        result
    }

    async fn dead_letter(&self, message: &ReceivedMessage, reason: &str) -> Result<(), ReceiverError> {
        let result = self.inner.dead_letter(message, reason).await;
        self.release(message);
        result
    }
}

/// Builder for [`LockRenewalOperator`]
pub struct LockRenewalOperatorBuilder<S> {
    upstream: Option<S>,
    renewer: Option<Arc<dyn LockRenewer>>,
    container: Option<Arc<LockContainer<RenewalHandle>>>,
    max_auto_renew: Duration,
}

impl<S> Default for LockRenewalOperatorBuilder<S> {
    fn default() -> Self {
        Self {
            upstream: None,
            renewer: None,
            container: None,
            max_auto_renew: Duration::from_secs(300),
        }
    }
}

impl<S: MessageSource> LockRenewalOperatorBuilder<S> {
    pub fn upstream(mut self, upstream: S) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn renewer(mut self, renewer: Arc<dyn LockRenewer>) -> Self {
        self.renewer = Some(renewer);
        self
    }

    pub fn container(mut self, container: Arc<LockContainer<RenewalHandle>>) -> Self {
        self.container = Some(container);
        self
    }

    /// Upper bound on how long one lock is renewed; zero disables renewal
    pub fn max_auto_renew_duration(mut self, duration: Duration) -> Self {
        self.max_auto_renew = duration;
        self
    }

    pub fn build(self) -> Result<LockRenewalOperator<S>, ReceiverError> {
        let upstream = self
            .upstream
            .ok_or_else(|| ReceiverError::invalid_argument("upstream", "a message source is required"))?;
        let renewer = self
            .renewer
            .ok_or_else(|| ReceiverError::invalid_argument("renewer", "a lock renewer is required"))?;
        let container = self
            .container
            .ok_or_else(|| ReceiverError::invalid_argument("container", "a lock container is required"))?;

        Ok(LockRenewalOperator {
            upstream,
            renewer,
            container,
            max_auto_renew: self.max_auto_renew,
            cancel: CancellationToken::new(),
        })
    }
}
