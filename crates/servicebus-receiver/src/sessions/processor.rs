//! Rolling session pump.
//!
//! Each worker acquires a session, keeps its lock alive, pumps its messages
//! through lock renewal and auto-complete, and releases the session once it
//! has been idle for the idle timeout. The worker then acquires the next
//! session. Workers run until the processor is closed.

use super::{Session, SessionAcquirer, SessionIdleTimer};
use crate::auto_complete::{AutoCompleteOperator, MessageHandler, SettlementSummary};
use crate::config::ReceiverConfig;
use crate::error::ReceiverError;
use crate::link::{LockRenewer, MessageSettler, MessageSource};
use crate::lock_container::LockContainer;
use crate::message::ReceivedMessage;
use crate::renewal::{LockRenewalOperator, ReleasingSettler};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tuning for [`SessionProcessor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProcessorOptions {
    pub max_concurrent_sessions: usize,
    /// Applies to both message and session locks; zero disables renewal
    pub max_auto_lock_renew_duration: Duration,
    pub session_idle_timeout: Duration,
    pub prefetch_count: u64,
}

impl Default for SessionProcessorOptions {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 1,
            max_auto_lock_renew_duration: Duration::from_secs(300),
            session_idle_timeout: Duration::from_secs(60),
            prefetch_count: 0,
        }
    }
}

impl From<&ReceiverConfig> for SessionProcessorOptions {
    fn from(config: &ReceiverConfig) -> Self {
        Self {
            max_concurrent_sessions: config.max_concurrent_sessions,
            max_auto_lock_renew_duration: config.max_auto_lock_renew_duration(),
            session_idle_timeout: config.session_idle_timeout(),
            prefetch_count: u64::from(config.prefetch_count),
        }
    }
}

struct ProcessorInner {
    acquirer: SessionAcquirer,
    settler: Arc<dyn MessageSettler>,
    renewer: Arc<dyn LockRenewer>,
    options: SessionProcessorOptions,
    cancel: CancellationToken,
}

/// Processes sessions one after another on up to
/// `max_concurrent_sessions` workers
pub struct SessionProcessor {
    inner: Arc<ProcessorInner>,
}

impl SessionProcessor {
    pub fn new(
        acquirer: SessionAcquirer,
        settler: Arc<dyn MessageSettler>,
        renewer: Arc<dyn LockRenewer>,
        options: SessionProcessorOptions,
    ) -> Result<Self, ReceiverError> {
        Self::with_cancellation(acquirer, settler, renewer, options, CancellationToken::new())
    }

    /// Build a processor that also stops when `cancel` is cancelled
    pub(crate) fn with_cancellation(
        acquirer: SessionAcquirer,
        settler: Arc<dyn MessageSettler>,
        renewer: Arc<dyn LockRenewer>,
        options: SessionProcessorOptions,
        cancel: CancellationToken,
    ) -> Result<Self, ReceiverError> {
        if options.max_concurrent_sessions == 0 {
            return Err(ReceiverError::invalid_argument(
                "max_concurrent_sessions",
                "must be greater than zero",
            ));
        }

        if options.session_idle_timeout.is_zero() {
            return Err(ReceiverError::invalid_argument(
                "session_idle_timeout",
                "must be greater than zero",
            ));
        }

        Ok(Self {
            inner: Arc::new(ProcessorInner {
                acquirer,
                settler,
                renewer,
                options,
                cancel,
            }),
        })
    }

    pub fn options(&self) -> &SessionProcessorOptions {
        &self.inner.options
    }

    /// Token that stops every worker when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Stop acquiring sessions and release the active ones. Idempotent.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Run the workers until the processor is closed.
    ///
    /// Returns the combined settlement counts, or the first acquisition
    /// error that is not a timeout. Such an error stops every worker, as
    /// does a worker whose handler panicked.
    pub async fn run<H>(&self, handler: Arc<H>) -> Result<SettlementSummary, ReceiverError>
    where
        H: MessageHandler + 'static,
    {
        let mut workers = JoinSet::new();
        for worker in 0..self.inner.options.max_concurrent_sessions {
            let inner = Arc::clone(&self.inner);
            let handler = Arc::clone(&handler);
            workers.spawn(async move { inner.pump_sessions(worker, handler.as_ref()).await });
        }

        let mut total = SettlementSummary::default();
        let mut first_error = None;

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(summary)) => total += summary,
                Ok(Err(e)) => {
                    warn!(error = %e, "Session worker failed; stopping processor");
                    self.inner.cancel.cancel();
                    first_error.get_or_insert(e);
                }
                Err(join_error) => {
                    error!(error = %join_error, "Session worker panicked; stopping processor");
                    self.inner.cancel.cancel();
                    first_error.get_or_insert(ReceiverError::WorkerFailed {
                        message: join_error.to_string(),
                    });
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }
}

impl Drop for SessionProcessor {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl ProcessorInner {
    async fn pump_sessions<H>(&self, worker: usize, handler: &H) -> Result<SettlementSummary, ReceiverError>
    where
        H: MessageHandler + ?Sized,
    {
        let mut total = SettlementSummary::default();

        loop {
            let acquired = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                acquired = self.acquirer.acquire(None) => acquired,
            };

            let session = match acquired {
                Ok(session) => session,
                Err(e @ ReceiverError::SessionAcquireTimeout { .. }) => {
                    debug!(worker, error = %e, "No session available");
                    tokio::task::yield_now().await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            total += self.pump_session(worker, session, handler).await;
        }

        debug!(worker, "Session worker stopped");
        Ok(total)
    }

    /// Drive one session until it is idle, its link closes or the
    /// processor is closed. Session-level failures are logged and end only
    /// this session.
    async fn pump_session<H>(&self, worker: usize, mut session: Session, handler: &H) -> SettlementSummary
    where
        H: MessageHandler + ?Sized,
    {
        let session_id = session.id().clone();
        session.begin_lock_renew(self.options.max_auto_lock_renew_duration);

        let summary = match session.take_messages() {
            Some(messages) => self.run_pipeline(messages, handler).await,
            None => Ok(SettlementSummary::default()),
        };

        if let Err(e) = session.dispose().await {
            debug!(worker, session_id = %session_id, error = %e, "Session close failed");
        }

        match summary {
            Ok(summary) => {
                info!(
                    worker,
                    session_id = %session_id,
                    completed = summary.completed,
                    abandoned = summary.abandoned,
                    "Session released"
                );
                summary
            }
            Err(e) => {
                warn!(worker, session_id = %session_id, error = %e, "Session processing failed");
                SettlementSummary::default()
            }
        }
    }

    async fn run_pipeline<H>(
        &self,
        messages: Box<dyn MessageSource>,
        handler: &H,
    ) -> Result<SettlementSummary, ReceiverError>
    where
        H: MessageHandler + ?Sized,
    {
        let container = Arc::new(LockContainer::new());

        let renewing = LockRenewalOperator::builder()
            .upstream(IdleTrackingSource::new(messages, self.options.session_idle_timeout))
            .renewer(Arc::clone(&self.renewer))
            .container(Arc::clone(&container))
            .max_auto_renew_duration(self.options.max_auto_lock_renew_duration)
            .build()?;

        let mut operator = AutoCompleteOperator::builder()
            .upstream(renewing)
            .settler(Arc::new(ReleasingSettler::new(Arc::clone(&self.settler), container)))
            .prefetch(self.options.prefetch_count)
            .parent_token(&self.cancel)
            .build()?;

        operator.run(handler).await
    }
}

/// Ends the session's message stream once the session has waited
/// `session_idle_timeout` for its next message.
///
/// The countdown restarts on every pull, so time spent handling and
/// settling the previous message never counts as idle.
struct IdleTrackingSource<S> {
    inner: S,
    timer: SessionIdleTimer,
}

impl<S> IdleTrackingSource<S> {
    fn new(inner: S, idle_timeout: Duration) -> Self {
        Self {
            inner,
            timer: SessionIdleTimer::new(idle_timeout),
        }
    }

    fn restart_countdown(&mut self) {
        if !self.timer.reset() {
            self.timer = SessionIdleTimer::new(self.timer.idle_timeout());
        }
    }
}

#[async_trait]
impl<S: MessageSource> MessageSource for IdleTrackingSource<S> {
    fn request(&mut self, credits: u64) {
        self.inner.request(credits);
    }

    async fn next_message(&mut self) -> Option<Result<ReceivedMessage, ReceiverError>> {
        self.restart_countdown();

        // A message that is already waiting wins over an elapsed timer
        tokio::select! {
            biased;
            next = self.inner.next_message() => next,
            _ = self.timer.timeout() => {
                debug!("Session idle; ending message stream");
                None
            }
        }
    }
}

#[cfg(test)]
#[path = "processor_tests.rs"]
mod tests;
