//! Receiver client composing the receive pipeline.
//!
//! [`ServiceBusReceiverClient`] wires a [`ConnectionProvider`] link through
//! lock renewal and either auto-settlement ([`ServiceBusReceiverClient::process`])
//! or the bounded pull adapter ([`ServiceBusReceiverClient::receive_messages`]).
//! Manual settlement through the client also ends the message's lock renewal.

use crate::auto_complete::{AutoCompleteOperator, MessageHandler, SettlementSummary};
use crate::config::ReceiverConfig;
use crate::error::ReceiverError;
use crate::link::{ConnectionProvider, LockRenewer, MessageSettler, MessageSource};
use crate::lock_container::LockContainer;
use crate::message::ReceivedMessage;
use crate::renewal::{LockRenewalOperator, ReleasingSettler, RenewalHandle};
use crate::sessions::{SessionAcquirer, SessionProcessor, SessionProcessorOptions};
use crate::synchronous::{collect_messages, SynchronousMessageSubscriber};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Millisecond count for a configured duration.
///
/// Non-zero durations below one millisecond round up so they never read as
/// the zero that disables a feature.
fn whole_millis(duration: Duration) -> u64 {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    if millis == 0 && !duration.is_zero() {
        1
    } else {
        millis
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`ServiceBusReceiverClient`]
#[derive(Default)]
pub struct ReceiverClientBuilder {
    config: ReceiverConfig,
    connection: Option<Arc<dyn ConnectionProvider>>,
    settler: Option<Arc<dyn MessageSettler>>,
    renewer: Option<Arc<dyn LockRenewer>>,
    runtime: Option<Handle>,
}

impl ReceiverClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every setting with `config`
    pub fn with_config(mut self, config: ReceiverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn entity_path(mut self, entity_path: impl Into<String>) -> Self {
        self.config.entity_path = entity_path.into();
        self
    }

    pub fn prefetch_count(mut self, prefetch_count: u32) -> Self {
        self.config.prefetch_count = prefetch_count;
        self
    }

    /// Zero disables lock renewal
    pub fn max_auto_lock_renew_duration(mut self, duration: Duration) -> Self {
        self.config.max_auto_lock_renew_millis = whole_millis(duration);
        self
    }

    /// Leave settlement of processed messages to the handler
    pub fn disable_auto_complete(mut self) -> Self {
        self.config.auto_complete = false;
        self
    }

    pub fn try_timeout(mut self, timeout: Duration) -> Self {
        self.config.try_timeout_millis = whole_millis(timeout);
        self
    }

    pub fn session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_idle_timeout_millis = whole_millis(timeout);
        self
    }

    pub fn disable_session_timeout_retry(mut self) -> Self {
        self.config.disable_session_timeout_retry = true;
        self
    }

    pub fn max_concurrent_sessions(mut self, sessions: usize) -> Self {
        self.config.max_concurrent_sessions = sessions;
        self
    }

    pub fn connection(mut self, connection: Arc<dyn ConnectionProvider>) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn settler(mut self, settler: Arc<dyn MessageSettler>) -> Self {
        self.settler = Some(settler);
        self
    }

    pub fn renewer(mut self, renewer: Arc<dyn LockRenewer>) -> Self {
        self.renewer = Some(renewer);
        self
    }

    /// Use one broker for links, settlement and lock renewal
    pub fn broker<B>(self, broker: Arc<B>) -> Self
    where
        B: ConnectionProvider + MessageSettler + LockRenewer + 'static,
    {
        self.connection(Arc::clone(&broker) as Arc<dyn ConnectionProvider>)
            .settler(Arc::clone(&broker) as Arc<dyn MessageSettler>)
            .renewer(broker as Arc<dyn LockRenewer>)
    }

    /// Runtime driving background tasks and blocking receives.
    ///
    /// Defaults to the runtime `build` is called on, if any.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn build(self) -> Result<ServiceBusReceiverClient, ReceiverError> {
        self.config.validate()?;

        let connection = self
            .connection
            .ok_or_else(|| ReceiverError::invalid_argument("connection", "a connection provider is required"))?;
        let settler = self
            .settler
            .ok_or_else(|| ReceiverError::invalid_argument("settler", "a message settler is required"))?;
        let renewer = self
            .renewer
            .ok_or_else(|| ReceiverError::invalid_argument("renewer", "a lock renewer is required"))?;

        let runtime = self.runtime.or_else(|| Handle::try_current().ok());
        let container = Arc::new(LockContainer::new());
        if let Some(handle) = &runtime {
            let _guard = handle.enter();
            container.spawn_cleanup(self.config.lock_cleanup_interval());
        }

        info!(
            entity_path = %self.config.entity_path,
            auto_complete = self.config.auto_complete,
            prefetch_count = self.config.prefetch_count,
            "Receiver client created"
        );

        Ok(ServiceBusReceiverClient {
            releasing: Arc::new(ReleasingSettler::new(Arc::clone(&settler), Arc::clone(&container))),
            config: self.config,
            connection,
            settler,
            renewer,
            container,
            subscriber: Mutex::new(None),
            cancel: CancellationToken::new(),
            runtime,
        })
    }
}

// ============================================================================
// Client
// ============================================================================

/// Receiver bound to one queue or subscription
pub struct ServiceBusReceiverClient {
    config: ReceiverConfig,
    connection: Arc<dyn ConnectionProvider>,
    settler: Arc<dyn MessageSettler>,
    releasing: Arc<ReleasingSettler>,
    renewer: Arc<dyn LockRenewer>,
    container: Arc<LockContainer<RenewalHandle>>,
    subscriber: Mutex<Option<SynchronousMessageSubscriber>>,
    cancel: CancellationToken,
    runtime: Option<Handle>,
}

impl ServiceBusReceiverClient {
    pub fn builder() -> ReceiverClientBuilder {
        ReceiverClientBuilder::new()
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn entity_path(&self) -> &str {
        &self.config.entity_path
    }

    /// Messages whose locks are currently being renewed
    pub fn active_lock_count(&self) -> usize {
        self.container.len()
    }

    /// Pump messages through `handler` until the link closes or the client is closed.
    ///
    /// With auto-complete enabled each message is completed when the handler
    /// succeeds and abandoned when it fails. Otherwise the handler settles
    /// messages itself through [`complete`](Self::complete) and friends; those
    /// messages are counted as skipped.
    pub async fn process<H>(&self, handler: &H) -> Result<SettlementSummary, ReceiverError>
    where
        H: MessageHandler + ?Sized,
    {
        self.ensure_open()?;
        let renewing = self.open_renewing_link().await?;

        if self.config.auto_complete {
            let mut operator = AutoCompleteOperator::builder()
                .upstream(renewing)
                .settler(Arc::clone(&self.releasing) as Arc<dyn MessageSettler>)
                .prefetch(self.prefetch())
                .parent_token(&self.cancel)
                .build()?;
            return operator.run(handler).await;
        }

        deliver_unsettled(renewing, self.prefetch(), &self.cancel, handler).await
    }

    /// Receive up to `count` messages, waiting at most `timeout`.
    ///
    /// Fewer messages (possibly none) are returned when the timeout elapses
    /// first. Requests are served in call order.
    pub async fn receive_messages(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, ReceiverError> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;

        let receiver = {
            let mut subscriber = self.subscriber.lock().await;
            if subscriber.is_none() {
                let renewing = self.open_renewing_link().await?;
                debug!(entity_path = %self.config.entity_path, "Starting synchronous receive subscriber");
                *subscriber = Some(SynchronousMessageSubscriber::new(
                    renewing,
                    self.prefetch(),
                    self.config.max_wait_between_messages(),
                ));
            }

            match subscriber.as_ref() {
                Some(subscriber) => subscriber.receive(count, timeout)?,
                None => return Err(ReceiverError::Disposed),
            }
        };

        collect_messages(receiver, deadline).await
    }

    /// Blocking form of [`receive_messages`](Self::receive_messages).
    ///
    /// Must be called from a thread that is not driving an async runtime; the
    /// work runs on the client's runtime handle, which must belong to a
    /// multi-threaded runtime.
    pub fn receive_messages_blocking(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, ReceiverError> {
        if Handle::try_current().is_ok() {
            return Err(ReceiverError::invalid_argument(
                "runtime",
                "blocking receive cannot be called from within an async runtime",
            ));
        }

        let handle = self
            .runtime
            .as_ref()
            .ok_or_else(|| ReceiverError::invalid_argument("runtime", "no tokio runtime handle is configured"))?;

        handle.block_on(self.receive_messages(count, timeout))
    }

    pub async fn complete(&self, message: &ReceivedMessage) -> Result<(), ReceiverError> {
        self.claim(message)?;
        self.releasing.complete(message).await
    }

    pub async fn abandon(&self, message: &ReceivedMessage) -> Result<(), ReceiverError> {
        self.claim(message)?;
        self.releasing.abandon(message).await
    }

    pub async fn dead_letter(&self, message: &ReceivedMessage, reason: &str) -> Result<(), ReceiverError> {
        self.claim(message)?;
        self.releasing.dead_letter(message, reason).await
    }

    /// Rolling session pump over this client's entity and collaborators.
    ///
    /// The processor stops when either it or the client is closed.
    pub fn session_processor(&self) -> Result<SessionProcessor, ReceiverError> {
        self.ensure_open()?;

        let acquirer = SessionAcquirer::new(
            Arc::clone(&self.connection),
            &self.config.entity_path,
            self.config.try_timeout(),
            self.config.disable_session_timeout_retry,
        )?
        .with_retry_delay(self.config.session_retry_delay());

        SessionProcessor::with_cancellation(
            acquirer,
            Arc::clone(&self.settler),
            Arc::clone(&self.renewer),
            SessionProcessorOptions::from(&self.config),
            self.cancel.child_token(),
        )
    }

    /// Stop every pump, pending receive and lock renewal. Idempotent.
    pub async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }

        info!(
            entity_path = %self.config.entity_path,
            active_locks = self.container.len(),
            "Closing receiver client"
        );
        self.cancel.cancel();
        self.container.clear();

        if let Some(subscriber) = self.subscriber.lock().await.take() {
            subscriber.dispose();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn ensure_open(&self) -> Result<(), ReceiverError> {
        if self.cancel.is_cancelled() {
            return Err(ReceiverError::Disposed);
        }
        Ok(())
    }

    fn prefetch(&self) -> u64 {
        u64::from(self.config.prefetch_count)
    }

    /// Mark `message` settled, failing if it already was
    fn claim(&self, message: &ReceivedMessage) -> Result<(), ReceiverError> {
        self.ensure_open()?;
        if !message.mark_settled() {
            return Err(ReceiverError::invalid_argument(
                "message",
                format!("message with lock token {} is already settled", message.lock_token()),
            ));
        }
        Ok(())
    }

    async fn open_renewing_link(
        &self,
    ) -> Result<LockRenewalOperator<Box<dyn MessageSource>>, ReceiverError> {
        let link = self.connection.create_receive_link(&self.config.entity_path).await?;

        LockRenewalOperator::builder()
            .upstream(link)
            .renewer(Arc::clone(&self.renewer))
            .container(Arc::clone(&self.container))
            .max_auto_renew_duration(self.config.max_auto_lock_renew_duration())
            .build()
    }
}

impl Drop for ServiceBusReceiverClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.container.clear();
    }
}

/// Hand each message to `handler` without settling it
async fn deliver_unsettled<S, H>(
    mut upstream: S,
    prefetch: u64,
    cancel: &CancellationToken,
    handler: &H,
) -> Result<SettlementSummary, ReceiverError>
where
    S: MessageSource,
    H: MessageHandler + ?Sized,
{
    let mut summary = SettlementSummary::default();
    upstream.request(prefetch.max(1));

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = upstream.next_message() => next,
        };

        let message = match next {
            None => break,
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(e),
        };

        if let Err(e) = handler.handle(message.clone()).await {
            warn!(lock_token = %message.lock_token(), error = %e, "Message handler failed; message left to its lock");
        }
        summary.skipped += 1;
        upstream.request(1);
    }

    Ok(summary)
}
