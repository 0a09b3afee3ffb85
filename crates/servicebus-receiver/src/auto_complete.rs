//! Automatic settlement of handled messages.
//!
//! [`AutoCompleteOperator`] pulls one message at a time from its upstream,
//! hands it to a [`MessageHandler`], then completes the message when the
//! handler succeeds or abandons it when the handler fails. A failing handler
//! never ends the stream; only upstream errors and settlement failures do.

use crate::error::ReceiverError;
use crate::link::{MessageSettler, MessageSource};
use crate::message::ReceivedMessage;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "auto_complete_tests.rs"]
mod tests;

/// User processing logic applied to each received message
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one message. An `Err` abandons the message.
    async fn handle(&self, message: ReceivedMessage) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(ReceivedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: ReceivedMessage) -> anyhow::Result<()> {
        (self)(message).await
    }
}

/// Settlement counts of one [`AutoCompleteOperator::run`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettlementSummary {
    pub completed: u64,
    pub abandoned: u64,
    /// Messages the handler settled itself
    pub skipped: u64,
}

impl std::ops::AddAssign for SettlementSummary {
    fn add_assign(&mut self, other: Self) {
        self.completed += other.completed;
        self.abandoned += other.abandoned;
        self.skipped += other.skipped;
    }
}

/// Stream wrapper settling every message after it has been handled
pub struct AutoCompleteOperator<S: MessageSource> {
    upstream: S,
    settler: Arc<dyn MessageSettler>,
    prefetch: u64,
    cancel: CancellationToken,
}

impl<S: MessageSource> AutoCompleteOperator<S> {
    pub fn builder() -> AutoCompleteOperatorBuilder<S> {
        AutoCompleteOperatorBuilder::default()
    }

    /// Token that disposes the operator when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop pulling and settling messages. Idempotent.
    pub fn dispose(&self) {
        self.cancel.cancel();
    }

    /// Drive the stream to completion through `handler`.
    ///
    /// Returns when the upstream ends or the operator is disposed. Upstream
    /// errors and settlement failures end the run with that error.
    pub async fn run<H>(&mut self, handler: &H) -> Result<SettlementSummary, ReceiverError>
    where
        H: MessageHandler + ?Sized,
    {
        let mut summary = SettlementSummary::default();
        self.upstream.request(self.prefetch);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = self.upstream.next_message() => next,
            };

            let message = match next {
                None => break,
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    warn!(error = %e, "Upstream failed; stopping auto-complete");
                    return Err(e);
                }
            };

            let outcome = handler.handle(message.clone()).await;

            if self.cancel.is_cancelled() {
                debug!(lock_token = %message.lock_token(), "Disposed while handling; message left unsettled");
                break;
            }

            settle(&self.settler, &self.cancel, &message, outcome, &mut summary).await?;
            self.upstream.request(1);
        }

        Ok(summary)
    }
}

impl<S: MessageSource> Drop for AutoCompleteOperator<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Settle one handled message unless the handler already did.
///
/// A settlement failure cancels the operator.
async fn settle(
    settler: &Arc<dyn MessageSettler>,
    cancel: &CancellationToken,
    message: &ReceivedMessage,
    outcome: anyhow::Result<()>,
    summary: &mut SettlementSummary,
) -> Result<(), ReceiverError> {
    if !message.mark_settled() {
        debug!(lock_token = %message.lock_token(), "Message already settled by handler");
        summary.skipped += 1;
        return Ok(());
    }

    let result = match outcome {
        Ok(()) => {
            summary.completed += 1;
            settler.complete(message).await
        }
        Err(e) => {
            warn!(
                lock_token = %message.lock_token(),
                sequence_number = message.sequence_number(),
                error = %e,
                "Message handler failed; abandoning message"
            );
            summary.abandoned += 1;
            settler.abandon(message).await
        }
    };

    if let Err(e) = result {
        warn!(lock_token = %message.lock_token(), error = %e, "Settlement failed; stopping auto-complete");
        cancel.cancel();
        return Err(e);
    }
    Ok(())
}

/// Builder for [`AutoCompleteOperator`]
pub struct AutoCompleteOperatorBuilder<S> {
    upstream: Option<S>,
    settler: Option<Arc<dyn MessageSettler>>,
    prefetch: u64,
    parent: Option<CancellationToken>,
}

impl<S> Default for AutoCompleteOperatorBuilder<S> {
    fn default() -> Self {
        Self {
            upstream: None,
            settler: None,
            prefetch: 1,
            parent: None,
        }
    }
}

impl<S: MessageSource> AutoCompleteOperatorBuilder<S> {
    pub fn upstream(mut self, upstream: S) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Settlement capability providing both complete and abandon
    pub fn settler(mut self, settler: Arc<dyn MessageSettler>) -> Self {
        self.settler = Some(settler);
        self
    }

    /// Credit granted before the first message (at least 1)
    pub fn prefetch(mut self, prefetch: u64) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    /// Dispose the operator together with `parent`
    pub fn parent_token(mut self, parent: &CancellationToken) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    pub fn build(self) -> Result<AutoCompleteOperator<S>, ReceiverError> {
        let upstream = self
            .upstream
            .ok_or_else(|| ReceiverError::invalid_argument("upstream", "a message source is required"))?;
        let settler = self
            .settler
            .ok_or_else(|| ReceiverError::invalid_argument("settler", "a message settler is required"))?;

        Ok(AutoCompleteOperator {
            upstream,
            settler,
            prefetch: self.prefetch,
            cancel: match &self.parent {
                Some(parent) => parent.child_token(),
                None => CancellationToken::new(),
            },
        })
    }
}
