//! Capabilities consumed from the transport and management layers.
//!
//! Link lifecycle, credit accounting on the wire and CBS authentication are
//! owned by the transport. The pipeline only needs the narrow operations
//! below, each keyed by lock token or session.

use crate::error::ReceiverError;
use crate::message::{LockToken, ReceivedMessage, SessionId, Timestamp};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[cfg(test)]
#[path = "link_tests.rs"]
mod tests;

/// Pull-based message stream with credit-based flow control
#[async_trait]
pub trait MessageSource: Send {
    /// Allow the transport to deliver `credits` more messages
    fn request(&mut self, credits: u64);

    /// Next delivered message; `None` once the link is closed
    async fn next_message(&mut self) -> Option<Result<ReceivedMessage, ReceiverError>>;
}

/// Broker-visible message dispositions
#[async_trait]
pub trait MessageSettler: Send + Sync {
    /// Acknowledge and remove the message
    async fn complete(&self, message: &ReceivedMessage) -> Result<(), ReceiverError>;

    /// Release the lock so the message is redelivered
    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), ReceiverError>;

    /// Move the message to the dead-letter sub-queue
    async fn dead_letter(&self, message: &ReceivedMessage, reason: &str) -> Result<(), ReceiverError>;
}

/// Message lock renewal through the management link
#[async_trait]
pub trait LockRenewer: Send + Sync {
    /// Extend the lock and return its new expiry
    async fn renew_message_lock(&self, lock_token: &LockToken) -> Result<Timestamp, ReceiverError>;
}

/// Control side of a receive link bound to one session
#[async_trait]
pub trait SessionLink: Send + Sync {
    /// Session the broker assigned to this link
    fn session_id(&self) -> &SessionId;

    fn session_locked_until(&self) -> Timestamp;

    /// Extend the session lock and return its new expiry
    async fn renew_session_lock(&self) -> Result<Timestamp, ReceiverError>;

    /// Detach the link and release the session
    async fn close(&self) -> Result<(), ReceiverError>;
}

/// Factory for receive links
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn create_receive_link(
        &self,
        entity_path: &str,
    ) -> Result<Box<dyn MessageSource>, ReceiverError>;

    /// Create a link for `session_id`, or for the next available session when `None`
    async fn create_session_link(
        &self,
        entity_path: &str,
        session_id: Option<SessionId>,
    ) -> Result<SessionReceiveLink, ReceiverError>;
}

/// A session link split into its control and message halves
pub struct SessionReceiveLink {
    pub control: Arc<dyn SessionLink>,
    pub messages: Box<dyn MessageSource>,
}

impl std::fmt::Debug for SessionReceiveLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionReceiveLink")
            .field("session_id", self.control.session_id())
            .finish_non_exhaustive()
    }
}

/// [`MessageSource`] over a tokio channel.
///
/// Credit granted through [`MessageSource::request`] is only recorded; the
/// producer side may read it through [`ChannelSource::credit_counter`].
pub struct ChannelSource {
    receiver: mpsc::Receiver<Result<ReceivedMessage, ReceiverError>>,
    requested: Arc<AtomicU64>,
}

impl ChannelSource {
    pub fn new(receiver: mpsc::Receiver<Result<ReceivedMessage, ReceiverError>>) -> Self {
        Self {
            receiver,
            requested: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a bounded channel and the source reading from it
    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<ReceivedMessage, ReceiverError>>, Self) {
        let (sender, receiver) = mpsc::channel(capacity);
        (sender, Self::new(receiver))
    }

    /// Total credit granted so far
    pub fn credit_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.requested)
    }
}

#[async_trait]
impl MessageSource for ChannelSource {
    fn request(&mut self, credits: u64) {
        self.requested.fetch_add(credits, Ordering::SeqCst);
    }

    async fn next_message(&mut self) -> Option<Result<ReceivedMessage, ReceiverError>> {
        self.receiver.recv().await
    }
}

#[async_trait]
impl MessageSource for Box<dyn MessageSource> {
    fn request(&mut self, credits: u64) {
        (**self).request(credits)
    }

    async fn next_message(&mut self) -> Option<Result<ReceivedMessage, ReceiverError>> {
        (**self).next_message().await
    }
}
