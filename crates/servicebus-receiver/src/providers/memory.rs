//! In-memory broker for testing and development.
//!
//! This module provides a self-contained broker that:
//! - Issues lock tokens and lock expiries on delivery
//! - Redelivers abandoned messages and messages whose lock lapsed
//! - Dead-letters messages past the maximum delivery count
//! - Grants exclusive session locks to session links
//!
//! [`InMemoryBroker`] implements every collaborator capability the receive
//! pipeline consumes, so a full client can run without a real namespace.

use crate::error::ReceiverError;
use crate::link::{
    ConnectionProvider, LockRenewer, MessageSettler, MessageSource, SessionLink, SessionReceiveLink,
};
use crate::message::{LockToken, ReceivedMessage, SessionId, Timestamp};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Dead-letter reason used when the delivery count is exceeded
pub const MAX_DELIVERY_COUNT_EXCEEDED: &str = "MaxDeliveryCountExceeded";

/// Configuration for [`InMemoryBroker`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMemoryBrokerConfig {
    /// Lock duration granted on delivery and on every renewal
    pub lock_duration: Duration,
    pub session_lock_duration: Duration,
    /// Deliveries after which a message is dead-lettered instead
    pub max_delivery_count: u32,
    /// How long a session link request waits before the broker reports a timeout
    pub session_accept_timeout: Duration,
}

impl Default for InMemoryBrokerConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(30),
            session_lock_duration: Duration::from_secs(30),
            max_delivery_count: 10,
            session_accept_timeout: Duration::from_secs(1),
        }
    }
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

#[derive(Default)]
struct BrokerStorage {
    entities: HashMap<String, EntityState>,
    /// In-flight messages of every entity, keyed by lock token
    in_flight: HashMap<String, InFlightMessage>,
}

impl BrokerStorage {
    fn entity(&mut self, entity_path: &str) -> &mut EntityState {
        self.entities.entry(entity_path.to_string()).or_default()
    }

    /// Return lapsed locks of `entity_path` to the queue
    fn reclaim_expired(&mut self, entity_path: &str) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, in_flight)| in_flight.entity_path == entity_path && in_flight.locked_until.is_past())
            .map(|(token, _)| token.clone())
            .collect();

        for token in expired {
            if let Some(in_flight) = self.in_flight.remove(&token) {
                debug!(lock_token = %token, "Message lock expired; redelivering");
                self.entity(entity_path).requeue(in_flight.message);
            }
        }
    }

    /// Remove a live in-flight message for settlement
    fn take_locked(&mut self, lock_token: &LockToken) -> Result<InFlightMessage, ReceiverError> {
        let in_flight = self
            .in_flight
            .remove(lock_token.as_str())
            .ok_or_else(|| ReceiverError::MessageLockLost {
                lock_token: lock_token.to_string(),
            })?;

        if in_flight.locked_until.is_past() {
            let entity_path = in_flight.entity_path.clone();
            self.entity(&entity_path).requeue(in_flight.message);
            return Err(ReceiverError::MessageLockLost {
                lock_token: lock_token.to_string(),
            });
        }
        Ok(in_flight)
    }
}

#[derive(Default)]
struct EntityState {
    /// Available messages in sequence order
    messages: VecDeque<StoredMessage>,
    dead_letter: Vec<DeadLetteredMessage>,
    completed: Vec<i64>,
    sessions: HashMap<SessionId, SessionState>,
    next_sequence: i64,
}

impl EntityState {
    fn enqueue(&mut self, body: Bytes, session_id: Option<SessionId>) -> i64 {
        self.next_sequence += 1;
        self.messages.push_back(StoredMessage {
            message_id: uuid::Uuid::new_v4().to_string(),
            sequence_number: self.next_sequence,
            body,
            session_id,
            delivery_count: 0,
        });
        self.next_sequence
    }

    /// Put a message back in sequence order
    fn requeue(&mut self, message: StoredMessage) {
        let position = self
            .messages
            .iter()
            .position(|m| m.sequence_number > message.sequence_number)
            .unwrap_or(self.messages.len());
        self.messages.insert(position, message);
    }

    fn take_next(&mut self, session_id: Option<&SessionId>) -> Option<StoredMessage> {
        let position = self
            .messages
            .iter()
            .position(|m| m.session_id.as_ref() == session_id)?;
        self.messages.remove(position)
    }

    /// First session with pending messages that nobody holds
    fn next_available_session(&self) -> Option<SessionId> {
        self.messages
            .iter()
            .filter_map(|m| m.session_id.as_ref())
            .find(|id| !self.sessions.get(*id).map(SessionState::is_locked).unwrap_or(false))
            .cloned()
    }
}

#[derive(Clone)]
struct StoredMessage {
    message_id: String,
    sequence_number: i64,
    body: Bytes,
    session_id: Option<SessionId>,
    delivery_count: u32,
}

struct InFlightMessage {
    entity_path: String,
    message: StoredMessage,
    locked_until: Timestamp,
}

/// A message moved to the dead-letter sub-queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetteredMessage {
    pub sequence_number: i64,
    pub reason: String,
}

struct SessionState {
    locked_until: Timestamp,
    link_id: u64,
}

impl SessionState {
    fn is_locked(&self) -> bool {
        !self.locked_until.is_past()
    }
}

struct BrokerInner {
    storage: RwLock<BrokerStorage>,
    /// Signalled whenever messages or sessions become available
    available: Notify,
    next_link_id: AtomicU64,
    config: InMemoryBrokerConfig,
}

impl BrokerInner {
    fn read(&self) -> RwLockReadGuard<'_, BrokerStorage> {
        match self.storage.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, BrokerStorage> {
        match self.storage.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Deliver the next message for a plain link (`None`) or a session
    fn deliver(&self, entity_path: &str, session_id: Option<&SessionId>) -> Option<ReceivedMessage> {
        let mut storage = self.write();
        storage.reclaim_expired(entity_path);

        loop {
            let mut message = storage.entity(entity_path).take_next(session_id)?;
            message.delivery_count += 1;

            if message.delivery_count > self.config.max_delivery_count {
                debug!(
                    sequence_number = message.sequence_number,
                    delivery_count = message.delivery_count,
                    "Maximum delivery count exceeded; dead-lettering"
                );
                storage.entity(entity_path).dead_letter.push(DeadLetteredMessage {
                    sequence_number: message.sequence_number,
                    reason: MAX_DELIVERY_COUNT_EXCEEDED.to_string(),
                });
                continue;
            }

            let lock_token = LockToken::generate();
            let locked_until = Timestamp::after(self.config.lock_duration);
            let mut received = ReceivedMessage::new(
                lock_token.clone(),
                message.sequence_number,
                locked_until,
                message.body.clone(),
            )
            .with_message_id(message.message_id.clone())
            .with_delivery_count(message.delivery_count);
            if let Some(session_id) = &message.session_id {
                received = received.with_session_id(session_id.clone());
            }

            storage.in_flight.insert(
                lock_token.to_string(),
                InFlightMessage {
                    entity_path: entity_path.to_string(),
                    message,
                    locked_until,
                },
            );
            return Some(received);
        }
    }

    /// Time until the earliest in-flight lock of `entity_path` lapses
    fn next_lock_expiry(&self, entity_path: &str) -> Option<Duration> {
        self.read()
            .in_flight
            .values()
            .filter(|in_flight| in_flight.entity_path == entity_path)
            .map(|in_flight| in_flight.locked_until.remaining())
            .min()
    }

    /// Lock `requested`, or the next available session, for a new link
    fn try_lock_session(&self, entity_path: &str, requested: Option<&SessionId>) -> Option<(SessionId, u64)> {
        let mut storage = self.write();
        let entity = storage.entity(entity_path);

        let session_id = match requested {
            Some(id) => {
                let held = entity.sessions.get(id).map(SessionState::is_locked).unwrap_or(false);
                if held {
                    return None;
                }
                id.clone()
            }
            None => entity.next_available_session()?,
        };

        let link_id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        entity.sessions.insert(
            session_id.clone(),
            SessionState {
                locked_until: Timestamp::after(self.config.session_lock_duration),
                link_id,
            },
        );
        Some((session_id, link_id))
    }
}

// ============================================================================
// InMemoryBroker
// ============================================================================

/// In-memory broker implementing the transport and management capabilities
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new(config: InMemoryBrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                storage: RwLock::new(BrokerStorage::default()),
                available: Notify::new(),
                next_link_id: AtomicU64::new(1),
                config,
            }),
        }
    }

    pub fn config(&self) -> &InMemoryBrokerConfig {
        &self.inner.config
    }

    /// Enqueue a message and return its sequence number
    pub fn send(&self, entity_path: &str, body: impl Into<Bytes>) -> i64 {
        let sequence_number = self.inner.write().entity(entity_path).enqueue(body.into(), None);
        self.inner.available.notify_waiters();
        sequence_number
    }

    /// Enqueue a message for `session_id` and return its sequence number
    pub fn send_to_session(&self, entity_path: &str, session_id: &SessionId, body: impl Into<Bytes>) -> i64 {
        let sequence_number = self
            .inner
            .write()
            .entity(entity_path)
            .enqueue(body.into(), Some(session_id.clone()));
        self.inner.available.notify_waiters();
        sequence_number
    }

    /// Messages waiting for delivery, excluding in-flight ones
    pub fn active_message_count(&self, entity_path: &str) -> usize {
        self.inner
            .read()
            .entities
            .get(entity_path)
            .map(|entity| entity.messages.len())
            .unwrap_or(0)
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.read().in_flight.len()
    }

    /// Sequence numbers of completed messages in completion order
    pub fn completed(&self, entity_path: &str) -> Vec<i64> {
        self.inner
            .read()
            .entities
            .get(entity_path)
            .map(|entity| entity.completed.clone())
            .unwrap_or_default()
    }

    pub fn dead_lettered(&self, entity_path: &str) -> Vec<DeadLetteredMessage> {
        self.inner
            .read()
            .entities
            .get(entity_path)
            .map(|entity| entity.dead_letter.clone())
            .unwrap_or_default()
    }

    /// Whether some link currently holds the lock of `session_id`
    pub fn is_session_locked(&self, entity_path: &str, session_id: &SessionId) -> bool {
        self.inner
            .read()
            .entities
            .get(entity_path)
            .and_then(|entity| entity.sessions.get(session_id))
            .map(SessionState::is_locked)
            .unwrap_or(false)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(InMemoryBrokerConfig::default())
    }
}

#[async_trait]
impl MessageSettler for InMemoryBroker {
    async fn complete(&self, message: &ReceivedMessage) -> Result<(), ReceiverError> {
        let mut storage = self.inner.write();
        let in_flight = storage.take_locked(message.lock_token())?;
        storage
            .entity(&in_flight.entity_path)
            .completed
            .push(in_flight.message.sequence_number);
        Ok(())
    }

    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), ReceiverError> {
        {
            let mut storage = self.inner.write();
            let in_flight = storage.take_locked(message.lock_token())?;
            storage.entity(&in_flight.entity_path).requeue(in_flight.message);
        }
        self.inner.available.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self, message: &ReceivedMessage, reason: &str) -> Result<(), ReceiverError> {
        let mut storage = self.inner.write();
        let in_flight = storage.take_locked(message.lock_token())?;
        storage
            .entity(&in_flight.entity_path)
            .dead_letter
            .push(DeadLetteredMessage {
                sequence_number: in_flight.message.sequence_number,
                reason: reason.to_string(),
            });
        Ok(())
    }
}

#[async_trait]
impl LockRenewer for InMemoryBroker {
    async fn renew_message_lock(&self, lock_token: &LockToken) -> Result<Timestamp, ReceiverError> {
        let mut storage = self.inner.write();
        let in_flight = storage
            .in_flight
            .get_mut(lock_token.as_str())
            .filter(|in_flight| !in_flight.locked_until.is_past())
            .ok_or_else(|| ReceiverError::MessageLockLost {
                lock_token: lock_token.to_string(),
            })?;

        in_flight.locked_until = Timestamp::after(self.inner.config.lock_duration);
        Ok(in_flight.locked_until)
    }
}

#[async_trait]
impl ConnectionProvider for InMemoryBroker {
    async fn create_receive_link(&self, entity_path: &str) -> Result<Box<dyn MessageSource>, ReceiverError> {
        Ok(Box::new(MemoryReceiveLink {
            inner: Arc::clone(&self.inner),
            entity_path: entity_path.to_string(),
            session_id: None,
            credit: 0,
            closed: CancellationToken::new(),
        }))
    }

    async fn create_session_link(
        &self,
        entity_path: &str,
        session_id: Option<SessionId>,
    ) -> Result<SessionReceiveLink, ReceiverError> {
        let deadline = tokio::time::Instant::now() + self.inner.config.session_accept_timeout;

        let (session_id, link_id) = loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(locked) = self.inner.try_lock_session(entity_path, session_id.as_ref()) {
                break locked;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(ReceiverError::BrokerTimeout {
                        message: format!("no session available on '{}'", entity_path),
                    });
                }
            }
        };

        debug!(entity_path, session_id = %session_id, link_id, "Session locked");
        let closed = CancellationToken::new();

        Ok(SessionReceiveLink {
            control: Arc::new(MemorySessionControl {
                inner: Arc::clone(&self.inner),
                entity_path: entity_path.to_string(),
                session_id: session_id.clone(),
                link_id,
                closed: closed.clone(),
            }),
            messages: Box::new(MemoryReceiveLink {
                inner: Arc::clone(&self.inner),
                entity_path: entity_path.to_string(),
                session_id: Some(session_id),
                credit: 0,
                closed,
            }),
        })
    }
}

// ============================================================================
// Links
// ============================================================================

/// Message half of an in-memory link
struct MemoryReceiveLink {
    inner: Arc<BrokerInner>,
    entity_path: String,
    session_id: Option<SessionId>,
    credit: u64,
    closed: CancellationToken,
}

#[async_trait]
impl MessageSource for MemoryReceiveLink {
    fn request(&mut self, credits: u64) {
        self.credit += credits;
        self.inner.available.notify_waiters();
    }

    async fn next_message(&mut self) -> Option<Result<ReceivedMessage, ReceiverError>> {
        loop {
            if self.closed.is_cancelled() {
                return None;
            }

            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.credit > 0 {
                if let Some(message) = self.inner.deliver(&self.entity_path, self.session_id.as_ref()) {
                    self.credit -= 1;
                    return Some(Ok(message));
                }
            }

            // Lapsed locks are reclaimed on the next delivery attempt
            let lock_expiry = if self.credit > 0 {
                self.inner.next_lock_expiry(&self.entity_path)
            } else {
                None
            };
            tokio::select! {
                _ = self.closed.cancelled() => return None,
                _ = &mut notified => {}
                _ = sleep_or_pending(lock_expiry) => {}
            }
        }
    }
}

async fn sleep_or_pending(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

/// Control half of an in-memory session link
struct MemorySessionControl {
    inner: Arc<BrokerInner>,
    entity_path: String,
    session_id: SessionId,
    link_id: u64,
    closed: CancellationToken,
}

#[async_trait]
impl SessionLink for MemorySessionControl {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn session_locked_until(&self) -> Timestamp {
        self.inner
            .read()
            .entities
            .get(&self.entity_path)
            .and_then(|entity| entity.sessions.get(&self.session_id))
            .filter(|state| state.link_id == self.link_id)
            .map(|state| state.locked_until)
            .unwrap_or_else(Timestamp::now)
    }

    async fn renew_session_lock(&self) -> Result<Timestamp, ReceiverError> {
        let mut storage = self.inner.write();
        let state = storage
            .entity(&self.entity_path)
            .sessions
            .get_mut(&self.session_id)
            .filter(|state| state.link_id == self.link_id && state.is_locked())
            .ok_or_else(|| ReceiverError::SessionLockLost {
                session_id: self.session_id.to_string(),
            })?;

        state.locked_until = Timestamp::after(self.inner.config.session_lock_duration);
        Ok(state.locked_until)
    }

    async fn close(&self) -> Result<(), ReceiverError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();

        {
            let mut storage = self.inner.write();
            let sessions = &mut storage.entity(&self.entity_path).sessions;
            if sessions.get(&self.session_id).map(|state| state.link_id) == Some(self.link_id) {
                sessions.remove(&self.session_id);
            }
        }
        self.inner.available.notify_waiters();
        debug!(session_id = %self.session_id, "Session released");
        Ok(())
    }
}
