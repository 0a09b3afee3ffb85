//! Message types for the receive pipeline including core domain identifiers.

use crate::error::ReceiverError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Opaque token correlating a received message with its broker-side lock
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(String);

impl LockToken {
    /// Create lock token with validation
    pub fn new(token: impl Into<String>) -> Result<Self, ReceiverError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(ReceiverError::invalid_argument(
                "lock_token",
                "must not be empty",
            ));
        }

        Ok(Self(token))
    }

    /// Generate a random lock token, as the broker does on delivery
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get lock token as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LockToken {
    type Err = ReceiverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Identifier of a broker-side session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Create new session ID with validation
    pub fn new(id: impl Into<String>) -> Result<Self, ReceiverError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ReceiverError::invalid_argument(
                "session_id",
                "must not be empty",
            ));
        }

        if id.len() > 128 {
            return Err(ReceiverError::invalid_argument(
                "session_id",
                "maximum 128 characters",
            ));
        }

        if !id.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
            return Err(ReceiverError::invalid_argument(
                "session_id",
                "only ASCII printable characters allowed",
            ));
        }

        Ok(Self(id))
    }

    /// Get session ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = ReceiverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Timestamp `duration` from now
    pub fn after(duration: Duration) -> Self {
        Self::now().add(duration)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Add a std duration, saturating at the chrono range
    pub fn add(&self, duration: Duration) -> Self {
        let delta = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
        Self(self.0.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }

    /// Time left until this timestamp, zero if already in the past
    pub fn remaining(&self) -> Duration {
        (self.0 - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    /// Check whether this timestamp lies in the past
    pub fn is_past(&self) -> bool {
        Utc::now() >= self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

// ============================================================================
// Received Message
// ============================================================================

/// A message delivered by a receive link, held under a broker lock.
///
/// Clones share the lock-expiry cell and the settlement flag, so a renewal
/// performed by the pipeline is visible to the copy a handler holds.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    message_id: String,
    lock_token: LockToken,
    sequence_number: i64,
    delivery_count: u32,
    session_id: Option<SessionId>,
    body: Bytes,
    properties: HashMap<String, String>,
    locked_until: Arc<RwLock<Timestamp>>,
    settled: Arc<AtomicBool>,
}

impl ReceivedMessage {
    /// Create a message as delivered by the transport
    pub fn new(lock_token: LockToken, sequence_number: i64, locked_until: Timestamp, body: Bytes) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            lock_token,
            sequence_number,
            delivery_count: 1,
            session_id: None,
            body,
            properties: HashMap::new(),
            locked_until: Arc::new(RwLock::new(locked_until)),
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set the broker-assigned message id
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    /// Set the session the message was received from
    pub fn with_session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Set how many times the broker has delivered this message
    pub fn with_delivery_count(mut self, delivery_count: u32) -> Self {
        self.delivery_count = delivery_count;
        self
    }

    /// Add an application property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn lock_token(&self) -> &LockToken {
        &self.lock_token
    }

    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    /// Current lock expiry
    pub fn locked_until(&self) -> Timestamp {
        match self.locked_until.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Record a new lock expiry after a successful renewal
    pub fn set_locked_until(&self, locked_until: Timestamp) {
        match self.locked_until.write() {
            Ok(mut guard) => *guard = locked_until,
            Err(poisoned) => *poisoned.into_inner() = locked_until,
        }
    }

    /// Check if the lock has lapsed
    pub fn is_lock_expired(&self) -> bool {
        self.locked_until().is_past()
    }

    /// Mark the message settled. Returns `true` only for the first caller.
    pub fn mark_settled(&self) -> bool {
        !self.settled.swap(true, Ordering::AcqRel)
    }

    /// Check whether any settlement has been issued for the message
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
