//! Retrying acquisition of session-bound receive links.

use super::Session;
use crate::error::ReceiverError;
use crate::link::{ConnectionProvider, SessionReceiveLink};
use crate::message::SessionId;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Obtains [`Session`]s from a [`ConnectionProvider`].
///
/// Every attempt is bounded by the try timeout. Broker-reported and
/// client-side timeouts are retried without limit unless timeout retry is
/// disabled, in which case the first timeout is returned as
/// [`ReceiverError::SessionAcquireTimeout`]. Any other error is returned
/// immediately.
pub struct SessionAcquirer {
    provider: Arc<dyn ConnectionProvider>,
    entity_path: String,
    try_timeout: Duration,
    timeout_retry_disabled: bool,
    retry_delay: Duration,
}

impl SessionAcquirer {
    pub fn new(
        provider: Arc<dyn ConnectionProvider>,
        entity_path: impl Into<String>,
        try_timeout: Duration,
        timeout_retry_disabled: bool,
    ) -> Result<Self, ReceiverError> {
        let entity_path = entity_path.into();
        if entity_path.trim().is_empty() {
            return Err(ReceiverError::invalid_argument(
                "entity_path",
                "must not be empty",
            ));
        }

        if try_timeout.is_zero() {
            return Err(ReceiverError::invalid_argument(
                "try_timeout",
                "must be greater than zero",
            ));
        }

        Ok(Self {
            provider,
            entity_path,
            try_timeout,
            timeout_retry_disabled,
            retry_delay: Duration::ZERO,
        })
    }

    /// Pause between a timed-out attempt and the next one
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }

    /// Acquire `session_id`, or the next available session when `None`
    pub async fn acquire(&self, session_id: Option<SessionId>) -> Result<Session, ReceiverError> {
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            match self.try_acquire(session_id.clone()).await {
                Ok(link) => {
                    let session = Session::new(link);
                    info!(
                        entity_path = %self.entity_path,
                        session_id = %session.id(),
                        attempts,
                        "Session acquired"
                    );
                    return Ok(session);
                }
                Err(e) if e.is_timeout() && !self.timeout_retry_disabled => {
                    debug!(
                        entity_path = %self.entity_path,
                        error = %e,
                        attempts,
                        delay_ms = self.retry_delay.as_millis() as u64,
                        "No session available; retrying"
                    );
                    // A provider may fail without ever suspending; always
                    // give the scheduler a turn so cancellation can run.
                    if self.retry_delay.is_zero() {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
                Err(e) if e.is_timeout() => {
                    debug!(
                        entity_path = %self.entity_path,
                        error = %e,
                        "Session acquisition timed out; timeout retry disabled"
                    );
                    return Err(ReceiverError::SessionAcquireTimeout {
                        entity_path: self.entity_path.clone(),
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!(
                        entity_path = %self.entity_path,
                        error = %e,
                        attempts,
                        "Session acquisition failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn try_acquire(
        &self,
        session_id: Option<SessionId>,
    ) -> Result<SessionReceiveLink, ReceiverError> {
        let attempt = self
            .provider
            .create_session_link(&self.entity_path, session_id);

        match tokio::time::timeout(self.try_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ReceiverError::Timeout {
                duration: self.try_timeout,
            }),
        }
    }
}

#[cfg(test)]
#[path = "acquirer_tests.rs"]
mod tests;
