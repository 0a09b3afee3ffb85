//! Session handles, acquisition, idle detection and the rolling session pump.

mod acquirer;
mod idle_timer;
mod processor;

pub use acquirer::SessionAcquirer;
pub use idle_timer::SessionIdleTimer;
pub use processor::{SessionProcessor, SessionProcessorOptions};

use crate::error::ReceiverError;
use crate::link::{MessageSource, SessionLink, SessionReceiveLink};
use crate::message::SessionId;
use crate::renewal::RenewalHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// An acquired session.
///
/// Owns the session's receive link and its lock renewal. Disposing the
/// session stops the renewal and closes the link.
pub struct Session {
    id: SessionId,
    link: Arc<dyn SessionLink>,
    messages: Option<Box<dyn MessageSource>>,
    renewal: Option<RenewalHandle>,
    cancel: CancellationToken,
    disposed: bool,
}

impl Session {
    pub fn new(link: SessionReceiveLink) -> Self {
        Self {
            id: link.control.session_id().clone(),
            link: link.control,
            messages: Some(link.messages),
            renewal: None,
            cancel: CancellationToken::new(),
            disposed: false,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Control half of the session link
    pub fn link(&self) -> &Arc<dyn SessionLink> {
        &self.link
    }

    /// Take the message stream; `None` once taken or after disposal
    pub fn take_messages(&mut self) -> Option<Box<dyn MessageSource>> {
        self.messages.take()
    }

    pub fn renewal(&self) -> Option<&RenewalHandle> {
        self.renewal.as_ref()
    }

    /// Keep the session lock alive for up to `max_duration`.
    ///
    /// Replaces any earlier renewal. A zero duration only stops the
    /// existing renewal.
    pub fn begin_lock_renew(&mut self, max_duration: Duration) -> Option<RenewalHandle> {
        if let Some(previous) = self.renewal.take() {
            previous.cancel();
        }

        if self.disposed || max_duration.is_zero() {
            return None;
        }

        let handle = RenewalHandle::new(&self.cancel);
        let link = Arc::clone(&self.link);
        let session_id = self.id.clone();

        handle.start(
            format!("session:{}", self.id),
            self.link.session_locked_until(),
            max_duration,
            move || {
                let link = Arc::clone(&link);
                async move { link.renew_session_lock().await }
            },
            |_| {},
            move |finished| {
                debug!(
                    session_id = %session_id,
                    status = ?finished.status(),
                    renewals = finished.renewal_count(),
                    "Session lock renewal ended"
                );
            },
        );

        self.renewal = Some(handle.clone());
        Some(handle)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Stop lock renewal and close the link. Idempotent.
    pub async fn dispose(&mut self) -> Result<(), ReceiverError> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        self.cancel.cancel();
        self.renewal = None;
        self.messages = None;

        debug!(session_id = %self.id, "Closing session");
        if let Err(e) = self.link.close().await {
            warn!(session_id = %self.id, error = %e, "Failed to close session link");
            return Err(e);
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
