//! A single bounded receive request.

use crate::error::ReceiverError;
use crate::message::ReceivedMessage;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Delivery sink for a work item; closing it completes the request
pub type WorkSink = mpsc::UnboundedSender<Result<ReceivedMessage, ReceiverError>>;

/// Caller side of a [`WorkSink`]
pub type WorkReceiver = mpsc::UnboundedReceiver<Result<ReceivedMessage, ReceiverError>>;

/// One "give me up to N messages within D" request.
///
/// The item becomes terminal when its count is reached, when its overall
/// timeout elapses, when no further message arrives within the
/// between-messages window after the first one, or when it is completed
/// explicitly. The terminal transition happens at most once; afterwards
/// [`emit_next`](Self::emit_next) returns `false`.
#[derive(Debug)]
pub struct SynchronousReceiveWork {
    id: u64,
    number_to_receive: usize,
    remaining: usize,
    timeout: Duration,
    max_wait_between_messages: Option<Duration>,
    started_at: Option<Instant>,
    last_emitted_at: Option<Instant>,
    sink: Option<WorkSink>,
}

impl SynchronousReceiveWork {
    pub fn new(
        id: u64,
        number_to_receive: usize,
        timeout: Duration,
        sink: WorkSink,
    ) -> Result<Self, ReceiverError> {
        if number_to_receive == 0 {
            return Err(ReceiverError::invalid_argument(
                "number_to_receive",
                "must be greater than zero",
            ));
        }

        if timeout.is_zero() {
            return Err(ReceiverError::invalid_argument(
                "timeout",
                "must be greater than zero",
            ));
        }

        if sink.is_closed() {
            return Err(ReceiverError::invalid_argument(
                "sink",
                "the delivery sink is already closed",
            ));
        }

        Ok(Self {
            id,
            number_to_receive,
            remaining: number_to_receive,
            timeout,
            max_wait_between_messages: None,
            started_at: None,
            last_emitted_at: None,
            sink: Some(sink),
        })
    }

    /// Complete early once no message arrived for `window` after the last one
    pub fn with_max_wait_between_messages(mut self, window: Duration) -> Self {
        if !window.is_zero() {
            self.max_wait_between_messages = Some(window);
        }
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn number_to_receive(&self) -> usize {
        self.number_to_receive
    }

    /// Messages still wanted
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_terminal(&self) -> bool {
        self.sink.is_none()
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    /// Start the timeout clock. Later calls are ignored.
    pub fn start(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
    }

    /// Instant at which the item times out, if started and not terminal
    pub fn deadline(&self) -> Option<Instant> {
        if self.is_terminal() {
            return None;
        }
        let started_at = self.started_at?;
        let overall = started_at + self.timeout;

        match (self.last_emitted_at, self.max_wait_between_messages) {
            (Some(last), Some(window)) => Some(overall.min(last + window)),
            _ => Some(overall),
        }
    }

    /// Deliver one message.
    ///
    /// Returns `false` without delivering when the item is already terminal
    /// or the caller stopped listening; the caller should route the message
    /// elsewhere.
    pub fn emit_next(&mut self, message: ReceivedMessage) -> bool {
        let Some(sink) = &self.sink else {
            return false;
        };

        if sink.send(Ok(message)).is_err() {
            debug!(work_id = self.id, "Receiver of work item dropped; completing");
            self.sink = None;
            return false;
        }

        self.remaining -= 1;
        self.last_emitted_at = Some(Instant::now());
        if self.remaining == 0 {
            self.complete();
        }
        true
    }

    /// Finish the item successfully. No-op if already terminal.
    pub fn complete(&mut self) {
        if self.sink.take().is_some() {
            debug!(
                work_id = self.id,
                received = self.number_to_receive - self.remaining,
                "Work item completed"
            );
        }
    }

    /// Finish the item with an error. No-op if already terminal.
    pub fn complete_with_error(&mut self, error: ReceiverError) {
        if let Some(sink) = self.sink.take() {
            debug!(work_id = self.id, error = %error, "Work item failed");
            let _ = sink.send(Err(error));
        }
    }

    /// Complete the item if its deadline has passed. Returns `true` if it timed out.
    pub fn complete_if_timed_out(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                debug!(work_id = self.id, remaining = self.remaining, "Work item timed out");
                self.complete();
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
#[path = "work_tests.rs"]
mod tests;
