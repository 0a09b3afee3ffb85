//! Bounded, pull-style receive over a message stream.
//!
//! Callers ask for "up to N messages within D". Each request becomes a
//! [`SynchronousReceiveWork`] queued on a [`SynchronousMessageSubscriber`],
//! whose background task routes upstream messages to the oldest pending
//! request.

mod subscriber;
mod work;

pub use subscriber::SynchronousMessageSubscriber;
pub use work::{SynchronousReceiveWork, WorkReceiver, WorkSink};

use crate::error::ReceiverError;
use crate::message::ReceivedMessage;
use tokio::time::Instant;

/// Collect the messages of one work item, waiting no later than `deadline`.
///
/// Returns whatever arrived once the item completes or the deadline passes.
/// An error delivered by the work item is returned instead of the messages.
pub async fn collect_messages(
    mut receiver: WorkReceiver,
    deadline: Instant,
) -> Result<Vec<ReceivedMessage>, ReceiverError> {
    let mut messages = Vec::new();

    loop {
        let next = tokio::select! {
            next = receiver.recv() => next,
            _ = tokio::time::sleep_until(deadline) => break,
        };

        match next {
            Some(Ok(message)) => messages.push(message),
            Some(Err(e)) => return Err(e),
            None => return Ok(messages),
        }
    }

    // Late deliveries bounce back to the dispatcher once the receiver is closed
    receiver.close();
    while let Ok(next) = receiver.try_recv() {
        match next {
            Ok(message) => messages.push(message),
            Err(e) => return Err(e),
        }
    }
    Ok(messages)
}
