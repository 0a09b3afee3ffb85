//! Dispatcher turning a message stream into bounded pull requests.

use super::work::{SynchronousReceiveWork, WorkReceiver};
use crate::error::ReceiverError;
use crate::link::MessageSource;
use crate::message::ReceivedMessage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Serves queued [`SynchronousReceiveWork`] items from one upstream source.
///
/// A background task owns the upstream. Work items are served in FIFO
/// order and only the head item receives messages. Upstream demand is kept
/// at `max(prefetch, head.remaining)`; messages arriving while no work item
/// is queued are buffered for the next one.
pub struct SynchronousMessageSubscriber {
    work_sender: mpsc::UnboundedSender<SynchronousReceiveWork>,
    next_work_id: AtomicU64,
    max_wait_between_messages: Duration,
    cancel: CancellationToken,
}

impl SynchronousMessageSubscriber {
    /// Spawn the dispatcher on the current runtime.
    ///
    /// A zero `max_wait_between_messages` disables the between-messages window.
    pub fn new<S>(upstream: S, prefetch: u64, max_wait_between_messages: Duration) -> Self
    where
        S: MessageSource + 'static,
    {
        let (work_sender, work_receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let dispatcher = Dispatcher {
            upstream,
            prefetch,
            queue: VecDeque::new(),
            buffered: VecDeque::new(),
            outstanding: 0,
            upstream_done: false,
        };
        tokio::spawn(dispatcher.run(work_receiver, cancel.clone()));

        Self {
            work_sender,
            next_work_id: AtomicU64::new(1),
            max_wait_between_messages,
            cancel,
        }
    }

    /// Request up to `count` messages within `timeout`.
    ///
    /// The returned receiver yields the messages and closes once the work
    /// item is terminal.
    pub fn receive(&self, count: usize, timeout: Duration) -> Result<WorkReceiver, ReceiverError> {
        let (sink, receiver) = mpsc::unbounded_channel();
        let id = self.next_work_id.fetch_add(1, Ordering::Relaxed);
        let work = SynchronousReceiveWork::new(id, count, timeout, sink)?
            .with_max_wait_between_messages(self.max_wait_between_messages);

        self.queue_work(work)?;
        Ok(receiver)
    }

    /// Queue an externally built work item
    pub fn queue_work(&self, work: SynchronousReceiveWork) -> Result<(), ReceiverError> {
        if self.cancel.is_cancelled() {
            return Err(ReceiverError::Disposed);
        }
        self.work_sender
            .send(work)
            .map_err(|_| ReceiverError::Disposed)
    }

    /// Stop the dispatcher. Pending work items fail with [`ReceiverError::Disposed`].
    pub fn dispose(&self) {
        self.cancel.cancel();
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for SynchronousMessageSubscriber {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Dispatcher<S> {
    upstream: S,
    prefetch: u64,
    queue: VecDeque<SynchronousReceiveWork>,
    buffered: VecDeque<ReceivedMessage>,
    /// Credit granted upstream and not yet consumed
    outstanding: u64,
    upstream_done: bool,
}

impl<S: MessageSource> Dispatcher<S> {
    async fn run(
        mut self,
        mut works: mpsc::UnboundedReceiver<SynchronousReceiveWork>,
        cancel: CancellationToken,
    ) {
        loop {
            let deadline = self.queue.front().and_then(SynchronousReceiveWork::deadline);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                work = works.recv() => match work {
                    Some(work) => self.enqueue(work),
                    None => break,
                },
                _ = sleep_until(deadline) => self.expire_head(),
                next = self.upstream.next_message(), if !self.upstream_done => {
                    self.on_upstream(next);
                }
            }
        }

        self.shutdown();
    }

    fn enqueue(&mut self, work: SynchronousReceiveWork) {
        debug!(
            work_id = work.id(),
            count = work.number_to_receive(),
            timeout = ?work.timeout(),
            queued = self.queue.len(),
            "Work item queued"
        );
        self.queue.push_back(work);
        if self.queue.len() == 1 {
            self.activate_head();
        }
    }

    /// Start the head item, feed it buffered messages, and refresh demand.
    /// Terminal heads are dropped until a live one is found.
    fn activate_head(&mut self) {
        while let Some(head) = self.queue.front_mut() {
            head.start();

            while let Some(message) = self.buffered.pop_front() {
                if !head.emit_next(message.clone()) {
                    self.buffered.push_front(message);
                    break;
                }
            }

            if self.upstream_done {
                head.complete();
            }

            if head.is_terminal() {
                self.queue.pop_front();
                continue;
            }

            self.update_demand();
            return;
        }
    }

    fn update_demand(&mut self) {
        let Some(head) = self.queue.front() else {
            return;
        };

        let target = self.prefetch.max(head.remaining() as u64);
        if self.outstanding < target {
            let credits = target - self.outstanding;
            debug!(work_id = head.id(), credits, "Requesting messages");
            self.upstream.request(credits);
            self.outstanding = target;
        }
    }

    fn on_upstream(&mut self, next: Option<Result<ReceivedMessage, ReceiverError>>) {
        match next {
            Some(Ok(message)) => {
                self.outstanding = self.outstanding.saturating_sub(1);
                self.route(message);
            }
            Some(Err(e)) => {
                warn!(error = %e, "Upstream failed; completing pending work");
                self.upstream_done = true;
                if let Some(mut head) = self.queue.pop_front() {
                    head.complete_with_error(e);
                }
                self.complete_all();
            }
            None => {
                debug!("Upstream closed; completing pending work");
                self.upstream_done = true;
                self.complete_all();
            }
        }
    }

    /// Deliver to the head item. When the head rejects the message it is
    /// already terminal; advance to the next item and retry the same message.
    fn route(&mut self, message: ReceivedMessage) {
        loop {
            let Some(head) = self.queue.front_mut() else {
                debug!(lock_token = %message.lock_token(), "No pending work; buffering message");
                self.buffered.push_back(message);
                return;
            };

            if head.emit_next(message.clone()) {
                if head.is_terminal() {
                    self.queue.pop_front();
                    self.activate_head();
                }
                return;
            }

            debug!(
                work_id = head.id(),
                lock_token = %message.lock_token(),
                "Work item rejected message; advancing to next item"
            );
            self.queue.pop_front();
            if let Some(next) = self.queue.front_mut() {
                next.start();
            }
            self.update_demand();
        }
    }

    fn expire_head(&mut self) {
        let timed_out = self
            .queue
            .front_mut()
            .map(|head| head.complete_if_timed_out(Instant::now()))
            .unwrap_or(false);

        if timed_out {
            self.queue.pop_front();
            self.activate_head();
        }
    }

    fn complete_all(&mut self) {
        for mut work in self.queue.drain(..) {
            work.complete();
        }
    }

    fn shutdown(&mut self) {
        if !self.buffered.is_empty() {
            warn!(
                count = self.buffered.len(),
                "Discarding buffered messages; their locks will lapse"
            );
            self.buffered.clear();
        }

        for mut work in self.queue.drain(..) {
            work.complete_with_error(ReceiverError::Disposed);
        }
        debug!("Synchronous subscriber stopped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "subscriber_tests.rs"]
mod tests;
