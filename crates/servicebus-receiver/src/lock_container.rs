//! Concurrent registry of lock tokens and the renewal handles attached to them.
//!
//! The container is the only structure touched both by the message flow and
//! by renewal timers. Every mutation holds the map lock for a single lookup or
//! insert; handles displaced by a mutation are released after the lock is
//! dropped so a release can never re-enter the container while it is held.

use crate::message::Timestamp;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[cfg(test)]
#[path = "lock_container_tests.rs"]
mod tests;

/// Something that must be released when its lock entry leaves the container
pub trait LockHandle: Send + Sync + 'static {
    /// Stop whatever work the handle represents. Must be idempotent.
    fn release(&self);
}

impl LockHandle for CancellationToken {
    fn release(&self) {
        self.cancel();
    }
}

#[derive(Debug)]
struct LockEntry<T> {
    handle: T,
    expires_at: Timestamp,
}

/// Map from lock token to a renewal handle plus the lock's current expiry.
///
/// At most one entry exists per token; replacing an entry releases the
/// displaced handle.
#[derive(Debug)]
pub struct LockContainer<T: LockHandle> {
    entries: Mutex<HashMap<String, LockEntry<T>>>,
    shutdown: CancellationToken,
}

impl<T: LockHandle> Default for LockContainer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: LockHandle> LockContainer<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, LockEntry<T>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Insert an entry only if the token is not yet tracked.
    ///
    /// Returns `false` and drops `handle` without releasing it when an entry
    /// already exists.
    pub fn add(&self, lock_token: &str, expires_at: Timestamp, handle: T) -> bool {
        let mut entries = self.entries();
        if entries.contains_key(lock_token) {
            return false;
        }
        entries.insert(lock_token.to_string(), LockEntry { handle, expires_at });
        true
    }

    /// Insert or replace the entry for a token; the last writer wins.
    pub fn add_or_update(&self, lock_token: &str, expires_at: Timestamp, handle: T) {
        let displaced = self
            .entries()
            .insert(lock_token.to_string(), LockEntry { handle, expires_at });

        if let Some(previous) = displaced {
            debug!(lock_token = %lock_token, "Replacing existing lock entry");
            previous.handle.release();
        }
    }

    /// Record a renewed expiry. Returns `false` if the token is not tracked.
    pub fn update_expiration(&self, lock_token: &str, expires_at: Timestamp) -> bool {
        match self.entries().get_mut(lock_token) {
            Some(entry) => {
                entry.expires_at = expires_at;
                true
            }
            None => false,
        }
    }

    /// Remove and release the entry for a token
    pub fn remove(&self, lock_token: &str) -> bool {
        let removed = self.entries().remove(lock_token);
        match removed {
            Some(entry) => {
                entry.handle.release();
                true
            }
            None => false,
        }
    }

    /// Remove the entry only when `predicate` accepts its handle.
    ///
    /// Used by renewal tasks to drop their own registration without touching
    /// a newer one registered under the same token.
    pub fn remove_if<F>(&self, lock_token: &str, predicate: F) -> bool
    where
        F: FnOnce(&T) -> bool,
    {
        let removed = {
            let mut entries = self.entries();
            match entries.get(lock_token) {
                Some(entry) if predicate(&entry.handle) => entries.remove(lock_token),
                _ => None,
            }
        };

        match removed {
            Some(entry) => {
                entry.handle.release();
                true
            }
            None => false,
        }
    }

    /// Current expiry recorded for a token
    pub fn get(&self, lock_token: &str) -> Option<Timestamp> {
        self.entries().get(lock_token).map(|entry| entry.expires_at)
    }

    /// Handle registered for a token
    pub fn handle(&self, lock_token: &str) -> Option<T>
    where
        T: Clone,
    {
        self.entries().get(lock_token).map(|entry| entry.handle.clone())
    }

    /// Check if a token is tracked and its lock has not lapsed
    pub fn contains_unexpired(&self, lock_token: &str) -> bool {
        self.get(lock_token)
            .map(|expires_at| !expires_at.is_past())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Drop every entry whose lock has lapsed. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        let expired: Vec<LockEntry<T>> = {
            let mut entries = self.entries();
            let tokens: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.expires_at.is_past())
                .map(|(token, _)| token.clone())
                .collect();
            tokens
                .iter()
                .filter_map(|token| entries.remove(token))
                .collect()
        };

        for entry in &expired {
            entry.handle.release();
        }
        expired.len()
    }

    /// Release and remove every entry. Safe to call more than once.
    pub fn clear(&self) {
        self.shutdown.cancel();
        let drained: Vec<LockEntry<T>> = self.entries().drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            entry.handle.release();
        }
    }

    /// Spawn a task sweeping expired entries every `interval` until [`clear`](Self::clear).
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let container = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(container) = container.upgrade() else {
                            break;
                        };
                        let removed = container.cleanup_expired();
                        if removed > 0 {
                            debug!(removed, "Removed expired lock entries");
                        }
                    }
                }
            }
        })
    }
}
