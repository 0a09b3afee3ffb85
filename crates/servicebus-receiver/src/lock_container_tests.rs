//! Tests for the lock container.

use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Handle counting how often it was released
#[derive(Debug, Clone)]
struct CountingHandle {
    id: u32,
    releases: Arc<AtomicUsize>,
}

impl CountingHandle {
    fn new(id: u32) -> Self {
        Self {
            id,
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl LockHandle for CountingHandle {
    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

fn in_future(secs: u64) -> Timestamp {
    Timestamp::after(Duration::from_secs(secs))
}

fn in_past(secs: i64) -> Timestamp {
    Timestamp::from_datetime(chrono::Utc::now() - chrono::Duration::seconds(secs))
}

mod registration {
    use super::*;

    #[test]
    fn test_add_rejects_duplicate_token() {
        let container = LockContainer::new();
        let first = CountingHandle::new(1);
        let second = CountingHandle::new(2);

        assert!(container.add("token", in_future(30), first.clone()));
        assert!(!container.add("token", in_future(60), second.clone()));

        assert_eq!(container.len(), 1);
        assert_eq!(first.release_count(), 0);
        assert_eq!(second.release_count(), 0);
    }

    #[test]
    fn test_add_or_update_releases_displaced_handle() {
        let container = LockContainer::new();
        let first = CountingHandle::new(1);
        let second = CountingHandle::new(2);
        let later = in_future(120);

        container.add_or_update("token", in_future(30), first.clone());
        container.add_or_update("token", later, second.clone());

        assert_eq!(container.len(), 1);
        assert_eq!(container.get("token"), Some(later));
        assert_eq!(first.release_count(), 1);
        assert_eq!(second.release_count(), 0);
    }

    #[test]
    fn test_update_expiration_only_for_tracked_tokens() {
        let container = LockContainer::new();
        container.add_or_update("token", in_future(5), CountingHandle::new(1));

        let renewed = in_future(90);
        assert!(container.update_expiration("token", renewed));
        assert_eq!(container.get("token"), Some(renewed));

        assert!(!container.update_expiration("missing", renewed));
        assert_eq!(container.get("missing"), None);
    }
}

mod removal {
    use super::*;

    #[test]
    fn test_remove_releases_handle() {
        let container = LockContainer::new();
        let handle = CountingHandle::new(1);
        container.add_or_update("token", in_future(30), handle.clone());

        assert!(container.remove("token"));
        assert!(!container.remove("token"));

        assert!(container.is_empty());
        assert_eq!(handle.release_count(), 1);
    }

    #[test]
    fn test_remove_if_leaves_newer_registration() {
        let container = LockContainer::new();
        let stale = CountingHandle::new(1);
        let current = CountingHandle::new(2);
        container.add_or_update("token", in_future(30), stale.clone());
        container.add_or_update("token", in_future(30), current.clone());

        assert!(!container.remove_if("token", |h| h.id == stale.id));
        assert_eq!(container.len(), 1);
        assert_eq!(current.release_count(), 0);

        assert!(container.remove_if("token", |h| h.id == current.id));
        assert!(container.is_empty());
        assert_eq!(current.release_count(), 1);
    }

    #[test]
    fn test_clear_releases_everything_and_is_idempotent() {
        let container = LockContainer::new();
        let handles: Vec<CountingHandle> = (0..3).map(CountingHandle::new).collect();
        for (i, handle) in handles.iter().enumerate() {
            container.add_or_update(&format!("token-{}", i), in_future(30), handle.clone());
        }

        container.clear();
        container.clear();

        assert!(container.is_empty());
        for handle in &handles {
            assert_eq!(handle.release_count(), 1);
        }
    }
}

mod expiry {
    use super::*;

    #[test]
    fn test_contains_unexpired() {
        let container = LockContainer::new();
        container.add_or_update("live", in_future(30), CountingHandle::new(1));
        container.add_or_update("lapsed", in_past(5), CountingHandle::new(2));

        assert!(container.contains_unexpired("live"));
        assert!(!container.contains_unexpired("lapsed"));
        assert!(!container.contains_unexpired("unknown"));
    }

    #[test]
    fn test_cleanup_expired_removes_only_lapsed_entries() {
        let container = LockContainer::new();
        let live = CountingHandle::new(1);
        let lapsed = CountingHandle::new(2);
        container.add_or_update("live", in_future(30), live.clone());
        container.add_or_update("lapsed", in_past(5), lapsed.clone());

        assert_eq!(container.cleanup_expired(), 1);

        assert_eq!(container.len(), 1);
        assert!(container.get("live").is_some());
        assert_eq!(lapsed.release_count(), 1);
        assert_eq!(live.release_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_cleanup_stops_after_clear() {
        let container = Arc::new(LockContainer::new());
        let lapsed = CountingHandle::new(1);
        container.add_or_update("lapsed", in_past(5), lapsed.clone());

        let sweeper = container.spawn_cleanup(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(container.is_empty());
        assert_eq!(lapsed.release_count(), 1);

        container.clear();
        tokio::time::timeout(Duration::from_secs(1), sweeper)
            .await
            .expect("sweeper should stop once the container is cleared")
            .expect("sweeper should not panic");
    }
}

mod concurrency {
    use super::*;

    #[test]
    fn test_concurrent_writers_leave_single_entry() {
        let container = Arc::new(LockContainer::new());
        let handles: Vec<CountingHandle> = (0..8).map(CountingHandle::new).collect();

        let threads: Vec<_> = handles
            .iter()
            .cloned()
            .map(|handle| {
                let container = Arc::clone(&container);
                std::thread::spawn(move || {
                    container.add_or_update("shared", in_future(30), handle);
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(container.len(), 1);
        let released: usize = handles.iter().map(|h| h.release_count()).sum();
        assert_eq!(released, handles.len() - 1);
    }
}
