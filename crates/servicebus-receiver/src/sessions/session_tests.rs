//! Tests for session handles.

use super::*;
use crate::link::ChannelSource;
use crate::message::Timestamp;
use crate::renewal::RenewalStatus;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};

/// Session link extending its lock by a fixed amount on every renewal
struct FakeSessionLink {
    session_id: SessionId,
    lock_duration: Duration,
    renewals: AtomicU32,
    closes: AtomicU32,
}

impl FakeSessionLink {
    fn new(session_id: &str, lock_duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            session_id: SessionId::new(session_id).unwrap(),
            lock_duration,
            renewals: AtomicU32::new(0),
            closes: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl SessionLink for FakeSessionLink {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn session_locked_until(&self) -> Timestamp {
        Timestamp::after(self.lock_duration)
    }

    async fn renew_session_lock(&self) -> Result<Timestamp, ReceiverError> {
        self.renewals.fetch_add(1, Ordering::SeqCst);
        Ok(Timestamp::after(self.lock_duration))
    }

    async fn close(&self) -> Result<(), ReceiverError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn session(link: &Arc<FakeSessionLink>) -> Session {
    let (_sender, source) = ChannelSource::channel(1);
    Session::new(SessionReceiveLink {
        control: Arc::clone(link) as Arc<dyn SessionLink>,
        messages: Box::new(source),
    })
}

#[tokio::test]
async fn test_session_exposes_id_and_link() {
    let link = FakeSessionLink::new("order-42", Duration::from_secs(30));
    let mut session = session(&link);

    assert_eq!(session.id().as_str(), "order-42");
    assert_eq!(session.link().session_id().as_str(), "order-42");
    assert!(session.take_messages().is_some());
    assert!(session.take_messages().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_begin_lock_renew_keeps_session_lock_alive() {
    let link = FakeSessionLink::new("order-42", Duration::from_secs(4));
    let mut session = session(&link);

    let handle = session.begin_lock_renew(Duration::from_secs(60)).unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(link.renewals.load(Ordering::SeqCst) >= 2);
    assert_eq!(handle.status(), RenewalStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn test_begin_lock_renew_replaces_previous_renewal() {
    let link = FakeSessionLink::new("order-42", Duration::from_secs(4));
    let mut session = session(&link);

    let first = session.begin_lock_renew(Duration::from_secs(60)).unwrap();
    let second = session.begin_lock_renew(Duration::from_secs(60)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(first.status(), RenewalStatus::Cancelled);
    assert_eq!(second.status(), RenewalStatus::Running);
    assert_eq!(session.renewal().unwrap().id(), second.id());
}

#[tokio::test(start_paused = true)]
async fn test_dispose_stops_renewal_and_closes_link_once() {
    let link = FakeSessionLink::new("order-42", Duration::from_secs(4));
    let mut session = session(&link);
    let handle = session.begin_lock_renew(Duration::from_secs(60)).unwrap();

    session.dispose().await.unwrap();
    session.dispose().await.unwrap();
    let renewals = link.renewals.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert!(session.is_disposed());
    assert_eq!(handle.status(), RenewalStatus::Cancelled);
    assert_eq!(link.renewals.load(Ordering::SeqCst), renewals);
    assert_eq!(link.closes.load(Ordering::SeqCst), 1);
    assert!(session.take_messages().is_none());
    assert!(session.begin_lock_renew(Duration::from_secs(60)).is_none());
}
