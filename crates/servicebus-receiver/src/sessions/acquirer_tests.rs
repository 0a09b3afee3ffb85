//! Tests for session acquisition.

use super::*;
use crate::link::{ChannelSource, SessionLink};
use crate::message::Timestamp;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::time::Instant;

enum Step {
    Fail(ReceiverError),
    Hang,
    Succeed(&'static str),
}

/// Provider replaying a fixed sequence of attempt outcomes
struct ScriptedProvider {
    steps: Mutex<VecDeque<Step>>,
    attempts: AtomicU32,
}

impl ScriptedProvider {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            attempts: AtomicU32::new(0),
        })
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn remaining_steps(&self) -> usize {
        self.steps.lock().unwrap().len()
    }
}

struct StubSessionLink {
    session_id: SessionId,
}

#[async_trait]
impl SessionLink for StubSessionLink {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn session_locked_until(&self) -> Timestamp {
        Timestamp::after(Duration::from_secs(30))
    }

    async fn renew_session_lock(&self) -> Result<Timestamp, ReceiverError> {
        Ok(Timestamp::after(Duration::from_secs(30)))
    }

    async fn close(&self) -> Result<(), ReceiverError> {
        Ok(())
    }
}

#[async_trait]
impl ConnectionProvider for ScriptedProvider {
    async fn create_receive_link(
        &self,
        _entity_path: &str,
    ) -> Result<Box<dyn crate::link::MessageSource>, ReceiverError> {
        Err(ReceiverError::ConnectionFailed {
            message: "not scripted".to_string(),
        })
    }

    async fn create_session_link(
        &self,
        _entity_path: &str,
        session_id: Option<SessionId>,
    ) -> Result<SessionReceiveLink, ReceiverError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();

        match step {
            Some(Step::Fail(e)) => Err(e),
            Some(Step::Succeed(id)) => {
                let session_id = session_id.unwrap_or_else(|| SessionId::new(id).unwrap());
                let (_sender, source) = ChannelSource::channel(1);
                Ok(SessionReceiveLink {
                    control: Arc::new(StubSessionLink { session_id }),
                    messages: Box::new(source),
                })
            }
            Some(Step::Hang) | None => std::future::pending().await,
        }
    }
}

/// Provider whose attempts fail with a broker timeout without suspending
struct ImmediatelyTimingOutProvider {
    attempts: AtomicU32,
}

#[async_trait]
impl ConnectionProvider for ImmediatelyTimingOutProvider {
    async fn create_receive_link(
        &self,
        _entity_path: &str,
    ) -> Result<Box<dyn crate::link::MessageSource>, ReceiverError> {
        Err(ReceiverError::ConnectionFailed {
            message: "not scripted".to_string(),
        })
    }

    async fn create_session_link(
        &self,
        _entity_path: &str,
        _session_id: Option<SessionId>,
    ) -> Result<SessionReceiveLink, ReceiverError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(ReceiverError::BrokerTimeout {
            message: "no session available".to_string(),
        })
    }
}

fn broker_timeout() -> Step {
    Step::Fail(ReceiverError::BrokerTimeout {
        message: "no session available".to_string(),
    })
}

fn acquirer(provider: &Arc<ScriptedProvider>, retry_disabled: bool) -> SessionAcquirer {
    SessionAcquirer::new(
        Arc::clone(provider) as Arc<dyn ConnectionProvider>,
        "orders",
        Duration::from_secs(5),
        retry_disabled,
    )
    .expect("acquirer should build")
}

mod construction {
    use super::*;

    #[test]
    fn test_empty_entity_path_is_invalid_argument() {
        let provider = ScriptedProvider::new(vec![]);
        let result = SessionAcquirer::new(provider, "  ", Duration::from_secs(5), false);

        assert!(matches!(
            result,
            Err(ReceiverError::InvalidArgument { name, .. }) if name == "entity_path"
        ));
    }

    #[test]
    fn test_zero_try_timeout_is_invalid_argument() {
        let provider = ScriptedProvider::new(vec![]);
        let result = SessionAcquirer::new(provider, "orders", Duration::ZERO, false);

        assert!(matches!(
            result,
            Err(ReceiverError::InvalidArgument { name, .. }) if name == "try_timeout"
        ));
    }
}

mod retry_enabled {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_success() {
        let provider = ScriptedProvider::new(vec![Step::Succeed("order-1")]);

        let session = acquirer(&provider, false).acquire(None).await.unwrap();

        assert_eq!(session.id().as_str(), "order-1");
        assert_eq!(provider.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_timeouts_are_retried_until_success() {
        let provider = ScriptedProvider::new(vec![
            broker_timeout(),
            broker_timeout(),
            broker_timeout(),
            Step::Succeed("order-1"),
        ]);

        let session = acquirer(&provider, false).acquire(None).await.unwrap();

        assert_eq!(session.id().as_str(), "order-1");
        assert_eq!(provider.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_retried_then_non_timeout_error_surfaces() {
        let provider = ScriptedProvider::new(vec![
            broker_timeout(),
            broker_timeout(),
            Step::Fail(ReceiverError::ConnectionFailed {
                message: "connection reset".to_string(),
            }),
            Step::Fail(ReceiverError::ConnectionFailed {
                message: "never consumed".to_string(),
            }),
        ]);

        let result = acquirer(&provider, false).acquire(None).await;

        assert!(matches!(
            result,
            Err(ReceiverError::ConnectionFailed { message }) if message == "connection reset"
        ));
        assert_eq!(provider.attempts(), 3);
        assert_eq!(provider.remaining_steps(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_side_timeout_is_retried() {
        let provider = ScriptedProvider::new(vec![Step::Hang, Step::Succeed("order-1")]);
        let start = Instant::now();

        let session = acquirer(&provider, false).acquire(None).await.unwrap();

        assert_eq!(session.id().as_str(), "order-1");
        assert_eq!(provider.attempts(), 2);
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delay_is_applied_between_attempts() {
        let provider = ScriptedProvider::new(vec![broker_timeout(), Step::Succeed("order-1")]);
        let start = Instant::now();

        acquirer(&provider, false)
            .with_retry_delay(Duration::from_secs(2))
            .acquire(None)
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_immediate_timeouts_leave_room_for_cancellation() {
        let provider = Arc::new(ImmediatelyTimingOutProvider {
            attempts: AtomicU32::new(0),
        });
        let acquirer = SessionAcquirer::new(
            Arc::clone(&provider) as Arc<dyn ConnectionProvider>,
            "orders",
            Duration::from_secs(5),
            false,
        )
        .unwrap();
        let cancel = tokio_util::sync::CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };

        let cancelled = tokio::select! {
            _ = cancel.cancelled() => true,
            _ = acquirer.acquire(None) => false,
        };

        canceller.await.unwrap();
        assert!(cancelled);
        assert!(provider.attempts.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_named_session_is_requested() {
        let provider = ScriptedProvider::new(vec![Step::Succeed("ignored")]);

        let session = acquirer(&provider, false)
            .acquire(Some(SessionId::new("customer-7").unwrap()))
            .await
            .unwrap();

        assert_eq!(session.id().as_str(), "customer-7");
    }
}

mod retry_disabled {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_broker_timeout_is_wrapped_after_one_attempt() {
        let provider = ScriptedProvider::new(vec![
            broker_timeout(),
            broker_timeout(),
            Step::Succeed("order-1"),
        ]);

        let result = acquirer(&provider, true).acquire(None).await;

        match result {
            Err(ReceiverError::SessionAcquireTimeout { entity_path, source }) => {
                assert_eq!(entity_path, "orders");
                assert!(matches!(*source, ReceiverError::BrokerTimeout { .. }));
            }
            other => panic!("expected SessionAcquireTimeout, got {:?}", other),
        }
        assert_eq!(provider.attempts(), 1);
        assert_eq!(provider.remaining_steps(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_side_timeout_is_wrapped() {
        let provider = ScriptedProvider::new(vec![Step::Hang]);

        let result = acquirer(&provider, true).acquire(None).await;

        match result {
            Err(ReceiverError::SessionAcquireTimeout { source, .. }) => {
                assert!(matches!(*source, ReceiverError::Timeout { .. }));
            }
            other => panic!("expected SessionAcquireTimeout, got {:?}", other),
        }
        assert_eq!(provider.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_timeout_error_is_returned_unwrapped() {
        let provider = ScriptedProvider::new(vec![Step::Fail(ReceiverError::SessionLockLost {
            session_id: "order-1".to_string(),
        })]);

        let result = acquirer(&provider, true).acquire(None).await;

        assert!(matches!(result, Err(ReceiverError::SessionLockLost { .. })));
        assert_eq!(provider.attempts(), 1);
    }
}
