//! Tests for message types.

use super::*;

#[test]
fn test_lock_token_validation() {
    assert!(LockToken::new("2c2b0f3e-6a59-4d1c-9d0f-95f1e0a1b2c3").is_ok());
    assert!(LockToken::new("").is_err());
    assert!(LockToken::new("   ").is_err());

    let generated = LockToken::generate();
    assert_ne!(generated, LockToken::generate());
    assert!(!generated.as_str().is_empty());
}

#[test]
fn test_session_id_validation() {
    assert!(SessionId::new("session-123").is_ok());
    assert!(SessionId::new("tenant/order/42").is_ok());

    assert!(SessionId::new("").is_err());
    assert!(SessionId::new("a".repeat(129)).is_err());
    assert!(SessionId::new("control\x00char").is_err());
}

#[test]
fn test_timestamp_remaining_is_clamped() {
    let past = Timestamp::from_datetime(Utc::now() - chrono::Duration::seconds(10));
    assert_eq!(past.remaining(), Duration::ZERO);
    assert!(past.is_past());

    let future = Timestamp::after(Duration::from_secs(60));
    assert!(future.remaining() > Duration::from_secs(55));
    assert!(!future.is_past());
}

#[test]
fn test_lock_expiry_is_shared_between_clones() {
    let message = ReceivedMessage::new(
        LockToken::generate(),
        7,
        Timestamp::after(Duration::from_secs(5)),
        Bytes::from_static(b"payload"),
    );
    let copy = message.clone();

    let renewed = Timestamp::after(Duration::from_secs(30));
    message.set_locked_until(renewed);

    assert_eq!(copy.locked_until(), renewed);
    assert!(!copy.is_lock_expired());
}

#[test]
fn test_mark_settled_only_once() {
    let message = ReceivedMessage::new(
        LockToken::generate(),
        1,
        Timestamp::after(Duration::from_secs(5)),
        Bytes::new(),
    );
    let copy = message.clone();

    assert!(!message.is_settled());
    assert!(copy.mark_settled());
    assert!(!message.mark_settled());
    assert!(message.is_settled());
}

#[test]
fn test_message_builder() {
    let session_id = SessionId::new("session-a").unwrap();
    let message = ReceivedMessage::new(
        LockToken::new("token-1").unwrap(),
        42,
        Timestamp::now(),
        Bytes::from_static(b"body"),
    )
    .with_message_id("msg-1")
    .with_session_id(session_id.clone())
    .with_delivery_count(3)
    .with_property("kind", "order");

    assert_eq!(message.message_id(), "msg-1");
    assert_eq!(message.lock_token().as_str(), "token-1");
    assert_eq!(message.sequence_number(), 42);
    assert_eq!(message.delivery_count(), 3);
    assert_eq!(message.session_id(), Some(&session_id));
    assert_eq!(message.body().as_ref(), b"body");
    assert_eq!(message.properties().get("kind"), Some(&"order".to_string()));
}
