//! Tests for the channel-backed message source.

use super::*;
use bytes::Bytes;
use std::time::Duration;

fn message(sequence_number: i64) -> ReceivedMessage {
    ReceivedMessage::new(
        LockToken::generate(),
        sequence_number,
        Timestamp::after(Duration::from_secs(30)),
        Bytes::new(),
    )
}

#[tokio::test]
async fn test_channel_source_yields_in_order_then_closes() {
    let (sender, mut source) = ChannelSource::channel(4);
    sender.send(Ok(message(1))).await.unwrap();
    sender.send(Ok(message(2))).await.unwrap();
    drop(sender);

    let first = source.next_message().await.unwrap().unwrap();
    let second = source.next_message().await.unwrap().unwrap();
    assert_eq!(first.sequence_number(), 1);
    assert_eq!(second.sequence_number(), 2);
    assert!(source.next_message().await.is_none());
}

#[tokio::test]
async fn test_channel_source_records_credit() {
    let (_sender, source) = ChannelSource::channel(1);
    let counter = source.credit_counter();
    let mut boxed: Box<dyn MessageSource> = Box::new(source);

    boxed.request(3);
    boxed.request(2);

    assert_eq!(counter.load(Ordering::SeqCst), 5);
}
