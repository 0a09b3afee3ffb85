//! # Service Bus Receiver
//!
//! Client-side receive pipeline for Azure Service Bus queues and
//! subscriptions, built on top of an existing AMQP transport.
//!
//! This library provides:
//! - Automatic message and session lock renewal while messages are in flight
//! - Auto-complete on handler success and abandon on handler failure
//! - Bounded "up to N messages within D" receives over a push stream
//! - Session acquisition with timeout retry and idle-session release
//! - A rolling session processor handling several sessions concurrently
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all pipeline operations
//! - [`message`] - Received messages, lock tokens and session ids
//! - [`config`] - Layered receiver configuration
//! - [`link`] - Capabilities consumed from the transport layer
//! - [`lock_container`] - Lock token registry shared with renewal tasks
//! - [`renewal`] - Lock renewal loop and stream operator
//! - [`auto_complete`] - Automatic settlement of handled messages
//! - [`synchronous`] - Bounded pull-style receive
//! - [`sessions`] - Session acquisition, idle timer and session processor
//! - [`providers`] - Broker implementations (in-memory)
//! - [`client`] - Receiver client composing the pipeline

// Module declarations
pub mod auto_complete;
pub mod client;
pub mod config;
pub mod error;
pub mod link;
pub mod lock_container;
pub mod message;
pub mod providers;
pub mod renewal;
pub mod sessions;
pub mod synchronous;

// Re-export commonly used types at crate root for convenience
pub use auto_complete::{AutoCompleteOperator, MessageHandler, SettlementSummary};
pub use client::{ReceiverClientBuilder, ServiceBusReceiverClient};
pub use config::ReceiverConfig;
pub use error::{ConfigurationError, ReceiverError};
pub use link::{
    ChannelSource, ConnectionProvider, LockRenewer, MessageSettler, MessageSource, SessionLink,
    SessionReceiveLink,
};
pub use lock_container::{LockContainer, LockHandle};
pub use message::{LockToken, ReceivedMessage, SessionId, Timestamp};
pub use providers::{DeadLetteredMessage, InMemoryBroker, InMemoryBrokerConfig};
pub use renewal::{LockRenewalOperator, ReleasingSettler, RenewalHandle, RenewalStatus};
pub use sessions::{Session, SessionAcquirer, SessionIdleTimer, SessionProcessor, SessionProcessorOptions};
pub use synchronous::{collect_messages, SynchronousMessageSubscriber, SynchronousReceiveWork};
