//! Broker implementations.
//!
//! This module contains concrete implementations of the collaborator
//! capabilities in [`crate::link`].

pub mod memory;

pub use memory::{DeadLetteredMessage, InMemoryBroker, InMemoryBrokerConfig};
