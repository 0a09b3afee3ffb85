//! Receiver configuration.
//!
//! Settings are layered (later sources override earlier ones):
//!  1. Built-in defaults (every field carries a serde default)
//!  2. An optional YAML/TOML/JSON file
//!  3. Environment variables prefixed `SBR__` (double-underscore separator),
//!     e.g. `SBR__PREFETCH_COUNT=50` sets `prefetch_count = 50`

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for receiver settings
pub const ENV_PREFIX: &str = "SBR";

/// Configuration for a receiver client and its session processor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Queue or subscription path messages are received from
    pub entity_path: String,

    /// Standing upstream demand kept by the synchronous receive adapter
    pub prefetch_count: u32,

    /// Upper bound on how long a single lock is kept alive (0 disables renewal)
    pub max_auto_lock_renew_millis: u64,

    /// Complete on handler success, abandon on handler failure
    pub auto_complete: bool,

    /// Timeout applied to each link-creation attempt
    pub try_timeout_millis: u64,

    /// Idle period after which a session is released
    pub session_idle_timeout_millis: u64,

    /// Surface the first broker timeout during session acquisition instead of retrying
    pub disable_session_timeout_retry: bool,

    /// Delay between session acquisition attempts after a timeout
    pub session_retry_delay_millis: u64,

    /// Maximum gap between messages of one bounded receive once it has started yielding
    pub max_wait_between_messages_millis: u64,

    /// Sweep interval for expired lock-container entries
    pub lock_cleanup_interval_seconds: u64,

    /// Sessions processed concurrently by the session processor
    pub max_concurrent_sessions: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            entity_path: String::new(),
            prefetch_count: 0,
            max_auto_lock_renew_millis: 300_000,
            auto_complete: true,
            try_timeout_millis: 60_000,
            session_idle_timeout_millis: 60_000,
            disable_session_timeout_retry: false,
            session_retry_delay_millis: 0,
            max_wait_between_messages_millis: 1000,
            lock_cleanup_interval_seconds: 30,
            max_concurrent_sessions: 1,
        }
    }
}

impl ReceiverConfig {
    /// Load configuration from an optional file plus `SBR__*` environment variables.
    ///
    /// A missing file is an error only when a path is given explicitly.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let receiver_config: ReceiverConfig = config.try_deserialize()?;
        receiver_config.validate()?;

        Ok(receiver_config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.entity_path.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "entity_path".to_string(),
            });
        }

        if self.try_timeout_millis == 0 {
            return Err(ConfigurationError::Invalid {
                message: "try_timeout_millis must be greater than zero".to_string(),
            });
        }

        if self.session_idle_timeout_millis == 0 {
            return Err(ConfigurationError::Invalid {
                message: "session_idle_timeout_millis must be greater than zero".to_string(),
            });
        }

        if self.max_concurrent_sessions == 0 {
            return Err(ConfigurationError::Invalid {
                message: "max_concurrent_sessions must be at least 1".to_string(),
            });
        }

        if self.lock_cleanup_interval_seconds == 0 {
            return Err(ConfigurationError::Invalid {
                message: "lock_cleanup_interval_seconds must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    pub fn max_auto_lock_renew_duration(&self) -> Duration {
        Duration::from_millis(self.max_auto_lock_renew_millis)
    }

    pub fn try_timeout(&self) -> Duration {
        Duration::from_millis(self.try_timeout_millis)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.session_idle_timeout_millis)
    }

    pub fn session_retry_delay(&self) -> Duration {
        Duration::from_millis(self.session_retry_delay_millis)
    }

    pub fn max_wait_between_messages(&self) -> Duration {
        Duration::from_millis(self.max_wait_between_messages_millis)
    }

    pub fn lock_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.lock_cleanup_interval_seconds)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
