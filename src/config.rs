// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Bus Configuration
//!
//! This module centralizes the tunables of the messaging layer: the broker URI,
//! the connection pool limits and the retry cadence used by the publishers and
//! subscribers when the broker is unreachable.

use std::time::Duration;

/// Environment variable read by [`AmqpConfig::from_env`].
pub const AMQP_URL_ENV: &str = "AMQP_URL";

/// Fallback broker URI when [`AMQP_URL_ENV`] is not set.
pub const DEFAULT_AMQP_URI: &str = "amqp://localhost:5672";

/// Connection name presented to the broker.
pub const DEFAULT_CONNECTION_NAME: &str = "amqp-bus";

/// Upper bound of open connections held by the pool.
pub const MAX_POOL_CONNECTIONS: usize = 10;

/// Connections the pool opens eagerly on startup.
pub const MIN_POOL_CONNECTIONS: usize = 1;

/// Number of acquire priority classes served by the pool.
pub const POOL_PRIORITY_CLASSES: usize = 3;

/// How long an acquire waits for a connection before giving up.
pub const POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);

/// Delay before a parked publish is attempted again.
pub const RETRY_ENQUEUE_AFTER_TIMEOUT: Duration = Duration::from_secs(1);

/// Delay before a parked subscription is attempted again.
pub const RETRY_SUBSCRIBE_AFTER_TIMEOUT: Duration = Duration::from_secs(1);

/// Default retry count of the bounded enqueue helper.
pub const DEFAULT_ENQUEUE_RETRIES: u32 = 3;

/// Default first backoff delay of the bounded enqueue helper.
pub const DEFAULT_ENQUEUE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Connection settings for the AMQP bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpConfig {
    pub(crate) uri: String,
    pub(crate) connection_name: String,
}

impl AmqpConfig {
    /// Creates a configuration pointing at the given broker URI.
    pub fn new(uri: &str) -> AmqpConfig {
        AmqpConfig {
            uri: uri.to_owned(),
            connection_name: DEFAULT_CONNECTION_NAME.to_owned(),
        }
    }

    /// Reads the broker URI from the environment, falling back to the default.
    pub fn from_env() -> AmqpConfig {
        match std::env::var(AMQP_URL_ENV) {
            Ok(uri) => AmqpConfig::new(&uri),
            Err(_) => AmqpConfig::new(DEFAULT_AMQP_URI),
        }
    }

    /// Overrides the connection name presented to the broker.
    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.connection_name = name.to_owned();
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }
}

impl Default for AmqpConfig {
    fn default() -> Self {
        AmqpConfig::new(DEFAULT_AMQP_URI)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_points_at_local_broker() {
        let cfg = AmqpConfig::default();

        assert_eq!(cfg.uri(), DEFAULT_AMQP_URI);
        assert_eq!(cfg.connection_name(), DEFAULT_CONNECTION_NAME);
    }

    #[test]
    fn new_keeps_uri_and_renames_connection() {
        let cfg = AmqpConfig::new("amqp://broker:5672/%2f").with_connection_name("orders");

        assert_eq!(cfg.uri(), "amqp://broker:5672/%2f");
        assert_eq!(cfg.connection_name(), "orders");
    }
}
