// ABOUTME: Tunables for the change monitor - batch sizing, lease timing, retry caps
// ABOUTME: Defaults match the engine's coordination tables and competing-consumer protocol

use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration for a change trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerConfig {
    /// Maximum rows delivered to the handler per invocation
    pub batch_size: usize,
    /// Failed attempts after which a row is abandoned
    pub max_attempt_count: i32,
    /// Lease renewals before a stuck handler is forcibly cancelled
    pub max_lease_renewal_count: u32,
    /// Lease length; leases are renewed at half this interval
    pub lease_interval: Duration,
    /// Time between polling ticks
    pub polling_interval: Duration,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_attempt_count: 5,
            max_lease_renewal_count: 5,
            lease_interval: Duration::from_secs(30),
            polling_interval: Duration::from_secs(5),
        }
    }
}

impl TriggerConfig {
    /// Validate the configuration, rejecting values the coordination protocol
    /// cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.max_attempt_count < 1 {
            return Err(Error::Config(
                "max_attempt_count must be at least 1".to_string(),
            ));
        }
        if self.max_lease_renewal_count == 0 {
            return Err(Error::Config(
                "max_lease_renewal_count must be at least 1".to_string(),
            ));
        }
        if self.lease_interval < Duration::from_secs(2) {
            return Err(Error::Config(
                "lease_interval must be at least 2 seconds".to_string(),
            ));
        }
        if self.polling_interval.is_zero() {
            return Err(Error::Config(
                "polling_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Lease length in whole seconds, as embedded in coordination SQL.
    pub(crate) fn lease_interval_secs(&self) -> u64 {
        self.lease_interval.as_secs()
    }

    /// Period of the lease-renewal loop (half the lease length).
    pub(crate) fn lease_renewal_interval(&self) -> Duration {
        self.lease_interval / 2
    }
}
