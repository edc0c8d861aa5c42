use crate::BusError;
use std::time::Duration;

/// Configuration for the bus façade and its two rings.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Slot count of the order-book snapshot ring. Must be a power of two.
    pub book_capacity: usize,
    /// Slot count of the trade ring. Must be a power of two.
    pub trade_capacity: usize,
    /// How long a parked consumer sleeps before re-checking its cursor and
    /// cancellation flag. Acts as a safety net for missed wakeups.
    pub park_timeout: Duration,
    /// Upper bound on how long `Subscription` teardown waits for the
    /// consumer thread to observe cancellation.
    pub shutdown_grace: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            book_capacity: 1024,
            trade_capacity: 4096,
            park_timeout: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl BusConfig {
    /// Validates both ring capacities.
    pub fn validate(&self) -> Result<(), BusError> {
        validate_capacity(self.book_capacity)?;
        validate_capacity(self.trade_capacity)?;
        Ok(())
    }
}

/// Checks that a ring capacity is a nonzero power of two.
pub fn validate_capacity(capacity: usize) -> Result<(), BusError> {
    if capacity == 0 || !capacity.is_power_of_two() {
        return Err(BusError::InvalidBufferSize { got: capacity });
    }
    Ok(())
}

/// Configuration for the provider heartbeat watchdog.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// How often the sweep runs.
    pub interval: Duration,
    /// How old a provider's `last_updated` may be before it is stale.
    pub staleness: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            staleness: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two() {
        assert_eq!(
            validate_capacity(1000),
            Err(BusError::InvalidBufferSize { got: 1000 })
        );
        assert_eq!(validate_capacity(0), Err(BusError::InvalidBufferSize { got: 0 }));
        assert!(validate_capacity(1).is_ok());
        assert!(validate_capacity(4096).is_ok());
    }
}
