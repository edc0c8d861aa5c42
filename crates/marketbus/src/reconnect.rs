use rand::Rng;
use std::time::Duration;

/// Connector lifecycle states.
///
/// The machine is iterative: every failure produces exactly one typed
/// transition, and the attempt counter is reset in exactly one place
/// (`on_connected`), never as a side effect of unwinding a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Failing,
    BackingOff,
    /// Attempts exhausted; the provider is finished until operator action.
    Dead,
}

/// Retry shaping for a reconnecting connector.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// First backoff delay; doubles per consecutive failure.
    pub base_delay: Duration,
    /// Ceiling for the exponential growth.
    pub max_delay: Duration,
    /// Hard cap on consecutive failures before giving up.
    pub max_attempts: u32,
    /// Fraction of the delay randomised both ways (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
            jitter: 0.2,
        }
    }
}

/// Outcome of a connection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back off for `delay`, then call `on_backoff_elapsed`.
    Retry { attempt: u32, delay: Duration },
    /// The attempt budget is spent; the caller marks the provider
    /// `DisconnectedFailed` and stops.
    GiveUp { attempts: u32 },
}

/// Iterative reconnection state machine with exponential backoff + jitter.
#[derive(Debug)]
pub struct Reconnector {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempts: u32,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Idle,
            attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failures since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Idle/backing-off → connecting.
    pub fn on_connect_start(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// Connection established: the only transition that clears the
    /// attempt counter.
    pub fn on_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.attempts = 0;
    }

    /// Records a failure and decides whether to retry.
    pub fn on_failure(&mut self) -> RetryDecision {
        self.state = ConnectionState::Failing;
        self.attempts += 1;

        if self.attempts > self.policy.max_attempts {
            self.state = ConnectionState::Dead;
            tracing::warn!(attempts = self.attempts - 1, "reconnection attempts exhausted");
            return RetryDecision::GiveUp {
                attempts: self.attempts - 1,
            };
        }

        self.state = ConnectionState::BackingOff;
        let delay = self.backoff_delay();
        tracing::debug!(attempt = self.attempts, ?delay, "scheduling reconnect");
        RetryDecision::Retry {
            attempt: self.attempts,
            delay,
        }
    }

    /// Backoff window elapsed; the caller reconnects now.
    pub fn on_backoff_elapsed(&mut self) {
        if self.state == ConnectionState::BackingOff {
            self.state = ConnectionState::Connecting;
        }
    }

    /// Operator-driven disconnect back to idle.
    pub fn on_disconnect(&mut self) {
        self.state = ConnectionState::Idle;
        self.attempts = 0;
    }

    fn backoff_delay(&self) -> Duration {
        let exp = self.attempts.saturating_sub(1).min(20);
        let raw = self
            .policy
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.policy.max_delay);
        if self.policy.jitter <= 0.0 {
            return raw;
        }
        let spread = rand::thread_rng().gen_range(-self.policy.jitter..=self.policy.jitter);
        raw.mul_f64((1.0 + spread).max(0.0))
    }
}
