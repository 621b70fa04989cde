use std::time::Duration;
use thiserror::Error;

/// Bytes of every write reserved for ATT framing
pub const MTU_RESERVED_BYTES: usize = 3;

/// Default ATT MTU of a fresh BLE connection
pub const DEFAULT_MTU: usize = 23;

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(500);

pub const DEFAULT_INTER_PACKET_DELAY: Duration = Duration::from_millis(1);

/// How often a control point request is attempted when it times out.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    /// Pause before each further attempt
    pub delay: Duration,
}

impl RetryPolicy {
    /// Single attempt, failures propagate immediately
    pub const fn none() -> Self {
        Self {
            attempts: 1,
            delay: Duration::ZERO,
        }
    }

    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ConfigError {
    #[error("MTU {0} leaves no room for payload (at least {min} required)", min = MTU_RESERVED_BYTES + 1)]
    MtuTooSmall(usize),
    #[error("{0} retry policy needs at least one attempt")]
    NoAttempts(&'static str),
    #[error("operation timeout must be non-zero")]
    ZeroTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuConfig {
    /// Largest single write the transport accepts
    pub mtu: usize,
    /// Deadline for each control point response
    pub operation_timeout: Duration,
    /// Packets per receipt notification, 0 disables them
    pub prn: u16,
    /// Pause before every data packet write; zero disables it
    pub inter_packet_delay: Duration,
    /// Retries of the checksum request
    pub checksum_retry: RetryPolicy,
    /// Retries of every other control point request
    pub request_retry: RetryPolicy,
    /// Send the terminal frame and wait for its acknowledgment once done
    pub exit_on_complete: bool,
}

impl Default for DfuConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            prn: 0,
            inter_packet_delay: DEFAULT_INTER_PACKET_DELAY,
            checksum_retry: RetryPolicy::new(3, Duration::from_millis(100)),
            request_retry: RetryPolicy::none(),
            exit_on_complete: true,
        }
    }
}

impl DfuConfig {
    /// Number of checksum request attempts before giving up
    pub fn max_checksum_retries(&self) -> u32 {
        self.checksum_retry.attempts
    }

    /// Usable payload bytes per data packet
    pub fn packet_size(&self) -> usize {
        self.mtu.saturating_sub(MTU_RESERVED_BYTES)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.packet_size() == 0 {
            return Err(ConfigError::MtuTooSmall(self.mtu));
        }
        if self.operation_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.checksum_retry.attempts == 0 {
            return Err(ConfigError::NoAttempts("checksum"));
        }
        if self.request_retry.attempts == 0 {
            return Err(ConfigError::NoAttempts("request"));
        }
        Ok(())
    }
}
