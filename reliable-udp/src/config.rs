//! Tunable protocol parameters.
//!
//! One [`Config`] is handed to every connection.  The window is a fixed
//! constant rather than a negotiated value: the header carries no window
//! field, so both peers simply agree out of band (or use the defaults).

use std::time::Duration;

use thiserror::Error;

use crate::packet::HEADER_LEN;

/// Largest payload that still fits one UDP datagram over IPv4.
pub const MAX_MSS: usize = 65_507 - HEADER_LEN;

/// A [`Config`] the protocol cannot run with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("mss must be between 1 and {MAX_MSS} bytes, got {0}")]
    Mss(usize),
    #[error("window must be at least one byte")]
    ZeroWindow,
    #[error("max_reorder ({max_reorder}) must be at least the window ({window})")]
    ReorderBelowWindow { max_reorder: usize, window: usize },
}

/// Per-connection knobs with their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum payload bytes carried by one segment.  Default 512.
    pub mss: usize,
    /// Maximum bytes in flight (sent, unacknowledged).  Default 4096.
    pub window: usize,
    /// RTO before any round-trip sample is available.  Default 1 s.
    pub initial_rto: Duration,
    /// Lower bound on the computed RTO.  Default 1 s.
    pub min_rto: Duration,
    /// Upper bound on the RTO after back-off.  Default 60 s.
    pub max_rto: Duration,
    /// Consecutive retransmission timeouts without progress before giving up.
    /// Default 6.
    pub max_retries: u32,
    /// Grace period after our FIN is acknowledged, spent re-acknowledging
    /// late retransmissions from the peer.  Default 2 s.
    pub linger: Duration,
    /// Silence from the peer for this long fails the connection.  Default 10 s.
    pub idle_timeout: Duration,
    /// Bytes beyond the next expected offset that may be buffered out of
    /// order.  Default `2 * window`.
    pub max_reorder: usize,
    /// Unsent application bytes accepted before `send` waits.  Default 64 KiB.
    pub send_buffer: usize,
    /// Half-open connections queued for `accept`.  Default 16.
    pub backlog: usize,
}

impl Default for Config {
    fn default() -> Self {
        let window = 4096;
        Self {
            mss: 512,
            window,
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_secs(1),
            max_rto: Duration::from_secs(60),
            max_retries: 6,
            linger: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(10),
            max_reorder: 2 * window,
            send_buffer: 64 * 1024,
            backlog: 16,
        }
    }
}

impl Config {
    /// Reject knob combinations that would stall or break the sender.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_MSS).contains(&self.mss) {
            return Err(ConfigError::Mss(self.mss));
        }
        if self.window == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if self.max_reorder < self.window {
            return Err(ConfigError::ReorderBelowWindow {
                max_reorder: self.max_reorder,
                window: self.window,
            });
        }
        Ok(())
    }

    /// Config with timeouts scaled down for loopback tests.
    pub fn fast() -> Self {
        Self {
            initial_rto: Duration::from_millis(100),
            min_rto: Duration::from_millis(50),
            max_rto: Duration::from_secs(2),
            linger: Duration::from_millis(200),
            idle_timeout: Duration::from_secs(3),
            ..Self::default()
        }
    }
}
