//! Retransmission timeout estimation and the retransmission timer.
//!
//! Reliable delivery requires that unacknowledged segments are re-sent if no
//! ACK arrives within a bounded time.  This module provides:
//! - [`RtoEstimator`] — the adaptive retransmission timeout (RTO).
//! - [`RetransmitTimer`] — a restartable, cancellable timer whose expiry is
//!   delivered as a [`TimerFired`] message on the connection's event queue.
//!
//! RTO is computed using Jacobson's algorithm (RFC 6298):
//!   `RTO = SRTT + 4 × RTTVAR`
//! clamped to `[min_rto, max_rto]`, and doubles on each consecutive timeout
//! (exponential back-off) up to `max_rto`.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;

// ---------------------------------------------------------------------------
// RtoEstimator
// ---------------------------------------------------------------------------

/// Smoothed round-trip-time state for one connection.
#[derive(Debug, Clone)]
pub struct RtoEstimator {
    /// Current RTO, updated after each RTT sample and each back-off.
    current: Duration,
    /// Smoothed RTT estimate (SRTT).
    srtt: Option<Duration>,
    /// RTT variance estimate (RTTVAR).
    rttvar: Duration,
    initial: Duration,
    min: Duration,
    max: Duration,
}

impl RtoEstimator {
    pub fn new(initial: Duration, min: Duration, max: Duration) -> Self {
        Self {
            current: initial.clamp(min, max),
            srtt: None,
            rttvar: Duration::ZERO,
            initial,
            min,
            max,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.initial_rto, config.min_rto, config.max_rto)
    }

    /// The timeout to arm the timer with right now.
    pub fn rto(&self) -> Duration {
        self.current
    }

    /// Smoothed RTT, once at least one sample has been taken.
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Record a new RTT sample and update SRTT / RTTVAR / RTO (RFC 6298 §2).
    ///
    /// On the first sample:  SRTT = R,  RTTVAR = R/2.
    /// Subsequent samples:   RTTVAR = 3/4·RTTVAR + 1/4·|SRTT − R|
    ///                       SRTT   = 7/8·SRTT   + 1/8·R
    pub fn record_rtt_sample(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let diff = sample.abs_diff(srtt);
                self.rttvar = self.rttvar * 3 / 4 + diff / 4;
                self.srtt = Some(srtt * 7 / 8 + sample / 8);
            }
        }
        self.reset();
    }

    /// Double the RTO on retransmit timeout (RFC 6298 §5.5), capped at `max`.
    pub fn back_off(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }

    /// Restore the RTO from the current SRTT / RTTVAR estimates.
    ///
    /// Falls back to the initial RTO before the first RTT sample.
    pub fn reset(&mut self) {
        let rto = match self.srtt {
            Some(srtt) => srtt + self.rttvar * 4,
            None => self.initial,
        };
        self.current = rto.clamp(self.min, self.max);
    }
}

// ---------------------------------------------------------------------------
// RetransmitTimer
// ---------------------------------------------------------------------------

/// Message posted to the event queue when an armed timer expires.
///
/// Each arm gets a fresh generation; expiries from a timer that has since
/// been restarted or stopped carry an old generation and must be ignored
/// (see [`RetransmitTimer::is_current`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub generation: u64,
}

/// A one-shot timer feeding the connection's event queue.
///
/// Expiry is never delivered by callback: a background sleep posts
/// `E::from(TimerFired)` onto the same queue that carries inbound
/// datagrams, so the state machine consumes both as one sequential stream.
#[derive(Debug)]
pub struct RetransmitTimer<E> {
    events: mpsc::UnboundedSender<E>,
    generation: u64,
    deadline: Option<Instant>,
    task: Option<JoinHandle<()>>,
}

impl<E> RetransmitTimer<E>
where
    E: From<TimerFired> + Send + 'static,
{
    pub fn new(events: mpsc::UnboundedSender<E>) -> Self {
        Self {
            events,
            generation: 0,
            deadline: None,
            task: None,
        }
    }

    /// Arm the timer to fire `duration` from now, cancelling any pending expiry.
    pub fn start(&mut self, duration: Duration) {
        self.start_at(Instant::now() + duration);
    }

    /// Arm the timer for an absolute deadline.
    ///
    /// Re-arming with the deadline already pending is a no-op.
    pub fn start_at(&mut self, deadline: Instant) {
        if self.deadline == Some(deadline) {
            return;
        }
        self.stop();
        self.deadline = Some(deadline);

        let fired = TimerFired {
            generation: self.generation,
        };
        let events = self.events.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            // The receiver is gone once the connection is torn down.
            let _ = events.send(E::from(fired));
        }));
    }

    /// Cancel a pending expiry.  Any already-queued expiry becomes stale.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.deadline = None;
        self.generation = self.generation.wrapping_add(1);
    }

    /// `true` if `fired` belongs to the currently armed deadline.
    pub fn is_current(&self, fired: TimerFired) -> bool {
        self.deadline.is_some() && fired.generation == self.generation
    }

    /// Consume an expiry taken off the queue.
    ///
    /// Returns `true` (and disarms) if it belongs to the current deadline;
    /// stale expiries return `false` and change nothing.
    pub fn expire(&mut self, fired: TimerFired) -> bool {
        if !self.is_current(fired) {
            return false;
        }
        self.task = None;
        self.deadline = None;
        self.generation = self.generation.wrapping_add(1);
        true
    }

    /// The pending deadline, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

impl<E> Drop for RetransmitTimer<E> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
