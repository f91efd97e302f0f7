//! Optional fault injection for outbound datagrams.
//!
//! Real networks drop, reorder, and duplicate packets.  To exercise the
//! reliability mechanisms without depending on actual network conditions,
//! a [`crate::socket::Socket`] can carry a [`Simulator`] that decides the
//! fate of every datagram it sends:
//!
//! | Fault        | Description                                          |
//! |--------------|------------------------------------------------------|
//! | Loss         | Drop a datagram with probability `loss_rate`.        |
//! | Duplication  | Send a datagram twice with probability `duplicate_rate`. |
//! | Reordering   | Hold a datagram back by `reorder_delay` with probability `reorder_rate`, letting later ones overtake it. |
//!
//! Decisions come from a seeded RNG so a failing run can be replayed.

use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that any given datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that a datagram is sent twice.
    pub duplicate_rate: f64,
    /// Probability that a datagram is delayed.
    pub reorder_rate: f64,
    /// Delay applied to reordered datagrams.
    pub reorder_delay: Duration,
    /// RNG seed.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default: a transparent pass-through.
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            reorder_rate: 0.0,
            reorder_delay: Duration::ZERO,
            seed: 0,
        }
    }
}

/// What happens to one outbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fate {
    Drop,
    Deliver {
        /// 1, or 2 when duplicated.
        copies: u8,
        /// Hold-back for reordering.
        delay: Option<Duration>,
    },
}

/// Seeded fault model shared by every send on one socket.
#[derive(Debug)]
pub struct Simulator {
    config: SimulatorConfig,
    rng: Mutex<StdRng>,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = Mutex::new(StdRng::seed_from_u64(config.seed));
        Self { config, rng }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Decide the fate of the next datagram.
    pub fn next_fate(&self) -> Fate {
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if rng.random_bool(self.config.loss_rate) {
            return Fate::Drop;
        }
        let copies = if rng.random_bool(self.config.duplicate_rate) { 2 } else { 1 };
        let delay = rng
            .random_bool(self.config.reorder_rate)
            .then_some(self.config.reorder_delay);
        Fate::Deliver { copies, delay }
    }
}
