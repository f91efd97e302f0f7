//! Connection finite-state machine (FSM) types.
//!
//! This module defines every state a [`crate::connection::Connection`] can
//! occupy.  Transitions live in [`crate::connection`].
//!
//! ```text
//!                 ┌──────── SYN / SYN+ACK ───────┐
//!  CLOSED ──▶ SYN_SENT ──SYN+ACK──▶ ESTABLISHED ◀┤
//!     │                                 │        │
//!     └──▶ LISTEN ──SYN──▶ SYN_RECEIVED ┘ ACK    │
//!                                                │
//!  ESTABLISHED ──local close──▶ FIN_WAIT ──ACK of FIN──▶ TIME_WAIT ──linger──▶ CLOSED
//!  ESTABLISHED ──peer FIN──▶ (flush) ──FIN sent──▶ LAST_ACK ──ACK of FIN──▶ CLOSED
//! ```
//!
//! Exhausting the retry budget or the idle timeout moves any state to
//! `Closed` with [`crate::connection::ConnError::ConnectionTimeout`].

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection exists; initial and terminal state.
    #[default]
    Closed,
    /// Server side: waiting for a SYN.
    Listen,
    /// Client side: SYN sent, waiting for SYN+ACK.
    SynSent,
    /// Server side: SYN+ACK sent, waiting for the client's confirming ACK.
    SynReceived,
    /// Handshake complete; data flows both ways.
    Established,
    /// Local FIN sent, waiting for its acknowledgement.
    FinWait,
    /// Peer FIN received first; our FIN sent, waiting for its acknowledgement.
    LastAck,
    /// Our FIN acknowledged; lingering to re-acknowledge late retransmissions.
    TimeWait,
}

impl ConnectionState {
    /// `true` in states where buffered data and FIN may be transmitted.
    pub fn can_transmit(self) -> bool {
        matches!(self, Self::Established | Self::FinWait | Self::LastAck)
    }

    /// `true` once the handshake has completed (including teardown states).
    pub fn is_synchronized(self) -> bool {
        matches!(
            self,
            Self::Established | Self::FinWait | Self::LastAck | Self::TimeWait
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RECEIVED",
            Self::Established => "ESTABLISHED",
            Self::FinWait => "FIN_WAIT",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait => "TIME_WAIT",
        };
        f.write_str(name)
    }
}
