//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that speaks
//! [`crate::packet::Segment`] instead of raw bytes.  All protocol logic lives
//! elsewhere; this module owns only byte I/O and, when configured, the
//! [`crate::simulator`] fault model.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::connection::ConnError;
use crate::packet::{Segment, SegmentError};
use crate::simulator::{Fate, Simulator, SimulatorConfig};

/// Maximum UDP payload size (theoretical limit; in practice kept much smaller).
const MAX_DATAGRAM: usize = 65_535;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The received datagram could not be decoded as a valid segment.
    #[error("segment decode error: {0}")]
    Segment(#[from] SegmentError),
}

impl From<SocketError> for ConnError {
    fn from(e: SocketError) -> Self {
        match e {
            SocketError::Io(e) => ConnError::Io(e),
            SocketError::Segment(e) => {
                ConnError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            }
        }
    }
}

/// ICMP feedback (port unreachable and friends) surfaces on a UDP socket as
/// these errors.  The datagram is simply lost; retransmission handles it.
pub(crate) fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
    )
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// An async, segment-oriented UDP socket.
///
/// All methods are `&self` so the socket can be shared across tasks.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: Arc<UdpSocket>,
    /// Fixed peer once [`Socket::connect`] has been called.
    peer: Option<SocketAddr>,
    faults: Option<Simulator>,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing `0.0.0.0:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self {
            local_addr,
            inner: Arc::new(inner),
            peer: None,
            faults: None,
        })
    }

    /// Fix the peer: only its datagrams are received from now on.
    pub async fn connect(&mut self, peer: SocketAddr) -> Result<(), SocketError> {
        self.inner.connect(peer).await?;
        self.peer = Some(peer);
        Ok(())
    }

    /// Route every outbound datagram through a fault model.
    pub fn with_faults(mut self, config: SimulatorConfig) -> Self {
        self.faults = Some(Simulator::new(config));
        self
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Encode `segment` and send it as a single UDP datagram to `dest`.
    pub async fn send_to(&self, segment: &Segment, dest: SocketAddr) -> Result<(), SocketError> {
        let bytes = segment.encode();

        let (copies, delay) = match self.faults.as_ref().map(Simulator::next_fate) {
            None => (1, None),
            Some(Fate::Drop) => {
                log::trace!("[sim] drop {segment}");
                return Ok(());
            }
            Some(Fate::Deliver { copies, delay }) => (copies, delay),
        };

        match delay {
            None => {
                for _ in 0..copies {
                    self.send_raw(&bytes, dest).await?;
                }
            }
            Some(delay) => {
                log::trace!("[sim] delay {segment} by {delay:?}");
                let inner = Arc::clone(&self.inner);
                let connected = self.peer == Some(dest);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    for _ in 0..copies {
                        let sent = if connected {
                            inner.send(&bytes).await
                        } else {
                            inner.send_to(&bytes, dest).await
                        };
                        if sent.is_err() {
                            break;
                        }
                    }
                });
            }
        }
        Ok(())
    }

    async fn send_raw(&self, bytes: &[u8], dest: SocketAddr) -> Result<(), SocketError> {
        if self.peer == Some(dest) {
            self.inner.send(bytes).await?;
        } else {
            self.inner.send_to(bytes, dest).await?;
        }
        Ok(())
    }

    /// Receive the next datagram and decode it into a [`Segment`].
    ///
    /// Returns `(segment, sender_address)`.  Datagrams that fail to decode are
    /// returned as `Err` — the caller decides whether to retry.
    pub async fn recv_from(&self) -> Result<(Segment, SocketAddr), SocketError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        let segment = Segment::decode(&buf[..n])?;
        Ok((segment, addr))
    }
}
