//! Passive side: one UDP socket serving many connections.
//!
//! A background demux task owns the socket's receive half and a routing
//! table keyed by `(peer address, connection id)`.  A SYN for an unknown key
//! creates a listening [`Connection`] and hands a new [`Stream`] to
//! [`Listener::accept`]; every other segment is forwarded to the owning
//! stream's event queue or dropped.
//!
//! ```text
//!   UDP socket ──recv──▶ demux ──┬─▶ Stream A events
//!        ▲                       ├─▶ Stream B events
//!        │                       └─▶ (unknown: dropped)
//!        └──────────── send_to ◀── every Stream
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::connection::{ConnError, Connection};
use crate::packet::{flags, Segment};
use crate::socket::{is_transient, Socket, SocketError};
use crate::stream::{Event, Stream};

type ConnKey = (SocketAddr, u16);

/// Why the demux could not route a segment.  Never leaves this module.
#[derive(Debug, Error)]
enum DemuxError {
    #[error("no connection {conn_id} from {peer}")]
    UnknownConnection { peer: SocketAddr, conn_id: u16 },
    #[error("connection {conn_id} from {peer} was dropped")]
    Gone { peer: SocketAddr, conn_id: u16 },
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// A stream's entry in the routing table; removed when the stream goes away.
#[derive(Debug)]
pub(crate) struct Registration {
    key: ConnKey,
    serial: u64,
    release: mpsc::UnboundedSender<(ConnKey, u64)>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        // The listener may already be gone.
        let _ = self.release.send((self.key, self.serial));
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Accepts inbound connections on one local port.
#[derive(Debug)]
pub struct Listener {
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<Result<Stream, ConnError>>,
    demux: JoinHandle<()>,
}

impl Listener {
    /// Listen on every interface at `port` (0 picks an ephemeral port).
    pub async fn bind(port: u16, config: Config) -> Result<Self, ConnError> {
        config.validate()?;
        let socket = Socket::bind(([0, 0, 0, 0], port).into()).await?;
        Self::from_socket(socket, config)
    }

    /// Serve connections on an already-bound socket.
    pub fn from_socket(socket: Socket, config: Config) -> Result<Self, ConnError> {
        config.validate()?;
        let local_addr = socket.local_addr;
        let (accept_tx, incoming) = mpsc::channel(config.backlog.max(1));
        let (release_tx, release_rx) = mpsc::unbounded_channel();
        let demux = Demux {
            socket: Arc::new(socket),
            config,
            routes: HashMap::new(),
            next_serial: 0,
            accept_tx,
            release_tx,
            release_rx,
        };
        log::info!("[server] listening on {local_addr}");
        Ok(Self {
            local_addr,
            incoming,
            demux: tokio::spawn(demux.run()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next peer to open a connection.
    ///
    /// The returned stream has answered the SYN with SYN+ACK; the handshake
    /// completes as soon as the peer's ACK (or first data) arrives, which
    /// happens inside the stream's first `receive` or `send`.
    pub async fn accept(&mut self) -> Result<Stream, ConnError> {
        let mut stream = match self.incoming.recv().await {
            Some(stream) => stream?,
            None => return Err(ConnError::Closed),
        };
        stream.step().await?;
        log::info!("[server] accepted connection {} from {}", stream.conn_id(), stream.peer());
        Ok(stream)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.demux.abort();
    }
}

// ---------------------------------------------------------------------------
// Demux task
// ---------------------------------------------------------------------------

struct Route {
    serial: u64,
    events: mpsc::UnboundedSender<Event>,
}

struct Demux {
    socket: Arc<Socket>,
    config: Config,
    routes: HashMap<ConnKey, Route>,
    next_serial: u64,
    accept_tx: mpsc::Sender<Result<Stream, ConnError>>,
    release_tx: mpsc::UnboundedSender<(ConnKey, u64)>,
    release_rx: mpsc::UnboundedReceiver<(ConnKey, u64)>,
}

impl Demux {
    async fn run(mut self) {
        loop {
            tokio::select! {
                Some((key, serial)) = self.release_rx.recv() => self.release(key, serial),
                received = self.socket.recv_from() => match received {
                    Ok((segment, from)) => {
                        if let Err(e) = self.dispatch(segment, from) {
                            log::debug!("[server] dropping segment: {e}");
                        }
                    }
                    Err(SocketError::Segment(e)) => log::debug!("[server] dropping datagram: {e}"),
                    Err(SocketError::Io(e)) if is_transient(&e) => {
                        log::debug!("[server] ignoring ICMP feedback: {e}");
                    }
                    Err(SocketError::Io(e)) => {
                        log::error!("[server] socket failed: {e}");
                        let _ = self.accept_tx.send(Err(ConnError::Io(e))).await;
                        return;
                    }
                },
            }
        }
    }

    fn dispatch(&mut self, segment: Segment, from: SocketAddr) -> Result<(), DemuxError> {
        let conn_id = segment.header.conn_id;
        let key = (from, conn_id);

        if let Some(route) = self.routes.get(&key) {
            if route.events.send(Event::Segment(segment)).is_err() {
                self.routes.remove(&key);
                return Err(DemuxError::Gone { peer: from, conn_id });
            }
            return Ok(());
        }

        let h = segment.header;
        if h.has(flags::SYN) && !h.has(flags::ACK) {
            self.open(key, segment);
            return Ok(());
        }
        Err(DemuxError::UnknownConnection { peer: from, conn_id })
    }

    /// New SYN: build the stream and offer it to `accept`.
    fn open(&mut self, key: ConnKey, syn: Segment) {
        let (tx, rx) = mpsc::unbounded_channel();
        // Queued before anyone can step the stream, so it is the first event.
        let _ = tx.send(Event::Segment(syn));

        let serial = self.next_serial;
        self.next_serial += 1;
        let registration = Registration {
            key,
            serial,
            release: self.release_tx.clone(),
        };
        let conn = Connection::listen(self.config.clone(), rand::random());
        let stream = Stream::accepted(
            conn,
            Arc::clone(&self.socket),
            key.0,
            (tx.clone(), rx),
            registration,
        );

        match self.accept_tx.try_send(Ok(stream)) {
            Ok(()) => {
                log::debug!("[server] new connection {} from {}", key.1, key.0);
                self.routes.insert(key, Route { serial, events: tx });
            }
            Err(_) => log::warn!("[server] backlog full, ignoring SYN from {}", key.0),
        }
    }

    fn release(&mut self, key: ConnKey, serial: u64) {
        if self.routes.get(&key).is_some_and(|r| r.serial == serial) {
            self.routes.remove(&key);
            log::debug!("[server] connection {} from {} released", key.1, key.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn listener() -> Listener {
        let socket = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        Listener::from_socket(socket, Config::fast()).unwrap()
    }

    #[tokio::test]
    async fn zero_window_is_refused() {
        let socket = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let config = Config {
            window: 0,
            ..Config::fast()
        };
        assert!(matches!(
            Listener::from_socket(socket, config),
            Err(ConnError::Config(crate::config::ConfigError::ZeroWindow))
        ));
    }

    #[tokio::test]
    async fn syn_is_answered_with_synack() {
        let mut listener = listener().await;
        let client = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        client
            .send_to(&Segment::new(77, 0, 9, flags::SYN, Vec::new()), listener.local_addr())
            .await
            .unwrap();

        let stream = listener.accept().await.unwrap();
        assert_eq!(stream.conn_id(), 9);
        assert_eq!(stream.peer(), client.local_addr);

        let (synack, _) = client.recv_from().await.unwrap();
        assert!(synack.header.has(flags::SYN | flags::ACK));
        assert_eq!(synack.header.ack, 78);
        assert_eq!(synack.header.conn_id, 9);
    }

    #[tokio::test]
    async fn segment_for_unknown_connection_is_ignored() {
        let mut listener = listener().await;
        let client = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        client
            .send_to(&Segment::new(5, 5, 3, flags::ACK, b"x".to_vec()), listener.local_addr())
            .await
            .unwrap();

        let got =
            tokio::time::timeout(std::time::Duration::from_millis(200), listener.accept()).await;
        assert!(got.is_err(), "no connection should be created");
        let silence =
            tokio::time::timeout(std::time::Duration::from_millis(50), client.recv_from()).await;
        assert!(silence.is_err(), "nothing is sent back");
    }

    #[tokio::test]
    async fn connections_are_told_apart_by_id() {
        let mut listener = listener().await;
        let client = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        for id in [1u16, 2] {
            client
                .send_to(&Segment::new(100, 0, id, flags::SYN, Vec::new()), listener.local_addr())
                .await
                .unwrap();
        }
        let a = listener.accept().await.unwrap();
        let b = listener.accept().await.unwrap();
        assert_ne!(a.conn_id(), b.conn_id());
    }
}
