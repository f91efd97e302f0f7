//! Async driver binding a [`Connection`] to a socket and a timer.
//!
//! # Architecture
//!
//! ```text
//!  Application
//!      │  send(data) / receive() / close()
//!      ▼
//!  Stream ──────────────▶ Connection (sans-I/O state machine)
//!      ▲   one event at a time   │ poll_transmit / poll_timeout
//!      │                         ▼
//!  event queue (mpsc) ◀── RetransmitTimer        Socket::send_to
//!      ▲
//!      └── socket reader task (client) or server demux
//! ```
//!
//! Inbound segments and timer expiries share a single queue, so the
//! connection never sees two events at once and needs no locking.  Every
//! public method loops "flush outbound → wait for one event → apply it"
//! until its condition holds.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::connection::{ConnError, Connection};
use crate::packet::Segment;
use crate::server::Registration;
use crate::simulator::SimulatorConfig;
use crate::socket::{is_transient, Socket, SocketError};
use crate::state::ConnectionState;
use crate::timer::{RetransmitTimer, TimerFired};

/// Everything that can wake a connection up.
#[derive(Debug)]
pub(crate) enum Event {
    Segment(Segment),
    Timer(TimerFired),
    /// The socket reader hit a fatal error and stopped.
    SocketFailed(std::io::Error),
}

impl From<TimerFired> for Event {
    fn from(fired: TimerFired) -> Self {
        Event::Timer(fired)
    }
}

/// A reliable, ordered byte stream to one peer.
#[derive(Debug)]
pub struct Stream {
    conn: Connection,
    socket: Arc<Socket>,
    peer: SocketAddr,
    events: mpsc::UnboundedReceiver<Event>,
    timer: RetransmitTimer<Event>,
    /// Client side only: the task feeding `events` from the socket.
    reader: Option<JoinHandle<()>>,
    /// Server side only: our entry in the listener's routing table.
    registration: Option<Registration>,
}

impl Stream {
    // -----------------------------------------------------------------------
    // Constructors
    // -----------------------------------------------------------------------

    /// Resolve `host`, bind an ephemeral local port, and run the handshake.
    pub async fn open(host: &str, port: u16, config: Config) -> Result<Self, ConnError> {
        Self::open_with_faults(host, port, config, None).await
    }

    /// As [`Stream::open`], routing outbound datagrams through a fault model.
    pub async fn open_with_faults(
        host: &str,
        port: u16,
        config: Config,
        faults: Option<SimulatorConfig>,
    ) -> Result<Self, ConnError> {
        config.validate()?;
        let peer = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| ConnError::Resolve(format!("{host}:{port}")))?;
        let local: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let mut socket = Socket::bind(local).await?;
        if let Some(faults) = faults {
            socket = socket.with_faults(faults);
        }
        Self::connect(socket, peer, config).await
    }

    /// Active open over an already-bound socket.
    ///
    /// Returns once the connection is established, or with
    /// [`ConnError::ConnectionTimeout`] if the SYN is never answered.
    pub async fn connect(mut socket: Socket, peer: SocketAddr, config: Config) -> Result<Self, ConnError> {
        config.validate()?;
        socket.connect(peer).await?;
        let socket = Arc::new(socket);

        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(Arc::clone(&socket), tx.clone()));

        let conn_id: u16 = rand::random();
        let isn: u32 = rand::random();
        log::info!("[stream] connecting to {peer} (id={conn_id}, isn={isn})");
        let conn = Connection::connect(config, conn_id, isn, Instant::now());

        let mut stream = Self {
            conn,
            socket,
            peer,
            events: rx,
            timer: RetransmitTimer::new(tx),
            reader: Some(reader),
            registration: None,
        };
        stream.flush().await?;
        while !stream.conn.is_established() {
            stream.step().await?;
        }
        log::info!("[stream] connected to {peer}");
        Ok(stream)
    }

    /// Server side: wrap a listening connection whose first SYN is already
    /// queued on `events`.
    pub(crate) fn accepted(
        conn: Connection,
        socket: Arc<Socket>,
        peer: SocketAddr,
        events: (mpsc::UnboundedSender<Event>, mpsc::UnboundedReceiver<Event>),
        registration: Registration,
    ) -> Self {
        let (tx, rx) = events;
        Self {
            conn,
            socket,
            peer,
            events: rx,
            timer: RetransmitTimer::new(tx),
            reader: None,
            registration: Some(registration),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    pub fn conn_id(&self) -> u16 {
        self.conn.conn_id()
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    // -----------------------------------------------------------------------
    // Data transfer
    // -----------------------------------------------------------------------

    /// Queue `data` for reliable delivery.
    ///
    /// Blocks while more than `config.send_buffer` bytes are unacknowledged.
    /// Returning `Ok` means the bytes are buffered, not that the peer has them;
    /// [`Stream::close`] waits for that.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), ConnError> {
        let mut rest = data;
        while !rest.is_empty() {
            let room = self
                .conn
                .config()
                .send_buffer
                .saturating_sub(self.conn.send_buffered());
            if room == 0 {
                self.step().await?;
                continue;
            }
            let n = room.min(rest.len());
            self.conn.write(&rest[..n], Instant::now())?;
            rest = &rest[n..];
            self.flush().await?;
        }
        Ok(())
    }

    /// Next chunk of in-order bytes from the peer.
    ///
    /// `Ok(None)` marks the end of the stream: the peer's FIN has been
    /// consumed and everything before it returned.
    pub async fn receive(&mut self) -> Result<Option<Vec<u8>>, ConnError> {
        loop {
            let data = self.conn.read();
            if !data.is_empty() {
                return Ok(Some(data));
            }
            if self.conn.is_eof() || self.conn.is_closed() {
                return Ok(None);
            }
            self.step().await?;
        }
    }

    /// Read until the peer closes its side.
    pub async fn receive_to_end(&mut self) -> Result<Vec<u8>, ConnError> {
        let mut all = Vec::new();
        while let Some(chunk) = self.receive().await? {
            all.extend_from_slice(&chunk);
        }
        Ok(all)
    }

    /// Orderly close.
    ///
    /// Sends everything still buffered, then FIN, and returns once the
    /// connection reaches `Closed` (after the linger period on the side that
    /// closed first).
    pub async fn close(&mut self) -> Result<(), ConnError> {
        log::debug!("[stream] closing connection {}", self.conn.conn_id());
        self.conn.close(Instant::now());
        self.flush().await?;
        while !self.conn.is_closed() {
            self.step().await?;
        }
        self.registration = None;
        log::info!("[stream] connection {} to {} closed", self.conn.conn_id(), self.peer);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Event loop
    // -----------------------------------------------------------------------

    /// Wait for one event, apply it, and flush whatever it produced.
    pub(crate) async fn step(&mut self) -> Result<(), ConnError> {
        // The timer holds a sender, so the queue never reports closed.
        let event = self.events.recv().await.ok_or(ConnError::Closed)?;
        let now = Instant::now();
        match event {
            Event::Segment(segment) => self.conn.on_segment(segment, now),
            Event::Timer(fired) => {
                if self.timer.expire(fired) {
                    self.conn.on_timeout(now);
                }
            }
            Event::SocketFailed(e) => {
                self.conn.close(now);
                return Err(ConnError::Io(e));
            }
        }
        self.flush().await?;
        match self.conn.take_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Put every pending segment on the wire and re-arm the timer.
    async fn flush(&mut self) -> Result<(), ConnError> {
        while let Some(segment) = self.conn.poll_transmit() {
            match self.socket.send_to(&segment, self.peer).await {
                Ok(()) => {}
                Err(SocketError::Io(e)) if is_transient(&e) => {
                    log::debug!("[stream] send to {} lost: {e}", self.peer);
                }
                Err(e) => return Err(e.into()),
            }
        }
        match self.conn.poll_timeout() {
            Some(deadline) => self.timer.start_at(deadline),
            None => self.timer.stop(),
        }
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Client side: forward decoded segments from a connected socket.
async fn read_loop(socket: Arc<Socket>, events: mpsc::UnboundedSender<Event>) {
    loop {
        match socket.recv_from().await {
            Ok((segment, _)) => {
                if events.send(Event::Segment(segment)).is_err() {
                    return;
                }
            }
            Err(SocketError::Segment(e)) => log::debug!("[stream] dropping datagram: {e}"),
            Err(SocketError::Io(e)) if is_transient(&e) => {
                log::debug!("[stream] ignoring ICMP feedback: {e}");
            }
            Err(SocketError::Io(e)) => {
                log::error!("[stream] socket failed: {e}");
                let _ = events.send(Event::SocketFailed(e));
                return;
            }
        }
    }
}
