//! Per-connection protocol state machine.
//!
//! A [`Connection`] owns the complete protocol state for one logical session:
//! - Driving the finite-state machine (see [`crate::state`]).
//! - Coordinating the [`SendWindow`] and the [`Reassembler`].
//! - Deciding when the retransmission timer runs and what it re-sends.
//!
//! It performs no I/O and reads no clock.  Callers feed it inbound segments
//! ([`Connection::on_segment`]) and timer expiries ([`Connection::on_timeout`])
//! together with the current time, then drain outbound segments with
//! [`Connection::poll_transmit`] and re-arm their timer from
//! [`Connection::poll_timeout`].  [`crate::stream::Stream`] is the async
//! driver that does this against a real socket.

use std::collections::VecDeque;
use std::time::Instant;

use thiserror::Error;

use crate::config::{Config, ConfigError};
use crate::packet::{flags, Segment};
use crate::reassembler::Reassembler;
use crate::send_window::SendWindow;
use crate::state::ConnectionState;
use crate::timer::RtoEstimator;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures surfaced to the application.
///
/// Malformed, duplicate, and out-of-window segments never appear here: they
/// are handled locally by dropping and, where useful, re-acknowledging.
#[derive(Debug, Error)]
pub enum ConnError {
    /// The retry budget or the idle timeout ran out.
    #[error("connection timed out in {0}")]
    ConnectionTimeout(ConnectionState),
    /// The connection is closed (or closing) and cannot take this operation.
    #[error("connection closed")]
    Closed,
    /// The configuration cannot drive a connection.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// The host name did not resolve to any address.
    #[error("could not resolve {0}")]
    Resolve(String),
    /// Local failure of the underlying datagram socket.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One endpoint of a reliable connection.
#[derive(Debug)]
pub struct Connection {
    config: Config,
    state: ConnectionState,
    conn_id: u16,
    /// Our initial sequence number.
    isn: u32,
    send: SendWindow,
    recv: Reassembler,
    rto: RtoEstimator,
    /// Consecutive retransmission timeouts without an advancing ACK.
    retries: u32,
    rtx_deadline: Option<Instant>,
    linger_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,
    /// The application (or the peer's FIN) asked for our FIN.
    close_requested: bool,
    outbox: VecDeque<Segment>,
    error: Option<ConnError>,
}

impl Connection {
    fn new(config: Config, conn_id: u16, isn: u32) -> Self {
        Self {
            send: SendWindow::new(isn),
            recv: Reassembler::new(0, config.max_reorder),
            rto: RtoEstimator::from_config(&config),
            config,
            state: ConnectionState::Closed,
            conn_id,
            isn,
            retries: 0,
            rtx_deadline: None,
            linger_deadline: None,
            idle_deadline: None,
            close_requested: false,
            outbox: VecDeque::new(),
            error: None,
        }
    }

    /// Active open: queue a SYN with sequence number `isn` for connection
    /// `conn_id` and move to `SynSent`.
    pub fn connect(config: Config, conn_id: u16, isn: u32, now: Instant) -> Self {
        let mut conn = Self::new(config, conn_id, isn);
        conn.set_state(ConnectionState::SynSent);
        conn.touch(now);
        conn.send.push_syn();
        conn.emit_control(now);
        conn
    }

    /// Passive open: wait in `Listen` for the first SYN.  Our SYN+ACK will
    /// carry sequence number `isn`.
    pub fn listen(config: Config, isn: u32) -> Self {
        let mut conn = Self::new(config, 0, isn);
        conn.set_state(ConnectionState::Listen);
        conn
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn conn_id(&self) -> u16 {
        self.conn_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Next sequence number expected from the peer.
    pub fn expected_next(&self) -> u32 {
        self.recv.expected_next()
    }

    /// Next sequence number we will send.
    pub fn snd_nxt(&self) -> u32 {
        self.send.snd_nxt()
    }

    /// Bytes accepted from the application and not yet acknowledged.
    pub fn send_buffered(&self) -> usize {
        self.send.unsent_bytes() + self.send.in_flight_bytes()
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> std::time::Duration {
        self.rto.rto()
    }

    pub fn is_established(&self) -> bool {
        self.state.is_synchronized()
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// `true` once the peer's FIN is consumed and every byte before it read.
    pub fn is_eof(&self) -> bool {
        self.recv.is_finished()
    }

    /// The terminal failure, if the connection died rather than closing.
    pub fn take_error(&mut self) -> Option<ConnError> {
        self.error.take()
    }

    // -----------------------------------------------------------------------
    // Application surface
    // -----------------------------------------------------------------------

    /// Append application bytes to the outbound stream.
    ///
    /// Bytes written before the handshake completes are held until then.
    pub fn write(&mut self, data: &[u8], now: Instant) -> Result<(), ConnError> {
        let open = matches!(
            self.state,
            ConnectionState::SynSent | ConnectionState::SynReceived | ConnectionState::Established
        );
        if !open || self.close_requested {
            return Err(ConnError::Closed);
        }
        self.send.push(data);
        self.pump(now);
        Ok(())
    }

    /// Take every in-order byte received so far.
    pub fn read(&mut self) -> Vec<u8> {
        self.recv.take_ready()
    }

    /// Request an orderly close: a FIN follows the last buffered byte.
    pub fn close(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Closed => {}
            ConnectionState::Listen => self.set_state(ConnectionState::Closed),
            _ => {
                self.close_requested = true;
                self.pump(now);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Event inputs
    // -----------------------------------------------------------------------

    /// Process one inbound segment from the peer.
    pub fn on_segment(&mut self, segment: Segment, now: Instant) {
        let h = segment.header;
        log::trace!("[conn {}] ← {segment} in {}", self.conn_id, self.state);

        match self.state {
            ConnectionState::Closed => return,
            ConnectionState::Listen => {
                if h.has(flags::SYN) && !h.has(flags::ACK) {
                    self.conn_id = h.conn_id;
                    self.recv = Reassembler::new(h.seq.wrapping_add(1), self.config.max_reorder);
                    self.set_state(ConnectionState::SynReceived);
                    self.touch(now);
                    self.send.push_syn();
                    self.emit_control(now);
                }
                return;
            }
            _ => {}
        }

        if h.conn_id != self.conn_id {
            log::trace!("[conn {}] drop: foreign connection id {}", self.conn_id, h.conn_id);
            return;
        }

        match self.state {
            ConnectionState::SynSent => {
                if h.has(flags::SYN | flags::ACK) && h.ack == self.isn.wrapping_add(1) {
                    self.touch(now);
                    self.recv = Reassembler::new(h.seq.wrapping_add(1), self.config.max_reorder);
                    self.on_ack(h.ack, now);
                    self.set_state(ConnectionState::Established);
                    self.send_ack();
                    self.pump(now);
                } else {
                    log::trace!("[conn {}] drop: not a matching SYN+ACK", self.conn_id);
                }
            }
            ConnectionState::SynReceived => {
                if h.has(flags::SYN) && !h.has(flags::ACK) {
                    // Client never saw our SYN+ACK.
                    if h.seq.wrapping_add(1) == self.recv.expected_next() {
                        self.touch(now);
                        if let Some(synack) = self.send.retransmit_oldest(now) {
                            self.enqueue(synack);
                        }
                    }
                    return;
                }
                // Any segment acknowledging our SYN confirms the handshake,
                // including a first data segment with its piggybacked ACK.
                if !h.has(flags::ACK) || h.ack != self.isn.wrapping_add(1) {
                    log::trace!("[conn {}] drop: handshake not confirmed", self.conn_id);
                    return;
                }
                self.touch(now);
                self.set_state(ConnectionState::Established);
                self.on_synchronized(segment, now);
            }
            _ => {
                self.touch(now);
                self.on_synchronized(segment, now);
            }
        }
    }

    /// Process a timer expiry.  Deadlines not yet reached are left alone, so
    /// calling this early is harmless.
    pub fn on_timeout(&mut self, now: Instant) {
        if self.state == ConnectionState::Closed {
            return;
        }

        if self.linger_deadline.is_some_and(|d| now >= d) {
            log::debug!("[conn {}] linger over", self.conn_id);
            self.shut_down();
            return;
        }

        if self.idle_deadline.is_some_and(|d| now >= d) {
            log::warn!("[conn {}] peer silent for {:?}", self.conn_id, self.config.idle_timeout);
            self.fail();
            return;
        }

        if self.rtx_deadline.is_some_and(|d| now >= d) {
            self.retries += 1;
            if self.retries > self.config.max_retries {
                log::warn!("[conn {}] no progress after {} retransmissions", self.conn_id, self.config.max_retries);
                self.fail();
                return;
            }

            let mut due = self.send.retransmit_due(now, self.rto.rto());
            if due.is_empty() {
                due.extend(self.send.retransmit_oldest(now));
            }
            log::debug!(
                "[conn {}] timeout #{}: retransmitting {} range(s), rto={:?}",
                self.conn_id,
                self.retries,
                due.len(),
                self.rto.rto()
            );
            for segment in due {
                self.enqueue(segment);
            }

            self.rto.back_off();
            self.rtx_deadline = self.send.has_unacked().then(|| now + self.rto.rto());
        }
    }

    // -----------------------------------------------------------------------
    // Event outputs
    // -----------------------------------------------------------------------

    /// Next segment to put on the wire.
    pub fn poll_transmit(&mut self) -> Option<Segment> {
        self.outbox.pop_front()
    }

    /// Earliest instant at which [`Connection::on_timeout`] has work to do.
    ///
    /// `None` only once the connection is closed.
    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.state == ConnectionState::Closed {
            return None;
        }
        [self.rtx_deadline, self.linger_deadline, self.idle_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            log::debug!("[conn {}] {} → {}", self.conn_id, self.state, next);
            self.state = next;
        }
    }

    /// Heard from the peer: push the idle deadline out.
    fn touch(&mut self, now: Instant) {
        if self.state != ConnectionState::TimeWait {
            self.idle_deadline = Some(now + self.config.idle_timeout);
        }
    }

    /// Handle ACK, payload, and FIN once the handshake has completed.
    fn on_synchronized(&mut self, segment: Segment, now: Instant) {
        let h = segment.header;

        if h.has(flags::SYN) {
            // Our confirming ACK was lost and the peer re-sent SYN+ACK.
            if h.has(flags::ACK) {
                self.send_ack();
            }
            return;
        }

        if h.has(flags::ACK) {
            self.on_ack(h.ack, now);
        }

        if !segment.payload.is_empty() || h.has(flags::FIN) {
            let had_fin = self.recv.fin_received();
            let verdict = self.recv.on_segment(&segment);
            log::trace!("[conn {}] seq={} {:?}", self.conn_id, h.seq, verdict);
            self.send_ack();

            if !had_fin && self.recv.fin_received() {
                log::debug!("[conn {}] peer finished sending", self.conn_id);
                if self.state == ConnectionState::Established {
                    self.close_requested = true;
                }
            }
        }

        match self.state {
            ConnectionState::FinWait if self.send.fin_acked() => {
                self.set_state(ConnectionState::TimeWait);
                self.rtx_deadline = None;
                self.idle_deadline = None;
                self.linger_deadline = Some(now + self.config.linger);
            }
            ConnectionState::LastAck if self.send.fin_acked() => self.shut_down(),
            _ => {}
        }

        self.pump(now);
    }

    fn on_ack(&mut self, ack: u32, now: Instant) {
        let Some(acked) = self.send.on_ack(ack, now) else {
            return;
        };
        self.retries = 0;
        // Karn: a retransmitted range gives no sample, and the backed-off
        // RTO stands until one arrives.
        if let Some(rtt) = acked.rtt {
            self.rto.record_rtt_sample(rtt);
        }
        self.rtx_deadline = self.send.has_unacked().then(|| now + self.rto.rto());
    }

    /// Transmit whatever the window allows, queuing our FIN when closing.
    fn pump(&mut self, now: Instant) {
        if !self.state.can_transmit() {
            return;
        }
        if self.close_requested {
            self.send.push_fin();
        }
        while let Some(segment) = self.send.next_to_send(self.config.mss, self.config.window, now) {
            if segment.header.has(flags::FIN) {
                let next = if self.recv.fin_received() {
                    ConnectionState::LastAck
                } else {
                    ConnectionState::FinWait
                };
                self.set_state(next);
            }
            self.enqueue(segment);
            self.rtx_deadline = Some(now + self.rto.rto());
        }
    }

    /// Send a queued SYN before the handshake completes.
    fn emit_control(&mut self, now: Instant) {
        if let Some(segment) = self.send.next_to_send(self.config.mss, self.config.window, now) {
            self.enqueue(segment);
            self.rtx_deadline = Some(now + self.rto.rto());
        }
    }

    fn send_ack(&mut self) {
        let ack = Segment::new(self.send.snd_nxt(), 0, 0, 0, Vec::new());
        self.enqueue(ack);
    }

    /// Stamp connection id and (once the peer's ISN is known) the cumulative
    /// ACK onto an outbound segment, then queue it.
    fn enqueue(&mut self, mut segment: Segment) {
        segment.header.conn_id = self.conn_id;
        if self.state != ConnectionState::SynSent {
            segment.header.flags |= flags::ACK;
            segment.header.ack = self.recv.ack_to_send();
        }
        log::trace!("[conn {}] → {segment}", self.conn_id);
        self.outbox.push_back(segment);
    }

    fn shut_down(&mut self) {
        self.set_state(ConnectionState::Closed);
        self.rtx_deadline = None;
        self.linger_deadline = None;
        self.idle_deadline = None;
    }

    fn fail(&mut self) {
        self.error = Some(ConnError::ConnectionTimeout(self.state));
        self.outbox.clear();
        self.shut_down();
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const ID: u16 = 0x1234;

    fn drain(conn: &mut Connection) -> Vec<Segment> {
        std::iter::from_fn(|| conn.poll_transmit()).collect()
    }

    fn deliver(from: &mut Connection, to: &mut Connection, now: Instant) -> usize {
        let segments = drain(from);
        let n = segments.len();
        for s in segments {
            to.on_segment(s, now);
        }
        n
    }

    fn established_pair(now: Instant) -> (Connection, Connection) {
        let mut client = Connection::connect(Config::default(), ID, 1000, now);
        let mut server = Connection::listen(Config::default(), 5000);
        while deliver(&mut client, &mut server, now) + deliver(&mut server, &mut client, now) > 0 {}
        (client, server)
    }

    #[test]
    fn three_way_handshake() {
        let now = Instant::now();
        let mut client = Connection::connect(Config::default(), ID, 1000, now);
        let mut server = Connection::listen(Config::default(), 5000);

        let syn = drain(&mut client);
        assert_eq!(syn.len(), 1);
        assert_eq!(syn[0].header.seq, 1000);
        assert_eq!(syn[0].header.flags, flags::SYN);
        assert_eq!(syn[0].header.conn_id, ID);
        assert_eq!(client.state(), ConnectionState::SynSent);

        server.on_segment(syn[0].clone(), now);
        let synack = drain(&mut server);
        assert_eq!(synack.len(), 1);
        assert_eq!(synack[0].header.seq, 5000);
        assert_eq!(synack[0].header.ack, 1001);
        assert!(synack[0].header.has(flags::SYN | flags::ACK));
        assert_eq!(server.state(), ConnectionState::SynReceived);

        client.on_segment(synack[0].clone(), now);
        let ack = drain(&mut client);
        assert_eq!(ack.len(), 1);
        assert_eq!(ack[0].header.flags, flags::ACK);
        assert_eq!(ack[0].header.ack, 5001);
        assert_eq!(client.state(), ConnectionState::Established);

        server.on_segment(ack[0].clone(), now);
        assert_eq!(server.state(), ConnectionState::Established);
        assert_eq!(server.expected_next(), 1001);
        assert_eq!(client.expected_next(), 5001);
        assert_eq!(server.poll_timeout(), Some(now + Config::default().idle_timeout));
    }

    #[test]
    fn first_data_segment_confirms_handshake() {
        let now = Instant::now();
        let mut client = Connection::connect(Config::default(), ID, 1000, now);
        let mut server = Connection::listen(Config::default(), 5000);
        deliver(&mut client, &mut server, now);
        deliver(&mut server, &mut client, now);

        client.write(b"hello", now).unwrap();
        let out = drain(&mut client);
        assert_eq!(out.len(), 2, "pure ACK plus data");
        // Lose the pure ACK; the data segment carries the same acknowledgement.
        server.on_segment(out[1].clone(), now);
        assert_eq!(server.state(), ConnectionState::Established);
        assert_eq!(server.read(), b"hello");
    }

    #[test]
    fn duplicate_syn_resends_synack() {
        let now = Instant::now();
        let mut client = Connection::connect(Config::default(), ID, 1000, now);
        let mut server = Connection::listen(Config::default(), 5000);
        let syn = drain(&mut client).remove(0);

        server.on_segment(syn.clone(), now);
        drain(&mut server);
        server.on_segment(syn, now);
        let again = drain(&mut server);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].header.seq, 5000);
        assert!(again[0].header.has(flags::SYN | flags::ACK));
    }

    #[test]
    fn duplicate_synack_is_reacknowledged() {
        let now = Instant::now();
        let mut client = Connection::connect(Config::default(), ID, 1000, now);
        let mut server = Connection::listen(Config::default(), 5000);
        deliver(&mut client, &mut server, now);
        let synack = drain(&mut server).remove(0);

        client.on_segment(synack.clone(), now);
        drain(&mut client);
        client.on_segment(synack, now);
        let ack = drain(&mut client);
        assert_eq!(ack.len(), 1);
        assert_eq!(ack[0].header.ack, 5001);
    }

    #[test]
    fn wrong_connection_id_is_dropped() {
        let now = Instant::now();
        let (mut client, mut server) = established_pair(now);
        client.write(b"data", now).unwrap();
        let mut seg = drain(&mut client).remove(0);
        seg.header.conn_id = ID + 1;
        server.on_segment(seg, now);
        assert!(server.read().is_empty());
        assert!(drain(&mut server).is_empty());
    }

    #[test]
    fn syn_is_retransmitted_then_times_out() {
        let mut config = Config::default();
        config.idle_timeout = Duration::from_secs(3600);
        config.max_retries = 3;
        let mut now = Instant::now();
        let mut client = Connection::connect(config, ID, 1000, now);
        drain(&mut client);

        for attempt in 1..=3 {
            now = client.poll_timeout().unwrap();
            client.on_timeout(now);
            let resent = drain(&mut client);
            assert_eq!(resent.len(), 1, "attempt {attempt}");
            assert!(resent[0].header.has(flags::SYN));
            assert_eq!(resent[0].header.seq, 1000);
        }

        now = client.poll_timeout().unwrap();
        client.on_timeout(now);
        assert!(client.is_closed());
        assert!(matches!(
            client.take_error(),
            Some(ConnError::ConnectionTimeout(ConnectionState::SynSent))
        ));
    }

    #[test]
    fn timeout_retransmits_only_when_data_is_unacknowledged() {
        let now = Instant::now();
        let (mut client, mut server) = established_pair(now);

        client.write(b"payload", now).unwrap();
        drain(&mut client);
        let deadline = client.poll_timeout().unwrap();
        assert_eq!(deadline, now + client.rto());
        client.on_timeout(deadline);
        let resent = drain(&mut client);
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].payload, b"payload");

        server.on_segment(resent[0].clone(), deadline);
        deliver(&mut server, &mut client, deadline);
        // Everything acknowledged: only the idle deadline remains.
        assert_eq!(
            client.poll_timeout(),
            Some(deadline + client.config().idle_timeout)
        );
        client.on_timeout(deadline + client.rto() * 4);
        assert!(drain(&mut client).is_empty());
    }

    #[test]
    fn ack_of_retransmission_keeps_backed_off_rto() {
        let now = Instant::now();
        let (mut client, mut server) = established_pair(now);
        let base = client.rto();

        client.write(b"first", now).unwrap();
        drain(&mut client);
        let deadline = client.poll_timeout().unwrap();
        client.on_timeout(deadline);
        let resent = drain(&mut client);
        assert_eq!(client.rto(), base * 2);

        for s in resent {
            server.on_segment(s, deadline);
        }
        deliver(&mut server, &mut client, deadline);
        assert_eq!(client.rto(), base * 2, "no sample from a retransmitted range");

        client.write(b"second", deadline).unwrap();
        deliver(&mut client, &mut server, deadline);
        deliver(&mut server, &mut client, deadline);
        assert_eq!(client.rto(), base);
    }

    #[test]
    fn zero_mss_write_returns_without_sending_data() {
        let now = Instant::now();
        let config = Config {
            mss: 0,
            ..Config::default()
        };
        let mut client = Connection::connect(config.clone(), ID, 1000, now);
        let mut server = Connection::listen(config, 5000);
        while deliver(&mut client, &mut server, now) + deliver(&mut server, &mut client, now) > 0 {}

        client.write(b"x", now).unwrap();
        assert!(drain(&mut client).iter().all(|s| s.payload.is_empty()));
        assert_eq!(client.send_buffered(), 1);
    }

    #[test]
    fn idle_peer_times_out() {
        let now = Instant::now();
        let (_client, mut server) = established_pair(now);
        let later = now + server.config().idle_timeout;
        server.on_timeout(later);
        assert!(server.is_closed());
        assert!(matches!(server.take_error(), Some(ConnError::ConnectionTimeout(_))));
    }

    #[test]
    fn orderly_teardown() {
        let now = Instant::now();
        let (mut client, mut server) = established_pair(now);

        client.write(b"last words", now).unwrap();
        client.close(now);
        assert!(client.write(b"more", now).is_err());
        let out = drain(&mut client);
        let fin = out.iter().find(|s| s.header.has(flags::FIN)).unwrap();
        assert_eq!(fin.header.seq, 1001 + 10);
        assert_eq!(client.state(), ConnectionState::FinWait);

        for s in out {
            server.on_segment(s, now);
        }
        assert_eq!(server.read(), b"last words");
        assert!(server.is_eof());
        assert_eq!(server.state(), ConnectionState::LastAck);

        deliver(&mut server, &mut client, now);
        assert_eq!(client.state(), ConnectionState::TimeWait);
        deliver(&mut client, &mut server, now);
        assert!(server.is_closed());
        assert!(server.take_error().is_none());

        let linger = client.config().linger;
        assert_eq!(client.poll_timeout(), Some(now + linger));
        client.on_timeout(now + linger);
        assert!(client.is_closed());
        assert!(client.take_error().is_none());
    }

    #[test]
    fn time_wait_reacknowledges_retransmitted_fin() {
        let now = Instant::now();
        let (mut client, mut server) = established_pair(now);
        client.close(now);
        deliver(&mut client, &mut server, now);
        let from_server = drain(&mut server);
        let server_fin = from_server
            .iter()
            .find(|s| s.header.has(flags::FIN))
            .cloned()
            .unwrap();
        for s in from_server {
            client.on_segment(s, now);
        }
        assert_eq!(client.state(), ConnectionState::TimeWait);
        drain(&mut client);

        client.on_segment(server_fin, now);
        let ack = drain(&mut client);
        assert_eq!(ack.len(), 1);
        assert_eq!(ack[0].header.ack, 5002);
    }
}
