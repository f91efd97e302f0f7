//! Outbound byte window.
//!
//! [`SendWindow`] buffers application bytes, carves them into segments, and
//! keeps every transmitted-but-unacknowledged range until a cumulative ACK
//! covers it.  SYN and FIN live in the same window: each occupies one
//! sequence number and is retransmitted under exactly the same rules as data.
//!
//! # Protocol contract
//!
//! - At most `window_limit` sequence numbers may be in flight at once; the
//!   limit is a fixed configuration value, never negotiated.
//! - ACKs are **cumulative**: `ack = K` means the peer holds every byte
//!   before `K`.  Stale or duplicate ACKs change nothing.
//! - On timeout the caller collects [`SendWindow::retransmit_due`] and
//!   re-sends those ranges unchanged.
//! - Sequence numbers are u32 and wrap; two numbers are compared in
//!   wrap-around space (their distance is always far below `u32::MAX / 2`).
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility, and the caller stamps `ack` / `conn_id` on each segment.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::packet::{flags, Segment};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Returns `true` when sequence number `a` is ≤ `b` in wrap-around space.
#[inline]
pub(crate) fn seq_le(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) <= (u32::MAX / 2)
}

/// Returns `true` when sequence number `a` is < `b` in wrap-around space.
#[inline]
pub(crate) fn seq_lt(a: u32, b: u32) -> bool {
    a != b && seq_le(a, b)
}

// ---------------------------------------------------------------------------
// InFlight
// ---------------------------------------------------------------------------

/// One transmitted range awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct InFlight {
    /// First sequence number of the range.
    pub seq: u32,
    /// [`flags::SYN`] or [`flags::FIN`] for control entries, else zero.
    pub control: u16,
    pub payload: Vec<u8>,
    /// Total number of times this range has been transmitted.
    pub tx_count: u32,
    /// Time of the most recent transmission.
    pub sent_at: Instant,
}

impl InFlight {
    fn seq_len(&self) -> u32 {
        self.payload.len() as u32 + u32::from(self.control != 0)
    }

    /// First sequence number after this range.
    fn end(&self) -> u32 {
        self.seq.wrapping_add(self.seq_len())
    }

    fn to_segment(&self) -> Segment {
        Segment::new(self.seq, 0, 0, self.control, self.payload.clone())
    }
}

/// Result of an ACK that advanced the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acked {
    /// Sequence numbers newly acknowledged.
    pub bytes: u32,
    /// Round-trip sample, present only when the newest fully acknowledged
    /// range was transmitted exactly once (Karn's rule).
    pub rtt: Option<Duration>,
}

// ---------------------------------------------------------------------------
// SendWindow
// ---------------------------------------------------------------------------

/// Send-side byte window for one connection.
///
/// # Sequence-number layout
///
/// ```text
///  snd_una            snd_nxt
///      │                  │
///  ────┼──────────────────┼──────────────────▶ seq space
///      │ <── in flight ──▶│ <── unsent ──────▶
/// ```
#[derive(Debug)]
pub struct SendWindow {
    /// Oldest unacknowledged sequence number (left window edge).
    snd_una: u32,
    /// Sequence number for the next new range.
    snd_nxt: u32,
    /// Application bytes not yet transmitted.
    unsent: VecDeque<u8>,
    /// Transmitted ranges ordered by sequence number (front = oldest).
    in_flight: VecDeque<InFlight>,
    syn_pending: bool,
    fin_pending: bool,
    fin_sent: bool,
}

impl SendWindow {
    /// Create a window whose first range will carry sequence number `isn`.
    pub fn new(isn: u32) -> Self {
        Self {
            snd_una: isn,
            snd_nxt: isn,
            unsent: VecDeque::new(),
            in_flight: VecDeque::new(),
            syn_pending: false,
            fin_pending: false,
            fin_sent: false,
        }
    }

    pub fn snd_una(&self) -> u32 {
        self.snd_una
    }

    pub fn snd_nxt(&self) -> u32 {
        self.snd_nxt
    }

    /// Sequence numbers sent but not yet acknowledged.
    pub fn in_flight_bytes(&self) -> usize {
        self.snd_nxt.wrapping_sub(self.snd_una) as usize
    }

    /// Application bytes accepted but never transmitted.
    pub fn unsent_bytes(&self) -> usize {
        self.unsent.len()
    }

    /// `true` when at least one range is awaiting acknowledgement.
    pub fn has_unacked(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// `true` when nothing is queued, pending, or in flight.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.unsent.is_empty() && !self.syn_pending && !self.fin_pending
    }

    /// `true` once a FIN has been queued or sent.
    pub fn fin_queued(&self) -> bool {
        self.fin_pending || self.fin_sent
    }

    /// `true` once our FIN has been transmitted and acknowledged.
    pub fn fin_acked(&self) -> bool {
        self.fin_sent && self.in_flight.is_empty()
    }

    /// Append application bytes to the unsent tail.
    pub fn push(&mut self, data: &[u8]) {
        debug_assert!(!self.fin_queued(), "push after FIN");
        self.unsent.extend(data.iter().copied());
    }

    /// Queue a SYN; it goes out ahead of any data.
    pub fn push_syn(&mut self) {
        self.syn_pending = true;
    }

    /// Queue a FIN after the last byte currently buffered.
    pub fn push_fin(&mut self) {
        if !self.fin_queued() {
            self.fin_pending = true;
        }
    }

    /// Take the next range to transmit for the first time.
    ///
    /// Data is bounded by `mss` and by `window_limit` minus the bytes
    /// already in flight.  Returns `None` if the window is full or nothing
    /// new remains.  The returned segment is recorded as in flight.
    pub fn next_to_send(&mut self, mss: usize, window_limit: usize, now: Instant) -> Option<Segment> {
        if self.syn_pending {
            self.syn_pending = false;
            return Some(self.record(flags::SYN, Vec::new(), now));
        }

        let room = window_limit.saturating_sub(self.in_flight_bytes());
        if room == 0 {
            return None;
        }

        if !self.unsent.is_empty() {
            let n = self.unsent.len().min(mss).min(room);
            if n == 0 {
                return None;
            }
            let payload: Vec<u8> = self.unsent.drain(..n).collect();
            return Some(self.record(0, payload, now));
        }

        if self.fin_pending {
            self.fin_pending = false;
            self.fin_sent = true;
            return Some(self.record(flags::FIN, Vec::new(), now));
        }

        None
    }

    fn record(&mut self, control: u16, payload: Vec<u8>, now: Instant) -> Segment {
        let entry = InFlight {
            seq: self.snd_nxt,
            control,
            payload,
            tx_count: 1,
            sent_at: now,
        };
        self.snd_nxt = entry.end();
        let segment = entry.to_segment();
        self.in_flight.push_back(entry);
        segment
    }

    /// Process a cumulative ACK.
    ///
    /// Advances `snd_una` when `ack` is beyond it and not beyond `snd_nxt`;
    /// fully covered ranges are removed and a partially covered data range
    /// is trimmed.  Returns `None` for a duplicate, stale, or spurious ACK.
    pub fn on_ack(&mut self, ack: u32, now: Instant) -> Option<Acked> {
        if !seq_lt(self.snd_una, ack) || !seq_le(ack, self.snd_nxt) {
            return None;
        }

        let bytes = ack.wrapping_sub(self.snd_una);
        let mut rtt = None;

        while let Some(front) = self.in_flight.front_mut() {
            if seq_le(front.end(), ack) {
                rtt = (front.tx_count == 1).then(|| now.saturating_duration_since(front.sent_at));
                self.in_flight.pop_front();
            } else {
                if seq_lt(front.seq, ack) && front.control == 0 {
                    let covered = ack.wrapping_sub(front.seq) as usize;
                    front.payload.drain(..covered);
                    front.seq = ack;
                }
                break;
            }
        }

        self.snd_una = ack;
        Some(Acked { bytes, rtt })
    }

    /// Every in-flight range last sent at least `rto` before `now`.
    ///
    /// Returned ranges are marked as re-sent at `now`.
    pub fn retransmit_due(&mut self, now: Instant, rto: Duration) -> Vec<Segment> {
        self.in_flight
            .iter_mut()
            .filter(|e| now.saturating_duration_since(e.sent_at) >= rto)
            .map(|e| {
                e.tx_count += 1;
                e.sent_at = now;
                e.to_segment()
            })
            .collect()
    }

    /// Re-send the oldest in-flight range regardless of its age.
    pub fn retransmit_oldest(&mut self, now: Instant) -> Option<Segment> {
        let front = self.in_flight.front_mut()?;
        front.tx_count += 1;
        front.sent_at = now;
        Some(front.to_segment())
    }

    /// Iterate over all in-flight ranges from oldest to newest.
    pub fn in_flight(&self) -> impl Iterator<Item = &InFlight> {
        self.in_flight.iter()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const MSS: usize = 100;

    fn filled(isn: u32, data: usize) -> SendWindow {
        let mut w = SendWindow::new(isn);
        w.push(&vec![7u8; data]);
        w
    }

    #[test]
    fn initial_state() {
        let w = SendWindow::new(100);
        assert_eq!(w.snd_una(), 100);
        assert_eq!(w.snd_nxt(), 100);
        assert!(w.is_idle());
        assert!(!w.has_unacked());
    }

    #[test]
    fn segments_are_bounded_by_mss() {
        let now = Instant::now();
        let mut w = filled(0, 250);
        let a = w.next_to_send(MSS, 1000, now).unwrap();
        let b = w.next_to_send(MSS, 1000, now).unwrap();
        let c = w.next_to_send(MSS, 1000, now).unwrap();
        assert_eq!((a.header.seq, a.payload.len()), (0, 100));
        assert_eq!((b.header.seq, b.payload.len()), (100, 100));
        assert_eq!((c.header.seq, c.payload.len()), (200, 50));
        assert!(w.next_to_send(MSS, 1000, now).is_none());
        assert_eq!(w.in_flight_bytes(), 250);
    }

    #[test]
    fn window_full_blocks_send() {
        let now = Instant::now();
        let mut w = filled(0, 500);
        assert!(w.next_to_send(MSS, 150, now).is_some());
        // Only 50 bytes of room remain.
        let second = w.next_to_send(MSS, 150, now).unwrap();
        assert_eq!(second.payload.len(), 50);
        assert!(w.next_to_send(MSS, 150, now).is_none());

        w.on_ack(100, now).unwrap();
        assert_eq!(w.next_to_send(MSS, 150, now).unwrap().payload.len(), 100);
    }

    #[test]
    fn zero_mss_yields_no_empty_segments() {
        let now = Instant::now();
        let mut w = filled(0, 3);
        assert!(w.next_to_send(0, 4096, now).is_none());
        assert_eq!(w.unsent_bytes(), 3);
        assert_eq!(w.snd_nxt(), 0);
        assert!(!w.has_unacked());
    }

    #[test]
    fn cumulative_ack_slides_multiple() {
        let now = Instant::now();
        let mut w = filled(0, 300);
        while w.next_to_send(MSS, 1000, now).is_some() {}

        let acked = w.on_ack(300, now).unwrap();
        assert_eq!(acked.bytes, 300);
        assert_eq!(w.snd_una(), 300);
        assert!(!w.has_unacked());
    }

    #[test]
    fn duplicate_and_stale_acks_are_ignored() {
        let now = Instant::now();
        let mut w = filled(0, 200);
        while w.next_to_send(MSS, 1000, now).is_some() {}

        assert!(w.on_ack(100, now).is_some());
        assert!(w.on_ack(100, now).is_none());
        assert!(w.on_ack(50, now).is_none());
        assert_eq!(w.snd_una(), 100);
    }

    #[test]
    fn spurious_ack_beyond_snd_nxt_ignored() {
        let now = Instant::now();
        let mut w = filled(0, 50);
        w.next_to_send(MSS, 1000, now);
        assert!(w.on_ack(1000, now).is_none());
        assert_eq!(w.snd_una(), 0);
    }

    #[test]
    fn partial_ack_trims_front_range() {
        let now = Instant::now();
        let mut w = filled(0, 100);
        w.next_to_send(MSS, 1000, now);
        w.on_ack(40, now).unwrap();

        let resent = w.retransmit_oldest(now).unwrap();
        assert_eq!(resent.header.seq, 40);
        assert_eq!(resent.payload.len(), 60);
    }

    #[test]
    fn rtt_sample_only_for_first_transmission() {
        let t0 = Instant::now();
        let mut w = filled(0, 200);
        w.next_to_send(MSS, 1000, t0);
        w.next_to_send(MSS, 1000, t0);

        let t1 = t0 + Duration::from_millis(30);
        let acked = w.on_ack(100, t1).unwrap();
        assert_eq!(acked.rtt, Some(Duration::from_millis(30)));

        w.retransmit_oldest(t1);
        let acked = w.on_ack(200, t1 + Duration::from_millis(10)).unwrap();
        assert_eq!(acked.rtt, None);
    }

    #[test]
    fn retransmit_due_returns_only_old_ranges() {
        let t0 = Instant::now();
        let rto = Duration::from_millis(100);
        let mut w = filled(0, 200);
        w.next_to_send(MSS, 1000, t0);
        w.next_to_send(MSS, 1000, t0 + Duration::from_millis(80));

        let due = w.retransmit_due(t0 + rto, rto);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].header.seq, 0);

        // The re-sent range is fresh again; the other is now due.
        let due = w.retransmit_due(t0 + Duration::from_millis(180), rto);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].header.seq, 100);
    }

    #[test]
    fn nothing_to_retransmit_when_all_acked() {
        let t0 = Instant::now();
        let mut w = filled(0, 100);
        w.next_to_send(MSS, 1000, t0);
        w.on_ack(100, t0).unwrap();
        assert!(w.retransmit_due(t0 + Duration::from_secs(10), Duration::ZERO).is_empty());
        assert!(w.retransmit_oldest(t0).is_none());
    }

    #[test]
    fn syn_consumes_one_sequence_number() {
        let now = Instant::now();
        let mut w = SendWindow::new(1000);
        w.push_syn();
        let syn = w.next_to_send(MSS, 0, now).unwrap();
        assert!(syn.header.has(flags::SYN));
        assert_eq!(syn.header.seq, 1000);
        assert_eq!(w.snd_nxt(), 1001);
        w.on_ack(1001, now).unwrap();
        assert!(w.is_idle());
    }

    #[test]
    fn fin_follows_last_byte_and_is_acked() {
        let now = Instant::now();
        let mut w = filled(10, 100);
        w.push_fin();
        let data = w.next_to_send(MSS, 1000, now).unwrap();
        assert_eq!(data.payload.len(), 100);
        let fin = w.next_to_send(MSS, 1000, now).unwrap();
        assert!(fin.header.has(flags::FIN));
        assert_eq!(fin.header.seq, 110);
        assert!(!w.fin_acked());

        w.on_ack(110, now).unwrap();
        assert!(!w.fin_acked());
        w.on_ack(111, now).unwrap();
        assert!(w.fin_acked());
    }

    #[test]
    fn seq_wrap_around() {
        let start = u32::MAX - 5;
        let now = Instant::now();
        let mut w = filled(start, 10);
        w.next_to_send(MSS, 1000, now);

        let end = start.wrapping_add(10);
        let acked = w.on_ack(end, now).unwrap();
        assert_eq!(acked.bytes, 10);
        assert_eq!(w.snd_una(), end);
    }
}
