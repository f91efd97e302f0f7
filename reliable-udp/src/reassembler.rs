//! Inbound byte-stream reassembly.
//!
//! [`Reassembler`] implements the receive side of a connection:
//!
//! - A segment at `expected_next` is delivered at once, together with any
//!   buffered out-of-order data that becomes contiguous behind it.
//! - A segment ahead of `expected_next` is buffered, as long as it ends
//!   within `max_reorder` bytes of `expected_next`; beyond that it is
//!   dropped and left to the sender's retransmission.
//! - A segment behind `expected_next` is a duplicate.  Any tail that extends
//!   past `expected_next` is still accepted.
//! - Acknowledgements are cumulative only: [`Reassembler::ack_to_send`] is
//!   always `expected_next`.
//!
//! A FIN occupies the sequence number just after the last payload byte.  It
//! is only consumed (and end-of-stream signalled) once every preceding byte
//! has been delivered.

use std::collections::BTreeMap;

use crate::packet::{flags, Segment};

/// What happened to one inbound segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// `expected_next` advanced by this many sequence numbers.
    Delivered(u32),
    /// Stored out of order, awaiting the gap before it.
    Buffered,
    /// Entirely covered by what was already received.
    Duplicate,
    /// Too far ahead of `expected_next` to buffer.
    Dropped,
    /// Carried neither payload nor FIN.
    Empty,
}

/// Receive-side state for one connection.
#[derive(Debug)]
pub struct Reassembler {
    /// Next expected sequence number (`RCV.NXT`).
    expected_next: u32,
    /// Stream offset of `expected_next`, counted from creation.  Out-of-order
    /// data is keyed by stream offset so wrap-around never reorders keys.
    offset: u64,
    /// Contiguous bytes not yet taken by the application.
    ready: Vec<u8>,
    /// Out-of-order payloads keyed by stream offset.
    pending: BTreeMap<u64, Vec<u8>>,
    /// Stream offset of the peer's FIN, once seen.
    fin_at: Option<u64>,
    fin_received: bool,
    max_reorder: usize,
}

impl Reassembler {
    /// `expected_next` is the first sequence number expected from the peer:
    /// its initial sequence number plus one.
    pub fn new(expected_next: u32, max_reorder: usize) -> Self {
        Self {
            expected_next,
            offset: 0,
            ready: Vec::new(),
            pending: BTreeMap::new(),
            fin_at: None,
            fin_received: false,
            max_reorder,
        }
    }

    pub fn expected_next(&self) -> u32 {
        self.expected_next
    }

    /// Cumulative acknowledgement number for the next outbound segment.
    pub fn ack_to_send(&self) -> u32 {
        self.expected_next
    }

    /// `true` once the peer's FIN has been consumed in order.
    pub fn fin_received(&self) -> bool {
        self.fin_received
    }

    /// `true` once the peer's FIN is consumed and the application has taken
    /// every byte before it.
    pub fn is_finished(&self) -> bool {
        self.fin_received && self.ready.is_empty()
    }

    /// Bytes held out of order.
    pub fn pending_bytes(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Process an inbound segment's payload and FIN flag.
    pub fn on_segment(&mut self, segment: &Segment) -> Verdict {
        let fin = segment.header.has(flags::FIN);
        let mut payload = segment.payload.as_slice();
        if payload.is_empty() && !fin {
            return Verdict::Empty;
        }
        if self.fin_received {
            // The stream has ended; anything further is a retransmission or junk.
            return Verdict::Duplicate;
        }

        let distance = segment.header.seq.wrapping_sub(self.expected_next) as i32;
        let end_distance = i64::from(distance) + payload.len() as i64;

        if distance < 0 {
            // Already-delivered prefix.
            if end_distance <= 0 && !(fin && end_distance == 0 && !self.fin_received) {
                return Verdict::Duplicate;
            }
            let skip = (-i64::from(distance)).min(payload.len() as i64) as usize;
            payload = &payload[skip..];
        } else if distance > 0 {
            if end_distance > self.max_reorder as i64 {
                log::trace!(
                    "[rx] drop seq={} len={}: beyond reorder limit",
                    segment.header.seq,
                    payload.len()
                );
                return Verdict::Dropped;
            }
            let at = self.offset + distance as u64;
            if fin && self.fin_at.is_none() {
                self.fin_at = Some(at + payload.len() as u64);
            }
            let payload = self.clip_to_fin(at, payload);
            if payload.is_empty() && !fin {
                return Verdict::Dropped;
            }
            if !payload.is_empty() {
                let slot = self.pending.entry(at).or_default();
                if slot.len() < payload.len() {
                    *slot = payload.to_vec();
                }
            }
            return Verdict::Buffered;
        }

        let before = self.expected_next;
        if fin && self.fin_at.is_none() {
            self.fin_at = Some(self.offset + payload.len() as u64);
        }
        let payload = self.clip_to_fin(self.offset, payload);
        self.deliver(payload);
        self.coalesce();
        self.consume_fin();

        match self.expected_next.wrapping_sub(before) {
            0 => Verdict::Duplicate,
            n => Verdict::Delivered(n),
        }
    }

    fn deliver(&mut self, bytes: &[u8]) {
        self.ready.extend_from_slice(bytes);
        self.offset += bytes.len() as u64;
        self.expected_next = self.expected_next.wrapping_add(bytes.len() as u32);
    }

    /// Move buffered data that now touches `offset` into the ready stream.
    fn coalesce(&mut self) {
        while let Some(entry) = self.pending.first_entry() {
            let at = *entry.key();
            if at > self.offset {
                break;
            }
            let bytes = entry.remove();
            let overlap = (self.offset - at) as usize;
            if overlap < bytes.len() {
                let tail = self.clip_to_fin(self.offset, &bytes[overlap..]);
                self.deliver(tail);
            }
        }
    }

    /// Cut `payload` (starting at stream offset `at`) so it ends at the
    /// peer's FIN, if its position is known.
    fn clip_to_fin<'a>(&self, at: u64, payload: &'a [u8]) -> &'a [u8] {
        match self.fin_at {
            Some(end) if at + payload.len() as u64 > end => {
                &payload[..end.saturating_sub(at) as usize]
            }
            _ => payload,
        }
    }

    fn consume_fin(&mut self) {
        if !self.fin_received && self.fin_at == Some(self.offset) {
            self.fin_received = true;
            self.expected_next = self.expected_next.wrapping_add(1);
            self.pending.clear();
        }
    }

    /// Take every contiguous byte delivered so far, evicting it.
    pub fn take_ready(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.ready)
    }

    /// Copy up to `buf.len()` delivered bytes into `buf`.  Returns the count.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.ready.len());
        buf[..n].copy_from_slice(&self.ready[..n]);
        self.ready.drain(..n);
        n
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
