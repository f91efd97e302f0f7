//! Wire-format definitions for protocol segments.
//!
//! Every datagram exchanged between peers is a [`Segment`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout (header fields, flags, payload).
//! - Serialising a [`Segment`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Segment`], returning errors
//!   for truncated headers or illegal flag combinations.
//!
//! No I/O happens here — this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Connection ID         |     Reserved (13)       |A|S|F|
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Payload ...                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 12 bytes.
//! seq(4) + ack(4) + conn_id(2) + flags(2)

use thiserror::Error;

/// Bit-flag constants for the 16-bit `flags` header field.
///
/// The upper 13 bits are reserved: written as zero, ignored on decode.
pub mod flags {
    /// No more data from sender.
    pub const FIN: u16 = 0b0000_0000_0000_0001;
    /// Synchronise sequence numbers (handshake).
    pub const SYN: u16 = 0b0000_0000_0000_0010;
    /// Acknowledgement field is valid.
    pub const ACK: u16 = 0b0000_0000_0000_0100;
    /// Every bit that carries meaning.
    pub const MASK: u16 = FIN | SYN | ACK;
}

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 12;

// Byte offsets of each field within the serialised header.
const OFF_SEQ: usize = 0;
const OFF_ACK: usize = 4;
const OFF_CONN: usize = 8;
const OFF_FLAGS: usize = 10;

/// Fixed-size protocol header.
///
/// Fields are in host byte order; [`Segment::encode`] converts to big-endian
/// on the wire and [`Segment::decode`] converts back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    /// Sequence number of the first byte this segment occupies.
    pub seq: u32,
    /// Acknowledgement number (next expected sequence number from the peer).
    pub ack: u32,
    /// Connection identifier chosen by the client.
    pub conn_id: u16,
    /// Bitmask of [`flags`] constants.
    pub flags: u16,
}

impl Header {
    /// `true` if every bit of `flag` is set.
    pub fn has(&self, flag: u16) -> bool {
        self.flags & flag == flag
    }
}

/// A complete protocol datagram: header + payload bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segment {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Segment {
    /// Build a segment from its parts.
    pub fn new(seq: u32, ack: u32, conn_id: u16, flags: u16, payload: Vec<u8>) -> Self {
        Self {
            header: Header {
                seq,
                ack,
                conn_id,
                flags,
            },
            payload,
        }
    }

    /// Number of sequence numbers this segment occupies.
    ///
    /// SYN and FIN each consume one sequence number on top of the payload.
    pub fn seq_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.header.has(flags::SYN) {
            len += 1;
        }
        if self.header.has(flags::FIN) {
            len += 1;
        }
        len
    }

    /// Serialise this segment into a newly allocated byte vector.
    ///
    /// Reserved flag bits are always written as zero.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN + self.payload.len()];

        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.header.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&self.header.ack.to_be_bytes());
        buf[OFF_CONN..OFF_CONN + 2].copy_from_slice(&self.header.conn_id.to_be_bytes());
        buf[OFF_FLAGS..OFF_FLAGS + 2]
            .copy_from_slice(&(self.header.flags & flags::MASK).to_be_bytes());
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        buf
    }

    /// Parse a [`Segment`] from a raw byte slice.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`], or
    /// - SYN and FIN are both set.
    ///
    /// Everything after the header is payload; its content is never inspected.
    pub fn decode(buf: &[u8]) -> Result<Self, SegmentError> {
        if buf.len() < HEADER_LEN {
            return Err(SegmentError::MalformedSegment(buf.len()));
        }

        let seq = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let ack = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let conn_id = u16::from_be_bytes([buf[OFF_CONN], buf[OFF_CONN + 1]]);
        let flags = u16::from_be_bytes([buf[OFF_FLAGS], buf[OFF_FLAGS + 1]]) & flags::MASK;

        if flags & (flags::SYN | flags::FIN) == flags::SYN | flags::FIN {
            return Err(SegmentError::UnexpectedFlagsCombination(flags));
        }

        Ok(Segment {
            header: Header {
                seq,
                ack,
                conn_id,
                flags,
            },
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let h = &self.header;
        write!(f, "seq={} ack={} id={}", h.seq, h.ack, h.conn_id)?;
        for (bit, name) in [(flags::SYN, "SYN"), (flags::ACK, "ACK"), (flags::FIN, "FIN")] {
            if h.has(bit) {
                write!(f, " {name}")?;
            }
        }
        if !self.payload.is_empty() {
            write!(f, " len={}", self.payload.len())?;
        }
        Ok(())
    }
}

/// Errors that can arise when parsing a raw datagram.
///
/// Both are recovered locally: the datagram is dropped without reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SegmentError {
    /// Buffer shorter than the fixed header size.
    #[error("malformed segment: {0} bytes is shorter than the {HEADER_LEN}-byte header")]
    MalformedSegment(usize),
    /// Flags that can never appear together (SYN with FIN).
    #[error("unexpected flags combination {0:#05b}")]
    UnexpectedFlagsCombination(u16),
}
