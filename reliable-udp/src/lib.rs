//! `reliable-udp` — a minimal reliable, ordered byte stream over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐               ┌──────────────┐
//!  │  SendWindow  │── segments ──▶│ Reassembler  │
//!  └──────┬───────┘               └──────┬───────┘
//!         │◀──────── cumulative ACKs ────┘
//!  ┌──────▼─────────────────────────────────────┐
//!  │ Connection  (sans-I/O state machine)       │
//!  └──────┬─────────────────────────────────────┘
//!         │ one event queue: segments + timer expiries
//!  ┌──────▼──────┐   ┌──────────────┐
//!  │   Stream    │◀──│ Listener     │ (server demux by peer + conn id)
//!  └──────┬──────┘   └──────────────┘
//!         │ raw UDP datagrams
//!  ┌──────▼──────┐
//!  │   Socket    │  (tokio UdpSocket + optional fault simulator)
//!  └─────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]       — 12-byte header wire format
//! - [`config`]       — protocol tunables
//! - [`timer`]        — RTO estimation and the retransmission timer
//! - [`send_window`]  — outbound buffer, in-flight ranges, cumulative ACKs
//! - [`reassembler`]  — inbound reordering and in-order delivery
//! - [`state`]        — finite-state-machine types
//! - [`connection`]   — per-connection protocol logic
//! - [`stream`]       — async driver and application API
//! - [`server`]       — listener and per-connection demultiplexing
//! - [`simulator`]    — optional loss/duplication/reorder for testing
//! - [`socket`]       — async UDP socket abstraction

pub mod config;
pub mod connection;
pub mod packet;
pub mod reassembler;
pub mod send_window;
pub mod server;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod stream;
pub mod timer;

pub use config::{Config, ConfigError};
pub use connection::ConnError;
pub use server::Listener;
pub use stream::Stream;
