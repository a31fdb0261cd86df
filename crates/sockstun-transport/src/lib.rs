//! Event-loop transport layer for the tunnel agents
//!
//! Both agents are written as sans-IO engines: an [`Engine`] reacts to [`Event`]s and
//! performs every effect through the [`Net`] trait. The [`Reactor`] is the tokio
//! implementation of that seam; tests drive engines with the doubles in `mock`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │            Engine (local or remote agent)                 │
//! │   sessions · relays · registry · resolver                 │
//! └──────────────────────────────────────────────────────────┘
//!            ▲ Event                        │ Net calls
//!            │                              ↓
//! ┌──────────────────────────────────────────────────────────┐
//! │  Reactor: one task owning connections, timers, lookups    │
//! └──────────────────────────────────────────────────────────┘
//!      ▲ reader/writer tasks per connection    ▲ Delivery
//!      │                                       │
//!   TCP sockets                      CompressionPool workers
//! ```
//!
//! Identities handed to engines ([`ConnId`], [`TimerId`], [`LookupId`]) never keep
//! anything alive. A holder re-validates them at the point of use.

pub mod offload;
pub mod reactor;
pub mod registry;
pub mod relay;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use offload::{delivery_channel, CompressionPool, Delivery, Offload};
pub use reactor::{bind_listener, Reactor};
pub use registry::{Registry, Route};
pub use relay::{Leg, RelayCore, RelayState};

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Outbound queue depth that pauses the opposite leg of a relay (1 MiB).
///
/// Only bytes already handed to a connection's writer count. Frames still in the
/// compression pool or on the delivery channel are not included.
pub const HIGH_WATER_MARK: usize = 1024 * 1024;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}")]
    BindError { address: SocketAddr, reason: String },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Identity of one TCP connection owned by the reactor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identity of an armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// Identity of an in-flight name lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LookupId(pub u64);

/// Something that happened on the event loop
#[derive(Debug)]
pub enum Event {
    /// A listener accepted a new connection
    Accepted { conn: ConnId, peer: SocketAddr },
    /// An outbound connection started with [`Net::connect`] is established
    Connected { conn: ConnId, local_addr: SocketAddr },
    /// An outbound connection could not be established
    ConnectFailed { conn: ConnId, error: std::io::Error },
    /// Bytes arrived, in receipt order
    Data { conn: ConnId, data: Bytes },
    /// The outbound queue of `conn` crossed the high-water mark
    HighWater { conn: ConnId, queued: usize },
    /// The outbound queue of `conn` fully drained after a `HighWater`
    Drained { conn: ConnId },
    /// The connection is gone; no further events follow for it
    Closed { conn: ConnId },
    /// A timer armed with [`Net::arm_timer`] expired
    Timer(TimerId),
    /// A lookup started with [`Net::lookup`] finished
    Resolved {
        lookup: LookupId,
        result: std::io::Result<Vec<SocketAddr>>,
    },
}

/// Effects an engine may request from the event loop.
///
/// Every call is non-blocking. Calls naming a connection that is no longer live are
/// ignored.
pub trait Net {
    /// Queue bytes for sending on `conn`
    fn send(&mut self, conn: ConnId, data: Bytes);

    /// Stop delivering `Data` events for `conn`
    fn pause_read(&mut self, conn: ConnId);

    /// Resume delivering `Data` events for `conn`
    fn resume_read(&mut self, conn: ConnId);

    /// Flush the outbound queue, then close the write half. A connection still being
    /// established is abandoned instead.
    fn shutdown(&mut self, conn: ConnId);

    /// Stop reporting anything but `Closed` for `conn` and discard its input, while still
    /// accepting bytes to send. Used when a later `shutdown` is already on its way.
    fn retire(&mut self, conn: ConnId);

    /// Start connecting to `addr`; completion is reported as `Connected` or `ConnectFailed`
    fn connect(&mut self, addr: SocketAddr) -> ConnId;

    /// Whether `conn` is established or connecting and not shutting down
    fn is_alive(&self, conn: ConnId) -> bool;

    /// Bytes queued for sending on `conn`
    fn queued(&self, conn: ConnId) -> usize;

    /// Arm a one-shot timer
    fn arm_timer(&mut self, after: Duration) -> TimerId;

    /// Cancel a timer; a cancelled timer never fires
    fn cancel_timer(&mut self, timer: TimerId);

    /// Start resolving `host`; completion is reported as `Resolved`
    fn lookup(&mut self, host: &str, port: u16) -> LookupId;
}

/// A per-agent state machine driven by the reactor
pub trait Engine {
    fn on_event(&mut self, event: Event, net: &mut dyn Net);
}
