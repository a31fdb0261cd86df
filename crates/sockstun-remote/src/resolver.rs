//! Name resolution with a timeout
//!
//! Every lookup races a timer. Whichever finishes first settles the request and
//! removes it, so the loser finds nothing and does nothing. A result for a connection
//! that has gone away in the meantime is dropped.

use sockstun_transport::{ConnId, LookupId, Net, TimerId};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// Default lookup timeout
pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(3);

/// How a lookup settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved { conn: ConnId, addr: SocketAddr },
    Failed { conn: ConnId, host: String },
}

#[derive(Debug)]
struct Pending {
    conn: ConnId,
    host: String,
    port: u16,
    timer: TimerId,
}

#[derive(Debug)]
pub struct Resolver {
    timeout: Duration,
    pending: HashMap<LookupId, Pending>,
    timers: HashMap<TimerId, LookupId>,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new(DEFAULT_DNS_TIMEOUT)
    }
}

impl Resolver {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: HashMap::new(),
            timers: HashMap::new(),
        }
    }

    /// Start resolving `host` on behalf of `conn`
    pub fn resolve(&mut self, host: &str, port: u16, conn: ConnId, net: &mut dyn Net) -> (LookupId, TimerId) {
        let timer = net.arm_timer(self.timeout);
        let lookup = net.lookup(host, port);
        debug!(%conn, ?lookup, "resolving {}:{}", host, port);

        self.timers.insert(timer, lookup);
        self.pending.insert(
            lookup,
            Pending {
                conn,
                host: host.to_string(),
                port,
                timer,
            },
        );
        (lookup, timer)
    }

    /// A lookup finished. `None` if it already timed out or its connection is gone.
    pub fn on_resolved(
        &mut self,
        lookup: LookupId,
        result: io::Result<Vec<SocketAddr>>,
        net: &mut dyn Net,
    ) -> Option<Resolution> {
        let Some(pending) = self.pending.remove(&lookup) else {
            debug!(?lookup, "late lookup result ignored");
            return None;
        };
        self.timers.remove(&pending.timer);
        net.cancel_timer(pending.timer);

        if !net.is_alive(pending.conn) {
            debug!(conn = %pending.conn, "connection gone before {} resolved", pending.host);
            return None;
        }

        let addrs = match result {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!(conn = %pending.conn, "Failed to resolve {}: {}", pending.host, e);
                Vec::new()
            }
        };
        match pick_address(&addrs) {
            Some(addr) => {
                debug!(conn = %pending.conn, "{} resolved to {}", pending.host, addr.ip());
                Some(Resolution::Resolved {
                    conn: pending.conn,
                    addr: SocketAddr::new(addr.ip(), pending.port),
                })
            }
            None => Some(Resolution::Failed {
                conn: pending.conn,
                host: pending.host,
            }),
        }
    }

    /// A timer expired. `None` unless it was a pending lookup's timer and the connection is
    /// still there.
    pub fn on_timer(&mut self, timer: TimerId, net: &dyn Net) -> Option<Resolution> {
        let lookup = self.timers.remove(&timer)?;
        let pending = self.pending.remove(&lookup)?;
        warn!(conn = %pending.conn, "Resolving {} timed out", pending.host);

        if !net.is_alive(pending.conn) {
            return None;
        }
        Some(Resolution::Failed {
            conn: pending.conn,
            host: pending.host,
        })
    }

    /// Abandon the lookup started for `conn`, if any
    pub fn cancel(&mut self, conn: ConnId, net: &mut dyn Net) {
        let lookups: Vec<LookupId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.conn == conn)
            .map(|(lookup, _)| *lookup)
            .collect();
        for lookup in lookups {
            if let Some(pending) = self.pending.remove(&lookup) {
                self.timers.remove(&pending.timer);
                net.cancel_timer(pending.timer);
            }
        }
    }

    pub fn owns_timer(&self, timer: TimerId) -> bool {
        self.timers.contains_key(&timer)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// First IPv4 address, else the first address. Unspecified addresses count as failure.
fn pick_address(addrs: &[SocketAddr]) -> Option<SocketAddr> {
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .filter(|addr| !addr.ip().is_unspecified())
}
