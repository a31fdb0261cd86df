//! Test doubles for driving engines without sockets
//!
//! `MockNet` records every effect an engine requests and lets the test decide which
//! connections are alive and how full their queues are. `RecordingOffload` keeps
//! submitted messages and close requests instead of encoding them.

use crate::offload::Offload;
use crate::{ConnId, LookupId, Net, TimerId};
use bytes::Bytes;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

/// One effect requested through [`Net`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetOp {
    Send(ConnId, Bytes),
    PauseRead(ConnId),
    ResumeRead(ConnId),
    Shutdown(ConnId),
    Retire(ConnId),
    Connect { conn: ConnId, addr: SocketAddr },
    ArmTimer { timer: TimerId, after: Duration },
    CancelTimer(TimerId),
    Lookup { lookup: LookupId, host: String, port: u16 },
}

/// Recording implementation of [`Net`]
#[derive(Debug, Default)]
pub struct MockNet {
    ops: Vec<NetOp>,
    alive: HashSet<ConnId>,
    queued: HashMap<ConnId, usize>,
    next_conn: u64,
    next_timer: u64,
    next_lookup: u64,
}

impl MockNet {
    pub fn new() -> Self {
        Self {
            next_conn: 1000,
            next_timer: 1,
            next_lookup: 1,
            ..Default::default()
        }
    }

    /// Mark `conn` as an established connection
    pub fn open(&mut self, conn: ConnId) {
        self.alive.insert(conn);
    }

    /// Mark `conn` as gone without telling the engine
    pub fn kill(&mut self, conn: ConnId) {
        self.alive.remove(&conn);
    }

    pub fn set_queued(&mut self, conn: ConnId, bytes: usize) {
        self.queued.insert(conn, bytes);
    }

    /// Drain recorded operations
    pub fn take_ops(&mut self) -> Vec<NetOp> {
        std::mem::take(&mut self.ops)
    }

    pub fn ops(&self) -> &[NetOp] {
        &self.ops
    }

    /// Concatenation of all bytes sent to `conn` so far
    pub fn sent_to(&self, conn: ConnId) -> Vec<u8> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                NetOp::Send(c, data) if *c == conn => Some(data.as_ref()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    pub fn was_shut_down(&self, conn: ConnId) -> bool {
        self.ops.iter().any(|op| *op == NetOp::Shutdown(conn))
    }

    pub fn last_connect(&self) -> Option<(ConnId, SocketAddr)> {
        self.ops.iter().rev().find_map(|op| match op {
            NetOp::Connect { conn, addr } => Some((*conn, *addr)),
            _ => None,
        })
    }

    pub fn last_timer(&self) -> Option<TimerId> {
        self.ops.iter().rev().find_map(|op| match op {
            NetOp::ArmTimer { timer, .. } => Some(*timer),
            _ => None,
        })
    }

    pub fn last_lookup(&self) -> Option<(LookupId, String, u16)> {
        self.ops.iter().rev().find_map(|op| match op {
            NetOp::Lookup { lookup, host, port } => Some((*lookup, host.clone(), *port)),
            _ => None,
        })
    }
}

impl Net for MockNet {
    fn send(&mut self, conn: ConnId, data: Bytes) {
        self.ops.push(NetOp::Send(conn, data));
    }

    fn pause_read(&mut self, conn: ConnId) {
        self.ops.push(NetOp::PauseRead(conn));
    }

    fn resume_read(&mut self, conn: ConnId) {
        self.ops.push(NetOp::ResumeRead(conn));
    }

    fn shutdown(&mut self, conn: ConnId) {
        self.alive.remove(&conn);
        self.ops.push(NetOp::Shutdown(conn));
    }

    fn retire(&mut self, conn: ConnId) {
        self.ops.push(NetOp::Retire(conn));
    }

    fn connect(&mut self, addr: SocketAddr) -> ConnId {
        let conn = ConnId(self.next_conn);
        self.next_conn += 1;
        self.alive.insert(conn);
        self.ops.push(NetOp::Connect { conn, addr });
        conn
    }

    fn is_alive(&self, conn: ConnId) -> bool {
        self.alive.contains(&conn)
    }

    fn queued(&self, conn: ConnId) -> usize {
        self.queued.get(&conn).copied().unwrap_or(0)
    }

    fn arm_timer(&mut self, after: Duration) -> TimerId {
        let timer = TimerId(self.next_timer);
        self.next_timer += 1;
        self.ops.push(NetOp::ArmTimer { timer, after });
        timer
    }

    fn cancel_timer(&mut self, timer: TimerId) {
        self.ops.push(NetOp::CancelTimer(timer));
    }

    fn lookup(&mut self, host: &str, port: u16) -> LookupId {
        let lookup = LookupId(self.next_lookup);
        self.next_lookup += 1;
        self.ops.push(NetOp::Lookup {
            lookup,
            host: host.to_string(),
            port,
        });
        lookup
    }
}

/// Offload that records submissions in order
#[derive(Debug)]
pub struct RecordingOffload<M> {
    submitted: RefCell<Vec<(ConnId, M)>>,
    closed: RefCell<Vec<ConnId>>,
}

impl<M> Default for RecordingOffload<M> {
    fn default() -> Self {
        Self {
            submitted: RefCell::new(Vec::new()),
            closed: RefCell::new(Vec::new()),
        }
    }
}

impl<M> RecordingOffload<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain recorded submissions
    pub fn take(&self) -> Vec<(ConnId, M)> {
        std::mem::take(&mut *self.submitted.borrow_mut())
    }

    /// Drain recorded close requests
    pub fn take_closed(&self) -> Vec<ConnId> {
        std::mem::take(&mut *self.closed.borrow_mut())
    }

    pub fn was_closed(&self, conn: ConnId) -> bool {
        self.closed.borrow().contains(&conn)
    }
}

impl<M> Offload<M> for RecordingOffload<M> {
    fn submit(&self, dest: ConnId, message: M) {
        self.submitted.borrow_mut().push((dest, message));
    }

    fn close(&self, dest: ConnId) {
        self.closed.borrow_mut().push(dest);
    }
}
