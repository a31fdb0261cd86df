//! Destination relay
//!
//! Bridges one tunnel connection from the local agent (the server leg) and the
//! connection to the real destination (the client leg). The RESPONSE that ends the
//! negotiation is encoded inline so it is queued ahead of any DATA the compression pool
//! produces afterwards.

use bytes::Bytes;
use sockstun_proto::{ReplyCode, Response, ServerMessage, TunnelCodec};
use sockstun_transport::{ConnId, Leg, Net, Offload, RelayCore, RelayState, TimerId};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default destination connect timeout
pub const DEFAULT_TUNNEL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct Relay {
    relay: RelayCore,
    target: SocketAddr,
    /// Copy of the relay's setup timer kept for detaching its registry route; the
    /// relay forgets its own once the timer is claimed or cancelled
    setup_timer: Option<TimerId>,
}

impl Relay {
    pub fn new(tunnel: ConnId, target: SocketAddr) -> Self {
        Self {
            relay: RelayCore::new(tunnel),
            target,
            setup_timer: None,
        }
    }

    pub fn tunnel(&self) -> ConnId {
        self.relay.server()
    }

    pub fn destination(&self) -> Option<ConnId> {
        self.relay.client()
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn setup_timer(&self) -> Option<TimerId> {
        self.setup_timer
    }

    pub fn state(&self) -> RelayState {
        self.relay.state()
    }

    pub fn is_destination(&self, conn: ConnId) -> bool {
        self.relay.leg_of(conn) == Some(Leg::Client)
    }

    /// Arm the connect timer and start connecting to the destination
    pub fn start(&mut self, timeout: Duration, net: &mut dyn Net) -> (ConnId, TimerId) {
        let (conn, timer) = self.relay.setup(self.target, timeout, net);
        self.setup_timer = Some(timer);
        (conn, timer)
    }

    /// The destination accepted: answer the local agent and let its DATA flow
    pub fn on_connected(&mut self, local_addr: SocketAddr, net: &mut dyn Net) -> bool {
        if !self.relay.connected() {
            return false;
        }
        self.relay.begin_transport(net);

        let tunnel = self.tunnel();
        if !send_response(net, tunnel, Response::success(local_addr)) {
            return false;
        }
        net.resume_read(tunnel);
        info!(%tunnel, "Connected to {} from {}", self.target, local_addr);
        true
    }

    /// Destination bytes for the local agent
    pub fn forward<O: Offload<ServerMessage>>(&self, data: &[u8], offload: &O) {
        debug!(tunnel = %self.tunnel(), "{} bytes from {}", data.len(), self.target);
        offload.submit(self.tunnel(), ServerMessage::Data(data.to_vec()));
    }

    /// Tunnel payload for the destination
    pub fn deliver(&self, payload: Vec<u8>, net: &mut dyn Net) {
        if let Some(destination) = self.destination() {
            debug!(tunnel = %self.tunnel(), "{} bytes to {}", payload.len(), self.target);
            net.send(destination, Bytes::from(payload));
        }
    }

    /// Connect timer expired. True if it was this relay's pending timer.
    pub fn on_timer<O: Offload<ServerMessage>>(&mut self, timer: TimerId, net: &mut dyn Net, offload: &O) -> bool {
        if !self.relay.claim_timer(timer) {
            return false;
        }
        warn!(tunnel = %self.tunnel(), "Connecting to {} timed out", self.target);
        self.fail(ReplyCode::Timeout, net, offload);
        true
    }

    pub fn on_high_water(&mut self, conn: ConnId, net: &mut dyn Net) {
        self.relay.on_high_water(conn, net);
    }

    pub fn on_drained(&mut self, conn: ConnId, net: &mut dyn Net) {
        self.relay.on_drained(conn, net);
    }

    /// Answer `code` unless transport already began, then tear down
    pub fn fail<O: Offload<ServerMessage>>(&mut self, code: ReplyCode, net: &mut dyn Net, offload: &O) {
        if self.relay.is_torn_down() {
            return;
        }
        if self.relay.state() != RelayState::Transport {
            send_response(net, self.tunnel(), Response::failure(code));
        }
        self.teardown(net, offload);
    }

    /// Shut both connections down; the tunnel closes after queued DATA
    pub fn teardown<O: Offload<ServerMessage>>(&mut self, net: &mut dyn Net, offload: &O) -> bool {
        self.relay.teardown_after(Leg::Server, net, offload)
    }
}

/// Encode `response` on the loop thread and queue it on `tunnel`
pub(crate) fn send_response(net: &mut dyn Net, tunnel: ConnId, response: Response) -> bool {
    match TunnelCodec::encode(&ServerMessage::Response(response)) {
        Ok(frame) => {
            net.send(tunnel, frame);
            true
        }
        Err(e) => {
            error!(%tunnel, "Failed to encode RESPONSE: {}", e);
            false
        }
    }
}
