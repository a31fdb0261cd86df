//! Relay lifecycle shared by the tunnel-side and the destination-side relays
//!
//! A relay bridges two connections: the `Server` leg, which was accepted by the agent
//! and exists before the relay, and the `Client` leg, which the relay opens itself.
//! This module owns what both agents do identically with that pair: the setup timer,
//! state progression, backpressure and teardown. Protocol-specific behavior lives with
//! the agents.

use crate::offload::Offload;
use crate::{ConnId, Net, TimerId};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info};

/// One of the two connections a relay bridges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    /// The connection accepted by this agent
    Server,
    /// The connection this relay opened
    Client,
}

impl Leg {
    pub fn opposite(self) -> Self {
        match self {
            Leg::Server => Leg::Client,
            Leg::Client => Leg::Server,
        }
    }

    fn index(self) -> usize {
        match self {
            Leg::Server => 0,
            Leg::Client => 1,
        }
    }
}

/// Relay lifecycle. `Teardown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Init,
    /// Setup timer armed, client leg connecting
    Setup,
    /// Client leg established, negotiation in progress
    Connected,
    /// Bytes flow in both directions
    Transport,
    Teardown,
}

#[derive(Debug)]
pub struct RelayCore {
    server: ConnId,
    client: Option<ConnId>,
    state: RelayState,
    timer: Option<TimerId>,
    /// Legs whose outbound queue currently holds the opposite leg paused
    throttled: [bool; 2],
}

impl RelayCore {
    pub fn new(server: ConnId) -> Self {
        Self {
            server,
            client: None,
            state: RelayState::Init,
            timer: None,
            throttled: [false; 2],
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn server(&self) -> ConnId {
        self.server
    }

    pub fn client(&self) -> Option<ConnId> {
        self.client
    }

    /// Pending setup timer, if armed
    pub fn timer(&self) -> Option<TimerId> {
        self.timer
    }

    pub fn conn(&self, leg: Leg) -> Option<ConnId> {
        match leg {
            Leg::Server => Some(self.server),
            Leg::Client => self.client,
        }
    }

    pub fn leg_of(&self, conn: ConnId) -> Option<Leg> {
        if conn == self.server {
            Some(Leg::Server)
        } else if Some(conn) == self.client {
            Some(Leg::Client)
        } else {
            None
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.state == RelayState::Teardown
    }

    /// Arm the setup timer and start connecting the client leg
    pub fn setup(&mut self, target: SocketAddr, timeout: Duration, net: &mut dyn Net) -> (ConnId, TimerId) {
        debug_assert_eq!(self.state, RelayState::Init);

        let timer = net.arm_timer(timeout);
        let client = net.connect(target);
        debug!(server = %self.server, client = %client, %target, "relay setup");

        self.timer = Some(timer);
        self.client = Some(client);
        self.state = RelayState::Setup;
        (client, timer)
    }

    /// The client leg connected. Returns false unless the relay was waiting for it.
    pub fn connected(&mut self) -> bool {
        if self.state != RelayState::Setup {
            return false;
        }
        self.state = RelayState::Connected;
        true
    }

    /// Enter `Transport`, cancelling the setup timer. Succeeds at most once.
    pub fn begin_transport(&mut self, net: &mut dyn Net) -> bool {
        if self.state != RelayState::Connected {
            return false;
        }
        self.disarm(net);
        self.state = RelayState::Transport;
        info!(server = %self.server, client = ?self.client, "relay in transport");
        true
    }

    /// Cancel the setup timer if armed
    pub fn disarm(&mut self, net: &mut dyn Net) {
        if let Some(timer) = self.timer.take() {
            net.cancel_timer(timer);
        }
    }

    /// Claim an expired timer. True only for this relay's pending timer, and only once.
    pub fn claim_timer(&mut self, timer: TimerId) -> bool {
        if self.state == RelayState::Teardown || self.timer != Some(timer) {
            return false;
        }
        self.timer = None;
        true
    }

    /// The outbound queue of `conn` went over the high-water mark: stop reading from the
    /// opposite leg until it drains.
    pub fn on_high_water(&mut self, conn: ConnId, net: &mut dyn Net) {
        if self.state != RelayState::Transport {
            return;
        }
        let Some(leg) = self.leg_of(conn) else {
            return;
        };
        if net.queued(conn) == 0 || self.throttled[leg.index()] {
            return;
        }
        if let Some(opposite) = self.conn(leg.opposite()) {
            debug!(%conn, paused = %opposite, queued = net.queued(conn), "high water mark reached");
            self.throttled[leg.index()] = true;
            net.pause_read(opposite);
        }
    }

    /// The outbound queue of `conn` drained: resume the opposite leg if it was paused
    /// on account of `conn`.
    pub fn on_drained(&mut self, conn: ConnId, net: &mut dyn Net) {
        if self.state == RelayState::Teardown {
            return;
        }
        let Some(leg) = self.leg_of(conn) else {
            return;
        };
        if !self.throttled[leg.index()] {
            return;
        }
        self.throttled[leg.index()] = false;
        if let Some(opposite) = self.conn(leg.opposite()) {
            debug!(%conn, resumed = %opposite, "write queue drained");
            net.resume_read(opposite);
        }
    }

    pub fn is_throttled(&self, leg: Leg) -> bool {
        self.throttled[leg.index()]
    }

    /// Cancel the timer and shut both legs down. Returns false if already torn down.
    pub fn teardown(&mut self, net: &mut dyn Net) -> bool {
        if !self.enter_teardown(net) {
            return false;
        }
        net.shutdown(self.server);
        if let Some(client) = self.client {
            net.shutdown(client);
        }
        debug!(server = %self.server, client = ?self.client, "relay torn down");
        true
    }

    /// Like [`teardown`](Self::teardown), but the `pooled` leg is retired and closed
    /// through the offload so frames still being encoded for it go out first.
    pub fn teardown_after<M, O>(&mut self, pooled: Leg, net: &mut dyn Net, offload: &O) -> bool
    where
        O: Offload<M> + ?Sized,
    {
        if !self.enter_teardown(net) {
            return false;
        }
        for leg in [Leg::Server, Leg::Client] {
            let Some(conn) = self.conn(leg) else {
                continue;
            };
            if leg == pooled {
                net.retire(conn);
                offload.close(conn);
            } else {
                net.shutdown(conn);
            }
        }
        debug!(server = %self.server, client = ?self.client, ?pooled, "relay torn down");
        true
    }

    fn enter_teardown(&mut self, net: &mut dyn Net) -> bool {
        if self.state == RelayState::Teardown {
            return false;
        }
        self.state = RelayState::Teardown;
        self.disarm(net);
        self.throttled = [false; 2];
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockNet, NetOp, RecordingOffload};

    fn transport_relay(net: &mut MockNet) -> (RelayCore, ConnId, ConnId) {
        let server = ConnId(1);
        net.open(server);
        let mut relay = RelayCore::new(server);
        let (client, _) = relay.setup("127.0.0.1:9".parse().unwrap(), Duration::from_secs(5), net);
        assert!(relay.connected());
        assert!(relay.begin_transport(net));
        net.take_ops();
        (relay, server, client)
    }

    #[test]
    fn test_setup_arms_timer_and_connects() {
        let mut net = MockNet::new();
        let mut relay = RelayCore::new(ConnId(1));

        let (client, timer) = relay.setup("10.0.0.1:80".parse().unwrap(), Duration::from_secs(6), &mut net);

        assert_eq!(relay.state(), RelayState::Setup);
        assert_eq!(relay.client(), Some(client));
        assert_eq!(relay.timer(), Some(timer));
        assert_eq!(
            net.take_ops(),
            vec![
                NetOp::ArmTimer {
                    timer,
                    after: Duration::from_secs(6)
                },
                NetOp::Connect {
                    conn: client,
                    addr: "10.0.0.1:80".parse().unwrap()
                },
            ]
        );
    }

    #[test]
    fn test_begin_transport_cancels_timer_once() {
        let mut net = MockNet::new();
        let mut relay = RelayCore::new(ConnId(1));
        let (_, timer) = relay.setup("10.0.0.1:80".parse().unwrap(), Duration::from_secs(6), &mut net);
        net.take_ops();

        assert!(relay.connected());
        assert!(relay.begin_transport(&mut net));
        assert!(!relay.begin_transport(&mut net));
        assert_eq!(net.take_ops(), vec![NetOp::CancelTimer(timer)]);
        assert!(!relay.claim_timer(timer));
    }

    #[test]
    fn test_timer_claimed_once() {
        let mut net = MockNet::new();
        let mut relay = RelayCore::new(ConnId(1));
        let (_, timer) = relay.setup("10.0.0.1:80".parse().unwrap(), Duration::from_secs(6), &mut net);

        assert!(!relay.claim_timer(TimerId(timer.0 + 100)));
        assert!(relay.claim_timer(timer));
        assert!(!relay.claim_timer(timer));
    }

    #[test]
    fn test_late_connect_after_teardown_is_ignored() {
        let mut net = MockNet::new();
        let mut relay = RelayCore::new(ConnId(1));
        relay.setup("10.0.0.1:80".parse().unwrap(), Duration::from_secs(6), &mut net);

        assert!(relay.teardown(&mut net));
        assert!(!relay.connected());
        assert!(!relay.begin_transport(&mut net));
        assert_eq!(relay.state(), RelayState::Teardown);
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let mut net = MockNet::new();
        let (mut relay, server, client) = transport_relay(&mut net);

        assert!(relay.teardown(&mut net));
        let first = net.take_ops();
        assert_eq!(first, vec![NetOp::Shutdown(server), NetOp::Shutdown(client)]);

        assert!(!relay.teardown(&mut net));
        assert!(net.take_ops().is_empty());
    }

    #[test]
    fn test_teardown_after_closes_pooled_leg_through_offload() {
        let mut net = MockNet::new();
        let offload = RecordingOffload::<()>::new();
        let (mut relay, server, client) = transport_relay(&mut net);

        assert!(relay.teardown_after(Leg::Client, &mut net, &offload));
        assert_eq!(net.take_ops(), vec![NetOp::Shutdown(server), NetOp::Retire(client)]);
        assert_eq!(offload.take_closed(), vec![client]);

        assert!(!relay.teardown_after(Leg::Client, &mut net, &offload));
        assert!(offload.take_closed().is_empty());
    }

    #[test]
    fn test_backpressure_pauses_opposite_leg_until_drained() {
        let mut net = MockNet::new();
        let (mut relay, server, client) = transport_relay(&mut net);

        // Server leg is slow: stop reading from the client leg
        net.set_queued(server, 2 * crate::HIGH_WATER_MARK);
        relay.on_high_water(server, &mut net);
        relay.on_high_water(server, &mut net);
        assert_eq!(net.take_ops(), vec![NetOp::PauseRead(client)]);
        assert!(relay.is_throttled(Leg::Server));

        // Draining the server leg resumes the client leg exactly once
        net.set_queued(server, 0);
        relay.on_drained(server, &mut net);
        relay.on_drained(server, &mut net);
        assert_eq!(net.take_ops(), vec![NetOp::ResumeRead(client)]);
        assert!(!relay.is_throttled(Leg::Server));
    }

    #[test]
    fn test_backpressure_each_direction_is_independent() {
        let mut net = MockNet::new();
        let (mut relay, server, client) = transport_relay(&mut net);

        net.set_queued(server, crate::HIGH_WATER_MARK + 1);
        net.set_queued(client, crate::HIGH_WATER_MARK + 1);
        relay.on_high_water(server, &mut net);
        relay.on_high_water(client, &mut net);
        assert_eq!(net.take_ops(), vec![NetOp::PauseRead(client), NetOp::PauseRead(server)]);

        relay.on_drained(client, &mut net);
        assert_eq!(net.take_ops(), vec![NetOp::ResumeRead(server)]);
        assert!(relay.is_throttled(Leg::Server));
    }

    #[test]
    fn test_high_water_ignored_when_already_drained() {
        let mut net = MockNet::new();
        let (mut relay, server, _) = transport_relay(&mut net);

        net.set_queued(server, 0);
        relay.on_high_water(server, &mut net);
        assert!(net.take_ops().is_empty());
    }

    #[test]
    fn test_drained_after_teardown_does_not_resume() {
        let mut net = MockNet::new();
        let (mut relay, server, _) = transport_relay(&mut net);

        net.set_queued(server, crate::HIGH_WATER_MARK + 1);
        relay.on_high_water(server, &mut net);
        relay.teardown(&mut net);
        net.take_ops();

        relay.on_drained(server, &mut net);
        assert!(net.take_ops().is_empty());
    }

    #[test]
    fn test_leg_lookup() {
        let mut net = MockNet::new();
        let (relay, server, client) = transport_relay(&mut net);

        assert_eq!(relay.leg_of(server), Some(Leg::Server));
        assert_eq!(relay.leg_of(client), Some(Leg::Client));
        assert_eq!(relay.leg_of(ConnId(999)), None);
        assert_eq!(Leg::Server.opposite(), Leg::Client);
    }
}
