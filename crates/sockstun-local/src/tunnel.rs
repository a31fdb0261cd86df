//! Client-side tunnel
//!
//! A `Tunnel` bridges one application connection (the server leg) and one connection
//! to the remote agent (the client leg). It sends the REQUEST once the remote agent
//! accepts the connection, turns the RESPONSE into the SOCKS5 reply, and afterwards
//! unwraps DATA frames onto the application connection.

use crate::socks5::{self, ConnectRequest};
use bytes::{Bytes, BytesMut};
use sockstun_proto::{ClientMessage, ReplyCode, Request, ServerMessage, TunnelCodec, CMD_CONNECT};
use sockstun_transport::{ConnId, Leg, Net, Offload, RelayCore, RelayState, TimerId};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Effect of tunnel input on the owning session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Nothing for the session to act on
    Continue,
    /// The remote agent accepted the request; data transport has begun. Reported once.
    Established,
    /// The tunnel replied to the application if it still could, and tore down
    Failed,
}

#[derive(Debug)]
pub struct Tunnel {
    relay: RelayCore,
    target: ConnectRequest,
    password: String,
    /// Copy of the relay's setup timer kept for detaching its registry route; the
    /// relay forgets its own once the timer is claimed or cancelled
    setup_timer: Option<TimerId>,
    inbound: BytesMut,
}

impl Tunnel {
    pub fn new(app: ConnId, target: ConnectRequest, password: String) -> Self {
        Self {
            relay: RelayCore::new(app),
            target,
            password,
            setup_timer: None,
            inbound: BytesMut::new(),
        }
    }

    /// The application connection
    pub fn app(&self) -> ConnId {
        self.relay.server()
    }

    /// The connection to the remote agent, once setup started
    pub fn remote(&self) -> Option<ConnId> {
        self.relay.client()
    }

    pub fn setup_timer(&self) -> Option<TimerId> {
        self.setup_timer
    }

    pub fn state(&self) -> RelayState {
        self.relay.state()
    }

    pub fn target(&self) -> &ConnectRequest {
        &self.target
    }

    pub fn relay_mut(&mut self) -> &mut RelayCore {
        &mut self.relay
    }

    /// Arm the setup timer and start connecting to the remote agent
    pub fn start(&mut self, remote: SocketAddr, timeout: Duration, net: &mut dyn Net) -> (ConnId, TimerId) {
        let (conn, timer) = self.relay.setup(remote, timeout, net);
        self.setup_timer = Some(timer);
        (conn, timer)
    }

    /// The remote agent accepted the tunnel connection: send the REQUEST
    pub fn on_connected<O: Offload<ClientMessage>>(&mut self, offload: &O) -> bool {
        if !self.relay.connected() {
            return false;
        }
        let Some(remote) = self.relay.client() else {
            return false;
        };

        debug!(
            app = %self.app(),
            %remote,
            "requesting {}:{}",
            self.target.host,
            self.target.port
        );
        offload.submit(
            remote,
            ClientMessage::Request(Request {
                password: self.password.clone(),
                command: CMD_CONNECT,
                addr: self.target.host.clone(),
                port: self.target.port,
            }),
        );
        true
    }

    /// Frames from the remote agent
    pub fn on_data<O: Offload<ClientMessage>>(&mut self, data: &[u8], net: &mut dyn Net, offload: &O) -> Progress {
        if self.relay.is_torn_down() {
            return Progress::Failed;
        }
        self.inbound.extend_from_slice(data);

        let mut progress = Progress::Continue;
        loop {
            let message = match TunnelCodec::decode::<ServerMessage>(&mut self.inbound) {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    warn!(app = %self.app(), "Malformed frame from remote agent: {}", e);
                    self.fail(ReplyCode::GeneralFailure, net, offload);
                    return Progress::Failed;
                }
            };

            match (self.relay.state(), message) {
                (RelayState::Connected, ServerMessage::Response(response)) => {
                    match response.reply_code() {
                        Some(ReplyCode::Succeeded) => {
                            let app = self.app();
                            net.send(
                                app,
                                Bytes::copy_from_slice(&socks5::reply(
                                    response.rep,
                                    response.bound_ip(),
                                    response.port,
                                )),
                            );
                            self.relay.begin_transport(net);
                            net.resume_read(app);
                            info!(
                                %app,
                                "Built data pipeline to {}:{}",
                                self.target.host,
                                self.target.port
                            );
                            progress = Progress::Established;
                        }
                        code => {
                            let code = code.unwrap_or(ReplyCode::GeneralFailure);
                            warn!(
                                app = %self.app(),
                                "Remote agent refused {}:{}: {}",
                                self.target.host,
                                self.target.port,
                                code
                            );
                            self.fail(code, net, offload);
                            return Progress::Failed;
                        }
                    }
                }
                (RelayState::Transport, ServerMessage::Data(payload)) if !payload.is_empty() => {
                    debug!(app = %self.app(), "{} bytes from remote agent", payload.len());
                    net.send(self.app(), Bytes::from(payload));
                }
                (state, message) => {
                    warn!(
                        app = %self.app(),
                        ?state,
                        "Unexpected message from remote agent: {}",
                        describe(&message)
                    );
                    self.fail(ReplyCode::GeneralFailure, net, offload);
                    return Progress::Failed;
                }
            }
        }
        progress
    }

    /// Application bytes for the target
    pub fn forward<O: Offload<ClientMessage>>(&self, data: &[u8], offload: &O) {
        if let Some(remote) = self.relay.client() {
            debug!(app = %self.app(), "{} bytes to remote agent", data.len());
            offload.submit(remote, ClientMessage::Data(data.to_vec()));
        }
    }

    /// Setup timer expired. True if it was this tunnel's pending timer.
    pub fn on_timer<O: Offload<ClientMessage>>(&mut self, timer: TimerId, net: &mut dyn Net, offload: &O) -> bool {
        if !self.relay.claim_timer(timer) {
            return false;
        }
        warn!(
            app = %self.app(),
            "Tunnel to {}:{} timed out",
            self.target.host,
            self.target.port
        );
        self.fail(ReplyCode::Timeout, net, offload);
        true
    }

    pub fn on_high_water(&mut self, conn: ConnId, net: &mut dyn Net) {
        self.relay.on_high_water(conn, net);
    }

    pub fn on_drained(&mut self, conn: ConnId, net: &mut dyn Net) {
        self.relay.on_drained(conn, net);
    }

    pub fn is_remote(&self, conn: ConnId) -> bool {
        self.relay.leg_of(conn) == Some(Leg::Client)
    }

    /// Reply `code` to the application unless transport already began, then tear down
    pub fn fail<O: Offload<ClientMessage>>(&mut self, code: ReplyCode, net: &mut dyn Net, offload: &O) {
        if self.relay.is_torn_down() {
            return;
        }
        if self.relay.state() != RelayState::Transport {
            net.send(self.app(), Bytes::copy_from_slice(&socks5::failure_reply(code)));
        }
        self.teardown(net, offload);
    }

    /// Shut both connections down; the remote connection closes after queued DATA
    pub fn teardown<O: Offload<ClientMessage>>(&mut self, net: &mut dyn Net, offload: &O) -> bool {
        self.relay.teardown_after(Leg::Client, net, offload)
    }
}

fn describe(message: &ServerMessage) -> &'static str {
    match message {
        ServerMessage::Response(_) => "RESPONSE",
        ServerMessage::Data(data) if data.is_empty() => "empty DATA",
        ServerMessage::Data(_) => "DATA",
    }
}
