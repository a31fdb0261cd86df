//! Local agent engine: one SOCKS5 session per application connection

use crate::socks5::{self, METHOD_NO_ACCEPTABLE, METHOD_NO_AUTH};
use crate::tunnel::{Progress, Tunnel};
use bytes::{Bytes, BytesMut};
use sockstun_proto::{ClientMessage, ReplyCode};
use sockstun_transport::{ConnId, Engine, Event, Net, Offload, Registry, Route, TimerId};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Runtime options of the local agent
#[derive(Debug, Clone)]
pub struct LocalOptions {
    pub listen_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub password: String,
    /// Covers connecting to the remote agent and waiting for its RESPONSE
    pub timeout: Duration,
    pub send_threads: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the method-selection greeting
    Start,
    /// Greeting accepted, waiting for the CONNECT request
    Verified,
    /// Tunnel being negotiated; application reads paused
    GotCommand,
    Transport,
}

#[derive(Debug)]
struct Session {
    state: SessionState,
    inbound: BytesMut,
    tunnel: Option<Tunnel>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: SessionState::Start,
            inbound: BytesMut::new(),
            tunnel: None,
        }
    }
}

/// Local agent state machine
pub struct LocalServer<O> {
    options: LocalOptions,
    offload: O,
    sessions: Registry<Session>,
}

impl<O: Offload<ClientMessage>> LocalServer<O> {
    pub fn new(options: LocalOptions, offload: O) -> Self {
        Self {
            options,
            offload,
            sessions: Registry::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_state(&self, app: ConnId) -> Option<SessionState> {
        self.sessions.get(app).map(|s| s.state)
    }

    pub fn offload(&self) -> &O {
        &self.offload
    }

    fn on_app_data(&mut self, app: ConnId, data: Bytes, net: &mut dyn Net) {
        let Some(session) = self.sessions.get_mut(app) else {
            return;
        };
        session.inbound.extend_from_slice(&data);
        self.advance(app, net);
    }

    /// Run the handshake as far as the buffered bytes allow
    fn advance(&mut self, app: ConnId, net: &mut dyn Net) {
        loop {
            let Some(session) = self.sessions.get_mut(app) else {
                return;
            };

            match session.state {
                SessionState::Start => match socks5::parse_greeting(&mut session.inbound) {
                    Ok(None) => return,
                    Ok(Some(greeting)) => {
                        debug!(%app, methods = ?greeting.methods, "greeting accepted");
                        net.send(app, Bytes::copy_from_slice(&socks5::method_reply(METHOD_NO_AUTH)));
                        session.state = SessionState::Verified;
                    }
                    Err(e) => {
                        warn!(%app, "Rejecting SOCKS5 greeting: {}", e);
                        net.send(app, Bytes::copy_from_slice(&socks5::method_reply(METHOD_NO_ACCEPTABLE)));
                        self.close(app, net);
                        return;
                    }
                },
                SessionState::Verified => match socks5::parse_request(&mut session.inbound) {
                    Ok(None) => return,
                    Ok(Some(request)) => {
                        info!(%app, "CONNECT {}:{}", request.host, request.port);
                        net.pause_read(app);

                        let mut tunnel = Tunnel::new(app, request, self.options.password.clone());
                        let (remote, timer) = tunnel.start(self.options.remote_addr, self.options.timeout, net);
                        session.tunnel = Some(tunnel);
                        session.state = SessionState::GotCommand;

                        self.sessions.attach_peer(remote, app);
                        self.sessions.attach_timer(timer, app);
                        return;
                    }
                    Err(e) => {
                        warn!(%app, "Rejecting SOCKS5 request: {}", e);
                        net.send(app, Bytes::copy_from_slice(&socks5::failure_reply(e.reply_code())));
                        self.close(app, net);
                        return;
                    }
                },
                // Held until the tunnel is established
                SessionState::GotCommand => return,
                SessionState::Transport => {
                    if session.inbound.is_empty() {
                        return;
                    }
                    let live = session
                        .tunnel
                        .as_ref()
                        .and_then(|t| t.remote())
                        .map(|remote| net.is_alive(remote))
                        .unwrap_or(false);
                    if !live {
                        warn!(%app, "Tunnel connection is gone, closing application connection");
                        self.close(app, net);
                        return;
                    }
                    let data = session.inbound.split();
                    if let Some(tunnel) = session.tunnel.as_ref() {
                        tunnel.forward(&data, &self.offload);
                    }
                    return;
                }
            }
        }
    }

    fn on_tunnel_data(&mut self, app: ConnId, data: Bytes, net: &mut dyn Net) {
        let offload = &self.offload;
        let Some(tunnel) = self.sessions.get_mut(app).and_then(|s| s.tunnel.as_mut()) else {
            return;
        };
        match tunnel.on_data(&data, net, offload) {
            Progress::Continue => {}
            Progress::Established => {
                if let Some(session) = self.sessions.get_mut(app) {
                    session.state = SessionState::Transport;
                }
                // Flush application bytes that arrived during negotiation
                self.advance(app, net);
            }
            Progress::Failed => self.close(app, net),
        }
    }

    fn on_connected(&mut self, app: ConnId, remote: ConnId) {
        let offload = &self.offload;
        let Some(tunnel) = self.sessions.get_mut(app).and_then(|s| s.tunnel.as_mut()) else {
            return;
        };
        if tunnel.on_connected(offload) {
            info!(%app, %remote, "Connected to remote agent");
        }
    }

    fn fail(&mut self, app: ConnId, code: ReplyCode, net: &mut dyn Net) {
        let offload = &self.offload;
        if let Some(tunnel) = self.sessions.get_mut(app).and_then(|s| s.tunnel.as_mut()) {
            tunnel.fail(code, net, offload);
        }
        self.close(app, net);
    }

    fn on_timer(&mut self, timer: TimerId, net: &mut dyn Net) {
        let Some(app) = self.sessions.take_timer(timer) else {
            return;
        };
        let offload = &self.offload;
        let fired = self
            .sessions
            .get_mut(app)
            .and_then(|s| s.tunnel.as_mut())
            .map(|t| t.on_timer(timer, net, offload))
            .unwrap_or(false);
        if fired {
            self.close(app, net);
        }
    }

    /// Drop the session, tearing down its tunnel. Safe to call more than once.
    fn close(&mut self, app: ConnId, net: &mut dyn Net) {
        let Some(session) = self.sessions.remove(app) else {
            return;
        };
        match session.tunnel {
            Some(mut tunnel) => {
                if let Some(remote) = tunnel.remote() {
                    self.sessions.detach_peer(remote);
                }
                if let Some(timer) = tunnel.setup_timer() {
                    self.sessions.detach_timer(timer);
                }
                tunnel.teardown(net, &self.offload);
            }
            None => net.shutdown(app),
        }
        debug!(%app, sessions = self.sessions.len(), "session closed");
    }

    fn with_tunnel(&mut self, app: ConnId, f: impl FnOnce(&mut Tunnel)) {
        if let Some(tunnel) = self.sessions.get_mut(app).and_then(|s| s.tunnel.as_mut()) {
            f(tunnel);
        }
    }
}

impl<O: Offload<ClientMessage>> Engine for LocalServer<O> {
    fn on_event(&mut self, event: Event, net: &mut dyn Net) {
        match event {
            Event::Accepted { conn, peer } => {
                info!(app = %conn, %peer, "Application connected");
                self.sessions.insert(conn, Session::new());
            }
            Event::Data { conn, data } => match self.sessions.route(conn) {
                Route::Session(app) => self.on_app_data(app, data, net),
                Route::Peer(app) => self.on_tunnel_data(app, data, net),
                Route::Unknown => panic!("data for unregistered connection {}", conn),
            },
            Event::Connected { conn, .. } => match self.sessions.route(conn) {
                Route::Peer(app) => self.on_connected(app, conn),
                _ => debug!(%conn, "late connect ignored"),
            },
            Event::ConnectFailed { conn, error } => {
                if let Route::Peer(app) = self.sessions.route(conn) {
                    warn!(%app, "Failed to connect to remote agent {}: {}", self.options.remote_addr, error);
                    self.fail(app, ReplyCode::GeneralFailure, net);
                }
            }
            Event::HighWater { conn, .. } => {
                if let Route::Session(app) | Route::Peer(app) = self.sessions.route(conn) {
                    self.with_tunnel(app, |t| t.on_high_water(conn, net));
                }
            }
            Event::Drained { conn } => {
                if let Route::Session(app) | Route::Peer(app) = self.sessions.route(conn) {
                    self.with_tunnel(app, |t| t.on_drained(conn, net));
                }
            }
            Event::Closed { conn } => match self.sessions.route(conn) {
                Route::Session(app) => {
                    info!(%app, "Application disconnected");
                    self.close(app, net);
                }
                Route::Peer(app) => {
                    info!(%app, remote = %conn, "Remote agent closed the tunnel");
                    // Still negotiating: tell the application why
                    self.fail(app, ReplyCode::GeneralFailure, net);
                }
                Route::Unknown => {}
            },
            Event::Timer(timer) => self.on_timer(timer, net),
            Event::Resolved { lookup, .. } => debug!(?lookup, "unexpected lookup result ignored"),
        }
    }
}
