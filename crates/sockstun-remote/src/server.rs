//! Remote agent engine: one session per tunnel connection
//!
//! A session authenticates the REQUEST, resolves the target, connects a [`Relay`] to it
//! and then unwraps DATA frames onto the destination. Frames that arrive after the
//! REQUEST stay buffered until the relay reaches transport.

use crate::relay::{self, Relay, DEFAULT_TUNNEL_TIMEOUT};
use crate::resolver::{Resolution, Resolver, DEFAULT_DNS_TIMEOUT};
use bytes::{Bytes, BytesMut};
use sockstun_proto::{ClientMessage, ReplyCode, Response, ServerMessage, TunnelCodec, CMD_CONNECT};
use sockstun_transport::{ConnId, Engine, Event, LookupId, Net, Offload, Registry, Route, TimerId};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Runtime options of the remote agent
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    pub listen_addr: SocketAddr,
    pub password: String,
    pub dns_timeout: Duration,
    /// Destination connect timeout
    pub timeout: Duration,
    pub send_threads: usize,
}

impl RemoteOptions {
    /// Options with the default timeouts and thread count
    pub fn new(listen_addr: SocketAddr, password: impl Into<String>) -> Self {
        Self {
            listen_addr,
            password: password.into(),
            dns_timeout: DEFAULT_DNS_TIMEOUT,
            timeout: DEFAULT_TUNNEL_TIMEOUT,
            send_threads: crate::config::DEFAULT_SEND_THREADS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the REQUEST
    Start,
    /// Resolving the target; tunnel reads paused
    GotCommand,
    /// Connecting to the destination
    Resolved,
    Transport,
}

#[derive(Debug)]
struct Session {
    state: SessionState,
    inbound: BytesMut,
    relay: Option<Relay>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: SessionState::Start,
            inbound: BytesMut::new(),
            relay: None,
        }
    }
}

/// Remote agent state machine
pub struct RemoteServer<O> {
    options: RemoteOptions,
    offload: O,
    resolver: Resolver,
    sessions: Registry<Session>,
}

impl<O: Offload<ServerMessage>> RemoteServer<O> {
    pub fn new(options: RemoteOptions, offload: O) -> Self {
        let resolver = Resolver::new(options.dns_timeout);
        Self {
            options,
            offload,
            resolver,
            sessions: Registry::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_state(&self, tunnel: ConnId) -> Option<SessionState> {
        self.sessions.get(tunnel).map(|s| s.state)
    }

    pub fn offload(&self) -> &O {
        &self.offload
    }

    fn on_tunnel_data(&mut self, tunnel: ConnId, data: Bytes, net: &mut dyn Net) {
        let Some(session) = self.sessions.get_mut(tunnel) else {
            return;
        };
        session.inbound.extend_from_slice(&data);
        self.advance(tunnel, net);
    }

    /// Process buffered frames as far as the session state allows
    fn advance(&mut self, tunnel: ConnId, net: &mut dyn Net) {
        loop {
            let Some(session) = self.sessions.get_mut(tunnel) else {
                return;
            };
            if matches!(session.state, SessionState::GotCommand | SessionState::Resolved) {
                return;
            }

            let message = match TunnelCodec::decode::<ClientMessage>(&mut session.inbound) {
                Ok(Some(message)) => message,
                Ok(None) => return,
                Err(e) => {
                    warn!(%tunnel, "Malformed frame from local agent: {}", e);
                    self.abort(tunnel, net);
                    return;
                }
            };

            match (session.state, message) {
                (SessionState::Start, ClientMessage::Request(request)) => {
                    if request.password != self.options.password {
                        warn!(%tunnel, "Wrong password, rejecting request for {}", request.addr);
                        self.reject(tunnel, ReplyCode::WrongPassword, net);
                        return;
                    }
                    if request.command != CMD_CONNECT {
                        warn!(%tunnel, command = request.command, "Unsupported command");
                        self.reject(tunnel, ReplyCode::CommandNotSupported, net);
                        return;
                    }

                    info!(%tunnel, "CONNECT {}:{}", request.addr, request.port);
                    net.pause_read(tunnel);
                    self.resolver.resolve(&request.addr, request.port, tunnel, net);
                    session.state = SessionState::GotCommand;
                }
                (SessionState::Transport, ClientMessage::Data(payload)) => {
                    if let Some(relay) = session.relay.as_ref() {
                        relay.deliver(payload, net);
                    }
                }
                (state, message) => {
                    warn!(
                        %tunnel,
                        ?state,
                        "Unexpected {} from local agent",
                        match message {
                            ClientMessage::Request(_) => "REQUEST",
                            ClientMessage::Data(_) => "DATA",
                        }
                    );
                    self.abort(tunnel, net);
                    return;
                }
            }
        }
    }

    fn on_resolved(&mut self, lookup: LookupId, result: io::Result<Vec<SocketAddr>>, net: &mut dyn Net) {
        match self.resolver.on_resolved(lookup, result, net) {
            Some(resolution) => self.on_resolution(resolution, net),
            None => debug!(?lookup, "lookup result dropped"),
        }
    }

    fn on_resolution(&mut self, resolution: Resolution, net: &mut dyn Net) {
        match resolution {
            Resolution::Resolved { conn: tunnel, addr } => {
                let Some(session) = self.sessions.get_mut(tunnel) else {
                    return;
                };
                if session.state != SessionState::GotCommand {
                    return;
                }

                let mut relay = Relay::new(tunnel, addr);
                let (destination, timer) = relay.start(self.options.timeout, net);
                session.relay = Some(relay);
                session.state = SessionState::Resolved;

                self.sessions.attach_peer(destination, tunnel);
                self.sessions.attach_timer(timer, tunnel);
            }
            Resolution::Failed { conn: tunnel, host } => {
                warn!(%tunnel, "Cannot resolve {}", host);
                self.reject(tunnel, ReplyCode::HostUnreachable, net);
            }
        }
    }

    fn on_connected(&mut self, tunnel: ConnId, local_addr: SocketAddr, net: &mut dyn Net) {
        let Some(session) = self.sessions.get_mut(tunnel) else {
            return;
        };
        let established = session
            .relay
            .as_mut()
            .map(|relay| relay.on_connected(local_addr, net))
            .unwrap_or(false);
        if !established {
            return;
        }
        session.state = SessionState::Transport;
        let timer = session.relay.as_ref().and_then(|r| r.setup_timer());
        if let Some(timer) = timer {
            self.sessions.detach_timer(timer);
        }
        // Frames held since the REQUEST
        self.advance(tunnel, net);
    }

    fn on_timer(&mut self, timer: TimerId, net: &mut dyn Net) {
        if self.resolver.owns_timer(timer) {
            if let Some(resolution) = self.resolver.on_timer(timer, net) {
                self.on_resolution(resolution, net);
            }
            return;
        }

        let Some(tunnel) = self.sessions.take_timer(timer) else {
            return;
        };
        let offload = &self.offload;
        let fired = self
            .sessions
            .get_mut(tunnel)
            .and_then(|s| s.relay.as_mut())
            .map(|r| r.on_timer(timer, net, offload))
            .unwrap_or(false);
        if fired {
            self.close(tunnel, net);
        }
    }

    /// Destination failed or went away
    fn fail(&mut self, tunnel: ConnId, code: ReplyCode, net: &mut dyn Net) {
        let offload = &self.offload;
        if let Some(relay) = self.sessions.get_mut(tunnel).and_then(|s| s.relay.as_mut()) {
            relay.fail(code, net, offload);
        }
        self.close(tunnel, net);
    }

    /// Answer a request that cannot be served, then close
    fn reject(&mut self, tunnel: ConnId, code: ReplyCode, net: &mut dyn Net) {
        relay::send_response(net, tunnel, Response::failure(code));
        self.close(tunnel, net);
    }

    /// Protocol violation: best-effort RESPONSE unless transport began, then close
    fn abort(&mut self, tunnel: ConnId, net: &mut dyn Net) {
        let has_relay = self
            .sessions
            .get(tunnel)
            .map(|s| s.relay.is_some())
            .unwrap_or(false);
        if has_relay {
            // The relay knows whether a RESPONSE can still be sent
            self.fail(tunnel, ReplyCode::GeneralFailure, net);
        } else {
            self.reject(tunnel, ReplyCode::GeneralFailure, net);
        }
    }

    /// Drop the session, tearing down its relay. Safe to call more than once.
    fn close(&mut self, tunnel: ConnId, net: &mut dyn Net) {
        let Some(session) = self.sessions.remove(tunnel) else {
            return;
        };
        self.resolver.cancel(tunnel, net);
        match session.relay {
            Some(mut relay) => {
                if let Some(destination) = relay.destination() {
                    self.sessions.detach_peer(destination);
                }
                if let Some(timer) = relay.setup_timer() {
                    self.sessions.detach_timer(timer);
                }
                relay.teardown(net, &self.offload);
            }
            None => net.shutdown(tunnel),
        }
        debug!(%tunnel, sessions = self.sessions.len(), "session closed");
    }

    fn with_relay(&mut self, tunnel: ConnId, f: impl FnOnce(&mut Relay)) {
        if let Some(relay) = self.sessions.get_mut(tunnel).and_then(|s| s.relay.as_mut()) {
            f(relay);
        }
    }
}

impl<O: Offload<ServerMessage>> Engine for RemoteServer<O> {
    fn on_event(&mut self, event: Event, net: &mut dyn Net) {
        match event {
            Event::Accepted { conn, peer } => {
                info!(tunnel = %conn, %peer, "Local agent connected");
                self.sessions.insert(conn, Session::new());
            }
            Event::Data { conn, data } => match self.sessions.route(conn) {
                Route::Session(tunnel) => self.on_tunnel_data(tunnel, data, net),
                Route::Peer(tunnel) => {
                    if let Some(relay) = self.sessions.get(tunnel).and_then(|s| s.relay.as_ref()) {
                        relay.forward(&data, &self.offload);
                    }
                }
                Route::Unknown => panic!("data for unregistered connection {}", conn),
            },
            Event::Connected { conn, local_addr } => match self.sessions.route(conn) {
                Route::Peer(tunnel) => self.on_connected(tunnel, local_addr, net),
                _ => debug!(%conn, "late connect ignored"),
            },
            Event::ConnectFailed { conn, error } => {
                if let Route::Peer(tunnel) = self.sessions.route(conn) {
                    let target = self
                        .sessions
                        .get(tunnel)
                        .and_then(|s| s.relay.as_ref())
                        .map(|r| r.target());
                    warn!(%tunnel, "Failed to connect to {:?}: {}", target, error);
                    self.fail(tunnel, ReplyCode::GeneralFailure, net);
                }
            }
            Event::HighWater { conn, .. } => {
                if let Route::Session(tunnel) | Route::Peer(tunnel) = self.sessions.route(conn) {
                    self.with_relay(tunnel, |r| r.on_high_water(conn, net));
                }
            }
            Event::Drained { conn } => {
                if let Route::Session(tunnel) | Route::Peer(tunnel) = self.sessions.route(conn) {
                    self.with_relay(tunnel, |r| r.on_drained(conn, net));
                }
            }
            Event::Closed { conn } => match self.sessions.route(conn) {
                Route::Session(tunnel) => {
                    info!(%tunnel, "Local agent disconnected");
                    self.close(tunnel, net);
                }
                Route::Peer(tunnel) => {
                    info!(%tunnel, destination = %conn, "Destination closed the connection");
                    self.fail(tunnel, ReplyCode::GeneralFailure, net);
                }
                Route::Unknown => {}
            },
            Event::Timer(timer) => self.on_timer(timer, net),
            Event::Resolved { lookup, result } => self.on_resolved(lookup, result, net),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sockstun_proto::Request;
    use sockstun_transport::mock::{MockNet, NetOp, RecordingOffload};

    const TUNNEL: ConnId = ConnId(1);

    type TestServer = RemoteServer<RecordingOffload<ServerMessage>>;

    fn server() -> (TestServer, MockNet) {
        let mut net = MockNet::new();
        net.open(TUNNEL);
        let options = RemoteOptions::new("0.0.0.0:8388".parse().unwrap(), "secret");
        let mut server = RemoteServer::new(options, RecordingOffload::new());
        server.on_event(
            Event::Accepted {
                conn: TUNNEL,
                peer: "198.51.100.20:50000".parse().unwrap(),
            },
            &mut net,
        );
        (server, net)
    }

    fn request(password: &str, command: u8) -> Bytes {
        TunnelCodec::encode(&ClientMessage::Request(Request {
            password: password.to_string(),
            command,
            addr: "localhost".to_string(),
            port: 80,
        }))
        .unwrap()
    }

    fn data_frame(payload: &[u8]) -> Bytes {
        TunnelCodec::encode(&ClientMessage::Data(payload.to_vec())).unwrap()
    }

    fn feed(server: &mut TestServer, net: &mut MockNet, conn: ConnId, bytes: &[u8]) {
        server.on_event(
            Event::Data {
                conn,
                data: Bytes::copy_from_slice(bytes),
            },
            net,
        );
    }

    fn responses(net: &MockNet) -> Vec<Response> {
        let mut buf = BytesMut::from(&net.sent_to(TUNNEL)[..]);
        TunnelCodec::decode_all::<ServerMessage>(&mut buf)
            .unwrap()
            .into_iter()
            .filter_map(|message| match message {
                ServerMessage::Response(response) => Some(response),
                ServerMessage::Data(_) => None,
            })
            .collect()
    }

    fn resolve(server: &mut TestServer, net: &mut MockNet, addrs: &[&str]) {
        let (lookup, _, _) = net.last_lookup().unwrap();
        resolve_with(server, net, lookup, addrs);
    }

    /// Answer `lookup`, even once its op has been cleared from the record
    fn resolve_with(server: &mut TestServer, net: &mut MockNet, lookup: LookupId, addrs: &[&str]) {
        server.on_event(
            Event::Resolved {
                lookup,
                result: Ok(addrs.iter().map(|a| a.parse().unwrap()).collect()),
            },
            net,
        );
    }

    /// Session whose destination connection is established
    fn in_transport(server: &mut TestServer, net: &mut MockNet) -> ConnId {
        feed(server, net, TUNNEL, &request("secret", CMD_CONNECT));
        resolve(server, net, &["127.0.0.1:0"]);
        let (destination, _) = net.last_connect().unwrap();
        server.on_event(
            Event::Connected {
                conn: destination,
                local_addr: "127.0.0.1:45000".parse().unwrap(),
            },
            net,
        );
        destination
    }

    #[test]
    fn test_wrong_password_rejected() {
        let (mut server, mut net) = server();

        feed(&mut server, &mut net, TUNNEL, &request("guess", CMD_CONNECT));

        assert_eq!(responses(&net), vec![Response::failure(ReplyCode::WrongPassword)]);
        assert!(net.was_shut_down(TUNNEL));
        assert_eq!(net.last_lookup(), None);
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn test_unsupported_command_rejected() {
        let (mut server, mut net) = server();

        feed(&mut server, &mut net, TUNNEL, &request("secret", 0x02));

        assert_eq!(responses(&net), vec![Response::failure(ReplyCode::CommandNotSupported)]);
        assert!(net.was_shut_down(TUNNEL));
    }

    #[test]
    fn test_request_pauses_tunnel_and_resolves() {
        let (mut server, mut net) = server();

        // Split mid-frame
        let frame = request("secret", CMD_CONNECT);
        feed(&mut server, &mut net, TUNNEL, &frame[..5]);
        assert_eq!(server.session_state(TUNNEL), Some(SessionState::Start));
        feed(&mut server, &mut net, TUNNEL, &frame[5..]);

        assert_eq!(server.session_state(TUNNEL), Some(SessionState::GotCommand));
        assert!(net.ops().contains(&NetOp::PauseRead(TUNNEL)));
        assert_eq!(
            net.last_lookup().map(|(_, host, port)| (host, port)),
            Some(("localhost".to_string(), 80))
        );
    }

    #[test]
    fn test_resolution_failure_replies_host_unreachable() {
        let (mut server, mut net) = server();
        feed(&mut server, &mut net, TUNNEL, &request("secret", CMD_CONNECT));
        let (lookup, _, _) = net.last_lookup().unwrap();

        server.on_event(
            Event::Resolved {
                lookup,
                result: Err(io::Error::new(io::ErrorKind::NotFound, "no such host")),
            },
            &mut net,
        );

        assert_eq!(responses(&net), vec![Response::failure(ReplyCode::HostUnreachable)]);
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn test_resolution_timeout_replies_host_unreachable() {
        let (mut server, mut net) = server();
        feed(&mut server, &mut net, TUNNEL, &request("secret", CMD_CONNECT));
        let (lookup, _, _) = net.last_lookup().unwrap();
        let timer = net.last_timer().unwrap();

        server.on_event(Event::Timer(timer), &mut net);
        assert_eq!(responses(&net), vec![Response::failure(ReplyCode::HostUnreachable)]);
        assert_eq!(server.session_count(), 0);

        // The answer arriving later changes nothing
        net.take_ops();
        resolve_with(&mut server, &mut net, lookup, &["127.0.0.1:0"]);
        assert!(net.take_ops().is_empty());
        assert_eq!(net.last_connect(), None);
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn test_resolved_connects_and_enters_transport() {
        let (mut server, mut net) = server();
        feed(&mut server, &mut net, TUNNEL, &request("secret", CMD_CONNECT));
        resolve(&mut server, &mut net, &["127.0.0.1:0"]);

        assert_eq!(server.session_state(TUNNEL), Some(SessionState::Resolved));
        let (destination, addr) = net.last_connect().unwrap();
        assert_eq!(addr, "127.0.0.1:80".parse().unwrap());

        server.on_event(
            Event::Connected {
                conn: destination,
                local_addr: "127.0.0.1:45000".parse().unwrap(),
            },
            &mut net,
        );

        assert_eq!(server.session_state(TUNNEL), Some(SessionState::Transport));
        assert_eq!(
            responses(&net),
            vec![Response::success("127.0.0.1:45000".parse().unwrap())]
        );
        assert!(net.ops().contains(&NetOp::ResumeRead(TUNNEL)));
    }

    #[test]
    fn test_data_both_ways_in_transport() {
        let (mut server, mut net) = server();
        let destination = in_transport(&mut server, &mut net);

        feed(&mut server, &mut net, TUNNEL, &data_frame(b"GET / HTTP/1.0\r\n\r\n"));
        assert_eq!(net.sent_to(destination), b"GET / HTTP/1.0\r\n\r\n".to_vec());

        feed(&mut server, &mut net, destination, b"HTTP/1.0 200 OK");
        assert_eq!(
            server.offload().take(),
            vec![(TUNNEL, ServerMessage::Data(b"HTTP/1.0 200 OK".to_vec()))]
        );
    }

    #[test]
    fn test_frames_after_request_held_until_transport() {
        let (mut server, mut net) = server();

        let mut batch = BytesMut::new();
        batch.extend_from_slice(&request("secret", CMD_CONNECT));
        batch.extend_from_slice(&data_frame(b"early"));
        feed(&mut server, &mut net, TUNNEL, &batch);
        resolve(&mut server, &mut net, &["127.0.0.1:0"]);
        let (destination, _) = net.last_connect().unwrap();
        assert!(net.sent_to(destination).is_empty());

        server.on_event(
            Event::Connected {
                conn: destination,
                local_addr: "127.0.0.1:45000".parse().unwrap(),
            },
            &mut net,
        );

        assert_eq!(net.sent_to(destination), b"early".to_vec());
    }

    #[test]
    fn test_connect_timeout_replies_timeout() {
        let (mut server, mut net) = server();
        feed(&mut server, &mut net, TUNNEL, &request("secret", CMD_CONNECT));
        resolve(&mut server, &mut net, &["127.0.0.1:0"]);
        let (destination, _) = net.last_connect().unwrap();
        let timer = net.last_timer().unwrap();

        server.on_event(Event::Timer(timer), &mut net);

        assert_eq!(responses(&net), vec![Response::failure(ReplyCode::Timeout)]);
        assert!(net.was_shut_down(destination));
        assert!(server.offload().was_closed(TUNNEL));
        assert_eq!(server.session_count(), 0);

        // A connect completing afterwards is ignored
        net.take_ops();
        server.on_event(
            Event::Connected {
                conn: destination,
                local_addr: "127.0.0.1:45000".parse().unwrap(),
            },
            &mut net,
        );
        assert!(net.take_ops().is_empty());
    }

    #[test]
    fn test_connect_refused_replies_general_failure() {
        let (mut server, mut net) = server();
        feed(&mut server, &mut net, TUNNEL, &request("secret", CMD_CONNECT));
        resolve(&mut server, &mut net, &["127.0.0.1:0"]);
        let (destination, _) = net.last_connect().unwrap();

        server.on_event(
            Event::ConnectFailed {
                conn: destination,
                error: io::Error::from(io::ErrorKind::ConnectionRefused),
            },
            &mut net,
        );

        assert_eq!(responses(&net), vec![Response::failure(ReplyCode::GeneralFailure)]);
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn test_data_before_request_is_a_violation() {
        let (mut server, mut net) = server();

        feed(&mut server, &mut net, TUNNEL, &data_frame(b"hi"));

        assert_eq!(responses(&net), vec![Response::failure(ReplyCode::GeneralFailure)]);
        assert!(net.was_shut_down(TUNNEL));
    }

    #[test]
    fn test_corrupt_frame_is_a_violation() {
        let (mut server, mut net) = server();

        feed(&mut server, &mut net, TUNNEL, &TunnelCodec::frame(&[1, 2, 3, 4]).unwrap());

        assert_eq!(responses(&net), vec![Response::failure(ReplyCode::GeneralFailure)]);
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn test_second_request_in_transport_closes_silently() {
        let (mut server, mut net) = server();
        let destination = in_transport(&mut server, &mut net);
        net.take_ops();

        feed(&mut server, &mut net, TUNNEL, &request("secret", CMD_CONNECT));

        // No RESPONSE once data is flowing
        assert_eq!(
            net.take_ops(),
            vec![NetOp::Retire(TUNNEL), NetOp::Shutdown(destination)]
        );
        assert_eq!(server.offload().take_closed(), vec![TUNNEL]);
    }

    #[test]
    fn test_destination_close_flushes_then_closes_tunnel() {
        let (mut server, mut net) = server();
        let destination = in_transport(&mut server, &mut net);

        feed(&mut server, &mut net, destination, b"last words");
        server.on_event(Event::Closed { conn: destination }, &mut net);

        assert_eq!(
            server.offload().take(),
            vec![(TUNNEL, ServerMessage::Data(b"last words".to_vec()))]
        );
        assert_eq!(server.offload().take_closed(), vec![TUNNEL]);
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn test_tunnel_close_while_resolving_cancels_lookup() {
        let (mut server, mut net) = server();
        feed(&mut server, &mut net, TUNNEL, &request("secret", CMD_CONNECT));
        let (lookup, _, _) = net.last_lookup().unwrap();
        let timer = net.last_timer().unwrap();
        net.take_ops();

        server.on_event(Event::Closed { conn: TUNNEL }, &mut net);

        assert!(net.ops().contains(&NetOp::CancelTimer(timer)));
        assert_eq!(server.session_count(), 0);

        net.kill(TUNNEL);
        net.take_ops();
        resolve_with(&mut server, &mut net, lookup, &["127.0.0.1:0"]);
        assert!(net.take_ops().is_empty());
        assert_eq!(net.last_connect(), None);
    }

    #[test]
    #[should_panic(expected = "unregistered connection")]
    fn test_data_for_unknown_connection_panics() {
        let (mut server, mut net) = server();
        feed(&mut server, &mut net, ConnId(99), b"??");
    }
}
