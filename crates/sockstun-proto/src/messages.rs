//! Protocol message types

use crate::reply::ReplyCode;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// SOCKS5 CONNECT, the only command the tunnel carries
pub const CMD_CONNECT: u8 = 0x01;

/// Messages sent by the local agent to the remote agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientMessage {
    /// Ask the remote agent to open a connection to a target host
    Request(Request),
    /// Application bytes for the target
    Data(#[serde(with = "serde_bytes")] Vec<u8>),
}

/// Connection request for one application session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Request {
    pub password: String,
    pub command: u8,
    pub addr: String,
    pub port: u16,
}

/// Messages sent by the remote agent to the local agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServerMessage {
    /// Outcome of a `Request`
    Response(Response),
    /// Bytes read from the target
    Data(#[serde(with = "serde_bytes")] Vec<u8>),
}

/// Reply to a `Request`.
///
/// `addr` holds an IPv4 address whose big-endian bytes are the octets, `port` the port
/// number; both are emitted in network order on the SOCKS5 side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Response {
    pub rep: u8,
    pub addr: u32,
    pub port: u16,
}

impl Response {
    /// Successful response carrying the address the remote agent is bound to
    pub fn success(bound: SocketAddr) -> Self {
        let addr = match bound.ip() {
            IpAddr::V4(ip) => u32::from(ip),
            IpAddr::V6(ip) => ip.to_ipv4_mapped().map(u32::from).unwrap_or(0),
        };
        Self {
            rep: ReplyCode::Succeeded.as_u8(),
            addr,
            port: bound.port(),
        }
    }

    /// Failure response with a zero bound address
    pub fn failure(code: ReplyCode) -> Self {
        Self {
            rep: code.as_u8(),
            addr: 0,
            port: 0,
        }
    }

    /// Known reply code, or `None` for a status byte this protocol does not define
    pub fn reply_code(&self) -> Option<ReplyCode> {
        ReplyCode::from_u8(self.rep)
    }

    pub fn bound_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.addr)
    }
}

// Vec<u8> payloads serialized as a byte string rather than a sequence
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_response_from_ipv4() {
        let response = Response::success("10.1.2.3:8080".parse().unwrap());
        assert_eq!(response.reply_code(), Some(ReplyCode::Succeeded));
        assert_eq!(response.bound_ip(), Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(response.addr.to_be_bytes(), [10, 1, 2, 3]);
        assert_eq!(response.port, 8080);
    }

    #[test]
    fn test_success_response_from_ipv6() {
        let mapped = Response::success("[::ffff:127.0.0.1]:80".parse().unwrap());
        assert_eq!(mapped.bound_ip(), Ipv4Addr::LOCALHOST);

        let native = Response::success("[2001:db8::1]:443".parse().unwrap());
        assert_eq!(native.addr, 0);
        assert_eq!(native.port, 443);
    }

    #[test]
    fn test_failure_response() {
        let response = Response::failure(ReplyCode::WrongPassword);
        assert_eq!(response.rep, 0x05);
        assert_eq!(response.addr, 0);
        assert_eq!(response.port, 0);
    }

    #[test]
    fn test_unknown_reply_code() {
        let response = Response {
            rep: 0x42,
            addr: 0,
            port: 0,
        };
        assert_eq!(response.reply_code(), None);
    }
}
