//! SOCKS5 greeting and CONNECT request parsing
//!
//! Parsers work on the session's inbound buffer and never consume a partial message:
//! `Ok(None)` means "wait for more bytes" and leaves the buffer as it was.

use bytes::{Buf, BytesMut};
use sockstun_proto::ReplyCode;
use std::net::Ipv4Addr;
use thiserror::Error;

pub const SOCKS_VERSION: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;

/// Length of every request-phase reply
pub const REPLY_LEN: usize = 10;

/// Fixed part of a domain CONNECT request: ver, cmd, rsv, atyp, len and the port
const REQUEST_FIXED_LEN: usize = 7;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Unsupported SOCKS version: {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("No acceptable authentication method offered: {0:02x?}")]
    NoAcceptableMethod(Vec<u8>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("Unsupported SOCKS version in request: {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("Command not supported: {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("Address type not supported: {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("Invalid domain name")]
    InvalidDomain,
}

impl RequestError {
    /// Reply code sent to the application before closing
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            RequestError::UnsupportedCommand(_) => ReplyCode::CommandNotSupported,
            RequestError::UnsupportedAddressType(_) => ReplyCode::AddressTypeNotSupported,
            RequestError::UnsupportedVersion(_) | RequestError::InvalidDomain => ReplyCode::GeneralFailure,
        }
    }
}

/// Method-selection message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub methods: Vec<u8>,
}

/// CONNECT request for a domain-name target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
}

/// Parse a greeting that offers the no-auth method
pub fn parse_greeting(buf: &mut BytesMut) -> Result<Option<Greeting>, HandshakeError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    if buf[0] != SOCKS_VERSION {
        return Err(HandshakeError::UnsupportedVersion(buf[0]));
    }

    let nmethods = buf[1] as usize;
    if buf.len() < 2 + nmethods {
        return Ok(None);
    }

    buf.advance(2);
    let methods = buf.split_to(nmethods).to_vec();
    if !methods.contains(&METHOD_NO_AUTH) {
        return Err(HandshakeError::NoAcceptableMethod(methods));
    }

    Ok(Some(Greeting { methods }))
}

/// Parse a CONNECT request with a domain-name address
pub fn parse_request(buf: &mut BytesMut) -> Result<Option<ConnectRequest>, RequestError> {
    if buf.len() < REQUEST_FIXED_LEN {
        return Ok(None);
    }
    if buf[0] != SOCKS_VERSION {
        return Err(RequestError::UnsupportedVersion(buf[0]));
    }
    if buf[1] != CMD_CONNECT {
        return Err(RequestError::UnsupportedCommand(buf[1]));
    }
    if buf[3] != ATYP_DOMAIN {
        return Err(RequestError::UnsupportedAddressType(buf[3]));
    }

    let domain_len = buf[4] as usize;
    if buf.len() < REQUEST_FIXED_LEN + domain_len {
        return Ok(None);
    }

    buf.advance(5);
    let domain = buf.split_to(domain_len);
    let port = buf.get_u16();

    let host = match std::str::from_utf8(&domain) {
        Ok(host) if !host.is_empty() => host.to_string(),
        _ => return Err(RequestError::InvalidDomain),
    };

    Ok(Some(ConnectRequest { host, port }))
}

/// Method-selection reply
pub fn method_reply(method: u8) -> [u8; 2] {
    [SOCKS_VERSION, method]
}

/// Request-phase reply with an IPv4 bound address
pub fn reply(rep: u8, addr: Ipv4Addr, port: u16) -> [u8; REPLY_LEN] {
    let mut out = [0u8; REPLY_LEN];
    out[0] = SOCKS_VERSION;
    out[1] = rep;
    out[2] = 0x00;
    out[3] = ATYP_IPV4;
    out[4..8].copy_from_slice(&addr.octets());
    out[8..10].copy_from_slice(&port.to_be_bytes());
    out
}

/// Failure reply with a zero bound address
pub fn failure_reply(code: ReplyCode) -> [u8; REPLY_LEN] {
    reply(code.as_u8(), Ipv4Addr::UNSPECIFIED, 0)
}
