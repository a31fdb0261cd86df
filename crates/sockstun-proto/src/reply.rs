//! Reply codes shared by the SOCKS5 front end and the tunnel protocol

use std::fmt;

/// Status byte carried by a tunnel `Response` and by the SOCKS5 reply sent to the
/// application. Values mirror SOCKS5 semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    /// The remote agent could not resolve the target host
    HostUnreachable = 0x03,
    /// A leg did not connect before its setup timer fired
    Timeout = 0x04,
    /// Shared secret mismatch
    WrongPassword = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl ReplyCode {
    /// Map a raw status byte to a known reply code
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(ReplyCode::Succeeded),
            0x01 => Some(ReplyCode::GeneralFailure),
            0x03 => Some(ReplyCode::HostUnreachable),
            0x04 => Some(ReplyCode::Timeout),
            0x05 => Some(ReplyCode::WrongPassword),
            0x07 => Some(ReplyCode::CommandNotSupported),
            0x08 => Some(ReplyCode::AddressTypeNotSupported),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_success(self) -> bool {
        self == ReplyCode::Succeeded
    }
}

impl From<ReplyCode> for u8 {
    fn from(code: ReplyCode) -> Self {
        code.as_u8()
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ReplyCode::Succeeded => "succeeded",
            ReplyCode::GeneralFailure => "general failure",
            ReplyCode::HostUnreachable => "host unreachable",
            ReplyCode::Timeout => "timeout",
            ReplyCode::WrongPassword => "wrong password",
            ReplyCode::CommandNotSupported => "command not supported",
            ReplyCode::AddressTypeNotSupported => "address type not supported",
        };
        write!(f, "{} (0x{:02x})", text, self.as_u8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_map_back() {
        for code in [
            ReplyCode::Succeeded,
            ReplyCode::GeneralFailure,
            ReplyCode::HostUnreachable,
            ReplyCode::Timeout,
            ReplyCode::WrongPassword,
            ReplyCode::CommandNotSupported,
            ReplyCode::AddressTypeNotSupported,
        ] {
            assert_eq!(ReplyCode::from_u8(code.as_u8()), Some(code));
        }
    }

    #[test]
    fn test_unknown_codes() {
        assert_eq!(ReplyCode::from_u8(0x02), None);
        assert_eq!(ReplyCode::from_u8(0x06), None);
        assert_eq!(ReplyCode::from_u8(0xff), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(ReplyCode::Timeout.to_string(), "timeout (0x04)");
        assert!(ReplyCode::Succeeded.is_success());
        assert!(!ReplyCode::WrongPassword.is_success());
    }
}
