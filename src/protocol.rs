// RSV: Fields marked RESERVED (RSV) must be set to X'00'.
pub const RSV: u8 = 0x00;

/// Version byte of the username/password sub-negotiation (RFC 1929)
pub const USERPASS_VERSION: u8 = 0x01;

/// Version represents available SOCKS proxy versions
/// I included this for readability and clarity, but this
/// implementation only supports SOCKS5
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Version {
    SOCKS5 = 0x05,
}

/// AuthMethod represents the SOCKS5 authentication methods this
/// server knows how to negotiate
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AuthMethod {
    NoAuth = 0x00,
    // Gssapi = 0x01, not supported
    UserPass = 0x02,
    // 0x03 - 0x7f: IANA reserved
    // 0x80 - 0xFE: private methods
    NoAcceptable = 0xFF,
}

/// AuthStatus is the RFC 1929 sub-negotiation result
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AuthStatus {
    Success = 0x00,
    Failure = 0x01,
}

/// Command represents SOCKS5 protocol commands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

/// Command implementation block
impl Command {
    /// from_byte converts a byte to its related SOCKS5 protocol command
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Command::Connect),
            0x02 => Some(Command::Bind),
            0x03 => Some(Command::UdpAssociate),
            _ => None,
        }
    }
}

/// AddressType represents the SOCKS5 address types:
/// IPv4, Domain Name, IPv6
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AddressType {
    IPv4 = 0x01,
    DomainName = 0x03,
    IPv6 = 0x04,
}

/// AddressType implementation block
impl AddressType {
    /// from_byte converts a byte to its related network address type
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(AddressType::IPv4),
            0x03 => Some(AddressType::DomainName),
            0x04 => Some(AddressType::IPv6),
            _ => None,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplyCode {
    Succeeded = 0x00,
    ServerFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddrTypeUnsupported = 0x08,
    // 0x09 - 0xFF: unassigned
}

/// ReplyCode implementation block
impl ReplyCode {
    /// from_byte maps a reply byte received from an upstream proxy,
    /// folding unassigned values into ServerFailure
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => ReplyCode::Succeeded,
            0x02 => ReplyCode::ConnectionNotAllowed,
            0x03 => ReplyCode::NetworkUnreachable,
            0x04 => ReplyCode::HostUnreachable,
            0x05 => ReplyCode::ConnectionRefused,
            0x06 => ReplyCode::TtlExpired,
            0x07 => ReplyCode::CommandNotSupported,
            0x08 => ReplyCode::AddrTypeUnsupported,
            _ => ReplyCode::ServerFailure,
        }
    }
}

/// Length of every reply this server sends
pub const REPLY_LEN: usize = 10;

/// reply_bytes builds a SOCKS5 reply carrying the given code
///
/// The bound address is always reported as 0.0.0.0:0; CONNECT clients
/// do not act on it.
pub fn reply_bytes(reply_code: ReplyCode) -> [u8; REPLY_LEN] {
    // SOCKS5 reply format
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    [
        Version::SOCKS5 as u8,
        reply_code as u8,
        RSV,
        AddressType::IPv4 as u8,
        0,
        0,
        0,
        0,
        0,
        0,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_reply_is_fixed_placeholder() {
        assert_eq!(
            reply_bytes(ReplyCode::Succeeded),
            [0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn failure_reply_carries_code() {
        let reply = reply_bytes(ReplyCode::ConnectionRefused);
        assert_eq!(reply[1], 0x05);
        assert_eq!(&reply[2..], &[0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn unassigned_upstream_codes_become_server_failure() {
        assert_eq!(ReplyCode::from_byte(0x04), ReplyCode::HostUnreachable);
        assert_eq!(ReplyCode::from_byte(0x01), ReplyCode::ServerFailure);
        assert_eq!(ReplyCode::from_byte(0x42), ReplyCode::ServerFailure);
    }
}
