//! Error types for the proxy.

use std::io;
use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

use crate::protocol::ReplyCode;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors raised while binding, negotiating, dialing or relaying.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Listener could not be bound
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Peer address is not on the allow-list
    #[error("source address {0} is not allowed")]
    NotAllowed(IpAddr),

    /// Version byte was not 0x05
    #[error("unsupported SOCKS version: {0:#04x}")]
    UnsupportedVersion(u8),

    /// Client did not offer the method the server requires
    #[error("no acceptable authentication method offered")]
    NoAcceptableMethod,

    /// Username/password sub-negotiation version was not 0x01
    #[error("invalid username/password sub-negotiation version: {0:#04x}")]
    AuthVersion(u8),

    /// Credentials did not match
    #[error("authentication failed for user {0:?}")]
    AuthFailed(String),

    /// Frame ended before its declared lengths were satisfied
    #[error("truncated {frame}: need {needed} bytes, got {actual}")]
    Truncated {
        frame: &'static str,
        needed: usize,
        actual: usize,
    },

    /// Domain name was empty or not valid UTF-8
    #[error("invalid domain name in request")]
    InvalidDomain,

    #[error("unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    /// Target host name did not resolve to any address
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    /// Outbound connection to the target failed
    #[error("failed to connect to {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Upstream proxy refused or broke the CONNECT
    #[error("upstream proxy {proxy}: {reason}")]
    Upstream {
        proxy: String,
        reason: String,
        reply: ReplyCode,
    },

    /// A deadline expired
    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// reply_code picks the SOCKS5 reply sent to the client when a
    /// CONNECT fails with this error
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            ProxyError::Dial { source, .. } => match source.kind() {
                io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
                io::ErrorKind::HostUnreachable => ReplyCode::HostUnreachable,
                io::ErrorKind::NetworkUnreachable => ReplyCode::NetworkUnreachable,
                io::ErrorKind::PermissionDenied => ReplyCode::ConnectionNotAllowed,
                io::ErrorKind::TimedOut => ReplyCode::HostUnreachable,
                _ => ReplyCode::ServerFailure,
            },
            ProxyError::Resolve { .. } => ReplyCode::HostUnreachable,
            ProxyError::Upstream { reply, .. } => *reply,
            ProxyError::Timeout(_) => ReplyCode::HostUnreachable,
            ProxyError::NotAllowed(_) => ReplyCode::ConnectionNotAllowed,
            ProxyError::UnsupportedCommand(_) => ReplyCode::CommandNotSupported,
            ProxyError::UnsupportedAddressType(_) => ReplyCode::AddrTypeUnsupported,
            _ => ReplyCode::ServerFailure,
        }
    }

    /// is_eof reports whether the peer simply went away mid-frame
    pub fn is_eof(&self) -> bool {
        matches!(self, ProxyError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dial_err(kind: io::ErrorKind) -> ProxyError {
        ProxyError::Dial {
            target: "127.0.0.1:9".into(),
            source: io::Error::from(kind),
        }
    }

    #[test]
    fn dial_errors_map_to_reply_codes() {
        assert_eq!(
            dial_err(io::ErrorKind::ConnectionRefused).reply_code(),
            ReplyCode::ConnectionRefused
        );
        assert_eq!(
            dial_err(io::ErrorKind::NetworkUnreachable).reply_code(),
            ReplyCode::NetworkUnreachable
        );
        assert_eq!(
            dial_err(io::ErrorKind::PermissionDenied).reply_code(),
            ReplyCode::ConnectionNotAllowed
        );
        assert_eq!(
            dial_err(io::ErrorKind::Other).reply_code(),
            ReplyCode::ServerFailure
        );
    }

    #[test]
    fn unresolved_host_is_unreachable() {
        let err = ProxyError::Resolve {
            host: "nowhere.invalid".into(),
            source: io::Error::other("failed to lookup address information"),
        };
        assert_eq!(err.reply_code(), ReplyCode::HostUnreachable);
    }

    #[test]
    fn upstream_reply_is_forwarded() {
        let err = ProxyError::Upstream {
            proxy: "10.0.0.2:1080".into(),
            reason: "CONNECT rejected".into(),
            reply: ReplyCode::TtlExpired,
        };
        assert_eq!(err.reply_code(), ReplyCode::TtlExpired);
    }

    #[test]
    fn request_rejections_have_distinct_codes() {
        assert_eq!(
            ProxyError::UnsupportedCommand(0x02).reply_code(),
            ReplyCode::CommandNotSupported
        );
        assert_eq!(
            ProxyError::UnsupportedAddressType(0x05).reply_code(),
            ReplyCode::AddrTypeUnsupported
        );
    }
}
