use crate::access::AllowList;
use crate::auth::{AuthMode, Credentials};
use crate::dial::Dialer;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default deadline for method negotiation plus the request
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for opening the outbound connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// ServerConfig is everything a Socks5Server needs; it is fixed once the
/// server is constructed
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_ip: IpAddr,
    pub port: u16,
    pub auth: AuthMode,
    pub allow_list: Option<AllowList>,
    pub dialer: Dialer,
    pub handshake_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub max_connections: Option<usize>,
}

/// ServerConfig implementation block
impl ServerConfig {
    /// new binds to loopback on the given port with no auth, no allow-list
    /// and direct dialing
    pub fn new(port: u16) -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            auth: AuthMode::None,
            allow_list: None,
            dialer: Dialer::Direct,
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            max_connections: None,
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }

    pub fn with_bind_ip(mut self, bind_ip: IpAddr) -> Self {
        self.bind_ip = bind_ip;
        self
    }

    /// with_credentials switches to username/password auth; an empty set
    /// leaves the server in no-auth mode
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.auth = if credentials.is_empty() {
            AuthMode::None
        } else {
            AuthMode::UsernamePassword(credentials)
        };
        self
    }

    /// with_allow_list enables source filtering; an empty list disables it
    pub fn with_allow_list(mut self, allow_list: AllowList) -> Self {
        self.allow_list = (!allow_list.is_empty()).then_some(allow_list);
        self
    }

    pub fn with_dialer(mut self, dialer: Dialer) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn with_handshake_timeout(mut self, limit: Option<Duration>) -> Self {
        self.handshake_timeout = limit;
        self
    }

    pub fn with_connect_timeout(mut self, limit: Option<Duration>) -> Self {
        self.connect_timeout = limit;
        self
    }

    pub fn with_max_connections(mut self, max: Option<usize>) -> Self {
        self.max_connections = max.filter(|&n| n > 0);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserPass;

    #[test]
    fn defaults_are_loopback_no_auth() {
        let config = ServerConfig::new(1080);
        assert_eq!(config.bind_addr().to_string(), "127.0.0.1:1080");
        assert!(matches!(config.auth, AuthMode::None));
        assert!(config.allow_list.is_none());
        assert!(config.max_connections.is_none());
    }

    #[test]
    fn empty_sets_leave_features_off() {
        let config = ServerConfig::new(1080)
            .with_credentials(Credentials::default())
            .with_allow_list(AllowList::default())
            .with_max_connections(Some(0));
        assert!(matches!(config.auth, AuthMode::None));
        assert!(config.allow_list.is_none());
        assert!(config.max_connections.is_none());
    }

    #[test]
    fn credentials_enable_userpass() {
        let creds = Credentials::from_entries([UserPass {
            username: "user1".into(),
            password: "password123".into(),
        }])
        .unwrap();
        let config = ServerConfig::new(1080)
            .with_bind_ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            .with_credentials(creds);
        assert!(matches!(config.auth, AuthMode::UsernamePassword(_)));
        assert_eq!(config.bind_addr().to_string(), "0.0.0.0:1080");
    }
}
