//! Outbound connections to CONNECT targets.
//!
//! Targets are reached directly through the system resolver, or through
//! an upstream SOCKS5 proxy named by `ALL_PROXY` / `all_proxy`. Hosts and
//! networks listed in `NO_PROXY` / `no_proxy` bypass the upstream.

use crate::address::TargetAddr;
use crate::auth::UserPass;
use crate::error::{ProxyError, Result};
use crate::protocol::{AddressType, AuthMethod, Command, RSV, ReplyCode, USERPASS_VERSION, Version};
use ipnet::IpNet;
use percent_encoding::percent_decode_str;
use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

const DEFAULT_UPSTREAM_PORT: u16 = 1080;

/// Dialer decides how the outbound leg of a session is opened
#[derive(Clone, Debug, Default)]
pub enum Dialer {
    #[default]
    Direct,
    Upstream(UpstreamProxy),
}

/// Dialer implementation block
impl Dialer {
    /// from_env reads the proxy environment variables, upper case first
    pub fn from_env() -> Self {
        let all_proxy = env_var(&["ALL_PROXY", "all_proxy"]);
        let no_proxy = env_var(&["NO_PROXY", "no_proxy"]);
        Self::from_vars(all_proxy.as_deref(), no_proxy.as_deref())
    }

    /// from_vars builds a dialer from raw ALL_PROXY / NO_PROXY values.
    /// An unusable proxy URL is logged and ignored.
    pub fn from_vars(all_proxy: Option<&str>, no_proxy: Option<&str>) -> Self {
        let Some(raw) = all_proxy.map(str::trim).filter(|s| !s.is_empty()) else {
            return Dialer::Direct;
        };

        match UpstreamProxy::parse(raw) {
            Ok(proxy) => {
                let bypass = no_proxy.map(NoProxy::parse).unwrap_or_default();
                Dialer::Upstream(proxy.with_bypass(bypass))
            }
            Err(e) => {
                warn!(error = %e, "ignoring upstream proxy setting, dialing directly");
                Dialer::Direct
            }
        }
    }

    /// connect opens a stream to the target, bounded by the optional timeout
    pub async fn connect(
        &self,
        target: &TargetAddr,
        connect_timeout: Option<Duration>,
    ) -> Result<TcpStream> {
        let dial = async {
            match self {
                Dialer::Upstream(proxy) if !proxy.bypass.matches(target) => {
                    proxy.connect(target).await
                }
                _ => connect_direct(target).await,
            }
        };

        match connect_timeout {
            Some(limit) => timeout(limit, dial)
                .await
                .map_err(|_| ProxyError::Timeout("connect"))?,
            None => dial.await,
        }
    }
}

/// connect_direct resolves and connects with the system resolver
async fn connect_direct(target: &TargetAddr) -> Result<TcpStream> {
    let result = match target {
        TargetAddr::Ip(addr) => TcpStream::connect(*addr).await,
        TargetAddr::Domain(host, port) => {
            let addrs = resolve(host, *port).await?;
            TcpStream::connect(addrs.as_slice()).await
        }
    };

    result.map_err(|source| ProxyError::Dial {
        target: target.to_string(),
        source,
    })
}

/// resolve looks the host up, treating an empty answer as a failure
async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let resolve_err = |source: io::Error| ProxyError::Resolve {
        host: host.to_string(),
        source,
    };

    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(resolve_err)?
        .collect();
    if addrs.is_empty() {
        return Err(resolve_err(io::Error::new(
            io::ErrorKind::NotFound,
            "no addresses found",
        )));
    }
    Ok(addrs)
}

fn env_var(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| std::env::var(name).ok())
}

/// UpstreamProxy is a SOCKS5 proxy that outbound connections are chained through
#[derive(Clone, Debug)]
pub struct UpstreamProxy {
    pub addr: String,
    pub credentials: Option<UserPass>,
    pub bypass: NoProxy,
}

/// UpstreamProxy implementation block
impl UpstreamProxy {
    /// parse accepts socks5://[user:pass@]host[:port] (socks5h is treated the same,
    /// domain names are always forwarded unresolved). Percent-encoded
    /// userinfo is decoded before use.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)
            .map_err(|e| ProxyError::Config(format!("invalid proxy URL {raw:?}: {e}")))?;

        match url.scheme() {
            "socks5" | "socks5h" => {}
            other => {
                return Err(ProxyError::Config(format!(
                    "unsupported proxy scheme {other:?}"
                )));
            }
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::Config(format!("proxy URL {raw:?} has no host")))?;
        let port = url.port().unwrap_or(DEFAULT_UPSTREAM_PORT);

        let credentials = match (url.username(), url.password()) {
            ("", None) => None,
            (username, password) => Some(UserPass::new(
                decode_userinfo(username)?,
                decode_userinfo(password.unwrap_or_default())?,
            )?),
        };

        Ok(Self {
            addr: format!("{host}:{port}"),
            credentials,
            bypass: NoProxy::default(),
        })
    }

    pub fn with_bypass(mut self, bypass: NoProxy) -> Self {
        self.bypass = bypass;
        self
    }

    /// connect dials the upstream and asks it to CONNECT to the target
    pub async fn connect(&self, target: &TargetAddr) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| ProxyError::Dial {
                target: self.addr.clone(),
                source,
            })?;

        debug!(upstream = %self.addr, target = %target, "chaining through upstream proxy");
        self.handshake(&mut stream, target).await?;

        Ok(stream)
    }

    /// handshake runs the client side of the SOCKS5 exchange on an open stream
    pub async fn handshake<S>(&self, stream: &mut S, target: &TargetAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // Offer user/pass only when we have something to send
        let hello = match self.credentials {
            Some(_) => vec![
                Version::SOCKS5 as u8,
                2,
                AuthMethod::NoAuth as u8,
                AuthMethod::UserPass as u8,
            ],
            None => vec![Version::SOCKS5 as u8, 1, AuthMethod::NoAuth as u8],
        };
        stream.write_all(&hello).await?;

        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;
        if choice[0] != Version::SOCKS5 as u8 {
            return Err(self.failure(
                format!("replied with version {:#04x}", choice[0]),
                ReplyCode::ServerFailure,
            ));
        }

        match (choice[1], &self.credentials) {
            (m, _) if m == AuthMethod::NoAuth as u8 => {}
            (m, Some(creds)) if m == AuthMethod::UserPass as u8 => {
                self.authenticate(stream, creds).await?;
            }
            (m, _) => {
                return Err(self.failure(
                    format!("selected unusable auth method {m:#04x}"),
                    ReplyCode::ServerFailure,
                ));
            }
        }

        let mut request = vec![Version::SOCKS5 as u8, Command::Connect as u8, RSV];
        target.write_to(&mut request);
        stream.write_all(&request).await?;

        // Reply header: VER, REP, RSV, ATYP
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        if header[1] != ReplyCode::Succeeded as u8 {
            return Err(self.failure(
                format!("CONNECT to {target} rejected with {:#04x}", header[1]),
                ReplyCode::from_byte(header[1]),
            ));
        }

        // Drain BND.ADDR and BND.PORT
        let bound_len = match AddressType::from_byte(header[3]) {
            Some(AddressType::IPv4) => 4 + 2,
            Some(AddressType::IPv6) => 16 + 2,
            Some(AddressType::DomainName) => stream.read_u8().await? as usize + 2,
            None => {
                return Err(self.failure(
                    format!("replied with address type {:#04x}", header[3]),
                    ReplyCode::ServerFailure,
                ));
            }
        };
        let mut bound = vec![0u8; bound_len];
        stream.read_exact(&mut bound).await?;

        Ok(())
    }

    async fn authenticate<S>(&self, stream: &mut S, creds: &UserPass) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // +----+------+----------+------+----------+
        // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
        // +----+------+----------+------+----------+
        // | 1  |  1   | 1 to 255 |  1   | 0 to 255 |
        // +----+------+----------+------+----------+
        let mut frame = vec![USERPASS_VERSION];
        for field in [&creds.username, &creds.password] {
            let len = u8::try_from(field.len()).map_err(|_| {
                ProxyError::Config("upstream credentials exceed 255 bytes".to_string())
            })?;
            frame.push(len);
            frame.extend_from_slice(field.as_bytes());
        }
        stream.write_all(&frame).await?;

        let mut status = [0u8; 2];
        stream.read_exact(&mut status).await?;
        if status[1] != 0x00 {
            return Err(self.failure(
                "rejected our credentials".to_string(),
                ReplyCode::ServerFailure,
            ));
        }
        Ok(())
    }

    fn failure(&self, reason: String, reply: ReplyCode) -> ProxyError {
        ProxyError::Upstream {
            proxy: self.addr.clone(),
            reason,
            reply,
        }
    }
}

/// decode_userinfo undoes the percent-encoding of a URL username or password
fn decode_userinfo(raw: &str) -> Result<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|e| ProxyError::Config(format!("proxy URL credentials are not UTF-8: {e}")))
}

/// NoProxy is the parsed NO_PROXY list
#[derive(Clone, Debug, Default)]
pub struct NoProxy {
    all: bool,
    ips: HashSet<IpAddr>,
    networks: Vec<IpNet>,
    domains: Vec<String>,
}

/// NoProxy implementation block
impl NoProxy {
    /// parse reads a comma separated list of `*`, IP literals, CIDR blocks
    /// and host names. A host name also covers its subdomains; leading `*.`
    /// or `.` is dropped.
    pub fn parse(raw: &str) -> Self {
        let mut no_proxy = NoProxy::default();

        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if entry == "*" {
                no_proxy.all = true;
                continue;
            }

            let unbracketed = entry.trim_start_matches('[').trim_end_matches(']');
            if let Ok(ip) = unbracketed.parse::<IpAddr>() {
                no_proxy.ips.insert(ip);
                continue;
            }
            if let Ok(net) = entry.parse::<IpNet>() {
                no_proxy.networks.push(net);
                continue;
            }

            let domain = entry
                .trim_start_matches("*.")
                .trim_start_matches('.')
                .trim_end_matches('.')
                .to_ascii_lowercase();
            if !domain.is_empty() {
                no_proxy.domains.push(domain);
            }
        }

        no_proxy
    }

    /// matches reports whether the target should be dialed directly
    pub fn matches(&self, target: &TargetAddr) -> bool {
        if self.all {
            return true;
        }

        match target {
            TargetAddr::Ip(addr) => self.matches_ip(addr.ip()),
            TargetAddr::Domain(host, _) => {
                if let Ok(ip) = host.parse::<IpAddr>() {
                    return self.matches_ip(ip);
                }
                let host = host.trim_end_matches('.').to_ascii_lowercase();
                self.domains.iter().any(|domain| {
                    host == *domain
                        || (host.len() > domain.len()
                            && host.ends_with(domain.as_str())
                            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
                })
            }
        }
    }

    fn matches_ip(&self, ip: IpAddr) -> bool {
        self.ips.contains(&ip) || self.networks.iter().any(|net| net.contains(&ip))
    }
}
