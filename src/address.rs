use crate::error::{ProxyError, Result};
use crate::protocol::{AddressType, Command, Version};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Fixed request prefix: VER, CMD, RSV, ATYP
const REQUEST_HEADER_LEN: usize = 4;

/// TargetAddr is the destination a client asked us to CONNECT to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

/// TargetAddr implementation block
impl TargetAddr {
    /// host returns the host part without the port; IPv6 hosts are not bracketed
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(addr) => addr.ip().to_string(),
            TargetAddr::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// write_to appends the ATYP, DST.ADDR and DST.PORT fields for this
    /// target, as used in an outgoing SOCKS5 request
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                buf.push(AddressType::IPv4 as u8);
                buf.extend_from_slice(&addr.ip().octets());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                buf.push(AddressType::IPv6 as u8);
                buf.extend_from_slice(&addr.ip().octets());
            }
            TargetAddr::Domain(domain, _) => {
                buf.push(AddressType::DomainName as u8);
                // The one-octet length prefix caps parsed domains at 255 bytes
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port().to_be_bytes());
    }
}

/// Renders as host:port, bracketing IPv6 hosts so the port stays unambiguous
impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{addr}"),
            TargetAddr::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

/// read_request reads exactly one SOCKS5 request frame from the stream and
/// parses it into the CONNECT target
///
/// A request with a known address type is read in full even when its
/// command is refused.
pub async fn read_request<S>(stream: &mut S) -> Result<TargetAddr>
where
    S: AsyncRead + Unpin,
{
    // SOCKS5 request format
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let mut frame = vec![0u8; REQUEST_HEADER_LEN];
    stream.read_exact(&mut frame).await?;

    // Ensure version is 0x05 -> SOCKS5
    if frame[0] != Version::SOCKS5 as u8 {
        return Err(ProxyError::UnsupportedVersion(frame[0]));
    }

    // Without a known address type the frame length is unknowable
    let Some(addr_type) = AddressType::from_byte(frame[3]) else {
        check_header(&frame)?;
        return Err(ProxyError::UnsupportedAddressType(frame[3]));
    };

    // Remaining length depends on the address type
    let remaining = match addr_type {
        AddressType::IPv4 => 4 + 2,
        AddressType::IPv6 => 16 + 2,
        AddressType::DomainName => {
            // First octet in DomainName contains the number of
            // octets to follow
            let len = stream.read_u8().await?;
            frame.push(len);
            len as usize + 2
        }
    };

    let start = frame.len();
    frame.resize(start + remaining, 0);
    stream.read_exact(&mut frame[start..]).await?;

    parse_request(&frame)
}

/// parse_request parses a complete SOCKS5 request held in a byte slice
///
/// Every declared length is checked against the slice before it is
/// indexed, so short input yields ProxyError::Truncated.
pub fn parse_request(data: &[u8]) -> Result<TargetAddr> {
    if data.len() < REQUEST_HEADER_LEN {
        return Err(ProxyError::Truncated {
            frame: "request header",
            needed: REQUEST_HEADER_LEN,
            actual: data.len(),
        });
    }

    check_header(data)?;

    let mut offset = REQUEST_HEADER_LEN;
    match AddressType::from_byte(data[3]) {
        Some(AddressType::IPv4) => parse_ipv4_address(data, &mut offset),
        Some(AddressType::DomainName) => parse_domain_address(data, &mut offset),
        Some(AddressType::IPv6) => parse_ipv6_address(data, &mut offset),
        None => Err(ProxyError::UnsupportedAddressType(data[3])),
    }
}

/// check_header validates VER and CMD; RSV is ignored
fn check_header(header: &[u8]) -> Result<()> {
    let version = header[0];
    let command = header[1];

    // Ensure version is 0x05 -> SOCKS5
    if version != Version::SOCKS5 as u8 {
        return Err(ProxyError::UnsupportedVersion(version));
    }

    // Only CONNECT is served
    match Command::from_byte(command) {
        Some(Command::Connect) => Ok(()),
        _ => Err(ProxyError::UnsupportedCommand(command)),
    }
}

/// parse_ipv4_address parses an IPv4 address and port from a byte slice
pub fn parse_ipv4_address(data: &[u8], offset: &mut usize) -> Result<TargetAddr> {
    let bytes = take(data, offset, 4 + 2, "IPv4 address")?;

    let ip_bytes: [u8; 4] = [bytes[0], bytes[1], bytes[2], bytes[3]];
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);

    Ok(TargetAddr::Ip(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::from(ip_bytes)),
        port,
    )))
}

/// parse_ipv6_address parses an IPv6 address and port from a byte slice
pub fn parse_ipv6_address(data: &[u8], offset: &mut usize) -> Result<TargetAddr> {
    let bytes = take(data, offset, 16 + 2, "IPv6 address")?;

    let mut ip_bytes = [0u8; 16];
    ip_bytes.copy_from_slice(&bytes[..16]);
    let port = u16::from_be_bytes([bytes[16], bytes[17]]);

    Ok(TargetAddr::Ip(SocketAddr::new(
        IpAddr::V6(Ipv6Addr::from(ip_bytes)),
        port,
    )))
}

/// parse_domain_address parses a length-prefixed domain and port from a byte slice
pub fn parse_domain_address(data: &[u8], offset: &mut usize) -> Result<TargetAddr> {
    let domain_len = take(data, offset, 1, "domain length")?[0] as usize;

    // Any non-empty length fits on the wire; names the resolver cannot
    // handle fail at dial time
    if domain_len == 0 {
        return Err(ProxyError::InvalidDomain);
    }

    let bytes = take(data, offset, domain_len + 2, "domain name")?;

    let domain = std::str::from_utf8(&bytes[..domain_len])
        .map_err(|_| ProxyError::InvalidDomain)?
        .to_string();
    let port = u16::from_be_bytes([bytes[domain_len], bytes[domain_len + 1]]);

    Ok(TargetAddr::Domain(domain, port))
}

/// take returns the next `len` bytes and advances the offset, or a
/// Truncated error when the slice is too short
fn take<'a>(
    data: &'a [u8],
    offset: &mut usize,
    len: usize,
    frame: &'static str,
) -> Result<&'a [u8]> {
    let start = *offset;
    let end = start + len;
    if end > data.len() {
        return Err(ProxyError::Truncated {
            frame,
            needed: len,
            actual: data.len().saturating_sub(start),
        });
    }
    *offset = end;
    Ok(&data[start..end])
}
