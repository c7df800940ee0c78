use crate::error::{ProxyError, Result};
use std::collections::HashSet;
use std::net::IpAddr;

/// AllowList holds the source addresses permitted to connect
#[derive(Clone, Debug, Default)]
pub struct AllowList {
    addrs: HashSet<IpAddr>,
}

/// AllowList implementation block
impl AllowList {
    pub fn new(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            addrs: addrs.into_iter().map(|ip| ip.to_canonical()).collect(),
        }
    }

    /// parse builds the list from string-formatted addresses
    pub fn parse<I, S>(addrs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let addrs = addrs
            .into_iter()
            .map(|s| {
                let s = s.as_ref().trim();
                s.parse::<IpAddr>()
                    .map_err(|_| ProxyError::Config(format!("invalid allow-list address {s:?}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(addrs))
    }

    /// is_allowed compares IPv4-mapped IPv6 peers in their IPv4 form
    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        self.addrs.contains(&ip.to_canonical())
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}
