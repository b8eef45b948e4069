//! IPv4 helpers shared by the IPAM and scope layers.
//!
//! Pools are declared as either a CIDR block or an inclusive address range; the
//! same textual forms are used in configuration and in the persisted scope record.

use crate::error::{NetworkError, Result};
use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// A declared address pool: a CIDR block or an inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEntry {
    Cidr(Ipv4Net),
    Range(Ipv4Addr, Ipv4Addr),
}

impl PoolEntry {
    /// First address covered by the pool.
    pub fn first(&self) -> Ipv4Addr {
        match self {
            PoolEntry::Cidr(net) => net.network(),
            PoolEntry::Range(first, _) => *first,
        }
    }

    /// Last address covered by the pool.
    pub fn last(&self) -> Ipv4Addr {
        match self {
            PoolEntry::Cidr(net) => net.broadcast(),
            PoolEntry::Range(_, last) => *last,
        }
    }
}

impl fmt::Display for PoolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolEntry::Cidr(net) => write!(f, "{}", net),
            PoolEntry::Range(first, last) => write!(f, "{}-{}", first, last),
        }
    }
}

impl FromStr for PoolEntry {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some((first, last)) = s.split_once('-') {
            let first: Ipv4Addr =
                first.parse().map_err(|_| NetworkError::InvalidPool { pool: s.to_string() })?;
            let last: Ipv4Addr =
                last.parse().map_err(|_| NetworkError::InvalidPool { pool: s.to_string() })?;
            if first > last {
                return Err(NetworkError::InvalidPool { pool: s.to_string() });
            }
            return Ok(PoolEntry::Range(first, last));
        }

        let net: Ipv4Net =
            s.parse().map_err(|_| NetworkError::InvalidPool { pool: s.to_string() })?;
        Ok(PoolEntry::Cidr(net.trunc()))
    }
}

/// True when `ip` is a usable host address on `subnet`: inside the subnet and
/// neither the all-zeros nor the all-ones address.
pub fn is_routable(ip: Ipv4Addr, subnet: Ipv4Net) -> bool {
    subnet.contains(&ip) && ip != subnet.network() && ip != subnet.broadcast()
}

/// True when the two subnets share any address.
pub fn overlaps(a: Ipv4Net, b: Ipv4Net) -> bool {
    a.contains(&b.network()) || a.contains(&b.broadcast()) || b.contains(&a.network())
}
