//! IPv4 address space allocator.
//!
//! An `AddressSpace` covers either a subnet or an inclusive address range and
//! tracks reservations as an ordered set of free intervals: reserving splits an
//! interval, releasing merges neighbors back together. Allocation always hands
//! out the lowest free address, and whole sub-nets or sub-ranges can be carved
//! out as child spaces and later returned in one piece.

use crate::error::{NetworkError, Result};
use crate::ip::PoolEntry;
use ipnet::Ipv4Net;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// An allocatable IPv4 address space.
#[derive(Debug, Clone)]
pub struct AddressSpace {
    network: Option<Ipv4Net>,
    first: u32,
    last: u32,
    /// Free intervals, keyed by start, value is the inclusive end.
    /// Intervals are disjoint and never adjacent.
    free: BTreeMap<u32, u32>,
}

impl AddressSpace {
    /// Allocator over a subnet. The all-zeros and all-ones addresses are part of
    /// the space; the context reserves them explicitly when provisioning a scope.
    pub fn from_network(net: Ipv4Net) -> Self {
        let net = net.trunc();
        let first = u32::from(net.network());
        let last = u32::from(net.broadcast());
        let mut free = BTreeMap::new();
        free.insert(first, last);
        Self { network: Some(net), first, last, free }
    }

    /// Allocator over the inclusive range `[first, last]`.
    pub fn from_range(first: Ipv4Addr, last: Ipv4Addr) -> Self {
        let (first, last) = (u32::from(first), u32::from(last));
        let (first, last) = if first <= last { (first, last) } else { (last, first) };
        let mut free = BTreeMap::new();
        free.insert(first, last);
        Self { network: None, first, last, free }
    }

    /// Allocator over a declared pool entry.
    pub fn from_pool_entry(entry: &PoolEntry) -> Self {
        match entry {
            PoolEntry::Cidr(net) => Self::from_network(*net),
            PoolEntry::Range(first, last) => Self::from_range(*first, *last),
        }
    }

    /// The subnet this space was built from, if any.
    pub fn network(&self) -> Option<Ipv4Net> {
        self.network
    }

    /// First address of the space.
    pub fn first_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.first)
    }

    /// Last address of the space.
    pub fn last_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.last)
    }

    /// The declared-pool form of this space: CIDR if built from a subnet, range
    /// otherwise.
    pub fn pool_entry(&self) -> PoolEntry {
        match self.network {
            Some(net) => PoolEntry::Cidr(net),
            None => PoolEntry::Range(self.first_ip(), self.last_ip()),
        }
    }

    /// True when `ip` falls within the bounds of the space.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        ip >= self.first && ip <= self.last
    }

    /// Number of reserved addresses.
    pub fn reserved_count(&self) -> u64 {
        let total = u64::from(self.last - self.first) + 1;
        let free: u64 = self.free.iter().map(|(s, e)| u64::from(e - s) + 1).sum();
        total - free
    }

    /// Reserve a specific address.
    pub fn reserve_ip4(&mut self, ip: Ipv4Addr) -> Result<()> {
        let u = u32::from(ip);
        if u < self.first || u > self.last {
            return Err(NetworkError::AddressOutOfRange { ip });
        }

        let (&start, &end) = match self.free.range(..=u).next_back() {
            Some(iv) if *iv.1 >= u => iv,
            _ => return Err(NetworkError::AddressInUse { ip }),
        };

        self.free.remove(&start);
        if start < u {
            self.free.insert(start, u - 1);
        }
        if u < end {
            self.free.insert(u + 1, end);
        }
        Ok(())
    }

    /// Reserve the lowest free address.
    pub fn reserve_next_ip4(&mut self) -> Result<Ipv4Addr> {
        let (&start, &end) = self.free.iter().next().ok_or(NetworkError::PoolExhausted)?;
        self.free.remove(&start);
        if start < end {
            self.free.insert(start + 1, end);
        }
        Ok(Ipv4Addr::from(start))
    }

    /// Release a previously reserved address.
    pub fn release_ip4(&mut self, ip: Ipv4Addr) -> Result<()> {
        let u = u32::from(ip);
        if u < self.first || u > self.last {
            return Err(NetworkError::AddressOutOfRange { ip });
        }
        if let Some((_, &end)) = self.free.range(..=u).next_back() {
            if end >= u {
                return Err(NetworkError::AddressNotReserved { ip });
            }
        }
        self.insert_free(u, u);
        Ok(())
    }

    /// Carve a whole subnet out of the space, returning it as a child space.
    /// Fails unless the entire span of `net` is currently free.
    pub fn reserve_ip4_net(&mut self, net: Ipv4Net) -> Result<AddressSpace> {
        let net = net.trunc();
        self.reserve_span(u32::from(net.network()), u32::from(net.broadcast()))?;
        Ok(Self::from_network(net))
    }

    /// Carve an inclusive range out of the space, returning it as a child space.
    pub fn reserve_ip4_range(&mut self, first: Ipv4Addr, last: Ipv4Addr) -> Result<AddressSpace> {
        let (s, e) = (u32::from(first), u32::from(last));
        if s > e {
            return Err(NetworkError::RangeUnavailable { first, last });
        }
        self.reserve_span(s, e)?;
        Ok(Self::from_range(first, last))
    }

    /// Return a carved child space to this space in one piece.
    pub fn release_ip4_range(&mut self, child: &AddressSpace) -> Result<()> {
        self.release_range(child.first_ip(), child.last_ip())
    }

    /// Return an inclusive range to this space. The whole span must currently be
    /// reserved.
    pub fn release_range(&mut self, first: Ipv4Addr, last: Ipv4Addr) -> Result<()> {
        let (s, e) = (u32::from(first), u32::from(last));
        if s > e || s < self.first || e > self.last {
            return Err(NetworkError::RangeUnavailable { first, last });
        }
        if let Some((_, &end)) = self.free.range(..=e).next_back() {
            if end >= s {
                return Err(NetworkError::AddressNotReserved { ip: first });
            }
        }
        self.insert_free(s, e);
        Ok(())
    }

    /// Find the lowest free, aligned subnet of the given prefix length. The
    /// subnet is not reserved; carve it with [`reserve_ip4_net`](Self::reserve_ip4_net).
    pub fn next_ip4_net(&self, prefix: u8) -> Result<Ipv4Net> {
        if prefix > 32 {
            return Err(NetworkError::InvalidConfig {
                reason: format!("invalid prefix length /{}", prefix),
            });
        }
        let size: u64 = 1u64 << (32 - prefix);

        for (&start, &end) in &self.free {
            let aligned = (u64::from(start) + size - 1) / size * size;
            if aligned + size - 1 <= u64::from(end) {
                let ip = Ipv4Addr::from(aligned as u32);
                return Ok(Ipv4Net::new(ip, prefix).map_err(NetworkError::internal)?);
            }
        }

        Err(NetworkError::PoolExhausted)
    }

    /// Reserve the span `[s, e]`, which must lie inside a single free interval.
    fn reserve_span(&mut self, s: u32, e: u32) -> Result<()> {
        let err = || NetworkError::RangeUnavailable {
            first: Ipv4Addr::from(s),
            last: Ipv4Addr::from(e),
        };
        if s < self.first || e > self.last {
            return Err(err());
        }

        let (&start, &end) = match self.free.range(..=s).next_back() {
            Some(iv) if *iv.1 >= e => iv,
            _ => return Err(err()),
        };

        self.free.remove(&start);
        if start < s {
            self.free.insert(start, s - 1);
        }
        if e < end {
            self.free.insert(e + 1, end);
        }
        Ok(())
    }

    /// Insert `[s, e]` as free, coalescing with adjacent intervals.
    fn insert_free(&mut self, mut s: u32, mut e: u32) {
        if s > self.first {
            if let Some((&pstart, &pend)) = self.free.range(..s).next_back() {
                if pend + 1 == s {
                    self.free.remove(&pstart);
                    s = pstart;
                }
            }
        }
        if e < self.last {
            if let Some((&nstart, &nend)) = self.free.range(e + 1..).next() {
                if nstart == e + 1 {
                    self.free.remove(&nstart);
                    e = nend;
                }
            }
        }
        self.free.insert(s, e);
    }
}
