//! Host bridge link capability.
//!
//! Bridge scopes need their gateway address present on the host's bridge
//! interface. Address management on that interface is an injected capability so
//! the core stays independent of the platform netlink surface. `MockBridgeLink`
//! records the address set for tests.

use crate::error::{NetworkError, Result};
use ipnet::Ipv4Net;
use std::sync::Mutex;

/// Address management on the host bridge interface.
///
/// `addr_add` reports an already-present address as [`NetworkError::AddrExists`]
/// and `addr_del` reports a missing one as [`NetworkError::AddrNotPresent`];
/// the context tolerates both.
pub trait BridgeLink: Send + Sync {
    /// Add an address to the bridge interface.
    fn addr_add(&self, addr: Ipv4Net) -> Result<()>;

    /// Remove an address from the bridge interface.
    fn addr_del(&self, addr: Ipv4Net) -> Result<()>;

    /// Interface name, for diagnostics.
    fn name(&self) -> &str;
}

/// Bridge link backed by an in-memory address list.
#[derive(Debug)]
pub struct MockBridgeLink {
    name: String,
    addrs: Mutex<Vec<Ipv4Net>>,
}

impl MockBridgeLink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), addrs: Mutex::new(Vec::new()) }
    }

    /// Current address set, for assertions.
    pub fn addresses(&self) -> Vec<Ipv4Net> {
        self.addrs.lock().unwrap().clone()
    }
}

impl Default for MockBridgeLink {
    fn default() -> Self {
        Self::new("vbr0")
    }
}

impl BridgeLink for MockBridgeLink {
    fn addr_add(&self, addr: Ipv4Net) -> Result<()> {
        let mut addrs = self.addrs.lock().unwrap();
        if addrs.contains(&addr) {
            return Err(NetworkError::AddrExists { addr });
        }
        addrs.push(addr);
        Ok(())
    }

    fn addr_del(&self, addr: Ipv4Net) -> Result<()> {
        let mut addrs = self.addrs.lock().unwrap();
        match addrs.iter().position(|a| *a == addr) {
            Some(i) => {
                addrs.remove(i);
                Ok(())
            }
            None => Err(NetworkError::AddrNotPresent { addr }),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
