//! Context configuration.
//!
//! The configuration declares the bridge address pool, the container networks
//! known at startup, the port groups backing them, and the injected host
//! capabilities. Validation happens when the context is constructed.

use crate::bridge::BridgeLink;
use crate::device::{Hypervisor, PortGroup};
use crate::ip::PoolEntry;
use crate::scope::{ScopeType, TrustLevel};
use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// CIDR the bridge subnets are carved from when none is configured.
pub const DEFAULT_BRIDGE_RANGE: &str = "172.16.0.0/12";

/// Prefix length of auto-allocated bridge subnets when none is configured.
pub const DEFAULT_BRIDGE_WIDTH: u8 = 16;

/// Name of the default bridge scope.
pub const DEFAULT_BRIDGE_NAME: &str = "bridge";

/// A container network declared in configuration. Each entry becomes a builtin
/// scope at context construction.
#[derive(Debug, Clone)]
pub struct ContainerNetwork {
    pub name: String,
    pub scope_type: ScopeType,
    /// Gateway address with the network's prefix; the subnet is derived from it.
    pub gateway: Option<Ipv4Net>,
    pub nameservers: Vec<Ipv4Addr>,
    pub trust_level: TrustLevel,
    pub pools: Vec<PoolEntry>,
}

impl ContainerNetwork {
    pub fn new(name: impl Into<String>, scope_type: ScopeType) -> Self {
        Self {
            name: name.into(),
            scope_type,
            gateway: None,
            nameservers: Vec::new(),
            trust_level: TrustLevel::Unspecified,
            pools: Vec::new(),
        }
    }
}

/// Everything the context needs to come up.
#[derive(Clone)]
pub struct Configuration {
    /// CIDR from which bridge subnets are carved. Defaults to
    /// [`DEFAULT_BRIDGE_RANGE`] when unset.
    pub bridge_ip_range: Option<Ipv4Net>,

    /// Prefix used for auto-allocated bridge subnets. Defaults to
    /// [`DEFAULT_BRIDGE_WIDTH`] when unset.
    pub bridge_network_width: Option<u8>,

    /// Name of the default bridge entry; must exist in `container_networks`.
    pub bridge_network: String,

    /// Container networks declared at startup, by name.
    pub container_networks: HashMap<String, ContainerNetwork>,

    /// Backing port groups, by name.
    pub port_groups: HashMap<String, PortGroup>,

    /// Host bridge device capability.
    pub bridge_link: Arc<dyn BridgeLink>,

    /// Hypervisor client capability.
    pub hypervisor: Arc<dyn Hypervisor>,
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("bridge_ip_range", &self.bridge_ip_range)
            .field("bridge_network_width", &self.bridge_network_width)
            .field("bridge_network", &self.bridge_network)
            .field("container_networks", &self.container_networks)
            .field("port_groups", &self.port_groups)
            .field("bridge_link", &self.bridge_link.name())
            .finish_non_exhaustive()
    }
}
