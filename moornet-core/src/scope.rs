//! Network scopes: named logical networks with their own IPAM.
//!
//! A scope is either a bridge network (subnet carved from the shared bridge
//! pool, gateway held on the host bridge link) or an external network backed
//! directly by a port group. An external scope with no subnet is dynamic: its
//! address management happens outside the context, e.g. via DHCP.

use crate::address_space::AddressSpace;
use crate::container::Container;
use crate::device::PortGroup;
use crate::endpoint::{Alias, Endpoint};
use crate::error::{NetworkError, Result};
use crate::ip::PoolEntry;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

/// The two kinds of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    Bridge,
    External,
}

impl fmt::Display for ScopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeType::Bridge => write!(f, "bridge"),
            ScopeType::External => write!(f, "external"),
        }
    }
}

/// Per-scope policy tag controlling which container ports may be published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Open,
    Peers,
    Published,
    Outbound,
    Closed,
    #[default]
    Unspecified,
}

/// Fields used to create a new scope.
#[derive(Debug, Clone)]
pub struct ScopeData {
    pub scope_type: ScopeType,
    pub name: String,
    pub subnet: Option<Ipv4Net>,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
    pub trust_level: TrustLevel,
    pub pools: Vec<PoolEntry>,
    pub annotations: HashMap<String, String>,
    pub internal: bool,
}

impl ScopeData {
    pub fn new(scope_type: ScopeType, name: impl Into<String>) -> Self {
        Self {
            scope_type,
            name: name.into(),
            subnet: None,
            gateway: None,
            dns: Vec::new(),
            trust_level: TrustLevel::Unspecified,
            pools: Vec::new(),
            annotations: HashMap::new(),
            internal: false,
        }
    }
}

/// The persisted form of a scope. The port group reference is not serialized;
/// it is re-attached from configuration on load by matching name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ScopeRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub scope_type: ScopeType,
    pub subnet: Option<Ipv4Net>,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
    pub pools: Vec<String>,
    pub trust_level: TrustLevel,
    pub annotations: HashMap<String, String>,
    pub internal: bool,
}

impl ScopeRecord {
    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(NetworkError::internal)
    }
}

/// A named logical network.
#[derive(Debug, Clone)]
pub struct Scope {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) scope_type: ScopeType,
    pub(crate) subnet: Option<Ipv4Net>,
    pub(crate) gateway: Option<Ipv4Addr>,
    pub(crate) dns: Vec<Ipv4Addr>,
    pub(crate) trust_level: TrustLevel,
    pub(crate) annotations: HashMap<String, String>,
    pub(crate) internal: bool,
    pub(crate) builtin: bool,
    /// Set when the subnet was carved from the shared default bridge pool.
    pub(crate) from_default_pool: bool,
    /// Declared pools; the live allocators are built from these when the scope
    /// is admitted.
    pub(crate) pool_decl: Vec<PoolEntry>,
    pub(crate) spaces: Vec<AddressSpace>,
    /// Endpoints keyed by container UID.
    pub(crate) endpoints: HashMap<String, Endpoint>,
    /// Scoped alias name to owning container UID.
    pub(crate) aliases: HashMap<String, String>,
    pub(crate) network: Option<PortGroup>,
}

impl Scope {
    pub(crate) fn new(
        id: impl Into<String>,
        scope_type: ScopeType,
        network: Option<PortGroup>,
        data: ScopeData,
    ) -> Self {
        Self {
            id: id.into(),
            name: data.name,
            scope_type,
            subnet: data.subnet,
            gateway: data.gateway,
            dns: data.dns,
            trust_level: data.trust_level,
            annotations: data.annotations,
            internal: data.internal,
            builtin: false,
            from_default_pool: false,
            pool_decl: data.pools,
            spaces: Vec::new(),
            endpoints: HashMap::new(),
            aliases: HashMap::new(),
            network,
        }
    }

    pub(crate) fn from_record(record: ScopeRecord, network: Option<PortGroup>) -> Result<Self> {
        let mut pools = Vec::with_capacity(record.pools.len());
        for p in &record.pools {
            pools.push(p.parse::<PoolEntry>()?);
        }

        let mut data = ScopeData::new(record.scope_type, record.name);
        data.subnet = record.subnet;
        data.gateway = record.gateway;
        data.dns = record.dns;
        data.trust_level = record.trust_level;
        data.pools = pools;
        data.annotations = record.annotations;
        data.internal = record.internal;

        Ok(Self::new(record.id, record.scope_type, network, data))
    }

    pub(crate) fn to_record(&self) -> ScopeRecord {
        ScopeRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            scope_type: self.scope_type,
            subnet: self.subnet,
            gateway: self.gateway,
            dns: self.dns.clone(),
            pools: self.pool_entries().iter().map(PoolEntry::to_string).collect(),
            trust_level: self.trust_level,
            annotations: self.annotations.clone(),
            internal: self.internal,
        }
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.to_record()).map_err(NetworkError::internal)
    }

    /// Scope UID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Scope name, unique within a context.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope_type(&self) -> ScopeType {
        self.scope_type
    }

    pub fn subnet(&self) -> Option<Ipv4Net> {
        self.subnet
    }

    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.gateway
    }

    pub fn dns(&self) -> &[Ipv4Addr] {
        &self.dns
    }

    pub fn trust_level(&self) -> TrustLevel {
        self.trust_level
    }

    pub fn annotations(&self) -> &HashMap<String, String> {
        &self.annotations
    }

    pub fn internal(&self) -> bool {
        self.internal
    }

    /// True for scopes created from configuration; they cannot be deleted.
    pub fn builtin(&self) -> bool {
        self.builtin
    }

    /// The backing port group, if attached.
    pub fn network(&self) -> Option<&PortGroup> {
        self.network.as_ref()
    }

    /// The address pools endpoint IPs are drawn from.
    pub fn pools(&self) -> &[AddressSpace] {
        &self.spaces
    }

    /// Declared-pool view of the scope's address pools.
    pub fn pool_entries(&self) -> Vec<PoolEntry> {
        if self.spaces.is_empty() {
            self.pool_decl.clone()
        } else {
            self.spaces.iter().map(AddressSpace::pool_entry).collect()
        }
    }

    /// Endpoints attached to this scope.
    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values()
    }

    /// UIDs of the containers attached to this scope.
    pub fn container_ids(&self) -> Vec<String> {
        self.endpoints.keys().cloned().collect()
    }

    /// The endpoint of a given container, if attached.
    pub fn endpoint(&self, container_id: &str) -> Option<&Endpoint> {
        self.endpoints.get(container_id)
    }

    /// The endpoint holding a given address, if any.
    pub fn container_by_addr(&self, addr: Ipv4Addr) -> Option<&Endpoint> {
        self.endpoints.values().find(|e| e.ip() == Some(addr))
    }

    /// True when address management for this scope happens externally.
    pub fn is_dynamic(&self) -> bool {
        self.scope_type == ScopeType::External && self.subnet.is_none()
    }

    pub(crate) fn endpoint_mut(&mut self, container_id: &str) -> Option<&mut Endpoint> {
        self.endpoints.get_mut(container_id)
    }

    /// Attach an endpoint to this scope, allocating or reserving its address
    /// from the scope's pools unless the scope is dynamic.
    pub(crate) fn add_container(&mut self, con: &Container, ep: &mut Endpoint) -> Result<()> {
        if self.endpoints.contains_key(con.id()) {
            return Err(NetworkError::Duplicate { id: con.id().to_string() });
        }

        if !self.is_dynamic() {
            match ep.ip() {
                None => {
                    let mut allocated = None;
                    for space in &mut self.spaces {
                        if let Ok(ip) = space.reserve_next_ip4() {
                            allocated = Some(ip);
                            break;
                        }
                    }
                    ep.set_ip(Some(allocated.ok_or(NetworkError::PoolExhausted)?));
                }
                Some(ip) => {
                    let space = self
                        .spaces
                        .iter_mut()
                        .find(|s| s.contains(ip))
                        .ok_or(NetworkError::AddressOutOfRange { ip })?;
                    space.reserve_ip4(ip)?;
                }
            }
        }

        self.endpoints.insert(con.id().to_string(), ep.clone());
        Ok(())
    }

    /// Detach a container's endpoint, releasing its address back to the pools.
    pub(crate) fn remove_container(&mut self, con: &Container) -> Result<Endpoint> {
        let ep = self
            .endpoints
            .remove(con.id())
            .ok_or_else(|| NetworkError::NotFound { id: con.id().to_string() })?;

        if !self.is_dynamic() {
            if let Some(ip) = ep.ip() {
                for space in &mut self.spaces {
                    if space.release_ip4(ip).is_ok() {
                        break;
                    }
                }
            }
        }

        self.aliases.retain(|_, owner| owner != con.id());
        Ok(ep)
    }

    /// Record an alias entry on a container's endpoint, tracking ownership in
    /// the scope's alias table.
    pub(crate) fn add_endpoint_alias(
        &mut self,
        container_id: &str,
        who: &str,
        what: &str,
    ) -> Option<(Alias, bool)> {
        let ep = self.endpoints.get_mut(container_id)?;
        let (alias, exists) = ep.add_alias(who, what)?;
        if !exists {
            self.aliases.insert(alias.scoped_name(), container_id.to_string());
        }
        Some((alias, exists))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn bridge_scope() -> Scope {
        // provisioned the way the context does it: whole subnet as the single
        // pool, zeros/ones and gateway reserved
        let subnet = net("10.0.0.0/24");
        let mut space = AddressSpace::from_network(subnet);
        space.reserve_ip4(ip("10.0.0.0")).unwrap();
        space.reserve_ip4(ip("10.0.0.255")).unwrap();
        space.reserve_ip4(ip("10.0.0.1")).unwrap();

        let mut data = ScopeData::new(ScopeType::Bridge, "test");
        data.subnet = Some(subnet);
        data.gateway = Some(ip("10.0.0.1"));
        let mut scope = Scope::new("scope-1", ScopeType::Bridge, None, data);
        scope.spaces = vec![space];
        scope
    }

    fn container() -> Container {
        Container::new("0123456789abcdef", "web")
    }

    #[test]
    fn test_add_container_allocates() {
        let mut scope = bridge_scope();
        let con = container();
        let mut ep = Endpoint::new(&con, "test", None, false);

        scope.add_container(&con, &mut ep).unwrap();
        assert_eq!(ep.ip(), Some(ip("10.0.0.2")));
        assert!(scope.endpoint(con.id()).is_some());
    }

    #[test]
    fn test_add_container_reserves_specific() {
        let mut scope = bridge_scope();
        let con = container();
        let mut ep = Endpoint::new(&con, "test", Some(ip("10.0.0.100")), true);

        scope.add_container(&con, &mut ep).unwrap();
        assert_eq!(ep.ip(), Some(ip("10.0.0.100")));

        // same address for another container fails
        let other = Container::new("fedcba9876543210", "db");
        let mut ep = Endpoint::new(&other, "test", Some(ip("10.0.0.100")), true);
        let err = scope.add_container(&other, &mut ep).unwrap_err();
        assert!(matches!(err, NetworkError::AddressInUse { .. }));
    }

    #[test]
    fn test_add_container_out_of_pool() {
        let mut scope = bridge_scope();
        let con = container();
        let mut ep = Endpoint::new(&con, "test", Some(ip("192.168.0.1")), true);

        let err = scope.add_container(&con, &mut ep).unwrap_err();
        assert!(matches!(err, NetworkError::AddressOutOfRange { .. }));
    }

    #[test]
    fn test_add_container_twice_is_duplicate() {
        let mut scope = bridge_scope();
        let con = container();
        let mut ep = Endpoint::new(&con, "test", None, false);
        scope.add_container(&con, &mut ep).unwrap();

        let mut ep = Endpoint::new(&con, "test", None, false);
        assert!(scope.add_container(&con, &mut ep).unwrap_err().is_duplicate());
    }

    #[test]
    fn test_remove_container_releases() {
        let mut scope = bridge_scope();
        let con = container();
        let mut ep = Endpoint::new(&con, "test", None, false);
        scope.add_container(&con, &mut ep).unwrap();

        let removed = scope.remove_container(&con).unwrap();
        assert_eq!(removed.ip(), Some(ip("10.0.0.2")));
        assert!(scope.endpoint(con.id()).is_none());

        // released address is allocated again
        let other = Container::new("fedcba9876543210", "db");
        let mut ep = Endpoint::new(&other, "test", None, false);
        scope.add_container(&other, &mut ep).unwrap();
        assert_eq!(ep.ip(), Some(ip("10.0.0.2")));
    }

    #[test]
    fn test_remove_container_not_attached() {
        let mut scope = bridge_scope();
        assert!(scope.remove_container(&container()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_dynamic_scope_skips_ipam() {
        let data = ScopeData::new(ScopeType::External, "wan");
        let mut scope = Scope::new("scope-2", ScopeType::External, None, data);
        assert!(scope.is_dynamic());

        let con = container();
        let mut ep = Endpoint::new(&con, "wan", None, false);
        scope.add_container(&con, &mut ep).unwrap();
        assert_eq!(ep.ip(), None);

        scope.remove_container(&con).unwrap();
    }

    #[test]
    fn test_container_by_addr() {
        let mut scope = bridge_scope();
        let con = container();
        let mut ep = Endpoint::new(&con, "test", None, false);
        scope.add_container(&con, &mut ep).unwrap();

        let found = scope.container_by_addr(ip("10.0.0.2")).unwrap();
        assert_eq!(found.container_id(), con.id());
        assert!(scope.container_by_addr(ip("10.0.0.3")).is_none());
    }

    #[test]
    fn test_alias_ownership_cleanup() {
        let mut scope = bridge_scope();
        let con = container();
        let mut ep = Endpoint::new(&con, "test", None, false);
        scope.add_container(&con, &mut ep).unwrap();

        let (alias, exists) = scope.add_endpoint_alias(con.id(), "web", "app").unwrap();
        assert!(!exists);
        assert_eq!(scope.aliases.get(&alias.scoped_name()), Some(&con.id().to_string()));

        scope.remove_container(&con).unwrap();
        assert!(scope.aliases.is_empty());
    }

    #[test]
    fn test_record_round_trip() {
        let mut data = ScopeData::new(ScopeType::External, "public");
        data.subnet = Some(net("192.168.10.0/24"));
        data.gateway = Some(ip("192.168.10.1"));
        data.dns = vec![ip("8.8.8.8")];
        data.trust_level = TrustLevel::Published;
        data.pools = vec!["192.168.10.10-192.168.10.50".parse().unwrap()];
        data.annotations.insert("tier".to_string(), "dmz".to_string());
        let scope =
            Scope::new("scope-3", ScopeType::External, Some(PortGroup::new("public", "pg-1")), data);

        let bytes = scope.to_bytes().unwrap();
        let record = ScopeRecord::from_bytes(&bytes).unwrap();
        let restored = Scope::from_record(record, Some(PortGroup::new("public", "pg-1"))).unwrap();

        assert_eq!(restored.id(), "scope-3");
        assert_eq!(restored.name(), "public");
        assert_eq!(restored.scope_type(), ScopeType::External);
        assert_eq!(restored.subnet(), Some(net("192.168.10.0/24")));
        assert_eq!(restored.gateway(), Some(ip("192.168.10.1")));
        assert_eq!(restored.dns(), &[ip("8.8.8.8")]);
        assert_eq!(restored.trust_level(), TrustLevel::Published);
        assert_eq!(restored.pool_entries(), scope.pool_entries());
        assert_eq!(restored.annotations().get("tier"), Some(&"dmz".to_string()));
        // port group is not serialized; it is re-attached on load
        assert_eq!(restored.network().unwrap().name, "public");
    }

    #[test]
    fn test_record_field_names() {
        let mut data = ScopeData::new(ScopeType::Bridge, "net1");
        data.subnet = Some(net("172.16.0.0/16"));
        data.gateway = Some(ip("172.16.0.1"));
        let scope = Scope::new("scope-4", ScopeType::Bridge, None, data);

        let value: serde_json::Value =
            serde_json::from_slice(&scope.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "bridge");
        assert_eq!(value["subnet"], "172.16.0.0/16");
        assert_eq!(value["gateway"], "172.16.0.1");
        assert_eq!(value["trustLevel"], "unspecified");
        assert!(value["dns"].is_array());
    }
}
