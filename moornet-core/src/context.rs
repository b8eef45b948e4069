//! The network context: scopes, IPAM, and container binding.
//!
//! A `Context` owns every scope and bound container, enforces address
//! management across scopes, stages and commits container endpoints, and
//! persists scope definitions to the injected key/value store. All state is
//! guarded by one coarse lock; subordinate entities rely on it and carry no
//! synchronization of their own.

use crate::address_space::AddressSpace;
use crate::config::{Configuration, ContainerNetwork, DEFAULT_BRIDGE_RANGE, DEFAULT_BRIDGE_WIDTH};
use crate::container::Container;
use crate::device::{
    add_ethernet_card, remove_ethernet_card, ContainerNetworkInfo, Handle, NetworkEndpoint,
};
use crate::endpoint::{parse_alias, parse_port_specs, Endpoint};
use crate::error::{NetworkError, Result};
use crate::ip::{self, PoolEntry};
use crate::kv::KvStore;
use crate::scope::{Scope, ScopeData, ScopeRecord, ScopeType, TrustLevel};
use ipnet::Ipv4Net;
use metrics::counter;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const SCOPE_KEY_PREFIX: &str = "context.scopes.";
const SCOPE_KEY_PATTERN: &str = r"context\.scopes\..+";

fn scope_key(name: &str) -> String {
    format!("{}{}", SCOPE_KEY_PREFIX, name)
}

/// Options for staging a container onto a scope.
#[derive(Debug, Clone, Default)]
pub struct AddContainerOptions {
    /// Scope name, UID, or UID prefix. `"default"` names the default scope.
    pub scope: String,
    /// Static address for the container on the scope.
    pub ip: Option<Ipv4Addr>,
    /// Aliases in `"who:what"` form; an empty `who` means the container itself.
    pub aliases: Vec<String>,
    /// Port specs, docker style.
    pub ports: Vec<String>,
}

impl AddContainerOptions {
    pub fn new(scope: impl Into<String>) -> Self {
        Self { scope: scope.into(), ..Self::default() }
    }
}

struct State {
    default_bridge_pool: AddressSpace,
    default_bridge_width: u8,
    scopes: HashMap<String, Scope>,
    /// Bound containers under each of long UID, short UID, and name.
    containers: HashMap<String, Arc<Container>>,
    /// Scoped alias to the containers answering it.
    aliases: HashMap<String, Vec<Arc<Container>>>,
    default_scope: String,
}

/// A networking context: a set of scopes, endpoints, and containers with its
/// own separate IPAM.
pub struct Context {
    config: Configuration,
    kv: Option<Arc<dyn KvStore>>,
    state: Mutex<State>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("config", &self.config).finish()
    }
}

impl Context {
    /// Construct a context from configuration, creating the builtin scopes and
    /// restoring any scopes saved in the key/value store. Construction failures
    /// are fatal; no partially constructed context is returned.
    pub fn new(config: Configuration, kv: Option<Arc<dyn KvStore>>) -> Result<Context> {
        let bridge_range = match config.bridge_ip_range {
            Some(range) => range.trunc(),
            None => DEFAULT_BRIDGE_RANGE
                .parse::<Ipv4Net>()
                .map_err(NetworkError::internal)?
                .trunc(),
        };

        let width = config.bridge_network_width.unwrap_or(DEFAULT_BRIDGE_WIDTH);
        if width > 32 || width < bridge_range.prefix_len() {
            return Err(NetworkError::BridgeMaskIncompatible);
        }

        let state = State {
            default_bridge_pool: AddressSpace::from_network(bridge_range),
            default_bridge_width: width,
            scopes: HashMap::new(),
            containers: HashMap::new(),
            aliases: HashMap::new(),
            default_scope: String::new(),
        };

        let ctx = Context { config, kv, state: Mutex::new(state) };

        {
            let mut st = ctx.state.lock().unwrap();

            let bn = ctx.config.container_networks.get(&ctx.config.bridge_network).ok_or_else(
                || NetworkError::InvalidConfig {
                    reason: format!(
                        "default bridge network {} not present in configuration",
                        ctx.config.bridge_network
                    ),
                },
            )?;

            let name = ctx.new_scope_inner(&mut st, Self::scope_data_from_network(bn))?;
            if let Some(scope) = st.scopes.get_mut(&name) {
                scope.builtin = true;
            }
            st.default_scope = name;

            // remaining declared container networks, in a stable order
            let mut names: Vec<&String> = ctx.config.container_networks.keys().collect();
            names.sort();
            for nn in names {
                if *nn == ctx.config.bridge_network {
                    continue;
                }
                let n = &ctx.config.container_networks[nn];
                let name = ctx.new_scope_inner(&mut st, Self::scope_data_from_network(n))?;
                if let Some(scope) = st.scopes.get_mut(&name) {
                    scope.builtin = true;
                }
            }

            if let Some(kv) = ctx.kv.clone() {
                ctx.load_saved_scopes(&mut st, kv.as_ref());
            }
        }

        Ok(ctx)
    }

    fn scope_data_from_network(n: &ContainerNetwork) -> ScopeData {
        let mut data = ScopeData::new(n.scope_type, n.name.clone());
        if let Some(gw) = n.gateway {
            data.subnet = Some(gw.trunc());
            data.gateway = Some(gw.addr());
        }
        data.dns = n.nameservers.clone();
        data.trust_level = n.trust_level;
        data.pools = n.pools.clone();
        data
    }

    /// Restore scopes persisted by a previous incarnation of the context.
    /// Corrupt records and scopes whose port group has disappeared are skipped.
    fn load_saved_scopes(&self, st: &mut State, kv: &dyn KvStore) {
        let values = match kv.list(SCOPE_KEY_PATTERN) {
            Ok(values) => values,
            Err(e) if e.is_key_not_found() => return,
            Err(e) => {
                warn!("error listing scopes from key value store: {}", e);
                return;
            }
        };

        let mut keys: Vec<&String> = values.keys().collect();
        keys.sort();
        for k in keys {
            let record = match ScopeRecord::from_bytes(&values[k]) {
                Ok(record) => record,
                Err(e) => {
                    warn!("error loading scope data from key {}, skipping: {}", k, e);
                    continue;
                }
            };

            let pg_name = match record.scope_type {
                ScopeType::Bridge => self.config.bridge_network.clone(),
                ScopeType::External => record.name.clone(),
            };
            let Some(pg) = self.config.port_groups.get(&pg_name) else {
                warn!("skipping scope {}: port group {} not found", record.name, pg_name);
                continue;
            };

            let scope = match Scope::from_record(record, Some(pg.clone())) {
                Ok(scope) => scope,
                Err(e) => {
                    warn!("error loading scope data from key {}, skipping: {}", k, e);
                    continue;
                }
            };

            let name = scope.name().to_string();
            if let Err(e) = self.add_scope_inner(st, scope) {
                warn!("skipping scope {}: {}", name, e);
            } else {
                info!("restored scope {}", name);
            }
        }
    }

    /// Create a scope and persist it. On any failure, including the persistence
    /// write, every reservation made by this call is released and the scope is
    /// absent afterwards.
    #[instrument(skip(self, data), fields(scope = %data.name, scope_type = %data.scope_type))]
    pub fn new_scope(&self, data: ScopeData) -> Result<Scope> {
        let mut st = self.state.lock().unwrap();
        let name = self.new_scope_inner(&mut st, data)?;

        if let Some(kv) = &self.kv {
            let result =
                st.scopes[&name].to_bytes().and_then(|b| kv.put(&scope_key(&name), &b));
            if let Err(e) = result {
                self.delete_scope_inner(&mut st, &name);
                return Err(e);
            }
        }

        counter!("moornet.context.scope.create").increment(1);
        info!("created scope {}", name);
        Ok(st.scopes[&name].clone())
    }

    fn new_scope_inner(&self, st: &mut State, data: ScopeData) -> Result<String> {
        if data.name.is_empty() {
            return Err(NetworkError::InvalidConfig {
                reason: "scope name must not be empty".to_string(),
            });
        }
        if st.scopes.contains_key(&data.name) {
            return Err(NetworkError::Duplicate { id: data.name });
        }

        match data.scope_type {
            ScopeType::Bridge => self.new_bridge_scope(st, data),
            ScopeType::External => self.new_external_scope(st, data),
        }
    }

    fn new_bridge_scope(&self, st: &mut State, mut data: ScopeData) -> Result<String> {
        let pg = self
            .config
            .port_groups
            .get(&self.config.bridge_network)
            .ok_or_else(|| NetworkError::InvalidConfig {
                reason: "bridge network not set".to_string(),
            })?
            .clone();

        if data.subnet.is_none() {
            // next available subnet from the default bridge pool
            data.subnet = Some(st.default_bridge_pool.next_ip4_net(st.default_bridge_width)?);
        }

        let name = data.name.clone();
        let scope =
            Scope::new(Uuid::new_v4().simple().to_string(), ScopeType::Bridge, Some(pg), data);
        self.add_scope_inner(st, scope)?;

        // the gateway lives on the host bridge interface
        let scope = &st.scopes[&name];
        if let (Some(gw), Some(subnet)) = (scope.gateway(), scope.subnet()) {
            if let Ok(addr) = Ipv4Net::new(gw, subnet.prefix_len()) {
                match self.config.bridge_link.addr_add(addr) {
                    Ok(()) | Err(NetworkError::AddrExists { .. }) => {}
                    Err(e) => warn!(
                        "failed to add gateway address {} to bridge interface {}: {}",
                        addr,
                        self.config.bridge_link.name(),
                        e
                    ),
                }
            }
        }

        Ok(name)
    }

    fn new_external_scope(&self, st: &mut State, data: ScopeData) -> Result<String> {
        // ipam cannot be specified without gateway and subnet
        if !data.pools.is_empty() && (data.subnet.is_none() || data.gateway.is_none()) {
            return Err(NetworkError::InvalidConfig {
                reason: "ipam cannot be specified without gateway and subnet for external network"
                    .to_string(),
            });
        }

        if let Some(subnet) = data.subnet {
            if let Some(pool_net) = st.default_bridge_pool.network() {
                if ip::overlaps(subnet, pool_net) {
                    return Err(NetworkError::InvalidConfig {
                        reason: "external network cannot overlap with default bridge network"
                            .to_string(),
                    });
                }
            }
        }

        let pg = self
            .config
            .port_groups
            .get(&data.name)
            .ok_or_else(|| NetworkError::InvalidConfig {
                reason: format!("no network info for external scope {}", data.name),
            })?
            .clone();

        let name = data.name.clone();
        let scope =
            Scope::new(Uuid::new_v4().simple().to_string(), ScopeType::External, Some(pg), data);
        self.add_scope_inner(st, scope)?;
        Ok(name)
    }

    /// Admit a scope: carve its subnet, reserve its pools, non-routable
    /// addresses, nameservers, and gateway, then install it. Failures leave no
    /// reservation behind.
    fn add_scope_inner(&self, st: &mut State, mut scope: Scope) -> Result<()> {
        if st.scopes.contains_key(scope.name()) {
            return Err(NetworkError::Duplicate { id: scope.name().to_string() });
        }

        // a subnet may be absent, e.g. for dynamic external scopes
        if let Some(subnet) = scope.subnet() {
            let subnet = subnet.trunc();
            Self::check_net_overlap(st, subnet)?;

            // consume the shared default pool when the subnet fits it,
            // stand alone otherwise
            let (space, from_pool) = match st.default_bridge_pool.reserve_ip4_net(subnet) {
                Ok(space) => (space, true),
                Err(_) => (AddressSpace::from_network(subnet), false),
            };

            if let Err(e) = Self::provision_scope(space, &mut scope) {
                if from_pool {
                    if let Err(re) =
                        st.default_bridge_pool.release_range(subnet.network(), subnet.broadcast())
                    {
                        warn!("failed to return subnet {} to the bridge pool: {}", subnet, re);
                    }
                }
                return Err(e);
            }
            scope.from_default_pool = from_pool;
        }

        st.scopes.insert(scope.name().to_string(), scope);
        Ok(())
    }

    fn provision_scope(space: AddressSpace, scope: &mut Scope) -> Result<()> {
        let subnet = match space.network() {
            Some(subnet) => subnet,
            None => return Err(NetworkError::Internal("subnet space has no network".to_string())),
        };

        // the declared pools become sub-spaces of the subnet; with no pools the
        // whole subnet is the single pool
        let mut spaces = if scope.pool_decl.is_empty() {
            vec![space]
        } else {
            let mut space = space;
            let mut spaces = Vec::with_capacity(scope.pool_decl.len());
            for p in &scope.pool_decl {
                let child = match p {
                    PoolEntry::Cidr(net) => space.reserve_ip4_net(*net)?,
                    PoolEntry::Range(first, last) => space.reserve_ip4_range(*first, *last)?,
                };
                spaces.push(child);
            }
            spaces
        };

        // all-zeros and all-ones are not routable and must never be handed out
        let allzeros = subnet.network();
        let allones = subnet.broadcast();
        for space in &mut spaces {
            let _ = space.reserve_ip4(allzeros);
            let _ = space.reserve_ip4(allones);

            for d in &scope.dns {
                if Some(*d) == scope.gateway {
                    continue; // reserved with the gateway below
                }
                // nameservers outside the pools are legal, skip them
                let _ = space.reserve_ip4(*d);
            }
        }

        let gateway = Self::reserve_gateway(scope.gateway, subnet, &mut spaces)?;

        scope.subnet = Some(subnet);
        scope.gateway = Some(gateway);
        scope.spaces = spaces;
        Ok(())
    }

    fn reserve_gateway(
        gateway: Option<Ipv4Addr>,
        subnet: Ipv4Net,
        spaces: &mut [AddressSpace],
    ) -> Result<Ipv4Addr> {
        if let Some(gw) = gateway {
            if !ip::is_routable(gw, subnet) {
                return Err(NetworkError::GatewayNotRoutable { gateway: gw, subnet });
            }

            // reserve it in whichever pool holds it; a gateway outside the
            // pools is legal
            for space in spaces.iter_mut() {
                if space.reserve_ip4(gw).is_ok() {
                    break;
                }
            }
            return Ok(gw);
        }

        // gateway not specified, pick one from the first pool
        let first = spaces.first_mut().ok_or_else(|| NetworkError::InvalidConfig {
            reason: format!("could not reserve gateway address for network {}", subnet),
        })?;
        let gw = first.reserve_next_ip4()?;
        if !ip::is_routable(gw, subnet) {
            return Err(NetworkError::GatewayNotRoutable { gateway: gw, subnet });
        }
        Ok(gw)
    }

    fn check_net_overlap(st: &State, subnet: Ipv4Net) -> Result<()> {
        for scope in st.scopes.values() {
            if let Some(other) = scope.subnet() {
                if ip::overlaps(subnet, other) {
                    return Err(NetworkError::SubnetOverlap {
                        subnet,
                        scope: scope.name().to_string(),
                        other,
                    });
                }
            }
        }
        Ok(())
    }

    /// Delete a scope. Builtin scopes and scopes with active endpoints are
    /// refused; a missing persistence record is tolerated.
    #[instrument(skip(self))]
    pub fn delete_scope(&self, id_or_name: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let name = Self::resolve_scope(&st, id_or_name)?;

        let scope = &st.scopes[&name];
        if scope.builtin() {
            return Err(NetworkError::BuiltinScope { name });
        }
        if scope.endpoints().next().is_some() {
            return Err(NetworkError::ActiveEndpoints { name });
        }

        if let Some(kv) = &self.kv {
            match kv.delete(&scope_key(&name)) {
                Ok(()) => {}
                Err(e) if e.is_key_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        self.delete_scope_inner(&mut st, &name);
        counter!("moornet.context.scope.delete").increment(1);
        info!("deleted scope {}", name);
        Ok(())
    }

    /// Remove a scope from the context, taking its gateway off the bridge link
    /// and returning a pool-carved subnet to the default bridge pool.
    fn delete_scope_inner(&self, st: &mut State, name: &str) {
        let Some(scope) = st.scopes.remove(name) else {
            return;
        };

        if scope.scope_type() == ScopeType::Bridge {
            if let (Some(gw), Some(subnet)) = (scope.gateway(), scope.subnet()) {
                if let Ok(addr) = Ipv4Net::new(gw, subnet.prefix_len()) {
                    match self.config.bridge_link.addr_del(addr) {
                        Ok(()) | Err(NetworkError::AddrNotPresent { .. }) => {}
                        Err(e) => warn!(
                            "could not remove gateway address {} for scope {} on link {}: {}",
                            addr,
                            name,
                            self.config.bridge_link.name(),
                            e
                        ),
                    }
                }
            }
        }

        if scope.from_default_pool {
            if let Some(subnet) = scope.subnet() {
                if let Err(e) =
                    st.default_bridge_pool.release_range(subnet.network(), subnet.broadcast())
                {
                    warn!("failed to return subnet {} to the bridge pool: {}", subnet, e);
                }
            }
        }
    }

    fn find_scopes<'a>(st: &'a State, id_or_name: Option<&str>) -> Result<Vec<&'a Scope>> {
        if let Some(key) = id_or_name.filter(|s| !s.is_empty()) {
            if key == "default" {
                let scope = st
                    .scopes
                    .get(&st.default_scope)
                    .ok_or_else(|| NetworkError::NotFound { id: key.to_string() })?;
                return Ok(vec![scope]);
            }

            // exact name first
            if let Some(scope) = st.scopes.get(key) {
                return Ok(vec![scope]);
            }

            // then exact or prefix match on the UID
            let mut matches: Vec<&Scope> =
                st.scopes.values().filter(|s| s.id().starts_with(key)).collect();
            if !matches.is_empty() {
                matches.sort_by(|a, b| a.name().cmp(b.name()));
                return Ok(matches);
            }

            return Err(NetworkError::NotFound { id: key.to_string() });
        }

        let mut all: Vec<&Scope> = st.scopes.values().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(all)
    }

    /// Resolve a scope reference to exactly one scope name.
    fn resolve_scope(st: &State, id_or_name: &str) -> Result<String> {
        let scopes = Self::find_scopes(st, Some(id_or_name))?;
        if scopes.len() == 1 {
            return Ok(scopes[0].name().to_string());
        }
        let matches = scopes.iter().map(|s| s.name()).collect::<Vec<_>>().join(", ");
        Err(NetworkError::AmbiguousScope { id: id_or_name.to_string(), matches })
    }

    /// Look up scopes by name, UID, or UID prefix; `None` lists all scopes.
    /// Endpoints of dynamic scopes are refreshed from the hypervisor first so
    /// guest-assigned addresses are current.
    #[instrument(skip(self))]
    pub fn scopes(&self, id_or_name: Option<&str>) -> Result<Vec<Scope>> {
        let mut st = self.state.lock().unwrap();
        let names: Vec<String> =
            Self::find_scopes(&st, id_or_name)?.iter().map(|s| s.name().to_string()).collect();

        for name in &names {
            let Some(scope) = st.scopes.get_mut(name) else {
                continue;
            };
            if !scope.is_dynamic() {
                continue;
            }
            for id in scope.container_ids() {
                if let Some(addr) = self.config.hypervisor.current_address(&id, name) {
                    if let Some(ep) = scope.endpoint_mut(&id) {
                        ep.set_ip(Some(addr.addr()));
                    }
                }
            }
        }

        Ok(names.iter().filter_map(|n| st.scopes.get(n).cloned()).collect())
    }

    /// The builtin default bridge scope.
    pub fn default_scope(&self) -> Scope {
        let st = self.state.lock().unwrap();
        st.scopes.get(&st.default_scope).cloned().expect("builtin default scope cannot be deleted")
    }

    /// Stage a container onto a scope, declaring an endpoint and the NIC
    /// serving it on the handle. No addresses are allocated here; that happens
    /// at bind.
    #[instrument(skip(self, h, options), fields(container = %h.id(), scope = %options.scope))]
    pub fn add_container(&self, h: &mut Handle, options: &AddContainerOptions) -> Result<()> {
        let st = self.state.lock().unwrap();

        let name = Self::resolve_scope(&st, &options.scope)?;
        let scope = &st.scopes[&name];

        if h.network(scope.name()).is_some() {
            return Ok(()); // already staged on this scope
        }

        if scope.scope_type() == ScopeType::External {
            // a container joins at most one external scope
            for other in h.networks().keys() {
                let Ok(other_name) = Self::resolve_scope(&st, other) else {
                    continue;
                };
                if st.scopes[&other_name].scope_type() == ScopeType::External {
                    return Err(NetworkError::OneExternalNetwork);
                }
            }

            // no PAT on external networks, ports are only unblocked on the
            // container itself
            for p in &options.ports {
                if p.contains(':') {
                    return Err(NetworkError::PortMappingOnExternal { port: p.clone() });
                }
            }
            if !options.ports.is_empty() && scope.trust_level() == TrustLevel::Closed {
                return Err(NetworkError::ClosedFirewall);
            }
        }

        // a NIC already serving another bridge scope on this handle is reused
        let mut pci_slot: Option<i32> = None;
        if scope.scope_type() == ScopeType::Bridge {
            for (other, ne) in h.networks() {
                let Ok(other_name) = Self::resolve_scope(&st, other) else {
                    continue;
                };
                if st.scopes[&other_name].scope_type() != ScopeType::Bridge {
                    continue;
                }
                match ne.id.parse::<i32>() {
                    Ok(slot) if slot != 0 => {
                        pci_slot = Some(slot);
                        break;
                    }
                    _ => {}
                }
            }
        }

        let slot = match pci_slot {
            Some(slot) => slot,
            None => {
                let pg = scope.network().cloned().ok_or_else(|| NetworkError::InvalidConfig {
                    reason: format!("no network info for scope {}", scope.name()),
                })?;
                add_ethernet_card(h, scope.name(), &pg, self.config.hypervisor.as_ref())?
            }
        };

        let scope = &st.scopes[&name];
        let static_ip = options.ip.is_some();
        let prefix = scope.subnet().map(|s| s.prefix_len()).unwrap_or(32);
        let ip_net = match options.ip {
            Some(ip) => Some(Ipv4Net::new(ip, prefix).map_err(NetworkError::internal)?),
            None => None,
        };

        h.insert_network(NetworkEndpoint {
            id: slot.to_string(),
            network: ContainerNetworkInfo {
                name: scope.name().to_string(),
                aliases: options.aliases.clone(),
                scope_type: scope.scope_type(),
                trust_level: scope.trust_level(),
                pools: scope.pool_entries(),
                gateway: None,
                nameservers: Vec::new(),
                default: false,
            },
            static_ip,
            ip: ip_net,
            assigned: None,
            ports: options.ports.clone(),
        });

        Ok(())
    }

    /// Remove a staged endpoint from the handle, dropping the NIC when no other
    /// staged endpoint shares its slot. Refused while the container is bound.
    #[instrument(skip(self, h), fields(container = %h.id()))]
    pub fn remove_container(&self, h: &mut Handle, scope: &str) -> Result<()> {
        let st = self.state.lock().unwrap();

        if st.containers.contains_key(h.id()) {
            return Err(NetworkError::ContainerBound { id: h.id().to_string() });
        }

        let name = Self::resolve_scope(&st, scope)?;

        let ne_id = match h.network(&name) {
            Some(ne) => ne.id.clone(),
            None => {
                return Err(NetworkError::InvalidConfig {
                    reason: format!("container {} not part of network {}", h.id(), name),
                })
            }
        };

        let shared = h.networks().iter().any(|(n, other)| *n != name && other.id == ne_id);
        if !shared {
            let sc = &st.scopes[&name];
            let pg = sc.network().cloned().ok_or_else(|| NetworkError::InvalidConfig {
                reason: format!("no network info for scope {}", name),
            })?;
            remove_ethernet_card(
                h,
                &name,
                &pg,
                self.config.hypervisor.as_ref(),
                ne_id.parse::<i32>().ok(),
            )?;
        }

        h.remove_network(&name);
        Ok(())
    }

    /// Commit every endpoint staged on the handle: allocate addresses, install
    /// aliases, and index the container. Binding an already-bound container
    /// returns its existing endpoints unchanged. On failure, every endpoint
    /// added by this call is removed again.
    #[instrument(skip(self, h), fields(container = %h.id(), name = %h.name()))]
    pub fn bind_container(&self, h: &mut Handle) -> Result<Vec<Endpoint>> {
        let mut st = self.state.lock().unwrap();

        if h.id().is_empty() {
            return Err(NetworkError::InvalidConfig {
                reason: "invalid container id".to_string(),
            });
        }

        if st.containers.contains_key(h.id()) {
            return Ok(Self::container_endpoints(&st, h.id()));
        }

        let con = Arc::new(Container::new(h.id(), h.name()));

        let state = &mut *st;
        let scopes = &mut state.scopes;
        let containers = &mut state.containers;
        let alias_index = &mut state.aliases;

        let names = h.sorted_network_names();
        let mut new_aliases: Vec<(String, Arc<Container>)> = Vec::new();
        let mut endpoints: Vec<Endpoint> = Vec::new();
        let mut bound: Vec<String> = Vec::new();
        let mut default_marked = false;

        let mut result: Result<()> = Ok(());
        'bind: for name in &names {
            let Some(scope) = scopes.get_mut(name) else {
                result = Err(NetworkError::NotFound { id: format!("network {}", name) });
                break 'bind;
            };
            let Some(ne) = h.network_mut(name) else {
                continue;
            };

            let eip = if ne.static_ip {
                ne.ip.map(|n| n.addr())
            } else if ne.assigned.is_some() {
                // control-plane restart: the running container already holds
                // this address, possibly DHCP-assigned; dynamic scopes skip
                // the reservation anyway
                ne.assigned
            } else {
                None
            };

            let mut ep = Endpoint::new(&con, name.clone(), eip, ne.static_ip);
            if let Err(e) = scope.add_container(&con, &mut ep) {
                result = Err(e);
                break 'bind;
            }
            bound.push(name.clone());

            match parse_port_specs(&ne.ports) {
                Ok(ports) => {
                    if let Some(ep_ref) = scope.endpoint_mut(con.id()) {
                        for p in ports {
                            ep_ref.add_port(p);
                        }
                    }
                }
                Err(e) => {
                    result = Err(e);
                    break 'bind;
                }
            }

            // write the resolved network back onto the handle
            let prefix = scope.subnet().map(|s| s.prefix_len()).unwrap_or(32);
            if let Some(ip) = scope.endpoint(con.id()).and_then(|e| e.ip()) {
                if let Ok(n) = Ipv4Net::new(ip, prefix) {
                    ne.ip = Some(n);
                }
            }
            ne.network.gateway = scope.gateway().and_then(|gw| Ipv4Net::new(gw, prefix).ok());
            ne.network.nameservers = scope.dns().to_vec();

            // the first external, non-internal endpoint is the default network
            if !default_marked && scope.scope_type() == ScopeType::External && !scope.internal() {
                ne.network.default = true;
                default_marked = true;
            }

            // resolution entries for the container's own name and short id
            new_aliases.push((format!("{}:{}", name, con.name()), con.clone()));
            new_aliases.push((format!("{}:{}", name, con.short_id()), con.clone()));

            // container-declared aliases
            for a in ne.network.aliases.clone() {
                debug!("parsing alias {}", a);
                let (who, what) = match parse_alias(&a) {
                    Ok(parts) => parts,
                    Err(e) => {
                        result = Err(e);
                        break 'bind;
                    }
                };
                let who = if who.is_empty() { con.name().to_string() } else { who.to_string() };

                let Some((alias, exists)) = scope.add_endpoint_alias(con.id(), &who, what) else {
                    continue;
                };
                if exists {
                    continue;
                }

                // this container answers the alias, but the entry only resolves
                // while `who` is bound; a missing `who` is fixed up when it binds
                if who == con.name() || containers.contains_key(&who) {
                    new_aliases.push((alias.scoped_name(), con.clone()));
                } else {
                    debug!("skipping alias {} since {} is not bound yet", a, who);
                }
            }

            // aliases other containers declared toward this one resolve now
            let mut fixups: Vec<(String, String)> = Vec::new();
            for other in scope.endpoints() {
                if other.container_id() == con.id() {
                    continue;
                }
                for a in other.get_aliases(con.name()) {
                    fixups.push((a.scoped_name(), other.container_id().to_string()));
                }
            }
            for (key, declarer) in fixups {
                if let Some(c) = containers.get(&declarer) {
                    new_aliases.push((key, c.clone()));
                }
            }

            if let Some(ep) = scope.endpoint(con.id()) {
                endpoints.push(ep.clone());
            }
        }

        if let Err(e) = result {
            for name in &bound {
                if let Some(scope) = scopes.get_mut(name) {
                    let _ = scope.remove_container(&con);
                }
            }
            return Err(e);
        }

        // no external network elected a default; fall back to the first
        // non-internal endpoint
        if !default_marked {
            for name in &names {
                let internal = scopes.get(name).map(|s| s.internal()).unwrap_or(false);
                if internal {
                    debug!("not setting internal network {} as default", name);
                    continue;
                }
                if let Some(ne) = h.network_mut(name) {
                    ne.network.default = true;
                }
                break;
            }
        }

        // index under long id, short id, and name
        containers.insert(con.id().to_string(), con.clone());
        containers.insert(con.short_id().to_string(), con.clone());
        containers.insert(con.name().to_string(), con.clone());

        for (key, c) in new_aliases {
            debug!("adding alias {} -> {}", key, c.name());
            let entry = alias_index.entry(key).or_default();
            if !entry.iter().any(|existing| existing.id() == c.id()) {
                entry.push(c);
            }
        }

        counter!("moornet.context.container.bind").increment(1);
        info!("bound container {} on {} scope(s)", con.name(), endpoints.len());
        Ok(endpoints)
    }

    /// Undo a bind: release addresses, drop aliases, and unindex the container.
    /// Unbinding a container that is not bound is a no-op returning `None`.
    #[instrument(skip(self, h), fields(container = %h.id()))]
    pub fn unbind_container(&self, h: &mut Handle) -> Result<Option<Vec<Endpoint>>> {
        let mut st = self.state.lock().unwrap();

        let Some(con) = st.containers.get(h.id()).cloned() else {
            return Ok(None); // not bound
        };

        let state = &mut *st;
        let scopes = &mut state.scopes;
        let containers = &mut state.containers;
        let alias_index = &mut state.aliases;

        let names = h.sorted_network_names();
        let mut endpoints: Vec<Endpoint> = Vec::new();
        // alias key and the container id whose entry leaves with it
        let mut to_drop: Vec<(String, String)> = Vec::new();

        for name in &names {
            let Some(scope) = scopes.get_mut(name) else {
                return Err(NetworkError::NotFound { id: format!("network {}", name) });
            };

            // aliases other containers declared toward this one stop resolving
            for other in scope.endpoints() {
                if other.container_id() == con.id() {
                    continue;
                }
                for a in other.get_aliases(con.name()) {
                    to_drop.push((a.scoped_name(), other.container_id().to_string()));
                }
            }

            let ep = scope.remove_container(&con)?;

            if let Some(ne) = h.network_mut(name) {
                ne.assigned = None;
                if !ne.static_ip {
                    ne.ip = None;
                }
            }

            to_drop.push((format!("{}:{}", name, con.name()), con.id().to_string()));
            to_drop.push((format!("{}:{}", name, con.short_id()), con.id().to_string()));
            for entries in ep.aliases().values() {
                for a in entries {
                    to_drop.push((a.scoped_name(), con.id().to_string()));
                }
            }

            endpoints.push(ep);
        }

        for (key, cid) in to_drop {
            if let Some(list) = alias_index.get_mut(&key) {
                if let Some(i) = list.iter().position(|c| c.id() == cid) {
                    list.remove(i);
                }
                if list.is_empty() {
                    alias_index.remove(&key);
                }
            }
        }

        containers.remove(con.id());
        containers.remove(con.short_id());
        containers.remove(con.name());

        counter!("moornet.context.container.unbind").increment(1);
        info!("unbound container {}", con.name());
        Ok(Some(endpoints))
    }

    /// Direct container lookup by long UID, short UID, or name.
    pub fn container(&self, key: &str) -> Option<Container> {
        let st = self.state.lock().unwrap();
        st.containers.get(key).map(|c| (**c).clone())
    }

    /// The containers answering a scoped alias.
    pub fn containers_by_alias(&self, alias: &str) -> Vec<Container> {
        let st = self.state.lock().unwrap();
        st.aliases
            .get(alias)
            .map(|list| list.iter().map(|c| (**c).clone()).collect())
            .unwrap_or_default()
    }

    /// The endpoint holding a given address, scanning scopes in name order.
    pub fn container_by_addr(&self, addr: Ipv4Addr) -> Option<Endpoint> {
        let st = self.state.lock().unwrap();
        let mut names: Vec<&String> = st.scopes.keys().collect();
        names.sort();
        for name in names {
            if let Some(ep) = st.scopes[name].container_by_addr(addr) {
                return Some(ep.clone());
            }
        }
        None
    }

    /// A container's endpoint on one scope, by any of its three index keys.
    pub fn container_endpoint(&self, key: &str, scope: &str) -> Option<Endpoint> {
        let st = self.state.lock().unwrap();
        let con = st.containers.get(key)?;
        let name = Self::resolve_scope(&st, scope).ok()?;
        st.scopes.get(&name)?.endpoint(con.id()).cloned()
    }

    /// All endpoints of a container, by any of its three index keys.
    pub fn container_endpoints_of(&self, key: &str) -> Vec<Endpoint> {
        let st = self.state.lock().unwrap();
        match st.containers.get(key) {
            Some(con) => {
                let id = con.id().to_string();
                Self::container_endpoints(&st, &id)
            }
            None => Vec::new(),
        }
    }

    fn container_endpoints(st: &State, id: &str) -> Vec<Endpoint> {
        let mut names: Vec<&String> = st.scopes.keys().collect();
        names.sort();
        names.iter().filter_map(|n| st.scopes[*n].endpoint(id).cloned()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MockBridgeLink;
    use crate::device::{MockHypervisor, PortGroup};
    use std::collections::HashMap;

    fn test_config() -> (Configuration, Arc<MockBridgeLink>, Arc<MockHypervisor>) {
        let link = Arc::new(MockBridgeLink::new("vbr0"));
        let hv = Arc::new(MockHypervisor::new());

        let mut container_networks = HashMap::new();
        let mut bn = ContainerNetwork::new("bridge", ScopeType::Bridge);
        bn.gateway = Some("10.10.10.1/24".parse().unwrap());
        container_networks.insert("bridge".to_string(), bn);

        let mut port_groups = HashMap::new();
        port_groups.insert("bridge".to_string(), PortGroup::new("bridge", "pg-bridge"));

        let config = Configuration {
            bridge_ip_range: Some("172.16.0.0/12".parse().unwrap()),
            bridge_network_width: Some(16),
            bridge_network: "bridge".to_string(),
            container_networks,
            port_groups,
            bridge_link: link.clone(),
            hypervisor: hv.clone(),
        };
        (config, link, hv)
    }

    #[test]
    fn test_construction_requires_bridge_network() {
        let (mut config, _, _) = test_config();
        config.container_networks.clear();
        let err = Context::new(config, None).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidConfig { .. }));
    }

    #[test]
    fn test_construction_rejects_incompatible_mask() {
        let (mut config, _, _) = test_config();
        config.bridge_network_width = Some(8); // wider than the /12 pool
        let err = Context::new(config, None).unwrap_err();
        assert!(matches!(err, NetworkError::BridgeMaskIncompatible));
    }

    #[test]
    fn test_builtin_bridge_scope() {
        let (config, link, _) = test_config();
        let ctx = Context::new(config, None).unwrap();

        let scope = ctx.default_scope();
        assert_eq!(scope.name(), "bridge");
        assert!(scope.builtin());
        assert_eq!(scope.subnet(), Some("10.10.10.0/24".parse().unwrap()));
        assert_eq!(scope.gateway(), Some("10.10.10.1".parse().unwrap()));
        assert_eq!(link.addresses(), vec!["10.10.10.1/24".parse().unwrap()]);
    }

    #[test]
    fn test_scope_name_resolution() {
        let (config, _, _) = test_config();
        let ctx = Context::new(config, None).unwrap();
        let scope = ctx.new_scope(ScopeData::new(ScopeType::Bridge, "net1")).unwrap();

        // by name, by full id, by id prefix, and via "default"
        assert_eq!(ctx.scopes(Some("net1")).unwrap()[0].name(), "net1");
        assert_eq!(ctx.scopes(Some(scope.id())).unwrap()[0].name(), "net1");
        assert_eq!(ctx.scopes(Some(&scope.id()[..8])).unwrap()[0].name(), "net1");
        assert_eq!(ctx.scopes(Some("default")).unwrap()[0].name(), "bridge");

        assert!(ctx.scopes(Some("missing")).unwrap_err().is_not_found());

        let all = ctx.scopes(None).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_new_scope_duplicate_name() {
        let (config, _, _) = test_config();
        let ctx = Context::new(config, None).unwrap();
        ctx.new_scope(ScopeData::new(ScopeType::Bridge, "net1")).unwrap();
        let err = ctx.new_scope(ScopeData::new(ScopeType::Bridge, "net1")).unwrap_err();
        assert!(err.is_duplicate());
    }

    #[test]
    fn test_new_scope_empty_name() {
        let (config, _, _) = test_config();
        let ctx = Context::new(config, None).unwrap();
        let err = ctx.new_scope(ScopeData::new(ScopeType::Bridge, "")).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidConfig { .. }));
    }

    #[test]
    fn test_external_scope_requires_subnet_with_pools() {
        let (config, _, _) = test_config();
        let ctx = Context::new(config, None).unwrap();

        let mut data = ScopeData::new(ScopeType::External, "ext");
        data.pools = vec!["192.168.1.10-192.168.1.20".parse().unwrap()];
        let err = ctx.new_scope(data).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidConfig { .. }));
    }

    #[test]
    fn test_external_scope_cannot_overlap_bridge_pool() {
        let (mut config, _, _) = test_config();
        config
            .port_groups
            .insert("ext".to_string(), PortGroup::new("ext", "pg-ext"));
        let ctx = Context::new(config, None).unwrap();

        let mut data = ScopeData::new(ScopeType::External, "ext");
        data.subnet = Some("172.20.0.0/16".parse().unwrap());
        data.gateway = Some("172.20.0.1".parse().unwrap());
        let err = ctx.new_scope(data).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidConfig { .. }));
    }

    #[test]
    fn test_gateway_must_be_routable() {
        let (config, _, _) = test_config();
        let ctx = Context::new(config, None).unwrap();

        let mut data = ScopeData::new(ScopeType::Bridge, "net1");
        data.subnet = Some("172.16.0.0/16".parse().unwrap());
        data.gateway = Some("172.17.0.1".parse().unwrap());
        let err = ctx.new_scope(data).unwrap_err();
        assert!(matches!(err, NetworkError::GatewayNotRoutable { .. }));
    }
}
