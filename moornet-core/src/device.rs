//! Virtual NIC staging on an in-flight container configuration.
//!
//! A `Handle` is owned by the calling request and accumulates the device-change
//! operations and network endpoint declarations for a container until it is
//! realized. The context never talks to the hypervisor directly; it emits
//! ordered device changes onto the handle and resolves NIC backings through the
//! injected [`Hypervisor`] capability.

use crate::error::{NetworkError, Result};
use crate::ip::PoolEntry;
use crate::scope::{ScopeType, TrustLevel};
use ipnet::Ipv4Net;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// First PCI slot usable for container NICs.
pub const PCI_SLOT_BEGIN: i32 = 0xc0;
/// One past the last usable PCI slot.
pub const PCI_SLOT_END: i32 = 1 << 10;
/// Distance between consecutive NIC slots.
pub const PCI_SLOT_STEP: i32 = 1 << 5;

/// Device kind synthesized for container NICs.
pub const ETHERNET_CARD_KIND: &str = "vmxnet3";

/// Opaque reference to a backing network (port group) on the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortGroup {
    /// Port group name, matched against configuration on scope restore.
    pub name: String,
    /// Hypervisor-side identifier of the port group.
    pub id: String,
}

impl PortGroup {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self { name: name.into(), id: id.into() }
    }
}

/// Hypervisor client capability.
///
/// The real implementation talks to the virtualization platform; tests use
/// [`MockHypervisor`].
pub trait Hypervisor: Send + Sync {
    /// Backing descriptor for an ethernet card attached to the given port group.
    fn ethernet_card_backing(&self, network: &PortGroup) -> Result<String>;

    /// The address a running container currently holds on the given scope, as
    /// reported by the guest. Used to refresh endpoints on dynamic scopes.
    fn current_address(&self, container_id: &str, scope_name: &str) -> Option<Ipv4Net>;
}

/// Hypervisor with deterministic backings and scripted guest addresses.
#[derive(Debug, Default)]
pub struct MockHypervisor {
    addresses: Mutex<HashMap<(String, String), Ipv4Net>>,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the guest-reported address for a container on a scope.
    pub fn set_current_address(&self, container_id: &str, scope_name: &str, addr: Ipv4Net) {
        let mut addresses = self.addresses.lock().unwrap();
        addresses.insert((container_id.to_string(), scope_name.to_string()), addr);
    }
}

impl Hypervisor for MockHypervisor {
    fn ethernet_card_backing(&self, network: &PortGroup) -> Result<String> {
        Ok(network.id.clone())
    }

    fn current_address(&self, container_id: &str, scope_name: &str) -> Option<Ipv4Net> {
        let addresses = self.addresses.lock().unwrap();
        addresses.get(&(container_id.to_string(), scope_name.to_string())).copied()
    }
}

/// Whether a device change adds or removes the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOperation {
    Add,
    Remove,
}

/// A virtual NIC as staged on a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualNic {
    pub kind: String,
    pub backing: String,
    pub label: String,
    pub slot: Option<i32>,
}

/// One entry of the ordered device-change list on a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceChange {
    pub op: DeviceOperation,
    pub device: VirtualNic,
}

/// The network half of a staged endpoint declaration.
#[derive(Debug, Clone)]
pub struct ContainerNetworkInfo {
    pub name: String,
    pub aliases: Vec<String>,
    pub scope_type: ScopeType,
    pub trust_level: TrustLevel,
    pub pools: Vec<PoolEntry>,
    pub gateway: Option<Ipv4Net>,
    pub nameservers: Vec<Ipv4Addr>,
    pub default: bool,
}

/// A staged network endpoint declaration on a handle.
///
/// `id` is the decimal PCI slot of the NIC serving the endpoint; endpoints on
/// different bridge scopes may share one NIC and therefore one id.
#[derive(Debug, Clone)]
pub struct NetworkEndpoint {
    pub id: String,
    pub network: ContainerNetworkInfo,
    pub static_ip: bool,
    pub ip: Option<Ipv4Net>,
    pub assigned: Option<Ipv4Addr>,
    pub ports: Vec<String>,
}

/// An in-flight container configuration.
#[derive(Debug, Clone)]
pub struct Handle {
    id: String,
    name: String,
    networks: HashMap<String, NetworkEndpoint>,
    device_changes: Vec<DeviceChange>,
}

impl Handle {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            networks: HashMap::new(),
            device_changes: Vec::new(),
        }
    }

    /// Container UID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Container name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The staged endpoint declaration for a scope, if any.
    pub fn network(&self, scope_name: &str) -> Option<&NetworkEndpoint> {
        self.networks.get(scope_name)
    }

    /// All staged endpoint declarations, keyed by scope name.
    pub fn networks(&self) -> &HashMap<String, NetworkEndpoint> {
        &self.networks
    }

    /// Ordered device changes staged so far.
    pub fn device_changes(&self) -> &[DeviceChange] {
        &self.device_changes
    }

    /// Mutable access to a staged endpoint declaration. The handle is owned by
    /// the calling request; recovery flows use this to seed `assigned` with the
    /// address a running container already holds.
    pub fn network_mut(&mut self, scope_name: &str) -> Option<&mut NetworkEndpoint> {
        self.networks.get_mut(scope_name)
    }

    pub(crate) fn insert_network(&mut self, ne: NetworkEndpoint) {
        self.networks.insert(ne.network.name.clone(), ne);
    }

    pub(crate) fn remove_network(&mut self, scope_name: &str) -> Option<NetworkEndpoint> {
        self.networks.remove(scope_name)
    }

    /// Scope names of the staged endpoints, sorted for deterministic iteration.
    pub(crate) fn sorted_network_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.networks.keys().cloned().collect();
        names.sort();
        names
    }

    /// PCI slots in use by staged endpoints and pending device adds.
    fn used_slots(&self) -> HashSet<i32> {
        let mut slots: HashSet<i32> = self
            .networks
            .values()
            .filter_map(|ne| ne.id.parse::<i32>().ok())
            .filter(|slot| *slot != 0)
            .collect();
        for change in &self.device_changes {
            if change.op == DeviceOperation::Add {
                if let Some(slot) = change.device.slot {
                    slots.insert(slot);
                }
            }
        }
        slots
    }
}

/// Pick the lowest unused PCI slot in the NIC window.
fn assign_slot(used: &HashSet<i32>) -> Result<i32> {
    let mut slot = PCI_SLOT_BEGIN;
    while slot < PCI_SLOT_END {
        if !used.contains(&slot) {
            return Ok(slot);
        }
        slot += PCI_SLOT_STEP;
    }
    Err(NetworkError::NoFreeSlots)
}

/// Find or synthesize the NIC serving `network` on the handle and return its
/// PCI slot. A pending add for the same backing is reused; otherwise a new
/// ethernet card is staged with the next free slot.
pub(crate) fn add_ethernet_card(
    h: &mut Handle,
    scope_name: &str,
    network: &PortGroup,
    hypervisor: &dyn Hypervisor,
) -> Result<i32> {
    let backing = hypervisor.ethernet_card_backing(network)?;

    let pending = h
        .device_changes
        .iter()
        .position(|c| c.op == DeviceOperation::Add && c.device.backing == backing);

    if let Some(i) = pending {
        if let Some(slot) = h.device_changes[i].device.slot {
            return Ok(slot);
        }
        let slot = assign_slot(&h.used_slots())?;
        h.device_changes[i].device.slot = Some(slot);
        return Ok(slot);
    }

    let slot = assign_slot(&h.used_slots())?;
    let device = VirtualNic {
        kind: ETHERNET_CARD_KIND.to_string(),
        backing,
        label: scope_name.to_string(),
        slot: Some(slot),
    };
    h.device_changes.push(DeviceChange { op: DeviceOperation::Add, device });
    Ok(slot)
}

/// Stage removal of the NIC serving `network` on the handle.
pub(crate) fn remove_ethernet_card(
    h: &mut Handle,
    scope_name: &str,
    network: &PortGroup,
    hypervisor: &dyn Hypervisor,
    slot: Option<i32>,
) -> Result<()> {
    let backing = hypervisor.ethernet_card_backing(network)?;
    let device = VirtualNic {
        kind: ETHERNET_CARD_KIND.to_string(),
        backing,
        label: scope_name.to_string(),
        slot,
    };
    h.device_changes.push(DeviceChange { op: DeviceOperation::Remove, device });
    Ok(())
}
