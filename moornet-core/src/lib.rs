//! moornet core library.
//!
//! The in-memory control plane for container networking on the moornet
//! container host: named network scopes with their own IPAM, container
//! binding, alias resolution, and write-through persistence of scope
//! definitions to an external key/value store.

pub mod address_space;
pub mod bridge;
pub mod config;
pub mod container;
pub mod context;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod ip;
pub mod kv;
pub mod scope;

// Re-export commonly used items
pub use address_space::AddressSpace;
pub use bridge::{BridgeLink, MockBridgeLink};
pub use config::{
    Configuration, ContainerNetwork, DEFAULT_BRIDGE_NAME, DEFAULT_BRIDGE_RANGE,
    DEFAULT_BRIDGE_WIDTH,
};
pub use container::Container;
pub use context::{AddContainerOptions, Context};
pub use device::{
    DeviceChange, DeviceOperation, Handle, Hypervisor, MockHypervisor, NetworkEndpoint, PortGroup,
    VirtualNic,
};
pub use endpoint::{parse_port, Alias, Endpoint, Port, Protocol};
pub use error::{NetworkError, Result};
pub use ip::PoolEntry;
pub use kv::{KvStore, MemoryKv};
pub use scope::{Scope, ScopeData, ScopeType, TrustLevel};
