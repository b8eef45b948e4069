//! Error types for the network context.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.
//! Callers distinguish two kinds structurally: duplicates (the operation already
//! happened) and not-found (the operation referenced something that does not exist).

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Result type alias for network context operations.
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Main error type for the network context.
#[derive(Error, Debug)]
pub enum NetworkError {
    // Identifiable kinds
    #[error("duplicate resource: {id}")]
    Duplicate { id: String },

    #[error("resource not found: {id}")]
    NotFound { id: String },

    #[error("key not found: {key}")]
    KeyNotFound { key: String },

    // Address space errors
    #[error("address {ip} is already reserved")]
    AddressInUse { ip: Ipv4Addr },

    #[error("address {ip} is out of range")]
    AddressOutOfRange { ip: Ipv4Addr },

    #[error("address {ip} is not reserved")]
    AddressNotReserved { ip: Ipv4Addr },

    #[error("range {first}-{last} is not available")]
    RangeUnavailable { first: Ipv4Addr, last: Ipv4Addr },

    #[error("IP address pool exhausted")]
    PoolExhausted,

    #[error("invalid pool: {pool}")]
    InvalidPool { pool: String },

    // Scope errors
    #[error("subnet {subnet} overlaps with scope {scope} subnet {other}")]
    SubnetOverlap { subnet: Ipv4Net, scope: String, other: Ipv4Net },

    #[error("gateway address {gateway} is not routable on network {subnet}")]
    GatewayNotRoutable { gateway: Ipv4Addr, subnet: Ipv4Net },

    #[error("bridge mask is not compatible with bridge pool mask")]
    BridgeMaskIncompatible,

    #[error("cannot remove builtin scope {name}")]
    BuiltinScope { name: String },

    #[error("scope {name} has active endpoints")]
    ActiveEndpoints { name: String },

    #[error("scope {id} matches multiple scopes: {matches}")]
    AmbiguousScope { id: String, matches: String },

    // Container binding errors
    #[error("container {id} is bound")]
    ContainerBound { id: String },

    #[error("container can only be added to at most one mapped network")]
    OneExternalNetwork,

    #[error("external scope includes a port mapping ({port})")]
    PortMappingOnExternal { port: String },

    #[error("ports cannot be published via the closed container network firewall")]
    ClosedFirewall,

    #[error("malformed port specification: {spec}")]
    MalformedPort { spec: String },

    #[error("failed to parse network alias {alias}")]
    MalformedAlias { alias: String },

    #[error("no available PCI slot for network device")]
    NoFreeSlots,

    // Bridge link errors
    #[error("address {addr} already assigned to bridge link")]
    AddrExists { addr: Ipv4Net },

    #[error("address {addr} not assigned to bridge link")]
    AddrNotPresent { addr: Ipv4Net },

    // Configuration errors
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Generic errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl NetworkError {
    /// True when the operation failed because the resource already exists.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, NetworkError::Duplicate { .. })
    }

    /// True when the operation referenced a resource that does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, NetworkError::NotFound { .. })
    }

    /// True when a key/value lookup missed.
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, NetworkError::KeyNotFound { .. })
    }

    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }
}
