//! Container endpoints: a container's point of attachment to a scope.
//!
//! An endpoint carries the container's address on the scope, its exposed ports,
//! and the alias entries the container declared on that scope. Alias entries
//! resolve through their scoped name, `"{scope}:{who}.{what}"`; that format is
//! load-bearing for DNS resolution downstream.

use crate::container::Container;
use crate::error::{NetworkError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use tracing::debug;

/// Transport protocol of an exposed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(NetworkError::MalformedPort { spec: s.to_string() }),
        }
    }
}

/// An exposed container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Port {
    pub protocol: Protocol,
    pub number: u16,
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.number, self.protocol)
    }
}

/// Parse a `"{num}/{proto}"` port. The protocol defaults to tcp when omitted.
pub fn parse_port(s: &str) -> Result<Port> {
    let (num, proto) = match s.split_once('/') {
        Some((num, proto)) => (num, proto.parse::<Protocol>()?),
        None => (s, Protocol::Tcp),
    };
    let number =
        num.parse::<u16>().map_err(|_| NetworkError::MalformedPort { spec: s.to_string() })?;
    if number == 0 {
        return Err(NetworkError::MalformedPort { spec: s.to_string() });
    }
    Ok(Port { protocol: proto, number })
}

/// Normalize docker-style port specs down to the container-side ports.
///
/// Accepted forms: `"80"`, `"80/udp"`, `"8080:80"`, `"8080:80/udp"`, and
/// `"1.2.3.4:8080:80[/proto]"`. The host side is discarded here; only the
/// container port and protocol are recorded on the endpoint.
pub(crate) fn parse_port_specs(specs: &[String]) -> Result<Vec<Port>> {
    let mut ports = Vec::new();
    for spec in specs {
        let parts: Vec<&str> = spec.split(':').collect();
        if parts.len() > 3 || parts.iter().any(|p| p.is_empty() && parts.len() != 3) {
            return Err(NetworkError::MalformedPort { spec: spec.clone() });
        }

        let Some(container) = parts.last() else {
            return Err(NetworkError::MalformedPort { spec: spec.clone() });
        };
        let port = parse_port(container)?;

        // validate the host side even though it is dropped
        if parts.len() >= 2 {
            let host = parts[parts.len() - 2];
            if !host.is_empty() {
                host.parse::<u16>()
                    .map_err(|_| NetworkError::MalformedPort { spec: spec.clone() })?;
            }
        }

        if !ports.contains(&port) {
            ports.push(port);
        }
    }
    Ok(ports)
}

/// Parse a declared `"who:what"` alias. Exactly one `:` is required; an empty
/// `who` refers to the declaring container itself.
pub(crate) fn parse_alias(s: &str) -> Result<(&str, &str)> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 2 {
        return Err(NetworkError::MalformedAlias { alias: s.to_string() });
    }
    Ok((parts[0], parts[1]))
}

/// A declared alias entry on an endpoint.
///
/// `who` is the container from whose viewpoint the alias exists, `what` the
/// name it resolves; the endpoint's own container answers the name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    pub scope: String,
    pub who: String,
    pub what: String,
}

impl Alias {
    /// The unique resolution key for this alias within its scope.
    pub fn scoped_name(&self) -> String {
        format!("{}:{}.{}", self.scope, self.who, self.what)
    }
}

/// A container's presence on a scope.
#[derive(Debug, Clone)]
pub struct Endpoint {
    container_id: String,
    container_name: String,
    scope_name: String,
    ip: Option<Ipv4Addr>,
    static_ip: bool,
    ports: Vec<Port>,
    aliases: HashMap<String, Vec<Alias>>,
    revealed: bool,
}

impl Endpoint {
    pub(crate) fn new(
        con: &Container,
        scope_name: impl Into<String>,
        ip: Option<Ipv4Addr>,
        static_ip: bool,
    ) -> Self {
        Self {
            container_id: con.id().to_string(),
            container_name: con.name().to_string(),
            scope_name: scope_name.into(),
            ip,
            static_ip,
            ports: Vec::new(),
            aliases: HashMap::new(),
            revealed: false,
        }
    }

    /// UID of the container attached through this endpoint.
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Name of the container attached through this endpoint.
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Name of the scope this endpoint is attached to.
    pub fn scope_name(&self) -> &str {
        &self.scope_name
    }

    /// The endpoint's address, if one is assigned.
    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.ip
    }

    /// True when the address was declared by the caller rather than allocated.
    pub fn is_static(&self) -> bool {
        self.static_ip
    }

    /// Exposed container ports.
    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    /// True when the endpoint's ports have been revealed to the network by the
    /// firewall surface.
    pub fn revealed(&self) -> bool {
        self.revealed
    }

    /// Declared alias entries, keyed by the `who` side.
    pub fn aliases(&self) -> &HashMap<String, Vec<Alias>> {
        &self.aliases
    }

    /// Alias entries declared for a given `who`.
    pub fn get_aliases(&self, who: &str) -> &[Alias] {
        self.aliases.get(who).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn set_ip(&mut self, ip: Option<Ipv4Addr>) {
        self.ip = ip;
    }

    /// Idempotently record an exposed port.
    pub(crate) fn add_port(&mut self, port: Port) {
        if !self.ports.contains(&port) {
            self.ports.push(port);
        }
    }

    /// Record an alias entry. Returns `None` for an unusable alias (empty side),
    /// otherwise the entry and whether it was already present.
    pub(crate) fn add_alias(&mut self, who: &str, what: &str) -> Option<(Alias, bool)> {
        if who.is_empty() || what.is_empty() {
            debug!("ignoring empty alias {}:{} on scope {}", who, what, self.scope_name);
            return None;
        }

        let alias =
            Alias { scope: self.scope_name.clone(), who: who.to_string(), what: what.to_string() };
        let entries = self.aliases.entry(who.to_string()).or_default();
        if entries.contains(&alias) {
            return Some((alias, true));
        }
        entries.push(alias.clone());
        Some((alias, false))
    }
}
