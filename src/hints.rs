//! Root hints table.
//!
//! The fixed set of well-known root server addresses that seeds every
//! iterative resolution. Loaded once at startup and never mutated.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::config::DNS_PORT;
use crate::errors::DnsError;

/// IANA root server addresses, a.root-servers.net through m.root-servers.net.
const ROOT_SERVERS: [Ipv4Addr; 13] = [
    Ipv4Addr::new(198, 41, 0, 4),
    Ipv4Addr::new(199, 9, 14, 201),
    Ipv4Addr::new(192, 33, 4, 12),
    Ipv4Addr::new(199, 7, 91, 13),
    Ipv4Addr::new(192, 203, 230, 10),
    Ipv4Addr::new(192, 5, 5, 241),
    Ipv4Addr::new(192, 112, 36, 4),
    Ipv4Addr::new(198, 97, 190, 53),
    Ipv4Addr::new(192, 36, 148, 17),
    Ipv4Addr::new(192, 58, 128, 30),
    Ipv4Addr::new(193, 0, 14, 129),
    Ipv4Addr::new(199, 7, 83, 42),
    Ipv4Addr::new(202, 12, 27, 33),
];

/// The built-in root server list, in hint order.
pub fn builtin_roots() -> Vec<SocketAddr> {
    ROOT_SERVERS
        .iter()
        .map(|ip| SocketAddr::new(IpAddr::V4(*ip), DNS_PORT))
        .collect()
}

/// Parse a comma-separated root hints override.
///
/// Each entry is either a full socket address or a bare IP address, which
/// gets the standard DNS port. An empty or unparseable list is a fatal
/// configuration error.
pub fn parse_hints(list: &str) -> Result<Vec<SocketAddr>, DnsError> {
    let mut servers = Vec::new();
    for entry in list.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if let Ok(addr) = entry.parse::<SocketAddr>() {
            servers.push(addr);
        } else if let Ok(ip) = entry.parse::<IpAddr>() {
            servers.push(SocketAddr::new(ip, DNS_PORT));
        } else {
            return Err(DnsError::Config(format!("Invalid root hint: {}", entry)));
        }
    }
    if servers.is_empty() {
        return Err(DnsError::Config("Root hints list is empty".into()));
    }
    Ok(servers)
}

/// The root server table handed to the resolution engine.
#[derive(Debug, Clone)]
pub struct RootHints {
    servers: Vec<SocketAddr>,
}

impl RootHints {
    pub fn new(servers: Vec<SocketAddr>) -> Self {
        Self { servers }
    }

    /// The seed servers for iterative resolution, in fixed order.
    pub fn roots(&self) -> &[SocketAddr] {
        &self.servers
    }
}
