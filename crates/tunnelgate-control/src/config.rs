//! Coordinator configuration

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Default WireGuard keepalive written into client configs (seconds)
pub const DEFAULT_KEEPALIVE_SECS: u16 = 25;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Range peers are addressed from; network + 1 belongs to the server
    pub address_range: Ipv4Net,

    /// `host:port` clients dial to reach the WireGuard interface
    pub server_endpoint: String,

    /// Seeded into settings at startup when present
    pub base_domain: Option<String>,

    pub keepalive_secs: u16,
}

impl CoordinatorConfig {
    pub fn new(address_range: Ipv4Net, server_endpoint: impl Into<String>) -> Self {
        Self {
            address_range: address_range.trunc(),
            server_endpoint: server_endpoint.into(),
            base_domain: None,
            keepalive_secs: DEFAULT_KEEPALIVE_SECS,
        }
    }

    pub fn with_base_domain(mut self, domain: impl Into<String>) -> Self {
        self.base_domain = Some(domain.into());
        self
    }

    pub fn with_keepalive(mut self, secs: u16) -> Self {
        self.keepalive_secs = secs;
        self
    }

    /// The server's own interface address (network + 1)
    pub fn server_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address_range.network()).wrapping_add(1))
    }
}
