//! Live network-interface peer table
//!
//! Mutations through these drivers are NOT transactional with the peer
//! records; callers serialize them per interface and rely on reconciliation
//! to repair drift.

mod memory;
mod wg;

pub use memory::MemoryInterfaceDriver;
pub use wg::{parse_dump, WgCommandDriver};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::Ipv4Addr;
use thiserror::Error;

use crate::exec::ExecError;

/// Errors from the interface driver
#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error("network command failed: {0}")]
    Command(#[from] ExecError),

    #[error("peer {0} is not present on the interface")]
    PeerNotFound(String),

    #[error("unexpected interface output: {0}")]
    Parse(String),
}

/// A peer as currently bound on the live interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LivePeer {
    pub public_key: String,
    pub allowed_ips: Vec<String>,
    pub endpoint: Option<String>,
    /// `None` if the peer never completed a handshake
    pub last_handshake: Option<DateTime<Utc>>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl LivePeer {
    /// IPv4 addresses bound to this peer (`/32` allowed-ips only)
    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.allowed_ips.iter().filter_map(|cidr| {
            let (addr, prefix) = cidr.split_once('/').unwrap_or((cidr.as_str(), "32"));
            if prefix == "32" {
                addr.parse().ok()
            } else {
                None
            }
        })
    }
}

/// Capability interface over one WireGuard interface
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait InterfaceDriver: Send + Sync {
    /// Bind `public_key` to `address/32` on the interface
    async fn apply_peer(&self, public_key: &str, address: Ipv4Addr) -> Result<(), InterfaceError>;

    /// Remove `public_key` from the interface; `PeerNotFound` if it is not bound
    async fn retract_peer(&self, public_key: &str) -> Result<(), InterfaceError>;

    /// Snapshot of every peer bound on the interface
    async fn list_peers(&self) -> Result<Vec<LivePeer>, InterfaceError>;

    /// Whether the interface exists and is expected to carry peers
    async fn is_up(&self) -> Result<bool, InterfaceError>;
}
