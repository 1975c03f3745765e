//! Lifecycle coordinator for WireGuard peers and their reverse-proxy tunnels
//!
//! Keeps three independently owned stores consistent:
//! - the live interface peer table (through [`tunnelgate_drivers::InterfaceDriver`])
//! - the peer/tunnel/settings records (SeaORM)
//! - the generated proxy routes (through [`tunnelgate_drivers::ProxyDriver`])
//!
//! Request paths keep them in step as far as external tools allow; the
//! [`reconciler`] repairs whatever drift remains after failures or restarts.

pub mod allocator;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod peers;
pub mod reconciler;
pub mod routes;
pub mod settings;
pub mod stats;
pub mod subdomain;
pub mod tunnels;

pub use allocator::{AddressAllocator, AddressPool};
pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use error::{ControlError, ErrorKind, Result};
pub use peers::{PeerController, PendingRegistration, Registration};
pub use reconciler::{OrphanedPeer, ReconcileReport, Reconciler, Repair};
pub use routes::RouteProvisioner;
pub use settings::Settings;
pub use stats::{StatsSummary, StatsSync};
pub use subdomain::{RandomSubdomainPolicy, SubdomainPolicy};
pub use tunnels::{TunnelManager, TunnelView};
