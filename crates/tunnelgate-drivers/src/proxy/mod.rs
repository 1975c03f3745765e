//! Reverse-proxy route artifacts
//!
//! One artifact per tunnel, keyed by tunnel id. Artifacts are always derived
//! from a [`RouteSpec`]; nothing here is authoritative.

mod memory;
mod nginx;

pub use memory::MemoryProxyDriver;
pub use nginx::{render_server_block, NginxDriver};

use async_trait::async_trait;
use std::net::SocketAddrV4;
use std::path::PathBuf;
use thiserror::Error;

use crate::exec::ExecError;

/// Errors from the proxy driver
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to write route artifact {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove route artifact {path}: {source}")]
    RemoveFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to list route artifacts in {path}: {source}")]
    ListFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The previous configuration stays loaded
    #[error("proxy reload failed: {0}")]
    ReloadFailed(#[source] ExecError),
}

/// Everything a route artifact is generated from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub tunnel_id: String,
    /// Fully-qualified public host (`subdomain.base-domain`)
    pub host: String,
    /// Peer address and the port the client serves
    pub target: SocketAddrV4,
}

/// Capability interface over the external reverse proxy
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait ProxyDriver: Send + Sync {
    /// Write (or overwrite) the artifact for `route.tunnel_id`
    async fn write_route(&self, route: &RouteSpec) -> Result<(), ProxyError>;

    /// Remove the artifact for `tunnel_id`; succeeds if it is already absent
    async fn remove_route(&self, tunnel_id: &str) -> Result<(), ProxyError>;

    /// Tunnel ids that currently have an artifact
    async fn list_routes(&self) -> Result<Vec<String>, ProxyError>;

    /// Make the proxy pick up the current set of artifacts
    async fn reload(&self) -> Result<(), ProxyError>;
}
