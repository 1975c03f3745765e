use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tunnelgate_control::{OrphanedPeer, ReconcileReport, TunnelView};
use tunnelgate_db::entities::{peer, tunnel};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

/// Register a new client
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegisterRequest {
    /// Human label for the client
    pub name: String,
}

/// A registered client (WireGuard peer)
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Client {
    pub id: Uuid,
    pub name: String,
    /// Base64 WireGuard public key
    pub public_key: String,
    /// VPN address assigned to the client
    pub assigned_address: String,
    pub created_at: DateTime<Utc>,
    /// Latest handshake seen on the interface
    pub last_seen: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl From<peer::Model> for Client {
    fn from(model: peer::Model) -> Self {
        Self {
            id: model.id,
            name: model.name,
            public_key: model.public_key,
            assigned_address: model.address,
            created_at: model.created_at,
            last_seen: model.last_seen,
            is_active: model.is_active,
        }
    }
}

/// Registration result; the private key is not stored and cannot be fetched again
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegisterResponse {
    pub peer: Client,
    /// Ready-to-use WireGuard configuration for the client
    pub interface_config: String,
    /// Client private key (base64)
    pub private_key: String,
}

/// List of clients
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ClientList {
    pub clients: Vec<Client>,
    pub total: usize,
}

/// Activate or deactivate a client
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateClientStatusRequest {
    pub is_active: bool,
}

/// Tunnel status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    /// Route provisioned and serving
    Active,
    /// Closed or replaced
    Closed,
    /// Route provisioning failed
    Error,
}

impl From<tunnel::TunnelStatus> for TunnelStatus {
    fn from(status: tunnel::TunnelStatus) -> Self {
        match status {
            tunnel::TunnelStatus::Active => TunnelStatus::Active,
            tunnel::TunnelStatus::Closed => TunnelStatus::Closed,
            tunnel::TunnelStatus::Error => TunnelStatus::Error,
        }
    }
}

/// Tunnel information
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Tunnel {
    pub id: Uuid,
    /// Owning client
    pub peer_id: Uuid,
    /// Port the client serves on its VPN address
    pub local_port: u16,
    pub subdomain: String,
    /// Public URL accessible from internet
    pub public_url: String,
    pub status: TunnelStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub request_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<TunnelView> for Tunnel {
    fn from(view: TunnelView) -> Self {
        let t = view.tunnel;
        Self {
            id: t.id,
            peer_id: t.peer_id,
            local_port: u16::try_from(t.local_port).unwrap_or_default(),
            subdomain: t.subdomain,
            public_url: view.public_url,
            status: t.status.into(),
            started_at: t.started_at,
            ended_at: t.ended_at,
            bytes_in: t.bytes_in,
            bytes_out: t.bytes_out,
            request_count: t.request_count,
            error_message: t.error_message,
        }
    }
}

/// Create a tunnel for a client, replacing its current one
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateTunnelRequest {
    pub peer_id: Uuid,
    /// Port the client serves on
    pub local_port: u16,
    /// Requested subdomain; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateTunnelResponse {
    pub tunnel: Tunnel,
}

/// List of tunnels
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TunnelList {
    pub tunnels: Vec<Tunnel>,
    pub total: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TunnelListQuery {
    /// Include closed and errored tunnels
    #[serde(default)]
    pub all: Option<bool>,
}

/// A live peer no record accounted for
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrphanedPeerInfo {
    pub public_key: String,
    pub allowed_ips: Vec<String>,
    pub retracted: bool,
}

impl From<OrphanedPeer> for OrphanedPeerInfo {
    fn from(orphan: OrphanedPeer) -> Self {
        Self {
            public_key: orphan.public_key,
            allowed_ips: orphan.allowed_ips,
            retracted: orphan.retracted,
        }
    }
}

/// Outcome of a reconcile or reset pass
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReconcileResponse {
    /// Corrective actions taken
    pub repaired: Vec<String>,
    pub orphaned: Vec<OrphanedPeerInfo>,
    /// Steps that failed; the pass continued past them
    pub failures: Vec<String>,
}

impl From<ReconcileReport> for ReconcileResponse {
    fn from(report: ReconcileReport) -> Self {
        Self {
            repaired: report.repaired.iter().map(ToString::to_string).collect(),
            orphaned: report.orphaned.into_iter().map(Into::into).collect(),
            failures: report.failures,
        }
    }
}

/// Base domain tunnels are published under
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DomainSettings {
    pub base_domain: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateDomainRequest {
    pub base_domain: String,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Database reachability
    pub database: String,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}
