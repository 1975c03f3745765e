//! Tunnel entity: a public subdomain routed to a peer's address and port

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum TunnelStatus {
    /// Route provisioned (or being provisioned) and serving
    #[sea_orm(string_value = "active")]
    Active,

    /// Closed by the client, replaced by a newer tunnel, or swept
    #[sea_orm(string_value = "closed")]
    Closed,

    /// Route provisioning failed
    #[sea_orm(string_value = "error")]
    Error,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tunnels")]
pub struct Model {
    /// Tunnel UUID (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning peer
    pub peer_id: Uuid,

    /// Port the remote client serves on its side of the VPN
    pub local_port: i32,

    /// Public label, unique among tunnels that are not closed
    pub subdomain: String,

    pub started_at: ChronoDateTimeUtc,

    /// Absent while the tunnel is active
    pub ended_at: Option<ChronoDateTimeUtc>,

    pub status: TunnelStatus,

    pub bytes_in: i64,

    pub bytes_out: i64,

    pub request_count: i64,

    /// Failure reason when status is `error`
    #[sea_orm(column_type = "Text", nullable)]
    pub error_message: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::peer::Entity",
        from = "Column::PeerId",
        to = "super::peer::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Peer,
}

impl Related<super::peer::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Peer.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
