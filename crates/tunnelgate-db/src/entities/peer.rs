//! Peer entity: a registered client bound to one WireGuard key and address

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "peers")]
pub struct Model {
    /// Peer UUID (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Human label supplied at registration
    pub name: String,

    /// Base64 WireGuard public key
    #[sea_orm(unique)]
    pub public_key: String,

    /// Address assigned from the pool (dotted IPv4, no prefix)
    #[sea_orm(unique)]
    pub address: String,

    pub created_at: ChronoDateTimeUtc,

    /// Latest WireGuard handshake observed for this peer
    pub last_seen: Option<ChronoDateTimeUtc>,

    /// Inactive peers are kept on record but not bound on the interface
    pub is_active: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::tunnel::Entity")]
    Tunnel,
}

impl Related<super::tunnel::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tunnel.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
