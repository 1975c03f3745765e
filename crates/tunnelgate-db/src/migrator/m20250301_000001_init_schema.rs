//! Initial schema: peers, tunnels, settings

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ============================================================
        // 1. peers
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Peer::Table)
                    .if_not_exists()
                    .col(uuid(Peer::Id).primary_key())
                    .col(string_len(Peer::Name, 255).not_null())
                    .col(string_len(Peer::PublicKey, 64).not_null().unique_key())
                    .col(string_len(Peer::Address, 45).not_null().unique_key())
                    .col(
                        timestamp_with_time_zone(Peer::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(Peer::LastSeen).timestamp_with_time_zone().null())
                    .col(boolean(Peer::IsActive).not_null().default(true))
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 2. tunnels
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Tunnel::Table)
                    .if_not_exists()
                    .col(uuid(Tunnel::Id).primary_key())
                    .col(uuid(Tunnel::PeerId).not_null())
                    .col(ColumnDef::new(Tunnel::LocalPort).integer().not_null())
                    .col(string_len(Tunnel::Subdomain, 63).not_null())
                    .col(
                        timestamp_with_time_zone(Tunnel::StartedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(Tunnel::EndedAt).timestamp_with_time_zone().null())
                    .col(
                        string_len(Tunnel::Status, 16)
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(Tunnel::BytesIn)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Tunnel::BytesOut)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Tunnel::RequestCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Tunnel::ErrorMessage).text().null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_tunnels_peer_id")
                            .from(Tunnel::Table, Tunnel::PeerId)
                            .to(Peer::Table, Peer::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tunnels_peer_id")
                    .table(Tunnel::Table)
                    .col(Tunnel::PeerId)
                    .to_owned(),
            )
            .await?;

        // Uniqueness among non-closed tunnels is enforced by the lifecycle manager;
        // this index only speeds up the lookup.
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tunnels_subdomain_status")
                    .table(Tunnel::Table)
                    .col(Tunnel::Subdomain)
                    .col(Tunnel::Status)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 3. settings
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Setting::Table)
                    .if_not_exists()
                    .col(string_len(Setting::Key, 64).primary_key())
                    .col(text(Setting::Value).not_null())
                    .col(
                        timestamp_with_time_zone(Setting::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Setting::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Tunnel::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Peer::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum Peer {
    #[sea_orm(iden = "peers")]
    Table,
    Id,
    Name,
    PublicKey,
    Address,
    CreatedAt,
    LastSeen,
    IsActive,
}

#[derive(DeriveIden)]
enum Tunnel {
    #[sea_orm(iden = "tunnels")]
    Table,
    Id,
    PeerId,
    LocalPort,
    Subdomain,
    StartedAt,
    EndedAt,
    Status,
    BytesIn,
    BytesOut,
    RequestCount,
    ErrorMessage,
}

#[derive(DeriveIden)]
enum Setting {
    #[sea_orm(iden = "settings")]
    Table,
    Key,
    Value,
    UpdatedAt,
}
