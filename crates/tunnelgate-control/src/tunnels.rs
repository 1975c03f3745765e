//! Tunnel lifecycle: create, replace, close
//!
//! A peer has at most one active tunnel and a subdomain belongs to at most one
//! tunnel that is not closed. Both rules are enforced by doing the claim
//! (close prior tunnels, pick the subdomain, insert the new row) in one
//! transaction under the claim lock. Route changes happen after the lock is
//! released.

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    IntoActiveModel, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use tunnelgate_db::entities::tunnel::TunnelStatus;
use tunnelgate_db::entities::{peer, tunnel};
use uuid::Uuid;

use crate::error::{ControlError, Result};
use crate::routes::{route_spec, RouteProvisioner};
use crate::settings::Settings;
use crate::subdomain::{public_url, SubdomainPolicy};

/// Generated subdomains are retried this many times on collision
const MAX_GENERATE_ATTEMPTS: usize = 16;

/// A tunnel row with its public URL resolved against the current base domain
#[derive(Debug, Clone, Serialize)]
pub struct TunnelView {
    #[serde(flatten)]
    pub tunnel: tunnel::Model,
    pub public_url: String,
}

impl TunnelView {
    fn new(tunnel: tunnel::Model, base_domain: &str) -> Self {
        let public_url = public_url(&tunnel.subdomain, base_domain);
        Self { tunnel, public_url }
    }
}

pub struct TunnelManager {
    db: DatabaseConnection,
    routes: Arc<RouteProvisioner>,
    settings: Settings,
    policy: Arc<dyn SubdomainPolicy>,
    claim_lock: Mutex<()>,
}

impl TunnelManager {
    pub fn new(
        db: DatabaseConnection,
        routes: Arc<RouteProvisioner>,
        settings: Settings,
        policy: Arc<dyn SubdomainPolicy>,
    ) -> Self {
        Self {
            db,
            routes,
            settings,
            policy,
            claim_lock: Mutex::new(()),
        }
    }

    /// Create a tunnel for `peer_id`, replacing whatever tunnel it had
    pub async fn create(
        &self,
        peer_id: Uuid,
        local_port: u16,
        subdomain: Option<&str>,
    ) -> Result<TunnelView> {
        if local_port == 0 {
            return Err(ControlError::InvalidRequest(
                "Local port must be between 1 and 65535".to_string(),
            ));
        }

        let requested = match subdomain.map(|s| s.trim().to_ascii_lowercase()) {
            Some(s) => {
                self.policy.validate(&s)?;
                Some(s)
            }
            None => None,
        };

        let owner = peer::Entity::find_by_id(peer_id)
            .one(&self.db)
            .await?
            .ok_or(ControlError::PeerNotFound(peer_id))?;
        if !owner.is_active {
            return Err(ControlError::PeerInactive(peer_id));
        }

        let base_domain = self.settings.require_base_domain().await?;

        let (record, replaced) = {
            let _claim = self.claim_lock.lock().await;
            self.claim(peer_id, local_port, requested).await?
        };

        for id in &replaced {
            if let Err(e) = self.routes.remove(&id.to_string()).await {
                warn!("Leaving route of replaced tunnel {} for reconciliation: {}", id, e);
            }
        }

        let provisioned = match route_spec(&record, &owner, &base_domain) {
            Ok(spec) => self.routes.provision(&spec).await,
            Err(e) => Err(e),
        };

        if let Err(e) = provisioned {
            error!(
                "Provisioning route for tunnel {} ({}) failed: {}",
                record.id, record.subdomain, e
            );
            self.mark_error(record, &e.to_string()).await?;
            if !replaced.is_empty() {
                // Replaced routes were removed without a reload of their own.
                if let Err(reload) = self.routes.reload().await {
                    warn!("Reload after failed provisioning also failed: {}", reload);
                }
            }
            return Err(e);
        }

        // A concurrent create for the same peer may have replaced this tunnel
        // while its route was being written; its removal may have run first.
        let current = tunnel::Entity::find_by_id(record.id)
            .one(&self.db)
            .await?
            .ok_or(ControlError::TunnelNotFound(record.id))?;
        if current.status != TunnelStatus::Active {
            debug!("Tunnel {} was replaced during provisioning", current.id);
            self.routes.deprovision(&current.id.to_string()).await?;
            return Ok(TunnelView::new(current, &base_domain));
        }

        info!(
            "Tunnel {} active: {}.{} -> {}:{}",
            current.id, current.subdomain, base_domain, owner.address, local_port
        );
        Ok(TunnelView::new(current, &base_domain))
    }

    /// Close prior tunnels of the peer, choose a subdomain and insert the row
    async fn claim(
        &self,
        peer_id: Uuid,
        local_port: u16,
        requested: Option<String>,
    ) -> Result<(tunnel::Model, Vec<Uuid>)> {
        let txn = self.db.begin().await?;

        let prior: Vec<Uuid> = tunnel::Entity::find()
            .filter(tunnel::Column::PeerId.eq(peer_id))
            .filter(tunnel::Column::Status.ne(TunnelStatus::Closed))
            .all(&txn)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();

        let subdomain = match requested {
            Some(s) => {
                if is_claimed(&txn, &s, &prior).await? {
                    return Err(ControlError::SubdomainTaken(s));
                }
                s
            }
            None => self.generate_unclaimed(&txn, &prior).await?,
        };

        if !prior.is_empty() {
            tunnel::Entity::update_many()
                .col_expr(tunnel::Column::Status, Expr::value(TunnelStatus::Closed))
                .col_expr(tunnel::Column::EndedAt, Expr::value(Utc::now()))
                .filter(tunnel::Column::Id.is_in(prior.clone()))
                .exec(&txn)
                .await?;
            debug!("Closed {} prior tunnel(s) of peer {}", prior.len(), peer_id);
        }

        let record = tunnel::ActiveModel {
            id: Set(Uuid::new_v4()),
            peer_id: Set(peer_id),
            local_port: Set(i32::from(local_port)),
            subdomain: Set(subdomain),
            started_at: Set(Utc::now()),
            ended_at: Set(None),
            status: Set(TunnelStatus::Active),
            bytes_in: Set(0),
            bytes_out: Set(0),
            request_count: Set(0),
            error_message: Set(None),
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;
        Ok((record, prior))
    }

    async fn generate_unclaimed<C: ConnectionTrait>(
        &self,
        conn: &C,
        released: &[Uuid],
    ) -> Result<String> {
        let mut candidate = self.policy.generate();
        for _ in 1..MAX_GENERATE_ATTEMPTS {
            if !is_claimed(conn, &candidate, released).await? {
                return Ok(candidate);
            }
            debug!("Generated subdomain {} collided, retrying", candidate);
            candidate = self.policy.generate();
        }
        if !is_claimed(conn, &candidate, released).await? {
            return Ok(candidate);
        }
        Err(ControlError::SubdomainTaken(candidate))
    }

    async fn mark_error(&self, record: tunnel::Model, message: &str) -> Result<tunnel::Model> {
        let mut model = record.into_active_model();
        model.status = Set(TunnelStatus::Error);
        model.ended_at = Set(Some(Utc::now()));
        model.error_message = Set(Some(message.to_string()));
        Ok(model.update(&self.db).await?)
    }

    /// Close a tunnel and remove its route.
    ///
    /// Closing an already closed tunnel succeeds and still removes the route.
    pub async fn close(&self, id: Uuid) -> Result<tunnel::Model> {
        let record = tunnel::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or(ControlError::TunnelNotFound(id))?;

        let record = if record.status == TunnelStatus::Closed {
            record
        } else {
            let ended_at = record.ended_at.unwrap_or_else(Utc::now);
            let mut model = record.into_active_model();
            model.status = Set(TunnelStatus::Closed);
            model.ended_at = Set(Some(ended_at));
            let closed = model.update(&self.db).await?;
            info!("Closed tunnel {} ({})", closed.id, closed.subdomain);
            closed
        };

        self.routes.deprovision(&id.to_string()).await?;
        Ok(record)
    }

    /// Close every tunnel of the peer that is not closed yet; one reload
    pub async fn close_for_peer(&self, peer_id: Uuid) -> Result<Vec<Uuid>> {
        let open: Vec<Uuid> = tunnel::Entity::find()
            .filter(tunnel::Column::PeerId.eq(peer_id))
            .filter(tunnel::Column::Status.ne(TunnelStatus::Closed))
            .all(&self.db)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();

        if open.is_empty() {
            return Ok(open);
        }

        tunnel::Entity::update_many()
            .col_expr(tunnel::Column::Status, Expr::value(TunnelStatus::Closed))
            .col_expr(tunnel::Column::EndedAt, Expr::value(Utc::now()))
            .filter(tunnel::Column::Id.is_in(open.clone()))
            .exec(&self.db)
            .await?;

        for id in &open {
            self.routes.remove(&id.to_string()).await?;
        }
        self.routes.reload().await?;

        info!("Closed {} tunnel(s) of peer {}", open.len(), peer_id);
        Ok(open)
    }

    pub async fn get(&self, id: Uuid) -> Result<TunnelView> {
        let record = tunnel::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or(ControlError::TunnelNotFound(id))?;
        let base_domain = self.settings.require_base_domain().await?;
        Ok(TunnelView::new(record, &base_domain))
    }

    pub async fn list_active(&self) -> Result<Vec<TunnelView>> {
        let base_domain = self.settings.require_base_domain().await?;
        let rows = tunnel::Entity::find()
            .filter(tunnel::Column::Status.eq(TunnelStatus::Active))
            .order_by_desc(tunnel::Column::StartedAt)
            .all(&self.db)
            .await?;
        Ok(rows
            .into_iter()
            .map(|t| TunnelView::new(t, &base_domain))
            .collect())
    }

    pub async fn list_all(&self) -> Result<Vec<TunnelView>> {
        let base_domain = self.settings.require_base_domain().await?;
        let rows = tunnel::Entity::find()
            .order_by_desc(tunnel::Column::StartedAt)
            .all(&self.db)
            .await?;
        Ok(rows
            .into_iter()
            .map(|t| TunnelView::new(t, &base_domain))
            .collect())
    }

    pub async fn active_for_peer(&self, peer_id: Uuid) -> Result<Option<tunnel::Model>> {
        Ok(tunnel::Entity::find()
            .filter(tunnel::Column::PeerId.eq(peer_id))
            .filter(tunnel::Column::Status.eq(TunnelStatus::Active))
            .one(&self.db)
            .await?)
    }

    /// Add transferred bytes and proxied requests to an active tunnel; other
    /// tunnels are left as is.
    ///
    /// Interface counters carry no request counts, so the periodic stats sync
    /// passes zero requests; callers that read proxy logs supply them.
    pub async fn record_traffic(
        &self,
        id: Uuid,
        bytes_in: u64,
        bytes_out: u64,
        requests: u64,
    ) -> Result<tunnel::Model> {
        let record = tunnel::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or(ControlError::TunnelNotFound(id))?;

        if record.status != TunnelStatus::Active
            || (bytes_in == 0 && bytes_out == 0 && requests == 0)
        {
            return Ok(record);
        }

        let total_in = record.bytes_in.saturating_add(clamp(bytes_in));
        let total_out = record.bytes_out.saturating_add(clamp(bytes_out));
        let total_requests = record.request_count.saturating_add(clamp(requests));
        let mut model = record.into_active_model();
        model.bytes_in = Set(total_in);
        model.bytes_out = Set(total_out);
        model.request_count = Set(total_requests);
        Ok(model.update(&self.db).await?)
    }
}

/// Whether a tunnel outside `released` holds `subdomain` and is not closed
async fn is_claimed<C: ConnectionTrait>(conn: &C, subdomain: &str, released: &[Uuid]) -> Result<bool> {
    let mut query = tunnel::Entity::find()
        .filter(tunnel::Column::Subdomain.eq(subdomain))
        .filter(tunnel::Column::Status.ne(TunnelStatus::Closed));
    if !released.is_empty() {
        query = query.filter(tunnel::Column::Id.is_not_in(released.to_vec()));
    }
    Ok(query.one(conn).await?.is_some())
}

fn clamp(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
