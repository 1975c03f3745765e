//! Drift repair between the live interface, the records and the route artifacts

use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tunnelgate_db::entities::tunnel::TunnelStatus;
use tunnelgate_db::entities::{peer, tunnel};
use uuid::Uuid;

use crate::error::Result;
use crate::peers::{peer_address, PeerController};
use crate::routes::{route_spec, RouteProvisioner};
use crate::settings::Settings;
use crate::tunnels::TunnelManager;

/// A single corrective action taken by a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Repair {
    AdoptedPendingPeer { public_key: String, address: String },
    ReappliedPeer { public_key: String, address: String },
    RetractedInactivePeer { public_key: String },
    ClosedTunnel { tunnel_id: Uuid, reason: String },
    RegeneratedRoute { tunnel_id: String },
    RemovedRoute { tunnel_id: String },
    DeletedRecords { peers: u64, tunnels: u64 },
    ClearedAddressCursor,
    ReloadedProxy,
}

impl fmt::Display for Repair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Repair::AdoptedPendingPeer {
                public_key,
                address,
            } => write!(f, "persisted pending peer {} at {}", public_key, address),
            Repair::ReappliedPeer {
                public_key,
                address,
            } => write!(f, "re-applied peer {} at {}", public_key, address),
            Repair::RetractedInactivePeer { public_key } => {
                write!(f, "retracted inactive peer {}", public_key)
            }
            Repair::ClosedTunnel { tunnel_id, reason } => {
                write!(f, "closed tunnel {} ({})", tunnel_id, reason)
            }
            Repair::RegeneratedRoute { tunnel_id } => {
                write!(f, "regenerated route for tunnel {}", tunnel_id)
            }
            Repair::RemovedRoute { tunnel_id } => write!(f, "removed route {}", tunnel_id),
            Repair::DeletedRecords { peers, tunnels } => {
                write!(f, "deleted {} peer and {} tunnel record(s)", peers, tunnels)
            }
            Repair::ClearedAddressCursor => write!(f, "cleared address cursor"),
            Repair::ReloadedProxy => write!(f, "reloaded proxy"),
        }
    }
}

/// A live peer that no record or pending registration accounts for
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanedPeer {
    pub public_key: String,
    pub allowed_ips: Vec<String>,
    /// Whether it was successfully retracted
    pub retracted: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub repaired: Vec<Repair>,
    pub orphaned: Vec<OrphanedPeer>,
    pub failures: Vec<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.repaired.is_empty() && self.orphaned.is_empty() && self.failures.is_empty()
    }

    fn fail(&mut self, what: impl fmt::Display, err: impl fmt::Display) {
        let message = format!("{}: {}", what, err);
        warn!("Reconciliation step failed: {}", message);
        self.failures.push(message);
    }
}

pub struct Reconciler {
    db: DatabaseConnection,
    peers: Arc<PeerController>,
    tunnels: Arc<TunnelManager>,
    routes: Arc<RouteProvisioner>,
    settings: Settings,
}

impl Reconciler {
    pub fn new(
        db: DatabaseConnection,
        peers: Arc<PeerController>,
        tunnels: Arc<TunnelManager>,
        routes: Arc<RouteProvisioner>,
        settings: Settings,
    ) -> Self {
        Self {
            db,
            peers,
            tunnels,
            routes,
            settings,
        }
    }

    /// Diff the three stores and repair what can be repaired.
    ///
    /// Only database errors while loading the records abort the pass; every
    /// other failure is collected into the report.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        self.reconcile_peers(&mut report).await?;
        self.reconcile_tunnels(&mut report).await?;

        info!(
            "Reconciliation finished: {} repaired, {} orphaned, {} failures",
            report.repaired.len(),
            report.orphaned.len(),
            report.failures.len()
        );
        Ok(report)
    }

    async fn reconcile_peers(&self, report: &mut ReconcileReport) -> Result<()> {
        let live = match self.peers.live_peers().await {
            Ok(live) => live,
            Err(e) => {
                report.fail("listing interface peers", e);
                return Ok(());
            }
        };
        let records = self.peers.list().await?;

        let by_key: HashMap<&str, &peer::Model> =
            records.iter().map(|p| (p.public_key.as_str(), p)).collect();
        let live_keys: HashSet<&str> = live.iter().map(|p| p.public_key.as_str()).collect();

        for live_peer in &live {
            match by_key.get(live_peer.public_key.as_str()) {
                Some(record) if !record.is_active => {
                    match self.peers.retract(&record.public_key).await {
                        Ok(()) => report.repaired.push(Repair::RetractedInactivePeer {
                            public_key: record.public_key.clone(),
                        }),
                        Err(e) => report.fail(format!("retracting inactive peer {}", record.public_key), e),
                    }
                }
                Some(_) => {}
                None => match self.peers.take_pending(&live_peer.public_key) {
                    Some(pending) => {
                        let public_key = pending.public_key.clone();
                        let address = pending.address.to_string();
                        match self.peers.adopt(pending).await {
                            Ok(_) => report.repaired.push(Repair::AdoptedPendingPeer {
                                public_key,
                                address,
                            }),
                            Err(e) => report.fail(format!("persisting pending peer {}", public_key), e),
                        }
                    }
                    None => {
                        // Registration may have persisted the peer since the
                        // records were loaded.
                        if self
                            .peers
                            .find_by_public_key(&live_peer.public_key)
                            .await?
                            .is_some()
                        {
                            debug!("Peer {} was persisted during the pass", live_peer.public_key);
                            continue;
                        }
                        let retracted = match self.peers.retract(&live_peer.public_key).await {
                            Ok(()) => true,
                            Err(e) => {
                                report.fail(format!("retracting orphaned peer {}", live_peer.public_key), e);
                                false
                            }
                        };
                        warn!(
                            "Orphaned peer {} ({:?}) on the interface",
                            live_peer.public_key, live_peer.allowed_ips
                        );
                        report.orphaned.push(OrphanedPeer {
                            public_key: live_peer.public_key.clone(),
                            allowed_ips: live_peer.allowed_ips.clone(),
                            retracted,
                        });
                    }
                },
            }
        }

        let missing: Vec<&peer::Model> = records
            .iter()
            .filter(|p| p.is_active && !live_keys.contains(p.public_key.as_str()))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        match self.peers.interface_is_up().await {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    "Interface is down; leaving {} unbound peer record(s) intact",
                    missing.len()
                );
                return Ok(());
            }
            Err(e) => {
                report.fail("checking interface state", e);
                return Ok(());
            }
        }

        for record in missing {
            let applied = match peer_address(record) {
                Ok(address) => self.peers.apply(&record.public_key, address).await,
                Err(e) => Err(e),
            };
            match applied {
                Ok(()) => report.repaired.push(Repair::ReappliedPeer {
                    public_key: record.public_key.clone(),
                    address: record.address.clone(),
                }),
                Err(e) => report.fail(format!("re-applying peer {}", record.public_key), e),
            }
        }

        Ok(())
    }

    async fn reconcile_tunnels(&self, report: &mut ReconcileReport) -> Result<()> {
        let peers: HashMap<Uuid, peer::Model> = self
            .peers
            .list()
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();
        let active = tunnel::Entity::find()
            .filter(tunnel::Column::Status.eq(TunnelStatus::Active))
            .all(&self.db)
            .await?;

        let mut routes_changed = false;
        let mut serving = Vec::new();

        for record in active {
            match peers.get(&record.peer_id) {
                Some(owner) if owner.is_active => serving.push((record, owner)),
                _ => match self.tunnels.close_for_peer(record.peer_id).await {
                    Ok(closed) => {
                        for tunnel_id in closed {
                            report.repaired.push(Repair::ClosedTunnel {
                                tunnel_id,
                                reason: "peer inactive".to_string(),
                            });
                        }
                    }
                    Err(e) => report.fail(format!("closing tunnel {}", record.id), e),
                },
            }
        }

        let existing: HashSet<String> = match self.routes.list().await {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                report.fail("listing route artifacts", e);
                return Ok(());
            }
        };

        if serving
            .iter()
            .any(|(t, _)| !existing.contains(&t.id.to_string()))
        {
            match self.settings.require_base_domain().await {
                Ok(base_domain) => {
                    for (record, owner) in &serving {
                        if existing.contains(&record.id.to_string()) {
                            continue;
                        }
                        let written = match route_spec(record, owner, &base_domain) {
                            Ok(spec) => self.routes.write(&spec).await,
                            Err(e) => Err(e),
                        };
                        match written {
                            Ok(()) => {
                                routes_changed = true;
                                report.repaired.push(Repair::RegeneratedRoute {
                                    tunnel_id: record.id.to_string(),
                                });
                            }
                            Err(e) => report.fail(format!("regenerating route {}", record.id), e),
                        }
                    }
                }
                Err(e) => report.fail("regenerating missing routes", e),
            }
        }

        let wanted: HashSet<String> = serving.iter().map(|(t, _)| t.id.to_string()).collect();
        for tunnel_id in existing.difference(&wanted) {
            if self.became_active(tunnel_id).await? {
                debug!("Tunnel {} was created during the pass", tunnel_id);
                continue;
            }
            match self.routes.remove(tunnel_id).await {
                Ok(()) => {
                    routes_changed = true;
                    report.repaired.push(Repair::RemovedRoute {
                        tunnel_id: tunnel_id.clone(),
                    });
                }
                Err(e) => report.fail(format!("removing stale route {}", tunnel_id), e),
            }
        }

        if routes_changed {
            match self.routes.reload().await {
                Ok(()) => report.repaired.push(Repair::ReloadedProxy),
                Err(e) => report.fail("reloading proxy", e),
            }
        }

        Ok(())
    }

    /// Whether the route's tunnel is active now, although it was not among the
    /// active rows loaded at the start of the pass
    async fn became_active(&self, tunnel_id: &str) -> Result<bool> {
        let Ok(id) = Uuid::parse_str(tunnel_id) else {
            return Ok(false);
        };
        Ok(tunnel::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .is_some_and(|t| t.status == TunnelStatus::Active))
    }

    /// Tear everything down: live peers, records, cursor and routes.
    ///
    /// Each step runs regardless of earlier failures.
    pub async fn reset(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        match self.peers.live_peers().await {
            Ok(live) => {
                for live_peer in live {
                    match self.peers.retract(&live_peer.public_key).await {
                        Ok(()) => report.orphaned.push(OrphanedPeer {
                            public_key: live_peer.public_key,
                            allowed_ips: live_peer.allowed_ips,
                            retracted: true,
                        }),
                        Err(e) => report.fail(format!("retracting peer {}", live_peer.public_key), e),
                    }
                }
            }
            Err(e) => report.fail("listing interface peers", e),
        }
        self.peers.clear_pending();

        let deleted_tunnels = match tunnel::Entity::delete_many().exec(&self.db).await {
            Ok(res) => res.rows_affected,
            Err(e) => {
                report.fail("deleting tunnel records", e);
                0
            }
        };
        let deleted_peers = match peer::Entity::delete_many().exec(&self.db).await {
            Ok(res) => res.rows_affected,
            Err(e) => {
                report.fail("deleting peer records", e);
                0
            }
        };
        report.repaired.push(Repair::DeletedRecords {
            peers: deleted_peers,
            tunnels: deleted_tunnels,
        });

        match self.peers.allocator().clear().await {
            Ok(()) => report.repaired.push(Repair::ClearedAddressCursor),
            Err(e) => report.fail("clearing address cursor", e),
        }

        match self.routes.list().await {
            Ok(ids) => {
                for tunnel_id in ids {
                    match self.routes.remove(&tunnel_id).await {
                        Ok(()) => report.repaired.push(Repair::RemovedRoute { tunnel_id }),
                        Err(e) => report.fail(format!("removing route {}", tunnel_id), e),
                    }
                }
            }
            Err(e) => report.fail("listing route artifacts", e),
        }

        match self.routes.reload().await {
            Ok(()) => report.repaired.push(Repair::ReloadedProxy),
            Err(e) => report.fail("reloading proxy", e),
        }

        info!(
            "Reset finished: {} peer(s) retracted, {} failure(s)",
            report.orphaned.len(),
            report.failures.len()
        );
        report
    }
}
