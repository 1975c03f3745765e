//! The lifecycle coordinator: one handle over every component

use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tunnelgate_db::entities::{peer, tunnel};
use tunnelgate_drivers::{InterfaceDriver, ProxyDriver};
use uuid::Uuid;

use crate::allocator::{AddressAllocator, AddressPool};
use crate::config::CoordinatorConfig;
use crate::error::Result;
use crate::peers::{PeerController, Registration};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::routes::RouteProvisioner;
use crate::settings::Settings;
use crate::stats::{StatsSummary, StatsSync};
use crate::subdomain::{RandomSubdomainPolicy, SubdomainPolicy};
use crate::tunnels::{TunnelManager, TunnelView};

pub struct Coordinator {
    db: DatabaseConnection,
    config: CoordinatorConfig,
    settings: Settings,
    peers: Arc<PeerController>,
    tunnels: Arc<TunnelManager>,
    reconciler: Reconciler,
    stats: StatsSync,
    /// Requests hold this shared; reconcile and reset hold it exclusively so
    /// their snapshots of the three stores cannot go stale mid-pass.
    maintenance: RwLock<()>,
}

impl Coordinator {
    pub fn new(
        db: DatabaseConnection,
        config: CoordinatorConfig,
        interface: Arc<dyn InterfaceDriver>,
        proxy: Arc<dyn ProxyDriver>,
    ) -> Result<Self> {
        Self::with_policy(
            db,
            config,
            interface,
            proxy,
            Arc::new(RandomSubdomainPolicy::new()),
        )
    }

    pub fn with_policy(
        db: DatabaseConnection,
        config: CoordinatorConfig,
        interface: Arc<dyn InterfaceDriver>,
        proxy: Arc<dyn ProxyDriver>,
        policy: Arc<dyn SubdomainPolicy>,
    ) -> Result<Self> {
        let pool = AddressPool::new(config.address_range)?;
        let settings = Settings::new(db.clone());
        let routes = Arc::new(RouteProvisioner::new(proxy));

        let peers = Arc::new(PeerController::new(
            db.clone(),
            interface,
            AddressAllocator::new(pool, db.clone()),
            settings.clone(),
            config.clone(),
        ));
        let tunnels = Arc::new(TunnelManager::new(
            db.clone(),
            routes.clone(),
            settings.clone(),
            policy,
        ));
        let reconciler = Reconciler::new(
            db.clone(),
            peers.clone(),
            tunnels.clone(),
            routes,
            settings.clone(),
        );
        let stats = StatsSync::new(peers.clone(), tunnels.clone());

        Ok(Self {
            db,
            config,
            settings,
            peers,
            tunnels,
            reconciler,
            stats,
            maintenance: RwLock::new(()),
        })
    }

    /// Ensure the server key pair exists and seed the configured base domain
    pub async fn initialize(&self) -> Result<()> {
        let keypair = self.settings.server_keypair().await?;
        info!("Server public key: {}", keypair.public);

        if let Some(domain) = &self.config.base_domain {
            self.settings.set_base_domain(domain).await?;
        } else if self.settings.base_domain().await?.is_none() {
            warn!("No base domain configured; tunnel URLs are unavailable until one is set");
        }
        Ok(())
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub async fn ping(&self) -> Result<()> {
        Ok(self.db.ping().await?)
    }

    // Clients

    pub async fn register(&self, name: &str) -> Result<Registration> {
        let _shared = self.maintenance.read().await;
        self.peers.register(name).await
    }

    pub async fn list_clients(&self) -> Result<Vec<peer::Model>> {
        self.peers.list().await
    }

    pub async fn get_client(&self, id: Uuid) -> Result<peer::Model> {
        self.peers.get(id).await
    }

    /// Deactivation closes the client's tunnels before unbinding it
    pub async fn set_client_active(&self, id: Uuid, active: bool) -> Result<peer::Model> {
        let _shared = self.maintenance.read().await;
        let record = self.peers.get(id).await?;
        if !active {
            self.tunnels.close_for_peer(record.id).await?;
        }
        self.peers.set_active(record.id, active).await
    }

    pub async fn remove_client(&self, id: Uuid) -> Result<peer::Model> {
        let _shared = self.maintenance.read().await;
        let record = self.peers.get(id).await?;
        self.tunnels.close_for_peer(record.id).await?;
        let removed = self.peers.remove(record.id).await?;
        self.stats.forget(&removed.public_key);
        Ok(removed)
    }

    // Tunnels

    pub async fn create_tunnel(
        &self,
        peer_id: Uuid,
        local_port: u16,
        subdomain: Option<&str>,
    ) -> Result<TunnelView> {
        let _shared = self.maintenance.read().await;
        self.tunnels.create(peer_id, local_port, subdomain).await
    }

    pub async fn close_tunnel(&self, id: Uuid) -> Result<tunnel::Model> {
        let _shared = self.maintenance.read().await;
        self.tunnels.close(id).await
    }

    pub async fn get_tunnel(&self, id: Uuid) -> Result<TunnelView> {
        self.tunnels.get(id).await
    }

    pub async fn list_tunnels(&self, include_closed: bool) -> Result<Vec<TunnelView>> {
        if include_closed {
            self.tunnels.list_all().await
        } else {
            self.tunnels.list_active().await
        }
    }

    /// Add traffic observed outside the interface counters to a tunnel
    pub async fn record_traffic(
        &self,
        id: Uuid,
        bytes_in: u64,
        bytes_out: u64,
        requests: u64,
    ) -> Result<tunnel::Model> {
        let _shared = self.maintenance.read().await;
        self.tunnels
            .record_traffic(id, bytes_in, bytes_out, requests)
            .await
    }

    // Maintenance

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let _exclusive = self.maintenance.write().await;
        self.reconciler.reconcile().await
    }

    pub async fn reset(&self) -> ReconcileReport {
        let _exclusive = self.maintenance.write().await;
        let report = self.reconciler.reset().await;
        self.stats.clear();
        report
    }

    pub async fn sync_stats(&self) -> Result<StatsSummary> {
        let _shared = self.maintenance.read().await;
        self.stats.sync().await
    }

    pub fn stats(&self) -> &StatsSync {
        &self.stats
    }

    pub async fn base_domain(&self) -> Result<Option<String>> {
        self.settings.base_domain().await
    }

    pub async fn set_base_domain(&self, domain: &str) -> Result<String> {
        self.settings.set_base_domain(domain).await
    }

    pub async fn server_public_key(&self) -> Result<String> {
        self.settings.server_public_key().await
    }

    /// Run [`Coordinator::sync_stats`] every `period` until the task is aborted
    pub fn spawn_stats_sync(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        let coordinator = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = coordinator.sync_stats().await {
                    error!("Stats sync failed: {}", e);
                }
            }
        })
    }
}
