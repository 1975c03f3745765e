//! Peer registration and client management
//!
//! Registration walks REQUESTED → KEY_GENERATED → ADDRESS_ALLOCATED →
//! INTERFACE_APPLIED → PERSISTED. Interface mutations always happen before the
//! matching record mutation. A registration that fails after the interface step
//! stays in the in-memory pending table so a reconciliation pass in this process
//! can still persist it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ipnet::Ipv4Net;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, ModelTrait,
    QueryFilter, QueryOrder, Set,
};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tunnelgate_db::entities::{peer, tunnel};
use tunnelgate_drivers::{InterfaceDriver, InterfaceError, KeyPair, LivePeer};
use uuid::Uuid;

use crate::allocator::AddressAllocator;
use crate::config::CoordinatorConfig;
use crate::error::{ControlError, Result};
use crate::settings::Settings;

const MAX_NAME_LEN: usize = 128;

/// Result of a successful registration; the private key is never stored
#[derive(Debug, Clone)]
pub struct Registration {
    pub peer: peer::Model,
    pub private_key: String,
    pub interface_config: String,
}

/// A registration applied to the interface but not yet persisted
#[derive(Debug, Clone)]
pub struct PendingRegistration {
    pub id: Uuid,
    pub name: String,
    pub public_key: String,
    pub address: Ipv4Addr,
    pub created_at: DateTime<Utc>,
}

impl PendingRegistration {
    fn into_active_model(self) -> peer::ActiveModel {
        peer::ActiveModel {
            id: Set(self.id),
            name: Set(self.name),
            public_key: Set(self.public_key),
            address: Set(self.address.to_string()),
            created_at: Set(self.created_at),
            last_seen: Set(None),
            is_active: Set(true),
        }
    }
}

pub struct PeerController {
    db: DatabaseConnection,
    driver: Arc<dyn InterfaceDriver>,
    allocator: AddressAllocator,
    settings: Settings,
    config: CoordinatorConfig,
    interface_lock: Mutex<()>,
    pending: DashMap<String, PendingRegistration>,
}

impl PeerController {
    pub fn new(
        db: DatabaseConnection,
        driver: Arc<dyn InterfaceDriver>,
        allocator: AddressAllocator,
        settings: Settings,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            db,
            driver,
            allocator,
            settings,
            config,
            interface_lock: Mutex::new(()),
            pending: DashMap::new(),
        }
    }

    pub fn allocator(&self) -> &AddressAllocator {
        &self.allocator
    }

    pub async fn register(&self, name: &str) -> Result<Registration> {
        let name = validate_name(name)?;
        let server_public_key = self.settings.server_public_key().await?;

        let keypair = KeyPair::generate();
        let public_key = keypair.public.to_base64();

        let occupied = self.occupied_addresses().await?;
        let address = self.allocator.allocate(&occupied).await?;

        let pending = PendingRegistration {
            id: Uuid::new_v4(),
            name,
            public_key: public_key.clone(),
            address,
            created_at: Utc::now(),
        };
        self.pending.insert(public_key.clone(), pending.clone());

        if let Err(e) = self.apply(&public_key, address).await {
            self.pending.remove(&public_key);
            return Err(e);
        }

        // From here on a failure leaves a live peer without a record; the
        // pending entry lets the reconciler adopt it.
        let peer = match pending.into_active_model().insert(&self.db).await {
            Ok(peer) => {
                self.pending.remove(&public_key);
                peer
            }
            // A concurrent reconciliation pass may have adopted it already.
            Err(e) => match self.find_by_public_key(&public_key).await? {
                Some(adopted) => adopted,
                None => return Err(e.into()),
            },
        };

        info!(
            "Registered peer '{}' ({}) at {}",
            peer.name, peer.public_key, peer.address
        );

        let interface_config = client_config(&ClientConfigParams {
            private_key: &keypair.private.to_base64(),
            address,
            server_public_key: &server_public_key,
            endpoint: &self.config.server_endpoint,
            allowed_ips: self.allocator.pool().range(),
            keepalive_secs: self.config.keepalive_secs,
        });

        Ok(Registration {
            peer,
            private_key: keypair.private.to_base64(),
            interface_config,
        })
    }

    pub async fn list(&self) -> Result<Vec<peer::Model>> {
        Ok(peer::Entity::find()
            .order_by_asc(peer::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<peer::Model> {
        peer::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or(ControlError::PeerNotFound(id))
    }

    pub async fn find_by_public_key(&self, public_key: &str) -> Result<Option<peer::Model>> {
        Ok(peer::Entity::find()
            .filter(peer::Column::PublicKey.eq(public_key))
            .one(&self.db)
            .await?)
    }

    /// Bind or unbind the peer on the interface, then record the new state.
    ///
    /// Closing the peer's tunnels on deactivation is the caller's job.
    pub async fn set_active(&self, id: Uuid, active: bool) -> Result<peer::Model> {
        let record = self.get(id).await?;
        if record.is_active == active {
            return Ok(record);
        }

        if active {
            let address = peer_address(&record)?;
            let live = self.live_peers().await?;
            if live
                .iter()
                .any(|p| p.public_key != record.public_key && p.addresses().any(|a| a == address))
            {
                return Err(ControlError::AddressConflict(address));
            }
            self.apply(&record.public_key, address).await?;
        } else {
            self.retract_if_live(&record.public_key).await?;
        }

        let mut model = record.into_active_model();
        model.is_active = Set(active);
        let updated = model.update(&self.db).await?;

        info!(
            "Peer {} is now {}",
            updated.id,
            if active { "active" } else { "inactive" }
        );
        Ok(updated)
    }

    /// Unbind the peer and delete its record together with its tunnel rows
    pub async fn remove(&self, id: Uuid) -> Result<peer::Model> {
        let record = self.get(id).await?;
        self.retract_if_live(&record.public_key).await?;

        tunnel::Entity::delete_many()
            .filter(tunnel::Column::PeerId.eq(id))
            .exec(&self.db)
            .await?;
        record.clone().delete(&self.db).await?;

        info!("Removed peer {} ({})", record.name, record.public_key);
        Ok(record)
    }

    pub async fn live_peers(&self) -> Result<Vec<LivePeer>> {
        Ok(self.driver.list_peers().await?)
    }

    pub async fn interface_is_up(&self) -> Result<bool> {
        Ok(self.driver.is_up().await?)
    }

    pub async fn apply(&self, public_key: &str, address: Ipv4Addr) -> Result<()> {
        let _guard = self.interface_lock.lock().await;
        self.driver
            .apply_peer(public_key, address)
            .await
            .map_err(|e| {
                warn!("Failed to apply peer {} at {}: {}", public_key, address, e);
                ControlError::from(e)
            })
    }

    /// `PeerNotFound` from the driver is passed through
    pub async fn retract(&self, public_key: &str) -> Result<()> {
        let _guard = self.interface_lock.lock().await;
        self.driver.retract_peer(public_key).await.map_err(|e| {
            if !matches!(e, InterfaceError::PeerNotFound(_)) {
                warn!("Failed to retract peer {}: {}", public_key, e);
            }
            ControlError::from(e)
        })
    }

    async fn retract_if_live(&self, public_key: &str) -> Result<()> {
        match self.retract(public_key).await {
            Ok(()) => Ok(()),
            Err(ControlError::Interface(InterfaceError::PeerNotFound(_))) => {
                debug!("Peer {} was not bound on the interface", public_key);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn take_pending(&self, public_key: &str) -> Option<PendingRegistration> {
        self.pending.remove(public_key).map(|(_, pending)| pending)
    }

    /// Persist a registration the interface already carries
    pub async fn adopt(&self, pending: PendingRegistration) -> Result<peer::Model> {
        let conflict = peer::Entity::find()
            .filter(peer::Column::Address.eq(pending.address.to_string()))
            .one(&self.db)
            .await?;
        if conflict.is_some() {
            return Err(ControlError::AddressConflict(pending.address));
        }

        let peer = pending.into_active_model().insert(&self.db).await?;
        info!("Adopted pending registration {} at {}", peer.public_key, peer.address);
        Ok(peer)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn clear_pending(&self) {
        self.pending.clear();
    }

    pub async fn touch(&self, record: peer::Model, seen: DateTime<Utc>) -> Result<peer::Model> {
        let mut model = record.into_active_model();
        model.last_seen = Set(Some(seen));
        Ok(model.update(&self.db).await?)
    }

    /// Addresses held by stored peers or bound on the interface
    async fn occupied_addresses(&self) -> Result<HashSet<Ipv4Addr>> {
        let mut occupied: HashSet<Ipv4Addr> = peer::Entity::find()
            .all(&self.db)
            .await?
            .iter()
            .filter_map(|p| p.address.parse().ok())
            .collect();

        for live in self.live_peers().await? {
            occupied.extend(live.addresses());
        }
        for pending in self.pending.iter() {
            occupied.insert(pending.address);
        }

        Ok(occupied)
    }
}

pub fn peer_address(record: &peer::Model) -> Result<Ipv4Addr> {
    record.address.parse().map_err(|_| ControlError::CorruptRecord {
        field: format!("peers.address ({})", record.id),
        reason: format!("'{}' is not an IPv4 address", record.address),
    })
}

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ControlError::InvalidRequest(
            "Peer name cannot be empty".to_string(),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ControlError::InvalidRequest(format!(
            "Peer name too long (max {} characters)",
            MAX_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

pub struct ClientConfigParams<'a> {
    pub private_key: &'a str,
    pub address: Ipv4Addr,
    pub server_public_key: &'a str,
    pub endpoint: &'a str,
    pub allowed_ips: Ipv4Net,
    pub keepalive_secs: u16,
}

/// WireGuard configuration file for the client side of a registration
pub fn client_config(params: &ClientConfigParams<'_>) -> String {
    format!(
        "[Interface]\n\
         PrivateKey = {}\n\
         Address = {}/32\n\
         \n\
         [Peer]\n\
         PublicKey = {}\n\
         Endpoint = {}\n\
         AllowedIPs = {}\n\
         PersistentKeepalive = {}\n",
        params.private_key,
        params.address,
        params.server_public_key,
        params.endpoint,
        params.allowed_ips,
        params.keepalive_secs
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_layout() {
        let text = client_config(&ClientConfigParams {
            private_key: "cHJpdmF0ZQ==",
            address: Ipv4Addr::new(10, 8, 0, 2),
            server_public_key: "c2VydmVy",
            endpoint: "vpn.example.com:51820",
            allowed_ips: "10.8.0.0/16".parse().unwrap(),
            keepalive_secs: 25,
        });

        assert!(text.starts_with("[Interface]\nPrivateKey = cHJpdmF0ZQ==\n"));
        assert!(text.contains("Address = 10.8.0.2/32\n"));
        assert!(text.contains("\n\n[Peer]\nPublicKey = c2VydmVy\n"));
        assert!(text.contains("Endpoint = vpn.example.com:51820\n"));
        assert!(text.contains("AllowedIPs = 10.8.0.0/16\n"));
        assert!(text.ends_with("PersistentKeepalive = 25\n"));
    }

    #[test]
    fn test_validate_name() {
        assert_eq!(validate_name("  laptop ").unwrap(), "laptop");
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }
}
