//! Route provisioning on top of a [`ProxyDriver`]

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tunnelgate_db::entities::{peer, tunnel};
use tunnelgate_drivers::{ProxyDriver, ProxyError, RouteSpec};

use crate::error::{ControlError, Result};

/// Build the artifact description for a tunnel routed to `peer`
pub fn route_spec(tunnel: &tunnel::Model, peer: &peer::Model, base_domain: &str) -> Result<RouteSpec> {
    let address: Ipv4Addr = peer.address.parse().map_err(|_| ControlError::CorruptRecord {
        field: format!("peers.address ({})", peer.id),
        reason: format!("'{}' is not an IPv4 address", peer.address),
    })?;
    let port = u16::try_from(tunnel.local_port).map_err(|_| ControlError::CorruptRecord {
        field: format!("tunnels.local_port ({})", tunnel.id),
        reason: format!("{} is not a port number", tunnel.local_port),
    })?;

    Ok(RouteSpec {
        tunnel_id: tunnel.id.to_string(),
        host: format!("{}.{}", tunnel.subdomain, base_domain),
        target: SocketAddrV4::new(address, port),
    })
}

/// Writes and removes route artifacts and coalesces proxy reloads.
///
/// Every reload request takes a ticket. A reload that starts after a ticket was
/// issued satisfies it, so callers queued behind a running reload share the next
/// one instead of each running their own.
pub struct RouteProvisioner {
    driver: Arc<dyn ProxyDriver>,
    requested: AtomicU64,
    completed: Mutex<u64>,
}

impl RouteProvisioner {
    pub fn new(driver: Arc<dyn ProxyDriver>) -> Self {
        Self {
            driver,
            requested: AtomicU64::new(0),
            completed: Mutex::new(0),
        }
    }

    /// Write the artifact and reload
    pub async fn provision(&self, route: &RouteSpec) -> Result<()> {
        self.write(route).await?;
        self.reload().await?;
        info!("Provisioned route {} -> {}", route.host, route.target);
        Ok(())
    }

    /// Remove the artifact (absent is fine) and reload
    pub async fn deprovision(&self, tunnel_id: &str) -> Result<()> {
        self.remove(tunnel_id).await?;
        self.reload().await?;
        debug!("Deprovisioned route for tunnel {}", tunnel_id);
        Ok(())
    }

    /// Write without reloading; batch callers reload once at the end
    pub async fn write(&self, route: &RouteSpec) -> Result<()> {
        self.driver.write_route(route).await.map_err(|e| {
            warn!("Failed to write route for tunnel {}: {}", route.tunnel_id, e);
            ControlError::from(e)
        })
    }

    pub async fn remove(&self, tunnel_id: &str) -> Result<()> {
        self.driver.remove_route(tunnel_id).await.map_err(|e| {
            warn!("Failed to remove route for tunnel {}: {}", tunnel_id, e);
            ControlError::from(e)
        })
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        Ok(self.driver.list_routes().await?)
    }

    pub async fn reload(&self) -> Result<()> {
        let ticket = self.requested.fetch_add(1, Ordering::SeqCst) + 1;

        let mut completed = self.completed.lock().await;
        if *completed >= ticket {
            debug!("Reload ticket {} already covered", ticket);
            return Ok(());
        }

        // Everything requested up to here is covered by the reload about to start.
        let target = self.requested.load(Ordering::SeqCst);
        match self.driver.reload().await {
            Ok(()) => {
                *completed = target;
                Ok(())
            }
            Err(e) => {
                if let ProxyError::ReloadFailed(exec) = &e {
                    warn!("Proxy reload failed ({}): {}", exec.command(), exec);
                }
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tunnelgate_drivers::MemoryProxyDriver;

    fn spec(id: &str) -> RouteSpec {
        RouteSpec {
            tunnel_id: id.to_string(),
            host: format!("{}.example.com", id),
            target: SocketAddrV4::new(Ipv4Addr::new(10, 8, 0, 2), 3000),
        }
    }

    #[tokio::test]
    async fn test_concurrent_reloads_coalesce() {
        let driver = Arc::new(MemoryProxyDriver::new());
        driver.set_reload_delay(Duration::from_millis(50));
        let provisioner = Arc::new(RouteProvisioner::new(driver.clone()));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let p = provisioner.clone();
                tokio::spawn(async move { p.reload().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // The first reload runs alone; the four queued behind it share one.
        assert_eq!(driver.reload_count(), 2);
    }

    #[tokio::test]
    async fn test_sequential_reloads_each_run() {
        let driver = Arc::new(MemoryProxyDriver::new());
        let provisioner = RouteProvisioner::new(driver.clone());

        provisioner.reload().await.unwrap();
        provisioner.reload().await.unwrap();

        assert_eq!(driver.reload_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_reload_does_not_satisfy_later_requests() {
        let driver = Arc::new(MemoryProxyDriver::new());
        let provisioner = RouteProvisioner::new(driver.clone());

        driver.fail_reloads(true);
        let err = provisioner.provision(&spec("one")).await.unwrap_err();
        assert_eq!(err.code(), "PROXY_RELOAD_FAILED");
        // The artifact was written even though the reload failed.
        assert!(driver.route("one").is_some());

        driver.fail_reloads(false);
        provisioner.reload().await.unwrap();
        assert_eq!(driver.reload_count(), 2);
    }

    #[tokio::test]
    async fn test_write_failure_skips_reload() {
        let driver = Arc::new(MemoryProxyDriver::new());
        driver.fail_writes(true);
        let provisioner = RouteProvisioner::new(driver.clone());

        let err = provisioner.provision(&spec("two")).await.unwrap_err();
        assert_eq!(err.code(), "PROXY_WRITE_FAILED");
        assert_eq!(driver.reload_count(), 0);
    }
}
