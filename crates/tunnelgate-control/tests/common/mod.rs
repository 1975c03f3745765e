#![allow(dead_code)]

use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tunnelgate_control::{Coordinator, CoordinatorConfig};
use tunnelgate_drivers::{InterfaceDriver, MemoryInterfaceDriver, MemoryProxyDriver, ProxyDriver};

pub const BASE_DOMAIN: &str = "tunnels.example.com";

pub struct Harness {
    pub db: DatabaseConnection,
    pub interface: Arc<MemoryInterfaceDriver>,
    pub proxy: Arc<MemoryProxyDriver>,
    pub coordinator: Coordinator,
}

impl Harness {
    /// A second coordinator over the same stores, as after a process restart
    pub fn restart(&self) -> Coordinator {
        Coordinator::new(
            self.db.clone(),
            config("10.8.0.0/16"),
            self.interface.clone(),
            self.proxy.clone(),
        )
        .unwrap()
    }
}

pub fn config(cidr: &str) -> CoordinatorConfig {
    CoordinatorConfig::new(cidr.parse().unwrap(), "vpn.example.com:51820")
        .with_base_domain(BASE_DOMAIN)
}

pub async fn setup_db() -> DatabaseConnection {
    let db = tunnelgate_db::connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory database");
    tunnelgate_db::migrate(&db)
        .await
        .expect("Failed to run migrations");
    db
}

pub async fn harness() -> Harness {
    harness_with(config("10.8.0.0/16")).await
}

pub async fn harness_with(config: CoordinatorConfig) -> Harness {
    let db = setup_db().await;
    let interface = Arc::new(MemoryInterfaceDriver::new());
    let proxy = Arc::new(MemoryProxyDriver::new());

    let coordinator = Coordinator::new(db.clone(), config, interface.clone(), proxy.clone())
        .expect("Failed to build coordinator");
    coordinator
        .initialize()
        .await
        .expect("Failed to initialize coordinator");

    Harness {
        db,
        interface,
        proxy,
        coordinator,
    }
}

/// Coordinator over arbitrary (usually mocked) drivers
pub async fn coordinator_with(
    interface: Arc<dyn InterfaceDriver>,
    proxy: Arc<dyn ProxyDriver>,
) -> (DatabaseConnection, Coordinator) {
    let db = setup_db().await;
    let coordinator = Coordinator::new(db.clone(), config("10.8.0.0/16"), interface, proxy)
        .expect("Failed to build coordinator");
    coordinator
        .initialize()
        .await
        .expect("Failed to initialize coordinator");
    (db, coordinator)
}
