//! External tool failures injected through mocked drivers

mod common;

use common::coordinator_with;
use sea_orm::{EntityTrait, PaginatorTrait};
use std::sync::Arc;
use std::time::Duration;
use tunnelgate_control::ErrorKind;
use tunnelgate_db::entities::{peer, tunnel, tunnel::TunnelStatus};
use tunnelgate_drivers::{
    ExecError, InterfaceError, MemoryInterfaceDriver, MemoryProxyDriver, MockInterfaceDriver,
    MockProxyDriver, ProxyError,
};

fn timeout(command: &str) -> ExecError {
    ExecError::Timeout {
        command: command.to_string(),
        timeout: Duration::from_secs(10),
    }
}

#[tokio::test]
async fn test_interface_timeout_aborts_registration() {
    let mut interface = MockInterfaceDriver::new();
    interface.expect_list_peers().returning(|| Ok(vec![]));
    interface
        .expect_apply_peer()
        .times(1)
        .returning(|_, _| Err(InterfaceError::Command(timeout("wg set wg0 peer ..."))));

    let (db, coordinator) =
        coordinator_with(Arc::new(interface), Arc::new(MemoryProxyDriver::new())).await;

    let err = coordinator.register("laptop").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ExternalToolFailure);
    assert_eq!(peer::Entity::find().count(&db).await.unwrap(), 0);
}

#[tokio::test]
async fn test_reload_failure_marks_tunnel_error() {
    let mut proxy = MockProxyDriver::new();
    proxy.expect_write_route().times(1).returning(|_| Ok(()));
    proxy.expect_reload().times(1).returning(|| {
        Err(ProxyError::ReloadFailed(ExecError::Failed {
            command: "nginx -s reload".to_string(),
            status: "exit status: 1".to_string(),
            stderr: "nginx: [emerg] unexpected \"}\"".to_string(),
        }))
    });

    let (db, coordinator) =
        coordinator_with(Arc::new(MemoryInterfaceDriver::new()), Arc::new(proxy)).await;
    let p1 = coordinator.register("p1").await.unwrap().peer;

    let err = coordinator
        .create_tunnel(p1.id, 3000, Some("alpha"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "PROXY_RELOAD_FAILED");
    let row = tunnel::Entity::find().one(&db).await.unwrap().unwrap();
    assert_eq!(row.status, TunnelStatus::Error);
    assert!(row.error_message.unwrap().contains("nginx -s reload"));
}

#[tokio::test]
async fn test_close_reports_route_removal_failure() {
    let mut proxy = MockProxyDriver::new();
    proxy.expect_write_route().returning(|_| Ok(()));
    proxy.expect_reload().returning(|| Ok(()));
    proxy.expect_remove_route().times(1).returning(|_| {
        Err(ProxyError::RemoveFailed {
            path: "/etc/nginx/tunnelgate/tunnelgate-x.conf".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        })
    });

    let (_db, coordinator) =
        coordinator_with(Arc::new(MemoryInterfaceDriver::new()), Arc::new(proxy)).await;
    let p1 = coordinator.register("p1").await.unwrap().peer;
    let t = coordinator.create_tunnel(p1.id, 3000, None).await.unwrap();

    let err = coordinator.close_tunnel(t.tunnel.id).await.unwrap_err();

    assert_eq!(err.code(), "PROXY_REMOVE_FAILED");
    // The record is closed regardless; a retried close removes the route.
    let view = coordinator.get_tunnel(t.tunnel.id).await.unwrap();
    assert_eq!(view.tunnel.status, TunnelStatus::Closed);
}

#[tokio::test]
async fn test_reset_keeps_going_when_the_interface_is_unreachable() {
    let mut interface = MockInterfaceDriver::new();
    interface
        .expect_list_peers()
        .returning(|| Err(InterfaceError::Command(timeout("wg show wg0 dump"))));

    let proxy = Arc::new(MemoryProxyDriver::new());
    let (db, coordinator) = coordinator_with(Arc::new(interface), proxy.clone()).await;

    let report = coordinator.reset().await;

    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].contains("wg show wg0 dump"));
    assert_eq!(peer::Entity::find().count(&db).await.unwrap(), 0);
    assert_eq!(proxy.reload_count(), 1);
}

#[tokio::test]
async fn test_reconcile_retracts_orphan_with_exact_key() {
    let mut interface = MockInterfaceDriver::new();
    interface.expect_list_peers().returning(|| {
        Ok(vec![tunnelgate_drivers::LivePeer {
            public_key: "orphan-key".to_string(),
            allowed_ips: vec!["10.8.0.7/32".to_string()],
            endpoint: Some("203.0.113.9:40000".to_string()),
            last_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
        }])
    });
    interface
        .expect_retract_peer()
        .withf(|key| key == "orphan-key")
        .times(1)
        .returning(|_| Ok(()));

    let (_db, coordinator) =
        coordinator_with(Arc::new(interface), Arc::new(MemoryProxyDriver::new())).await;

    let report = coordinator.reconcile().await.unwrap();

    assert_eq!(report.orphaned.len(), 1);
    assert!(report.orphaned[0].retracted);
}
