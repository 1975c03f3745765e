//! The in-memory drivers must honour the same contracts as the real ones,
//! since the coordinator's test suites lean on them.

use std::net::{Ipv4Addr, SocketAddrV4};
use tunnelgate_drivers::{
    InterfaceDriver, InterfaceError, MemoryInterfaceDriver, MemoryProxyDriver, ProxyDriver,
    ProxyError, RouteSpec,
};

#[tokio::test]
async fn test_interface_apply_then_list() {
    let driver = MemoryInterfaceDriver::new();

    driver
        .apply_peer("key-a", Ipv4Addr::new(10, 8, 0, 2))
        .await
        .unwrap();

    let peers = driver.list_peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].allowed_ips, vec!["10.8.0.2/32"]);
}

#[tokio::test]
async fn test_interface_retract_unknown_peer_is_not_found() {
    let driver = MemoryInterfaceDriver::new();

    let err = driver.retract_peer("ghost").await.unwrap_err();
    assert!(matches!(err, InterfaceError::PeerNotFound(key) if key == "ghost"));
}

#[tokio::test]
async fn test_interface_simulated_failure() {
    let driver = MemoryInterfaceDriver::new();
    driver.fail_applies(true);

    let err = driver
        .apply_peer("key-a", Ipv4Addr::new(10, 8, 0, 2))
        .await
        .unwrap_err();
    assert!(matches!(err, InterfaceError::Command(_)));
    assert!(driver.live_keys().is_empty());
}

#[tokio::test]
async fn test_proxy_remove_is_idempotent() {
    let driver = MemoryProxyDriver::new();
    let route = RouteSpec {
        tunnel_id: "t1".to_string(),
        host: "alpha.example.com".to_string(),
        target: SocketAddrV4::new(Ipv4Addr::new(10, 8, 0, 2), 3000),
    };

    driver.write_route(&route).await.unwrap();
    driver.remove_route("t1").await.unwrap();
    driver.remove_route("t1").await.unwrap();

    assert_eq!(driver.route_count(), 0);
}

#[tokio::test]
async fn test_proxy_failed_reload_still_counts() {
    let driver = MemoryProxyDriver::new();
    driver.fail_reloads(true);

    let err = driver.reload().await.unwrap_err();
    assert!(matches!(err, ProxyError::ReloadFailed(_)));
    assert_eq!(driver.reload_count(), 1);
}
