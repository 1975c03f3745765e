//! Drift repair and reset across the interface, the records and the routes

mod common;

use common::{harness, BASE_DOMAIN};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter};
use std::net::Ipv4Addr;
use std::time::Duration;
use tunnelgate_control::Repair;
use tunnelgate_db::entities::{peer, tunnel, tunnel::TunnelStatus};
use tunnelgate_drivers::RouteSpec;

async fn block_peer_inserts(db: &sea_orm::DatabaseConnection) {
    db.execute_unprepared(
        "CREATE TRIGGER block_peer_inserts BEFORE INSERT ON peers \
         BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
    )
    .await
    .unwrap();
}

async fn unblock_peer_inserts(db: &sea_orm::DatabaseConnection) {
    db.execute_unprepared("DROP TRIGGER block_peer_inserts")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_clean_state_needs_no_repair() {
    let h = harness().await;
    let p1 = h.coordinator.register("p1").await.unwrap().peer;
    h.coordinator.create_tunnel(p1.id, 3000, None).await.unwrap();
    let reloads = h.proxy.reload_count();

    let report = h.coordinator.reconcile().await.unwrap();

    assert!(report.is_clean(), "{:?}", report);
    assert_eq!(h.proxy.reload_count(), reloads);
}

#[tokio::test]
async fn test_unknown_live_peer_is_retracted_as_orphan() {
    let h = harness().await;
    h.interface
        .insert_live_peer("stray-key", Ipv4Addr::new(10, 8, 0, 40));

    let report = h.coordinator.reconcile().await.unwrap();

    assert_eq!(report.orphaned.len(), 1);
    assert_eq!(report.orphaned[0].public_key, "stray-key");
    assert_eq!(report.orphaned[0].allowed_ips, vec!["10.8.0.40/32"]);
    assert!(report.orphaned[0].retracted);
    assert!(h.interface.live_keys().is_empty());
}

#[tokio::test]
async fn test_pending_registration_is_adopted_in_process() {
    let h = harness().await;
    block_peer_inserts(&h.db).await;

    let err = h.coordinator.register("laptop").await.unwrap_err();
    assert_eq!(err.code(), "DATABASE_ERROR");

    // Applied on the interface, but no record.
    let live = h.interface.live_keys();
    assert_eq!(live.len(), 1);
    assert_eq!(peer::Entity::find().count(&h.db).await.unwrap(), 0);

    unblock_peer_inserts(&h.db).await;
    let report = h.coordinator.reconcile().await.unwrap();

    assert!(report.orphaned.is_empty());
    assert!(matches!(
        &report.repaired[..],
        [Repair::AdoptedPendingPeer { public_key, address }]
            if *public_key == live[0] && address == "10.8.0.2"
    ));

    let adopted = peer::Entity::find().all(&h.db).await.unwrap();
    assert_eq!(adopted.len(), 1);
    assert_eq!(adopted[0].name, "laptop");
    assert!(h.interface.contains(&live[0]));
}

#[tokio::test]
async fn test_pending_registration_is_orphaned_after_restart() {
    let h = harness().await;
    block_peer_inserts(&h.db).await;
    h.coordinator.register("laptop").await.unwrap_err();
    unblock_peer_inserts(&h.db).await;

    let restarted = h.restart();
    let report = restarted.reconcile().await.unwrap();

    assert_eq!(report.orphaned.len(), 1);
    assert!(h.interface.live_keys().is_empty());
    assert_eq!(peer::Entity::find().count(&h.db).await.unwrap(), 0);
}

#[tokio::test]
async fn test_active_record_missing_from_interface_is_reapplied() {
    let h = harness().await;
    let p1 = h.coordinator.register("p1").await.unwrap().peer;

    // Interface restarted and lost its peers.
    h.interface.set_up(true);
    tunnelgate_drivers::InterfaceDriver::retract_peer(h.interface.as_ref(), &p1.public_key)
        .await
        .unwrap();

    let report = h.coordinator.reconcile().await.unwrap();

    assert_eq!(
        report.repaired,
        vec![Repair::ReappliedPeer {
            public_key: p1.public_key.clone(),
            address: p1.address.clone(),
        }]
    );
    assert!(h.interface.contains(&p1.public_key));
}

#[tokio::test]
async fn test_records_left_intact_while_interface_is_down() {
    let h = harness().await;
    let p1 = h.coordinator.register("p1").await.unwrap().peer;
    tunnelgate_drivers::InterfaceDriver::retract_peer(h.interface.as_ref(), &p1.public_key)
        .await
        .unwrap();
    h.interface.set_up(false);

    let report = h.coordinator.reconcile().await.unwrap();

    assert!(report.is_clean(), "{:?}", report);
    assert!(!h.interface.contains(&p1.public_key));
    assert_eq!(peer::Entity::find().count(&h.db).await.unwrap(), 1);
}

#[tokio::test]
async fn test_inactive_record_still_bound_is_retracted() {
    let h = harness().await;
    let p1 = h.coordinator.register("p1").await.unwrap().peer;
    h.coordinator.set_client_active(p1.id, false).await.unwrap();
    let address: Ipv4Addr = p1.address.parse().unwrap();
    h.interface.insert_live_peer(&p1.public_key, address);

    let report = h.coordinator.reconcile().await.unwrap();

    assert_eq!(
        report.repaired,
        vec![Repair::RetractedInactivePeer {
            public_key: p1.public_key.clone()
        }]
    );
    assert!(!h.interface.contains(&p1.public_key));
}

#[tokio::test]
async fn test_routes_are_regenerated_and_swept_with_one_reload() {
    let h = harness().await;
    let p1 = h.coordinator.register("p1").await.unwrap().peer;
    let t = h
        .coordinator
        .create_tunnel(p1.id, 3000, Some("alpha"))
        .await
        .unwrap();
    let tunnel_id = t.tunnel.id.to_string();

    // Lose the live route and leave a stale one behind.
    tunnelgate_drivers::ProxyDriver::remove_route(h.proxy.as_ref(), &tunnel_id)
        .await
        .unwrap();
    h.proxy.insert_route(RouteSpec {
        tunnel_id: "stale".to_string(),
        host: format!("gone.{}", BASE_DOMAIN),
        target: "10.8.0.99:80".parse().unwrap(),
    });
    let reloads = h.proxy.reload_count();

    let report = h.coordinator.reconcile().await.unwrap();

    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert!(report.repaired.contains(&Repair::RegeneratedRoute {
        tunnel_id: tunnel_id.clone()
    }));
    assert!(report.repaired.contains(&Repair::RemovedRoute {
        tunnel_id: "stale".to_string()
    }));
    assert_eq!(h.proxy.reload_count(), reloads + 1);

    let route = h.proxy.route(&tunnel_id).unwrap();
    assert_eq!(route.host, format!("alpha.{}", BASE_DOMAIN));
    assert!(h.proxy.route("stale").is_none());
}

#[tokio::test]
async fn test_active_tunnel_of_inactive_peer_is_closed() {
    let h = harness().await;
    let p1 = h.coordinator.register("p1").await.unwrap().peer;
    let t = h.coordinator.create_tunnel(p1.id, 3000, None).await.unwrap();

    // Flip the record behind the coordinator's back.
    peer::Entity::update_many()
        .col_expr(peer::Column::IsActive, Expr::value(false))
        .filter(peer::Column::Id.eq(p1.id))
        .exec(&h.db)
        .await
        .unwrap();

    let report = h.coordinator.reconcile().await.unwrap();

    assert!(report.repaired.contains(&Repair::ClosedTunnel {
        tunnel_id: t.tunnel.id,
        reason: "peer inactive".to_string(),
    }));
    let row = tunnel::Entity::find_by_id(t.tunnel.id)
        .one(&h.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, TunnelStatus::Closed);
    assert_eq!(h.proxy.route_count(), 0);
}

#[tokio::test]
async fn test_reset_with_no_records_and_live_peers() {
    let h = harness().await;
    for i in 0..3u8 {
        h.interface
            .insert_live_peer(&format!("live-{}", i), Ipv4Addr::new(10, 8, 0, 10 + i));
    }

    let report = h.coordinator.reset().await;

    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(report.orphaned.len(), 3);
    assert!(h.interface.live_keys().is_empty());
    assert_eq!(peer::Entity::find().count(&h.db).await.unwrap(), 0);
    assert_eq!(tunnel::Entity::find().count(&h.db).await.unwrap(), 0);
}

#[tokio::test]
async fn test_reset_clears_everything_and_restarts_allocation() {
    let h = harness().await;
    for i in 0..3 {
        let p = h
            .coordinator
            .register(&format!("p{}", i))
            .await
            .unwrap()
            .peer;
        h.coordinator.create_tunnel(p.id, 3000, None).await.unwrap();
    }

    let report = h.coordinator.reset().await;

    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert!(report.repaired.contains(&Repair::DeletedRecords {
        peers: 3,
        tunnels: 3
    }));
    assert!(report.repaired.contains(&Repair::ClearedAddressCursor));
    assert!(h.interface.live_keys().is_empty());
    assert_eq!(h.proxy.route_count(), 0);

    let again = h.coordinator.register("fresh").await.unwrap();
    assert_eq!(again.peer.address, "10.8.0.2");
}

#[tokio::test]
async fn test_reconcile_keeps_route_of_tunnel_created_mid_pass() {
    let h = harness().await;
    let p1 = h.coordinator.register("p1").await.unwrap().peer;
    h.proxy.set_list_delay(Duration::from_millis(300));

    let (report, created) = tokio::join!(h.coordinator.reconcile(), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.coordinator.create_tunnel(p1.id, 3000, Some("alpha")).await
    });

    let report = report.unwrap();
    let created = created.unwrap();
    assert!(
        !report
            .repaired
            .iter()
            .any(|r| matches!(r, Repair::RemovedRoute { .. })),
        "{:?}",
        report
    );

    let current = h.coordinator.get_tunnel(created.tunnel.id).await.unwrap();
    assert_eq!(current.tunnel.status, TunnelStatus::Active);
    assert!(h.proxy.route(&created.tunnel.id.to_string()).is_some());
}

#[tokio::test]
async fn test_reconcile_does_not_orphan_peer_registered_mid_pass() {
    let h = harness().await;
    // Sorts ahead of any generated key, so its slow retraction runs first
    h.interface
        .insert_live_peer("++++orphan", Ipv4Addr::new(10, 8, 0, 200));
    h.interface.set_command_delay(Duration::from_millis(300));

    let (registered, report) = tokio::join!(h.coordinator.register("p1"), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.coordinator.reconcile().await
    });

    let registered = registered.unwrap();
    let report = report.unwrap();
    let orphaned: Vec<&str> = report
        .orphaned
        .iter()
        .map(|o| o.public_key.as_str())
        .collect();
    assert_eq!(orphaned, vec!["++++orphan"]);
    assert!(h.interface.contains(&registered.peer.public_key));
    assert!(!h.interface.contains("++++orphan"));
}

#[tokio::test]
async fn test_concurrent_registrations_and_reconciles_agree() {
    let h = std::sync::Arc::new(harness().await);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let h = h.clone();
            tokio::spawn(async move {
                if i % 2 == 0 {
                    h.coordinator.reconcile().await.map(|_| None)
                } else {
                    h.coordinator
                        .register(&format!("client-{}", i))
                        .await
                        .map(|reg| Some(reg.peer.public_key))
                }
            })
        })
        .collect();

    let mut registered = Vec::new();
    for handle in handles {
        if let Some(key) = handle.await.unwrap().unwrap() {
            registered.push(key);
        }
    }

    assert_eq!(registered.len(), 4);
    for key in &registered {
        assert!(h.interface.contains(key), "peer {} lost its binding", key);
    }
    assert_eq!(peer::Entity::find().count(&h.db).await.unwrap(), 4);
}

#[tokio::test]
async fn test_reset_drops_traffic_baselines() {
    let h = harness().await;
    let p1 = h.coordinator.register("p1").await.unwrap().peer;
    h.coordinator.create_tunnel(p1.id, 3000, None).await.unwrap();
    h.interface.set_stats(&p1.public_key, 500, 700, None);
    h.coordinator.sync_stats().await.unwrap();
    assert_eq!(h.coordinator.stats().tracked_peers(), 1);

    h.coordinator.reset().await;

    assert_eq!(h.coordinator.stats().tracked_peers(), 0);
}
