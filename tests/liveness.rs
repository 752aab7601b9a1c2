//! Heartbeat-driven status transitions, ID recycling, and the status
//! broadcast fan-out, on a synthetic clock.

mod common;

use common::Harness;
use rosterd::bus::{Bus, channels};
use rosterd::registry::NodeStatus;

/// Status broadcasts are published from spawned tasks; give the scheduler
/// room to run them before inspecting the channel.
async fn drain_spawned_tasks() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn missed_heartbeats_demote_then_heartbeat_promotes() {
    let harness = Harness::new();
    harness.register_mini("temp-a", "10.0.0.1").await;

    // 16 seconds of silence crosses the soft timeout.
    harness.advance_and_tick(16);
    assert_eq!(
        harness.supervisor.backends.get(0).unwrap().status,
        NodeStatus::Unavailable
    );

    // A heartbeat at t=20s brings it back.
    harness.clock.advance_secs(4);
    harness.backend_heartbeat("backend-0").await;
    assert_eq!(
        harness.supervisor.backends.get(0).unwrap().status,
        NodeStatus::Available
    );
}

#[tokio::test]
async fn dead_id_stays_reserved_through_recycle_window() {
    let harness = Harness::new();
    harness.register_mini("temp-a", "10.0.0.1").await;

    // 61 seconds of silence: soft timeout, then hard timeout.
    harness.advance_and_tick(61);
    assert_eq!(
        harness.supervisor.backends.get(0).unwrap().status,
        NodeStatus::Dead
    );

    // A new backend one second later must not take the reserved ID.
    harness.clock.advance_secs(1);
    let fresh = harness.register_mini("temp-b", "10.0.0.2").await;
    assert_eq!(fresh.assigned_id.as_deref(), Some("backend-1"));

    // Past the recycle window the ID may be handed out again.
    harness.advance_and_tick(301);
    let recycled = harness.register_mini("temp-c", "10.0.0.3").await;
    assert_eq!(recycled.assigned_id.as_deref(), Some("backend-0"));
}

#[tokio::test]
async fn status_sequence_is_monotonic_per_entry() {
    let harness = Harness::new();
    let mut status_rx = harness.bus.subscribe(channels::STATUS_CHANGED);
    harness.register_mini("temp-a", "10.0.0.1").await;

    // Heartbeat for a while, then fall silent until DEAD.
    for _ in 0..10 {
        harness.advance_and_tick(5);
        harness.backend_heartbeat("backend-0").await;
    }
    harness.advance_and_tick(130);
    assert_eq!(
        harness.supervisor.backends.get(0).unwrap().status,
        NodeStatus::Dead
    );

    // Collect every broadcast transition for this entry. The observed
    // sequence must be AVAILABLE -> UNAVAILABLE -> DEAD with no other
    // intermediate states (no heartbeat arrived once silence began).
    drain_spawned_tasks().await;
    let mut sequence = Vec::new();
    while let Ok(envelope) = status_rx.try_recv() {
        if envelope.payload["id"] == "backend-0" {
            sequence.push(envelope.payload["to"].as_str().unwrap().to_string());
        }
    }
    assert_eq!(sequence, vec!["UNAVAILABLE", "DEAD"]);
}

#[tokio::test]
async fn promotion_is_broadcast_too() {
    let harness = Harness::new();
    harness.register_proxy("temp-p", "10.0.0.10").await;
    let mut status_rx = harness.bus.subscribe(channels::STATUS_CHANGED);

    harness.advance_and_tick(16);
    harness.proxy_heartbeat("proxy-0").await;

    drain_spawned_tasks().await;
    let mut seen = Vec::new();
    while let Ok(envelope) = status_rx.try_recv() {
        seen.push((
            envelope.payload["from"].as_str().unwrap().to_string(),
            envelope.payload["to"].as_str().unwrap().to_string(),
        ));
    }
    assert_eq!(
        seen,
        vec![
            ("AVAILABLE".to_string(), "UNAVAILABLE".to_string()),
            ("UNAVAILABLE".to_string(), "AVAILABLE".to_string()),
        ]
    );
}

#[tokio::test]
async fn heartbeat_from_unknown_node_is_tolerated() {
    let harness = Harness::new();
    // Simulates nodes that outlived a core restart: no panic, no entry.
    harness.backend_heartbeat("backend-7").await;
    harness.proxy_heartbeat("proxy-3").await;
    assert!(harness.supervisor.backends.snapshot().is_empty());
    assert!(harness.supervisor.proxies.snapshot().is_empty());
}

#[tokio::test]
async fn console_tracks_liveness() {
    let harness = Harness::new();
    harness.register_proxy("temp-p", "10.0.0.10").await;
    harness.register_mini("temp-a", "10.0.0.1").await;

    let table = harness.supervisor.console.proxy_table(1);
    assert!(table.contains("proxy-0"));
    assert!(table.contains("AVAILABLE"));

    harness.advance_and_tick(16);
    let table = harness.supervisor.console.proxy_table(1);
    assert!(table.contains("UNAVAILABLE"));

    let table = harness.supervisor.console.backend_table(1);
    assert!(table.contains("backend-0"));
    assert!(table.contains("game"));
}
