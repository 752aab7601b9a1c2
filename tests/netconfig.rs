//! Network configuration distribution: apply/refresh semantics, the bus
//! request/response surface, and the SQLite-backed catalog.

mod common;

use common::Harness;
use chrono::Utc;
use rosterd::bus::{Bus, Envelope, channels};
use rosterd::netconfig::store::{ProfileStore, SqliteStore};
use rosterd::netconfig::{NetworkProfile, default_profile};
use std::time::Duration;

fn profile(id: &str, tag: &str) -> NetworkProfile {
    NetworkProfile {
        profile_id: id.to_string(),
        tag: tag.to_string(),
        ..default_profile(Utc::now())
    }
}

#[tokio::test]
async fn apply_broadcasts_after_swap() {
    let harness = Harness::new();
    harness.store.save(&profile("default", "DEFAULT")).await.unwrap();
    harness.store.save(&profile("winter", "WINTER")).await.unwrap();
    harness.supervisor.netconfig.initialize().await.unwrap();

    let mut updates = harness.bus.subscribe(channels::CONFIG_UPDATED);
    harness.supervisor.netconfig.apply_profile("winter").await.unwrap();

    let envelope = tokio::time::timeout(Duration::from_secs(2), updates.recv())
        .await
        .expect("update broadcast timed out")
        .unwrap();
    assert_eq!(envelope.payload["profileId"], "winter");
    assert_eq!(
        harness
            .supervisor
            .netconfig
            .get_active_profile()
            .unwrap()
            .profile_id,
        "winter"
    );
}

#[tokio::test]
async fn invalid_profile_is_rejected_without_broadcast() {
    let harness = Harness::new();
    harness.store.save(&profile("default", "DEFAULT")).await.unwrap();
    let mut broken = profile("broken", "BROKEN");
    broken.scoreboard.title = None;
    harness.store.save(&broken).await.unwrap();
    harness.supervisor.netconfig.initialize().await.unwrap();
    harness.supervisor.netconfig.apply_profile("default").await.unwrap();

    let mut updates = harness.bus.subscribe(channels::CONFIG_UPDATED);
    let err = harness
        .supervisor
        .netconfig
        .apply_profile("broken")
        .await
        .unwrap_err();
    match err {
        rosterd::error::ProfileError::Validation(errors) => {
            assert_eq!(errors, vec!["scoreboard.title is blank".to_string()]);
        }
        other => panic!("expected validation error, got {other:?}"),
    }

    // Active unchanged, nothing broadcast.
    assert_eq!(
        harness
            .supervisor
            .netconfig
            .get_active_profile()
            .unwrap()
            .profile_id,
        "default"
    );
    assert!(updates.try_recv().is_err());
}

#[tokio::test]
async fn empty_catalog_is_seeded_on_startup() {
    let harness = Harness::new();
    harness.supervisor.netconfig.initialize().await.unwrap();

    let profiles = harness.supervisor.netconfig.list_profiles().await.unwrap();
    assert_eq!(profiles.len(), 1);
    assert!(profiles[0].active);
    assert_eq!(profiles[0].profile_id, "default");
}

#[tokio::test]
async fn config_request_over_the_bus_round_trips() {
    let harness = Harness::new();
    harness.store.save(&profile("default", "DEFAULT")).await.unwrap();
    harness.supervisor.netconfig.initialize().await.unwrap();
    harness.supervisor.netconfig.apply_profile("default").await.unwrap();
    harness.supervisor.start().await.unwrap();

    // A node fetches the active profile with request/reply correlation.
    let request = serde_json::json!({"requestId": "req-1", "refresh": false});
    let reply = harness
        .bus
        .request(
            channels::CONFIG_REQUEST,
            channels::CONFIG_RESPONSE,
            Envelope::new(channels::CONFIG_REQUEST, "backend-0", &request).unwrap(),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

    assert_eq!(reply.payload["requestId"], "req-1");
    assert_eq!(reply.payload["ok"], true);
    assert_eq!(reply.payload["profile"]["profileId"], "default");
}

#[tokio::test]
async fn config_request_for_unknown_profile_fails_cleanly() {
    let harness = Harness::new();
    harness.supervisor.netconfig.initialize().await.unwrap();
    harness.supervisor.start().await.unwrap();

    let request = serde_json::json!({"requestId": "req-2", "profileId": "missing"});
    let reply = harness
        .bus
        .request(
            channels::CONFIG_REQUEST,
            channels::CONFIG_RESPONSE,
            Envelope::new(channels::CONFIG_REQUEST, "backend-0", &request).unwrap(),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

    assert_eq!(reply.payload["ok"], false);
    assert_eq!(reply.payload["error"], "profile not found: missing");
    assert!(reply.payload["profile"].is_null());
}

#[tokio::test]
async fn sqlite_catalog_round_trips_documents() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("profiles.db");
    let store = SqliteStore::connect(path.to_str().unwrap()).await.unwrap();

    let mut winter = profile("winter", "WINTER");
    winter.motd = vec!["line one".to_string(), "line two".to_string()];
    winter
        .data
        .insert("maintenance".to_string(), serde_json::json!(false));
    store.save(&winter).await.unwrap();
    store.save(&profile("default", "DEFAULT")).await.unwrap();

    let summaries = store.list().await.unwrap();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].profile_id, "default");

    let loaded = store.load("winter").await.unwrap().unwrap();
    assert_eq!(loaded.motd, winter.motd);
    assert_eq!(loaded.data["maintenance"], serde_json::json!(false));
    assert_eq!(loaded.ranks.len(), 1);

    assert!(store.load("nope").await.unwrap().is_none());

    // Overwrite keeps a single row per profile.
    winter.tag = "WINTER2".to_string();
    store.save(&winter).await.unwrap();
    let loaded = store.load("winter").await.unwrap().unwrap();
    assert_eq!(loaded.tag, "WINTER2");
    assert_eq!(store.list().await.unwrap().len(), 2);
}

#[tokio::test]
async fn sqlite_active_pointer_is_single_row() {
    use rosterd::netconfig::store::ActivePointer;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("profiles.db");
    let store = SqliteStore::connect(path.to_str().unwrap()).await.unwrap();

    assert!(store.active_pointer().await.unwrap().is_none());

    let now = Utc::now();
    store
        .set_active(&ActivePointer {
            profile_id: "a".to_string(),
            tag: "A".to_string(),
            updated_at: now,
        })
        .await
        .unwrap();
    store
        .set_active(&ActivePointer {
            profile_id: "b".to_string(),
            tag: "B".to_string(),
            updated_at: now,
        })
        .await
        .unwrap();

    let pointer = store.active_pointer().await.unwrap().unwrap();
    assert_eq!(pointer.profile_id, "b");
    assert_eq!(pointer.updated_at.timestamp_millis(), now.timestamp_millis());
}

#[tokio::test]
async fn concurrent_readers_never_see_a_partial_profile() {
    let harness = Harness::new();
    harness.store.save(&profile("a", "A")).await.unwrap();
    harness.store.save(&profile("b", "B")).await.unwrap();
    harness.supervisor.netconfig.initialize().await.unwrap();
    harness.supervisor.netconfig.apply_profile("a").await.unwrap();

    let netconfig = harness.supervisor.netconfig.clone();
    let reader = tokio::spawn(async move {
        for _ in 0..500 {
            let active = netconfig.get_active_profile().unwrap();
            // Tag always matches the profile it was written with.
            assert_eq!(active.tag.to_lowercase(), active.profile_id);
            tokio::task::yield_now().await;
        }
    });

    for _ in 0..50 {
        harness.supervisor.netconfig.apply_profile("b").await.unwrap();
        harness.supervisor.netconfig.apply_profile("a").await.unwrap();
    }
    reader.await.unwrap();
}
