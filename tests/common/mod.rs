//! Shared test harness: a Supervisor wired to the in-process bus, an
//! in-memory profile catalog, and a manually advanced clock.

#![allow(dead_code)]

use rosterd::bus::messages::{RegisterResponse, ServerHeartbeat};
use rosterd::bus::memory::InProcessBus;
use rosterd::bus::{Bus, Envelope, channels};
use rosterd::clock::ManualClock;
use rosterd::config::Config;
use rosterd::netconfig::store::MemoryStore;
use rosterd::registry::EntryKind;
use rosterd::supervisor::{Supervisor, SupervisorParams};
use std::sync::Arc;
use std::time::Duration;

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub bus: Arc<InProcessBus>,
    pub store: Arc<MemoryStore>,
    pub supervisor: Arc<Supervisor>,
}

impl Harness {
    pub fn new() -> Self {
        let mut config = Config::default();
        config.server.metrics_port = 0;
        Self::with_config(config)
    }

    pub fn with_config(config: Config) -> Self {
        let clock = Arc::new(ManualClock::new());
        let bus = Arc::new(InProcessBus::new());
        let store = Arc::new(MemoryStore::new());
        let supervisor = Supervisor::new(SupervisorParams {
            config,
            bus: bus.clone(),
            clock: clock.clone(),
            store: store.clone(),
        });
        Self {
            clock,
            bus,
            store,
            supervisor,
        }
    }

    /// Send a raw registration payload and wait for the reply on the node's
    /// response channel.
    pub async fn register(&self, payload: serde_json::Value) -> RegisterResponse {
        let temp_id = payload["tempId"]
            .as_str()
            .expect("payload needs a tempId")
            .to_string();
        let mut reply_rx = self
            .bus
            .subscribe(&channels::registration_response(&temp_id));
        let envelope = Envelope::new(channels::REGISTER, &temp_id, &payload).unwrap();
        self.supervisor.handle_register(&envelope).await;
        let reply = tokio::time::timeout(Duration::from_secs(2), reply_rx.recv())
            .await
            .expect("registration reply timed out")
            .expect("reply channel closed");
        reply.decode().expect("reply should decode")
    }

    /// Register a MINI backend at the given address with capacity 15.
    pub async fn register_mini(&self, temp_id: &str, address: &str) -> RegisterResponse {
        self.register(serde_json::json!({
            "tempId": temp_id,
            "role": "game",
            "type": "MINI",
            "address": address,
            "port": 25566,
            "capacity": 15
        }))
        .await
    }

    /// Register a proxy at the given address.
    pub async fn register_proxy(&self, temp_id: &str, address: &str) -> RegisterResponse {
        self.register(serde_json::json!({
            "tempId": temp_id,
            "role": "proxy",
            "address": address,
            "port": 25565
        }))
        .await
    }

    /// Deliver a backend heartbeat for the given wire token.
    pub async fn backend_heartbeat(&self, id: &str) {
        let heartbeat = ServerHeartbeat {
            id: id.to_string(),
            kind: None,
            tps: 20.0,
            player_count: 3,
            max_capacity: 15,
            uptime: 60_000,
            role: None,
            available_pools: vec![],
        };
        let envelope = Envelope::new(channels::SERVER_HEARTBEAT, id, &heartbeat).unwrap();
        self.supervisor.handle_server_heartbeat(&envelope).await;
    }

    /// Deliver a proxy heartbeat for the given wire token.
    pub async fn proxy_heartbeat(&self, id: &str) {
        let payload = serde_json::json!({
            "id": id,
            "currentPlayers": 5,
            "hardCap": 200
        });
        let envelope = Envelope::new(channels::PROXY_HEARTBEAT, id, &payload).unwrap();
        self.supervisor.handle_proxy_heartbeat(&envelope).await;
    }

    /// Advance the clock one second at a time, running the monitor and the
    /// evacuation deadline sweep after each step, the way the periodic
    /// tasks do in production.
    pub fn advance_and_tick(&self, secs: u64) {
        for _ in 0..secs {
            self.clock.advance_secs(1);
            self.supervisor.monitor.tick();
            for transition in self.supervisor.evacuation.sweep() {
                self.supervisor
                    .monitor
                    .notify(EntryKind::Backend, &transition);
            }
        }
    }
}
