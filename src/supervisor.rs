//! The Supervisor - central wiring for the registry control plane.
//!
//! Owns every component, subscribes the bus channels, and dispatches
//! incoming envelopes to the registries, the evacuation coordinator, and
//! the network-config manager. Constructed once and threaded through
//! collaborators; there are no global singletons.
//!
//! # Lock Order (Deadlock Prevention)
//!
//! 1. Registry table mutex (proxies or backends, never both)
//! 2. Network-config snapshot lock
//!
//! Handlers never hold a registry lock across an await; every bus publish
//! happens after the mutation has been committed and the lock released.

use crate::bus::messages::{
    ConfigRequest, EvacuationResponse, ProxyHeartbeat, RegisterRequest, RegisterResponse,
    RemoveRequest, ServerHeartbeat, StatusChanged,
};
use crate::bus::{Bus, Envelope, channels};
use crate::clock::Clock;
use crate::config::Config;
use crate::console::ConsoleView;
use crate::error::RegistryResult;
use crate::netconfig::NetworkConfigManager;
use crate::netconfig::store::ProfileStore;
use crate::registry::entry::BackendKind;
use crate::registry::evacuation::EvacuationCoordinator;
use crate::registry::{
    AgingPolicy, BackendRegistry, BackendSpec, BackendStats, EntryKind, HeartbeatMonitor, IdRole,
    ProxyRegistry, StatusListener,
};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Publishes registry status transitions on the bus.
struct BusStatusBroadcaster {
    bus: Arc<dyn Bus>,
    sender_id: String,
}

impl StatusListener for BusStatusBroadcaster {
    fn on_status_changed(&self, kind: EntryKind, id: &str, from: &str, to: &str) {
        let payload = StatusChanged {
            kind: kind.as_str().to_string(),
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        };
        let envelope = match Envelope::new(channels::STATUS_CHANGED, &self.sender_id, &payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode status broadcast");
                return;
            }
        };
        let bus = self.bus.clone();
        tokio::spawn(async move {
            if let Err(e) = bus.publish(channels::STATUS_CHANGED, envelope).await {
                tracing::warn!(error = %e, "Failed to publish status broadcast");
            }
        });
    }
}

/// Parameters for creating a new Supervisor.
pub struct SupervisorParams {
    pub config: Config,
    pub bus: Arc<dyn Bus>,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn ProfileStore>,
}

/// Central owner of all registry components.
pub struct Supervisor {
    pub proxies: Arc<ProxyRegistry>,
    pub backends: Arc<BackendRegistry>,
    pub monitor: Arc<HeartbeatMonitor>,
    pub evacuation: Arc<EvacuationCoordinator>,
    pub netconfig: Arc<NetworkConfigManager>,
    pub console: Arc<ConsoleView>,
    pub bus: Arc<dyn Bus>,
    pub clock: Arc<dyn Clock>,

    /// Shutdown signal broadcaster; every periodic task selects on it.
    pub shutdown_tx: broadcast::Sender<()>,

    config: Config,
    sender_id: String,
}

impl Supervisor {
    /// Wire all components. Nothing runs until [`start`](Self::start).
    pub fn new(params: SupervisorParams) -> Arc<Self> {
        let SupervisorParams {
            config,
            bus,
            clock,
            store,
        } = params;

        let sender_id = config.server.name.clone();
        let reg = &config.registry;

        let proxies = Arc::new(ProxyRegistry::new(
            clock.clone(),
            reg.dedup_window_ms(),
            reg.recycle_window_ms(),
        ));
        let backends = Arc::new(BackendRegistry::new(
            clock.clone(),
            reg.dedup_window_ms(),
            reg.recycle_window_ms(),
        ));

        let mut monitor = HeartbeatMonitor::new(
            proxies.clone(),
            backends.clone(),
            AgingPolicy {
                soft_timeout_ms: reg.soft_timeout_ms(),
                hard_timeout_ms: reg.hard_timeout_ms(),
            },
        );
        monitor.add_listener(Arc::new(BusStatusBroadcaster {
            bus: bus.clone(),
            sender_id: sender_id.clone(),
        }));
        let monitor = Arc::new(monitor);

        let evacuation = Arc::new(EvacuationCoordinator::new(
            backends.clone(),
            bus.clone(),
            clock.clone(),
            reg.evacuation_deadline_ms(),
            sender_id.clone(),
        ));

        let netconfig = Arc::new(NetworkConfigManager::new(
            store,
            bus.clone(),
            clock.clone(),
            sender_id.clone(),
        ));

        let console = Arc::new(ConsoleView::new(
            proxies.clone(),
            backends.clone(),
            clock.clone(),
            reg.console_page_size,
            reg.dead_display_ms(),
        ));

        let (shutdown_tx, _) = broadcast::channel(16);

        Arc::new(Self {
            proxies,
            backends,
            monitor,
            evacuation,
            netconfig,
            console,
            bus,
            clock,
            shutdown_tx,
            config,
            sender_id,
        })
    }

    /// Bring the control plane up: seed/load the profile catalog, ask the
    /// fleet to re-identify, and spawn the periodic tasks and dispatchers.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.netconfig.initialize().await?;

        // Registry state does not survive restarts; ask every running node
        // to register again.
        let envelope = Envelope::new(
            channels::REREGISTRATION_REQUEST,
            &self.sender_id,
            &serde_json::json!({}),
        )?;
        self.bus
            .publish(channels::REREGISTRATION_REQUEST, envelope)
            .await?;
        tracing::info!("Re-registration request broadcast");

        self.monitor.clone().spawn(
            self.config.registry.heartbeat_tick(),
            self.shutdown_tx.subscribe(),
        );
        tracing::info!("Heartbeat monitor started");

        self.spawn_evacuation_sweeper();
        tracing::info!("Evacuation deadline sweeper started");

        self.spawn_dispatchers();
        tracing::info!("Bus dispatchers started");

        Ok(())
    }

    /// Operator surface: trigger an evacuation by wire token.
    pub async fn evacuate(&self, token: &str, reason: &str) -> RegistryResult<()> {
        let Some((IdRole::Backend, id)) = IdRole::parse(token) else {
            return Err(crate::error::RegistryError::NotFound(token.to_string()));
        };
        let transition = self.evacuation.evacuate(id, reason).await?;
        self.monitor.notify(EntryKind::Backend, &transition);
        Ok(())
    }

    /// Operator surface: free a stuck reserved ID.
    pub fn force_release(&self, token: &str) -> RegistryResult<bool> {
        match IdRole::parse(token) {
            Some((IdRole::Proxy, id)) => Ok(self.proxies.force_release(id)),
            Some((IdRole::Backend, id)) => Ok(self.backends.force_release(id)),
            None => Err(crate::error::RegistryError::NotFound(token.to_string())),
        }
    }

    fn spawn_evacuation_sweeper(self: &Arc<Self>) {
        let supervisor = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let tick = self.config.registry.heartbeat_tick();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        for transition in supervisor.evacuation.sweep() {
                            supervisor.monitor.notify(EntryKind::Backend, &transition);
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    fn spawn_dispatchers(self: &Arc<Self>) {
        macro_rules! dispatch {
            ($channel:expr, $handler:ident) => {{
                let supervisor = self.clone();
                let mut rx = self.bus.subscribe($channel);
                let mut shutdown_rx = self.shutdown_tx.subscribe();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            Some(envelope) = rx.recv() => {
                                supervisor.$handler(&envelope).await;
                            }
                            _ = shutdown_rx.recv() => break,
                        }
                    }
                });
            }};
        }

        dispatch!(channels::REGISTER, handle_register);
        dispatch!(channels::SERVER_HEARTBEAT, handle_server_heartbeat);
        dispatch!(channels::PROXY_HEARTBEAT, handle_proxy_heartbeat);
        dispatch!(channels::SERVER_REMOVE, handle_remove);
        dispatch!(channels::EVACUATION_RESPONSE, handle_evacuation_response);
        dispatch!(channels::CONFIG_REQUEST, handle_config_request);
    }

    /// Handle `registry:register`.
    pub async fn handle_register(&self, envelope: &Envelope) {
        let request: RegisterRequest = match envelope.decode() {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed registration request");
                return;
            }
        };

        let result = if request.is_proxy() {
            self.proxies
                .register(&request.temp_id, &request.address, request.port)
                .map(|outcome| (IdRole::Proxy, outcome))
        } else {
            let spec = BackendSpec {
                temp_id: request.temp_id.clone(),
                address: request.address.clone(),
                port: request.port,
                kind: request.kind.unwrap_or(BackendKind::Mini),
                role: request.role.clone(),
                capacity: request.capacity,
            };
            self.backends
                .register(&spec)
                .map(|outcome| (IdRole::Backend, outcome))
        };

        let response = match &result {
            Ok((role, outcome)) => {
                crate::metrics::REGISTRATIONS.inc();
                RegisterResponse {
                    success: true,
                    assigned_id: Some(role.render(outcome.id())),
                    message: if outcome.reused() {
                        "already registered".to_string()
                    } else {
                        "registered".to_string()
                    },
                }
            }
            Err(e) => {
                if e.is_invariant() {
                    crate::metrics::INVARIANT_VIOLATIONS.inc();
                    tracing::error!(temp_id = %request.temp_id, error = %e, "Registration violated an invariant");
                } else {
                    tracing::warn!(temp_id = %request.temp_id, error = %e, "Registration refused");
                }
                RegisterResponse {
                    success: false,
                    assigned_id: None,
                    message: e.to_string(),
                }
            }
        };

        let reply_channel = channels::registration_response(&request.temp_id);
        self.publish(&reply_channel, &response).await;

        // Fan a fresh proxy out to the fleet so backends can discover it.
        if let Ok((IdRole::Proxy, outcome)) = &result
            && !outcome.reused()
        {
            let announce = ProxyHeartbeat {
                id: IdRole::Proxy.render(outcome.id()),
                current_players: 0,
                hard_cap: 0,
            };
            self.publish(channels::PROXY_ANNOUNCE, &announce).await;
        }
    }

    /// Handle `server:heartbeat`.
    pub async fn handle_server_heartbeat(&self, envelope: &Envelope) {
        let heartbeat: ServerHeartbeat = match envelope.decode() {
            Ok(heartbeat) => heartbeat,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed backend heartbeat");
                return;
            }
        };
        let Some((IdRole::Backend, id)) = IdRole::parse(&heartbeat.id) else {
            tracing::warn!(id = %heartbeat.id, "Backend heartbeat with unparseable id");
            return;
        };
        crate::metrics::HEARTBEATS.inc();

        let stats = BackendStats {
            tps: heartbeat.tps,
            player_count: heartbeat.player_count,
            max_capacity: heartbeat.max_capacity,
            uptime_ms: heartbeat.uptime,
            role: heartbeat.role.clone(),
            pools: heartbeat.available_pools.clone(),
        };
        match self.backends.heartbeat(id, &stats) {
            Ok(Some(transition)) => self.monitor.notify(EntryKind::Backend, &transition),
            Ok(None) => {}
            Err(e) => {
                // Unknown to us, most likely after a core restart; the node
                // will re-register on its own retry schedule.
                tracing::warn!(id = %heartbeat.id, error = %e, "Heartbeat from unregistered backend");
            }
        }
    }

    /// Handle `proxy:heartbeat`.
    pub async fn handle_proxy_heartbeat(&self, envelope: &Envelope) {
        let heartbeat: ProxyHeartbeat = match envelope.decode() {
            Ok(heartbeat) => heartbeat,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed proxy heartbeat");
                return;
            }
        };
        let Some((IdRole::Proxy, id)) = IdRole::parse(&heartbeat.id) else {
            tracing::warn!(id = %heartbeat.id, "Proxy heartbeat with unparseable id");
            return;
        };
        crate::metrics::HEARTBEATS.inc();

        match self
            .proxies
            .heartbeat(id, heartbeat.current_players, heartbeat.hard_cap)
        {
            Ok(Some(transition)) => self.monitor.notify(EntryKind::Proxy, &transition),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(id = %heartbeat.id, error = %e, "Heartbeat from unregistered proxy");
            }
        }
    }

    /// Handle `registry:server:remove` (graceful shutdown).
    pub async fn handle_remove(&self, envelope: &Envelope) {
        let request: RemoveRequest = match envelope.decode() {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed remove request");
                return;
            }
        };
        let removed = match IdRole::parse(&request.id) {
            Some((IdRole::Proxy, id)) => self.proxies.remove_immediate(id),
            Some((IdRole::Backend, id)) => self.backends.remove_immediate(id),
            None => {
                tracing::warn!(id = %request.id, "Remove request with unparseable id");
                return;
            }
        };
        if removed {
            tracing::info!(id = %request.id, reason = ?request.reason, "Node removed on request");
        } else {
            tracing::debug!(id = %request.id, "Remove request for unknown entry ignored");
        }
    }

    /// Handle `server:evacuation:response`.
    pub async fn handle_evacuation_response(&self, envelope: &Envelope) {
        let response: EvacuationResponse = match envelope.decode() {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed evacuation response");
                return;
            }
        };
        match self.evacuation.handle_response(&response) {
            Ok(Some(transition)) => self.monitor.notify(EntryKind::Backend, &transition),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(id = %response.id, error = %e, "Evacuation response could not be settled");
            }
        }
    }

    /// Handle `registry:network:config:request`.
    pub async fn handle_config_request(&self, envelope: &Envelope) {
        let request: ConfigRequest = match envelope.decode() {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed config request");
                return;
            }
        };
        let response = self.netconfig.handle_request(&request).await;
        self.publish(channels::CONFIG_RESPONSE, &response).await;
    }

    async fn publish<P: serde::Serialize>(&self, channel: &str, payload: &P) {
        match Envelope::new(channel, &self.sender_id, payload) {
            Ok(envelope) => {
                if let Err(e) = self.bus.publish(channel, envelope).await {
                    tracing::warn!(channel, error = %e, "Failed to publish");
                }
            }
            Err(e) => tracing::warn!(channel, error = %e, "Failed to encode payload"),
        }
    }
}
