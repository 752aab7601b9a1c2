//! Heartbeat monitor.
//!
//! One periodic tick ages every entry in both registries by its last
//! heartbeat, drives AVAILABLE -> UNAVAILABLE -> DEAD, and reaps expired ID
//! reservations. Transitions fan out to [`StatusListener`] sinks; the
//! monitor itself never mutates an entry except through the owning
//! registry's API.

use crate::registry::backends::BackendRegistry;
use crate::registry::proxies::ProxyRegistry;
use crate::registry::{AgingPolicy, IdRole, Transition};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Which registry an event concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Proxy,
    Backend,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Proxy => "proxy",
            EntryKind::Backend => "backend",
        }
    }

    fn role(&self) -> IdRole {
        match self {
            EntryKind::Proxy => IdRole::Proxy,
            EntryKind::Backend => IdRole::Backend,
        }
    }
}

/// Sink for registry status transitions.
///
/// Implemented by the bus broadcaster; the console reads snapshots instead
/// of subscribing. Implementations must not call back into the registries
/// from the callback.
pub trait StatusListener: Send + Sync {
    fn on_status_changed(&self, kind: EntryKind, id: &str, from: &str, to: &str);
}

/// Periodic liveness sweeper over both registries.
pub struct HeartbeatMonitor {
    proxies: Arc<ProxyRegistry>,
    backends: Arc<BackendRegistry>,
    policy: AgingPolicy,
    listeners: Vec<Arc<dyn StatusListener>>,
}

impl HeartbeatMonitor {
    pub fn new(
        proxies: Arc<ProxyRegistry>,
        backends: Arc<BackendRegistry>,
        policy: AgingPolicy,
    ) -> Self {
        Self {
            proxies,
            backends,
            policy,
            listeners: Vec::new(),
        }
    }

    /// Attach a transition sink. Called during wiring, before the first tick.
    pub fn add_listener(&mut self, listener: Arc<dyn StatusListener>) {
        self.listeners.push(listener);
    }

    /// Run one sweep over both registries and notify listeners.
    ///
    /// Sweeps happen under the registry locks; notification happens after,
    /// so a slow listener cannot stall registrations.
    pub fn tick(&self) {
        let proxy_report = self.proxies.sweep(&self.policy);
        let backend_report = self.backends.sweep(&self.policy);

        for transition in &proxy_report.transitions {
            self.notify(EntryKind::Proxy, transition);
        }
        for transition in &backend_report.transitions {
            self.notify(EntryKind::Backend, transition);
        }

        for &id in &proxy_report.dropped {
            tracing::info!(id = %IdRole::Proxy.render(id), "Recycle window elapsed, ID released");
        }
        for &id in &backend_report.dropped {
            tracing::info!(id = %IdRole::Backend.render(id), "Recycle window elapsed, ID released");
        }

        crate::metrics::REGISTERED_PROXIES.set(self.proxies.live_count() as i64);
        crate::metrics::REGISTERED_BACKENDS.set(self.backends.live_count() as i64);
    }

    /// Forward a transition produced outside the sweep (heartbeat
    /// promotion, evacuation settlement) to the same sinks.
    pub fn notify(&self, kind: EntryKind, transition: &Transition) {
        let token = kind.role().render(transition.id);
        tracing::info!(
            kind = kind.as_str(),
            id = %token,
            from = %transition.from,
            to = %transition.to,
            "Status changed"
        );
        for listener in &self.listeners {
            listener.on_status_changed(
                kind,
                &token,
                transition.from.as_str(),
                transition.to.as_str(),
            );
        }
    }

    /// Spawn the periodic tick task. Runs until shutdown; the tick itself is
    /// never cancelled mid-sweep.
    pub fn spawn(self: Arc<Self>, tick: Duration, mut shutdown_rx: broadcast::Receiver<()>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.tick();
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Heartbeat monitor stopping");
                        break;
                    }
                }
            }
        });
    }
}
