//! Registry entry types and the node status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Liveness status of a registered node.
///
/// Forward transitions are driven by the heartbeat monitor and the
/// evacuation coordinator; the only backward edge is UNAVAILABLE back to
/// AVAILABLE when a heartbeat arrives before the hard timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    Available,
    Evacuating,
    Unavailable,
    Dead,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Available => "AVAILABLE",
            NodeStatus::Evacuating => "EVACUATING",
            NodeStatus::Unavailable => "UNAVAILABLE",
            NodeStatus::Dead => "DEAD",
        }
    }

    /// Whether the entry still holds its `(address, port)` claim.
    pub fn holds_address(&self) -> bool {
        !matches!(self, NodeStatus::Dead)
    }

    /// Legal transitions of the status machine.
    pub fn can_transition(self, to: NodeStatus) -> bool {
        use NodeStatus::*;
        matches!(
            (self, to),
            (Available, Evacuating)
                | (Available, Unavailable)
                | (Unavailable, Available)
                | (Unavailable, Dead)
                | (Evacuating, Unavailable)
        )
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend sizing class. Selects the default player caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackendKind {
    Mini,
    Mega,
}

impl BackendKind {
    /// Default `(soft_cap, hard_cap)` for the class.
    pub fn default_caps(&self) -> (u32, u32) {
        match self {
            BackendKind::Mini => (10, 15),
            BackendKind::Mega => (60, 70),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Mini => "MINI",
            BackendKind::Mega => "MEGA",
        }
    }
}

/// A registered proxy gateway.
///
/// `id`, `temp_id`, `address` and `port` are immutable after creation;
/// everything else is mutated through the owning registry.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyEntry {
    /// Permanent numeric ID within the proxy role.
    pub id: u32,
    /// The placeholder the node used before registration.
    pub temp_id: String,
    pub address: String,
    pub port: u16,
    pub status: NodeStatus,
    /// Monotonic ms of the last accepted heartbeat.
    pub last_heartbeat: u64,
    /// Wall time of first successful registration.
    pub registered_at: DateTime<Utc>,
    pub current_players: u32,
    pub hard_cap: u32,
    /// Monotonic ms at which the entry went DEAD, for console display.
    pub dead_at: Option<u64>,
}

/// A registered backend game server.
#[derive(Debug, Clone, Serialize)]
pub struct BackendEntry {
    pub id: u32,
    pub temp_id: String,
    pub address: String,
    pub port: u16,
    pub kind: BackendKind,
    /// Free-form role from the node's environment selector.
    pub role: String,
    pub soft_cap: u32,
    pub hard_cap: u32,
    pub current_players: u32,
    pub tps: f64,
    pub uptime_ms: u64,
    /// Logical slots this backend advertises; routers consume these.
    pub available_pools: BTreeSet<String>,
    pub status: NodeStatus,
    pub last_heartbeat: u64,
    pub registered_at: DateTime<Utc>,
    pub dead_at: Option<u64>,
}

impl BackendEntry {
    /// Resolve caps from the sizing class and an optional hard-cap override.
    /// The soft cap never exceeds the hard cap.
    pub fn resolve_caps(kind: BackendKind, capacity: Option<u32>) -> (u32, u32) {
        let (default_soft, default_hard) = kind.default_caps();
        let hard = capacity.filter(|&c| c > 0).unwrap_or(default_hard);
        (default_soft.min(hard), hard)
    }
}
