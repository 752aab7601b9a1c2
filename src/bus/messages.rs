//! Typed payloads for every bus channel.
//!
//! Field names follow the wire convention (camelCase) via serde renames; the
//! structs themselves stay idiomatic Rust.

use crate::netconfig::NetworkProfile;
use crate::registry::entry::BackendKind;
use serde::{Deserialize, Serialize};

/// `registry:register`: a node requests a permanent ID.
///
/// Proxies register with `role = "proxy"`; anything else is a backend whose
/// `kind` selects the capacity defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub temp_id: String,
    pub role: String,
    #[serde(rename = "type", default)]
    pub kind: Option<BackendKind>,
    pub address: String,
    pub port: u16,
    /// Optional hard-cap override; soft cap stays at the kind default,
    /// clamped to never exceed the hard cap.
    #[serde(default)]
    pub capacity: Option<u32>,
}

impl RegisterRequest {
    pub fn is_proxy(&self) -> bool {
        self.role.eq_ignore_ascii_case("proxy")
    }
}

/// `server:<tempId>:registration:response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub success: bool,
    #[serde(default)]
    pub assigned_id: Option<String>,
    pub message: String,
}

/// `server:heartbeat`: periodic backend liveness and stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHeartbeat {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: Option<BackendKind>,
    pub tps: f64,
    pub player_count: u32,
    pub max_capacity: u32,
    /// Uptime in milliseconds.
    pub uptime: u64,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub available_pools: Vec<String>,
}

/// `proxy:heartbeat` / `proxy:announce`: proxy liveness and discovery share
/// one shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyHeartbeat {
    pub id: String,
    pub current_players: u32,
    pub hard_cap: u32,
}

/// `server.announcement`: backend self-description for routers and peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAnnouncement {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BackendKind,
    pub env: String,
    pub role: String,
    pub capacity: u32,
    pub address: String,
    pub port: u16,
}

/// `server:evacuation`: core asks a backend to vacate its players. The
/// backend picks its own target servers; the core does not dictate routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvacuationRequest {
    pub id: String,
    pub reason: String,
    /// Correlation nonce echoed back in logs; responses remain idempotent
    /// even without it.
    pub nonce: String,
}

/// `server:evacuation:response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvacuationResponse {
    pub id: String,
    pub succeeded: bool,
    pub evacuated: u32,
    pub failed: u32,
    #[serde(default)]
    pub message: Option<String>,
}

/// `registry:server:remove`: graceful shutdown notice.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveRequest {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// `registry:network:config:request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRequest {
    pub request_id: String,
    /// Specific profile to fetch; absent means the active one.
    #[serde(default)]
    pub profile_id: Option<String>,
    /// Re-read the catalog before answering.
    #[serde(default)]
    pub refresh: bool,
}

/// `registry:network:config:response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    pub request_id: String,
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub profile: Option<NetworkProfile>,
}

/// `registry:network:config:updated`: broadcast strictly after the cache
/// has been swapped to the new profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdated {
    pub profile_id: String,
    pub tag: String,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// `registry:status:changed`: registry entry status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChanged {
    /// "proxy" or "backend".
    pub kind: String,
    pub id: String,
    pub from: String,
    pub to: String,
}
