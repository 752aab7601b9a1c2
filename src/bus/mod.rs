//! Message-bus abstraction.
//!
//! The transport itself (Redis, NATS, whatever ops runs this week) is out of
//! scope; the core only depends on this contract: fire-and-forget publish,
//! subscription streams, and a bounded request/reply helper. Every message is
//! a JSON envelope `{type, senderId, payload}`.

pub mod memory;
pub mod messages;

use crate::error::BusError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// Well-known channel names.
pub mod channels {
    /// node -> core: request a permanent ID.
    pub const REGISTER: &str = "registry:register";
    /// node -> core: periodic backend liveness.
    pub const SERVER_HEARTBEAT: &str = "server:heartbeat";
    /// proxy -> core: periodic proxy liveness.
    pub const PROXY_HEARTBEAT: &str = "proxy:heartbeat";
    /// proxy -> all: backends discover new proxies.
    pub const PROXY_ANNOUNCE: &str = "proxy:announce";
    /// backend -> all: routers and peers discover backends.
    pub const SERVER_ANNOUNCEMENT: &str = "server.announcement";
    /// core -> backend: please vacate players.
    pub const EVACUATION: &str = "server:evacuation";
    /// backend -> core: evacuation result.
    pub const EVACUATION_RESPONSE: &str = "server:evacuation:response";
    /// node -> core: graceful shutdown.
    pub const SERVER_REMOVE: &str = "registry:server:remove";
    /// core -> all: ask every node to re-identify after a core restart.
    pub const REREGISTRATION_REQUEST: &str = "registry:reregistration:request";
    /// node -> core: fetch the active (or a specific) profile.
    pub const CONFIG_REQUEST: &str = "registry:network:config:request";
    /// core -> node: profile reply.
    pub const CONFIG_RESPONSE: &str = "registry:network:config:response";
    /// core -> all: broadcast after a profile apply.
    pub const CONFIG_UPDATED: &str = "registry:network:config:updated";
    /// core -> all: registry status transitions.
    pub const STATUS_CHANGED: &str = "registry:status:changed";

    /// Per-node registration reply channel. `node_id` is the tempId the node
    /// registered with.
    pub fn registration_response(node_id: &str) -> String {
        format!("server:{node_id}:registration:response")
    }
}

/// The JSON envelope every bus message travels in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type tag, conventionally the channel name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Identity of the sender (trust-on-first-use; not authenticated).
    #[serde(rename = "senderId")]
    pub sender_id: String,
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Build an envelope from a serializable payload.
    pub fn new<P: Serialize>(kind: &str, sender_id: &str, payload: &P) -> Result<Self, BusError> {
        Ok(Self {
            kind: kind.to_string(),
            sender_id: sender_id.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Decode the payload into a concrete message type.
    pub fn decode<P: DeserializeOwned>(&self) -> Result<P, BusError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Abstract pub/sub with a bounded request/reply helper.
///
/// The core replies to nodes by publishing on response channels and never
/// awaits on a node's behalf; `request` exists for the node side of the
/// contract (and the test suite playing node).
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish an envelope to every subscriber of `channel`.
    async fn publish(&self, channel: &str, envelope: Envelope) -> Result<(), BusError>;

    /// Subscribe to a channel. Each subscriber receives every envelope
    /// published after the subscription was created.
    fn subscribe(&self, channel: &str) -> mpsc::Receiver<Envelope>;

    /// Publish on `channel` and wait for the first envelope on
    /// `reply_channel`, bounded by `timeout`.
    async fn request(
        &self,
        channel: &str,
        reply_channel: &str,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, BusError> {
        let mut rx = self.subscribe(reply_channel);
        self.publish(channel, envelope).await?;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(BusError::Closed(reply_channel.to_string())),
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }
}
