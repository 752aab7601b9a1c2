//! Evacuation coordination.
//!
//! The coordinator asks a backend to vacate its players, tracks the
//! in-flight request against a deadline, and settles the outcome. The
//! backend chooses its own target servers from its cached announcements;
//! the core only triggers and records.

use crate::bus::messages::{EvacuationRequest, EvacuationResponse};
use crate::bus::{Bus, Envelope, channels};
use crate::clock::Clock;
use crate::error::{RegistryError, RegistryResult};
use crate::registry::backends::BackendRegistry;
use crate::registry::{IdRole, NodeStatus, Transition};
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct InFlight {
    nonce: String,
    requested_at_ms: u64,
    reason: String,
}

/// Tracks evacuation requests from trigger to settlement.
pub struct EvacuationCoordinator {
    backends: Arc<BackendRegistry>,
    bus: Arc<dyn Bus>,
    clock: Arc<dyn Clock>,
    deadline_ms: u64,
    sender_id: String,
    in_flight: DashMap<u32, InFlight>,
}

impl EvacuationCoordinator {
    pub fn new(
        backends: Arc<BackendRegistry>,
        bus: Arc<dyn Bus>,
        clock: Arc<dyn Clock>,
        deadline_ms: u64,
        sender_id: String,
    ) -> Self {
        Self {
            backends,
            bus,
            clock,
            deadline_ms,
            sender_id,
            in_flight: DashMap::new(),
        }
    }

    /// Ask a backend to evacuate. Marks it EVACUATING, sends the directed
    /// request, and starts the deadline timer.
    ///
    /// Returns the applied transition so the caller can fan it out.
    pub async fn evacuate(&self, id: u32, reason: &str) -> RegistryResult<Transition> {
        if self.in_flight.contains_key(&id) {
            return Err(RegistryError::Invariant(format!(
                "evacuation already in flight for {}",
                IdRole::Backend.render(id)
            )));
        }
        let transition = self.backends.set_status(id, NodeStatus::Evacuating)?;

        let nonce = uuid::Uuid::new_v4().to_string();
        let token = IdRole::Backend.render(id);
        let request = EvacuationRequest {
            id: token.clone(),
            reason: reason.to_string(),
            nonce: nonce.clone(),
        };
        self.in_flight.insert(
            id,
            InFlight {
                nonce: nonce.clone(),
                requested_at_ms: self.clock.mono_ms(),
                reason: reason.to_string(),
            },
        );

        let envelope = Envelope::new(channels::EVACUATION, &self.sender_id, &request)
            .map_err(|e| RegistryError::Invariant(format!("evacuation request encode: {e}")))?;
        if let Err(e) = self.bus.publish(channels::EVACUATION, envelope).await {
            // The request never left; roll the tracking back and let the
            // caller decide. The status stays EVACUATING for the operator.
            self.in_flight.remove(&id);
            tracing::error!(id = %token, error = %e, "Failed to send evacuation request");
            return Err(RegistryError::Invariant(format!(
                "evacuation request for {token} not sent: {e}"
            )));
        }

        crate::metrics::EVACUATIONS_REQUESTED.inc();
        tracing::info!(id = %token, reason, nonce = %nonce, "Evacuation requested");
        Ok(transition)
    }

    /// Settle an evacuation response. Duplicates (already settled, or never
    /// requested) are ignored.
    ///
    /// Success demotes the backend to UNAVAILABLE; the monitor ages it to
    /// DEAD from there. Failure leaves it EVACUATING for the operator.
    pub fn handle_response(&self, response: &EvacuationResponse) -> RegistryResult<Option<Transition>> {
        let Some((_, id)) = IdRole::parse(&response.id).filter(|(role, _)| *role == IdRole::Backend)
        else {
            return Err(RegistryError::NotFound(response.id.clone()));
        };
        let Some((_, pending)) = self.in_flight.remove(&id) else {
            tracing::debug!(id = %response.id, "Duplicate or unsolicited evacuation response ignored");
            return Ok(None);
        };

        if response.succeeded {
            crate::metrics::EVACUATIONS_SUCCEEDED.inc();
            tracing::info!(
                id = %response.id,
                evacuated = response.evacuated,
                failed = response.failed,
                nonce = %pending.nonce,
                "Evacuation succeeded"
            );
            let transition = self.backends.set_status(id, NodeStatus::Unavailable)?;
            Ok(Some(transition))
        } else {
            crate::metrics::EVACUATIONS_FAILED.inc();
            tracing::warn!(
                id = %response.id,
                evacuated = response.evacuated,
                failed = response.failed,
                message = ?response.message,
                "Evacuation failed, entry left EVACUATING for operator review"
            );
            Ok(None)
        }
    }

    /// Expire in-flight requests past the deadline. Each expired backend is
    /// demoted to UNAVAILABLE so ordinary aging resumes.
    pub fn sweep(&self) -> Vec<Transition> {
        let now_ms = self.clock.mono_ms();
        let expired: Vec<u32> = self
            .in_flight
            .iter()
            .filter(|entry| now_ms.saturating_sub(entry.requested_at_ms) > self.deadline_ms)
            .map(|entry| *entry.key())
            .collect();

        let mut transitions = Vec::new();
        for id in expired {
            let Some((_, pending)) = self.in_flight.remove(&id) else {
                continue;
            };
            crate::metrics::EVACUATIONS_FAILED.inc();
            tracing::warn!(
                id = %IdRole::Backend.render(id),
                reason = %pending.reason,
                "Evacuation deadline expired without a response"
            );
            match self.backends.set_status(id, NodeStatus::Unavailable) {
                Ok(transition) => transitions.push(transition),
                Err(e) => {
                    // The entry may have been removed while we waited.
                    tracing::debug!(id = %IdRole::Backend.render(id), error = %e, "Timed-out evacuation had no entry to demote");
                }
            }
        }
        transitions
    }

    /// Number of evacuations awaiting a response. Console helper.
    pub fn pending_count(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::InProcessBus;
    use crate::clock::ManualClock;
    use crate::registry::entry::BackendKind;
    use crate::registry::{AgingPolicy, BackendSpec};

    fn setup() -> (
        Arc<ManualClock>,
        Arc<BackendRegistry>,
        Arc<InProcessBus>,
        EvacuationCoordinator,
    ) {
        let clock = Arc::new(ManualClock::new());
        let backends = Arc::new(BackendRegistry::new(clock.clone(), 30_000, 300_000));
        let bus = Arc::new(InProcessBus::new());
        let coordinator = EvacuationCoordinator::new(
            backends.clone(),
            bus.clone(),
            clock.clone(),
            60_000,
            "registry-core".to_string(),
        );
        (clock, backends, bus, coordinator)
    }

    fn register(backends: &BackendRegistry) -> u32 {
        backends
            .register(&BackendSpec {
                temp_id: "temp-a".into(),
                address: "10.0.0.1".into(),
                port: 25566,
                kind: BackendKind::Mini,
                role: "game".into(),
                capacity: None,
            })
            .unwrap()
            .id()
    }

    fn response(id: &str, succeeded: bool) -> EvacuationResponse {
        EvacuationResponse {
            id: id.to_string(),
            succeeded,
            evacuated: 7,
            failed: if succeeded { 0 } else { 7 },
            message: None,
        }
    }

    #[tokio::test]
    async fn test_evacuate_sends_request_and_marks_status() {
        let (_clock, backends, bus, coordinator) = setup();
        let id = register(&backends);
        let mut rx = bus.subscribe(channels::EVACUATION);

        let transition = coordinator.evacuate(id, "maintenance").await.unwrap();
        assert_eq!(transition.to, NodeStatus::Evacuating);
        assert_eq!(backends.get(id).unwrap().status, NodeStatus::Evacuating);

        let envelope = rx.recv().await.unwrap();
        let request: EvacuationRequest = envelope.decode().unwrap();
        assert_eq!(request.id, "backend-0");
        assert_eq!(request.reason, "maintenance");
    }

    #[tokio::test]
    async fn test_success_demotes_to_unavailable() {
        let (_clock, backends, _bus, coordinator) = setup();
        let id = register(&backends);
        coordinator.evacuate(id, "drain").await.unwrap();

        let transition = coordinator
            .handle_response(&response("backend-0", true))
            .unwrap();
        assert_eq!(transition.unwrap().to, NodeStatus::Unavailable);
        assert_eq!(backends.get(id).unwrap().status, NodeStatus::Unavailable);
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_response_is_ignored() {
        let (_clock, backends, _bus, coordinator) = setup();
        let id = register(&backends);
        coordinator.evacuate(id, "drain").await.unwrap();

        coordinator
            .handle_response(&response("backend-0", true))
            .unwrap();
        let second = coordinator
            .handle_response(&response("backend-0", true))
            .unwrap();
        assert!(second.is_none());
        assert_eq!(backends.get(id).unwrap().status, NodeStatus::Unavailable);
    }

    #[tokio::test]
    async fn test_failure_leaves_evacuating() {
        let (_clock, backends, _bus, coordinator) = setup();
        let id = register(&backends);
        coordinator.evacuate(id, "drain").await.unwrap();

        let settled = coordinator
            .handle_response(&response("backend-0", false))
            .unwrap();
        assert!(settled.is_none());
        assert_eq!(backends.get(id).unwrap().status, NodeStatus::Evacuating);
    }

    #[tokio::test]
    async fn test_timeout_demotes_and_aging_resumes() {
        let (clock, backends, _bus, coordinator) = setup();
        let id = register(&backends);
        coordinator.evacuate(id, "drain").await.unwrap();

        // Before the deadline nothing happens.
        clock.advance_secs(59);
        assert!(coordinator.sweep().is_empty());

        clock.advance_secs(2);
        let transitions = coordinator.sweep();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, NodeStatus::Unavailable);

        // Continued heartbeat silence now ages it to DEAD.
        let policy = AgingPolicy {
            soft_timeout_ms: 15_000,
            hard_timeout_ms: 60_000,
        };
        clock.advance_secs(1);
        let report = backends.sweep(&policy);
        assert_eq!(report.transitions[0].to, NodeStatus::Dead);
    }

    #[tokio::test]
    async fn test_double_evacuate_is_refused() {
        let (_clock, backends, _bus, coordinator) = setup();
        let id = register(&backends);
        coordinator.evacuate(id, "drain").await.unwrap();
        let err = coordinator.evacuate(id, "drain again").await.unwrap_err();
        assert!(err.is_invariant());
    }
}
