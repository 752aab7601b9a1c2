//! Backend server registry.
//!
//! Mirrors the proxy registry's triple index (permanent ID, tempId,
//! address:port) and adds the backend-only inventory: sizing class, role,
//! player caps, TPS, uptime, and advertised pools.

use crate::clock::Clock;
use crate::error::{RegistryError, RegistryResult};
use crate::registry::alloc::{IdAllocator, IdRole};
use crate::registry::entry::{BackendEntry, BackendKind, NodeStatus};
use crate::registry::{AgingPolicy, RegisterOutcome, SweepReport, Transition};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Everything a backend supplies at registration time.
#[derive(Debug, Clone)]
pub struct BackendSpec {
    pub temp_id: String,
    pub address: String,
    pub port: u16,
    pub kind: BackendKind,
    /// Free-form role from the node's environment selector.
    pub role: String,
    /// Optional hard-cap override.
    pub capacity: Option<u32>,
}

/// Stats carried on every backend heartbeat.
#[derive(Debug, Clone, Default)]
pub struct BackendStats {
    pub tps: f64,
    pub player_count: u32,
    pub max_capacity: u32,
    pub uptime_ms: u64,
    pub role: Option<String>,
    pub pools: Vec<String>,
}

struct BackendTable {
    entries: BTreeMap<u32, BackendEntry>,
    by_temp: HashMap<String, u32>,
    by_addr: HashMap<(String, u16), u32>,
    alloc: IdAllocator,
}

/// Registry of backend game servers.
pub struct BackendRegistry {
    table: Mutex<BackendTable>,
    clock: Arc<dyn Clock>,
    dedup_window_ms: u64,
}

impl BackendRegistry {
    pub fn new(clock: Arc<dyn Clock>, dedup_window_ms: u64, recycle_window_ms: u64) -> Self {
        Self {
            table: Mutex::new(BackendTable {
                entries: BTreeMap::new(),
                by_temp: HashMap::new(),
                by_addr: HashMap::new(),
                alloc: IdAllocator::new(recycle_window_ms),
            }),
            clock,
            dedup_window_ms,
        }
    }

    /// Register a backend. Resolution order matches the proxy registry:
    /// address-dedup inside the window, then tempId resume/reactivate, then
    /// a fresh ID. A changed address never resurrects an old entry.
    pub fn register(&self, spec: &BackendSpec) -> RegistryResult<RegisterOutcome> {
        let now_ms = self.clock.mono_ms();
        let now_wall = self.clock.wall();
        let mut guard = self.table.lock();
        let t = &mut *guard;

        let addr_key = (spec.address.clone(), spec.port);
        if let Some(&id) = t.by_addr.get(&addr_key) {
            let entry = t
                .entries
                .get_mut(&id)
                .ok_or_else(|| RegistryError::Invariant(format!(
                    "address index points at missing entry backend-{id}"
                )))?;
            if entry.status.holds_address() {
                let age_ms = (now_wall - entry.registered_at).num_milliseconds().max(0) as u64;
                if age_ms <= self.dedup_window_ms {
                    entry.last_heartbeat = now_ms;
                    t.by_temp.insert(spec.temp_id.clone(), id);
                    tracing::debug!(
                        id = %IdRole::Backend.render(id),
                        temp_id = %spec.temp_id,
                        "Burst re-registration deduplicated"
                    );
                    return Ok(RegisterOutcome::Deduplicated { id });
                }
                if entry.temp_id != spec.temp_id {
                    return Err(RegistryError::AddressInUse {
                        address: spec.address.clone(),
                        port: spec.port,
                        holder: IdRole::Backend.render(id),
                    });
                }
            }
        }

        if let Some(&id) = t.by_temp.get(&spec.temp_id)
            && let Some(entry) = t.entries.get_mut(&id)
        {
            match entry.status {
                NodeStatus::Available | NodeStatus::Evacuating => {
                    if entry.address != spec.address || entry.port != spec.port {
                        tracing::warn!(
                            id = %IdRole::Backend.render(id),
                            known = %format!("{}:{}", entry.address, entry.port),
                            reported = %format!("{}:{}", spec.address, spec.port),
                            "Live backend re-registered with a different address"
                        );
                    }
                    entry.last_heartbeat = now_ms;
                    return Ok(RegisterOutcome::Resumed { id });
                }
                NodeStatus::Unavailable => {
                    if entry.address == spec.address && entry.port == spec.port {
                        entry.status = NodeStatus::Available;
                        entry.last_heartbeat = now_ms;
                        tracing::info!(id = %IdRole::Backend.render(id), "Reactivated unavailable backend");
                        return Ok(RegisterOutcome::Reactivated { id });
                    }
                    tracing::warn!(
                        id = %IdRole::Backend.render(id),
                        known = %format!("{}:{}", entry.address, entry.port),
                        reported = %format!("{}:{}", spec.address, spec.port),
                        "Backend reconnected with a new address, allocating a fresh ID"
                    );
                }
                NodeStatus::Dead => {}
            }
        }

        let id = t.alloc.allocate(IdRole::Backend)?;
        if t.entries.contains_key(&id) {
            t.alloc.release(IdRole::Backend, id, true, now_ms);
            return Err(RegistryError::Invariant(format!(
                "allocated id {} already has an entry",
                IdRole::Backend.render(id)
            )));
        }
        let (soft_cap, hard_cap) = BackendEntry::resolve_caps(spec.kind, spec.capacity);
        t.entries.insert(
            id,
            BackendEntry {
                id,
                temp_id: spec.temp_id.clone(),
                address: spec.address.clone(),
                port: spec.port,
                kind: spec.kind,
                role: spec.role.clone(),
                soft_cap,
                hard_cap,
                current_players: 0,
                tps: 20.0,
                uptime_ms: 0,
                available_pools: BTreeSet::new(),
                status: NodeStatus::Available,
                last_heartbeat: now_ms,
                registered_at: now_wall,
                dead_at: None,
            },
        );
        t.by_temp.insert(spec.temp_id.clone(), id);
        t.by_addr.insert(addr_key, id);
        tracing::info!(
            id = %IdRole::Backend.render(id),
            temp_id = %spec.temp_id,
            kind = %spec.kind.as_str(),
            role = %spec.role,
            address = %format!("{}:{}", spec.address, spec.port),
            "Backend registered"
        );
        Ok(RegisterOutcome::Created { id })
    }

    /// Record a heartbeat with stats. Promotes UNAVAILABLE back to
    /// AVAILABLE; EVACUATING and DEAD entries are untouched.
    pub fn heartbeat(&self, id: u32, stats: &BackendStats) -> RegistryResult<Option<Transition>> {
        let now_ms = self.clock.mono_ms();
        let mut t = self.table.lock();
        let entry = t
            .entries
            .get_mut(&id)
            .ok_or_else(|| RegistryError::NotFound(IdRole::Backend.render(id)))?;
        let promoted = match entry.status {
            NodeStatus::Available => false,
            NodeStatus::Unavailable => {
                entry.status = NodeStatus::Available;
                tracing::info!(
                    id = %IdRole::Backend.render(id),
                    "Backend heartbeat resumed, promoting to AVAILABLE"
                );
                true
            }
            NodeStatus::Evacuating | NodeStatus::Dead => return Ok(None),
        };
        entry.last_heartbeat = now_ms;
        entry.tps = stats.tps;
        entry.current_players = stats.player_count;
        entry.uptime_ms = stats.uptime_ms;
        if stats.max_capacity > 0 {
            entry.hard_cap = stats.max_capacity;
            entry.soft_cap = entry.soft_cap.min(entry.hard_cap);
        }
        if let Some(role) = &stats.role {
            entry.role = role.clone();
        }
        entry.available_pools = stats.pools.iter().cloned().collect();
        Ok(promoted.then_some(Transition {
            id,
            from: NodeStatus::Unavailable,
            to: NodeStatus::Available,
        }))
    }

    /// Apply a status transition, enforcing the state machine.
    pub fn set_status(&self, id: u32, to: NodeStatus) -> RegistryResult<Transition> {
        let now_ms = self.clock.mono_ms();
        let mut guard = self.table.lock();
        let t = &mut *guard;
        let entry = t
            .entries
            .get_mut(&id)
            .ok_or_else(|| RegistryError::NotFound(IdRole::Backend.render(id)))?;
        let from = entry.status;
        if !from.can_transition(to) {
            return Err(RegistryError::IllegalTransition {
                id: IdRole::Backend.render(id),
                from: from.as_str(),
                to: to.as_str(),
            });
        }
        entry.status = to;
        if to == NodeStatus::Dead {
            entry.dead_at = Some(now_ms);
            t.by_addr.remove(&(entry.address.clone(), entry.port));
            t.alloc.release(IdRole::Backend, id, false, now_ms);
        }
        Ok(Transition { id, from, to })
    }

    /// Graceful shutdown: drop the entry and free its ID immediately.
    /// Idempotent; a second call is a no-op returning `false`.
    pub fn remove_immediate(&self, id: u32) -> bool {
        let now_ms = self.clock.mono_ms();
        let mut guard = self.table.lock();
        let t = &mut *guard;
        let Some(entry) = t.entries.remove(&id) else {
            return false;
        };
        if t.by_temp.get(&entry.temp_id) == Some(&id) {
            t.by_temp.remove(&entry.temp_id);
        }
        t.by_addr.remove(&(entry.address.clone(), entry.port));
        t.alloc.release(IdRole::Backend, id, true, now_ms);
        tracing::info!(id = %IdRole::Backend.render(id), "Backend removed");
        true
    }

    /// Operator override for a stuck reserved ID.
    pub fn force_release(&self, id: u32) -> bool {
        let mut guard = self.table.lock();
        let t = &mut *guard;
        if let Some(entry) = t.entries.remove(&id) {
            if t.by_temp.get(&entry.temp_id) == Some(&id) {
                t.by_temp.remove(&entry.temp_id);
            }
            t.by_addr.remove(&(entry.address.clone(), entry.port));
        }
        let released = t.alloc.force_release(IdRole::Backend, id);
        if released {
            tracing::warn!(id = %IdRole::Backend.render(id), "Backend ID force-released by operator");
        }
        released
    }

    /// Age entries against the policy and reap expired ID reservations.
    /// Full pass in ascending ID order; EVACUATING entries are exempt.
    pub fn sweep(&self, policy: &AgingPolicy) -> SweepReport {
        let now_ms = self.clock.mono_ms();
        let mut guard = self.table.lock();
        let t = &mut *guard;
        let mut transitions = Vec::new();

        for (&id, entry) in t.entries.iter_mut() {
            let idle_ms = now_ms.saturating_sub(entry.last_heartbeat);
            match entry.status {
                NodeStatus::Available if idle_ms > policy.soft_timeout_ms => {
                    entry.status = NodeStatus::Unavailable;
                    transitions.push(Transition {
                        id,
                        from: NodeStatus::Available,
                        to: NodeStatus::Unavailable,
                    });
                }
                NodeStatus::Unavailable if idle_ms > policy.hard_timeout_ms => {
                    entry.status = NodeStatus::Dead;
                    entry.dead_at = Some(now_ms);
                    transitions.push(Transition {
                        id,
                        from: NodeStatus::Unavailable,
                        to: NodeStatus::Dead,
                    });
                }
                _ => {}
            }
        }

        for transition in &transitions {
            if transition.to == NodeStatus::Dead
                && let Some(entry) = t.entries.get(&transition.id)
            {
                let addr_key = (entry.address.clone(), entry.port);
                t.by_addr.remove(&addr_key);
                t.alloc
                    .release(IdRole::Backend, transition.id, false, now_ms);
            }
        }

        let dropped = t.alloc.reap(IdRole::Backend, now_ms);
        for &id in &dropped {
            if let Some(entry) = t.entries.remove(&id)
                && t.by_temp.get(&entry.temp_id) == Some(&id)
            {
                t.by_temp.remove(&entry.temp_id);
            }
        }

        SweepReport {
            transitions,
            dropped,
        }
    }

    /// Immutable copy of all entries, ascending by ID.
    pub fn snapshot(&self) -> Vec<BackendEntry> {
        self.table.lock().entries.values().cloned().collect()
    }

    pub fn get(&self, id: u32) -> Option<BackendEntry> {
        self.table.lock().entries.get(&id).cloned()
    }

    /// Number of non-DEAD entries.
    pub fn live_count(&self) -> usize {
        self.table
            .lock()
            .entries
            .values()
            .filter(|e| e.status != NodeStatus::Dead)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn registry() -> (Arc<ManualClock>, BackendRegistry) {
        let clock = Arc::new(ManualClock::new());
        let registry = BackendRegistry::new(clock.clone(), 30_000, 300_000);
        (clock, registry)
    }

    fn mini_spec(temp_id: &str, address: &str) -> BackendSpec {
        BackendSpec {
            temp_id: temp_id.to_string(),
            address: address.to_string(),
            port: 25566,
            kind: BackendKind::Mini,
            role: "game".to_string(),
            capacity: Some(15),
        }
    }

    const POLICY: AgingPolicy = AgingPolicy {
        soft_timeout_ms: 15_000,
        hard_timeout_ms: 60_000,
    };

    #[test]
    fn test_register_applies_cap_defaults() {
        let (_clock, reg) = registry();
        let id = reg.register(&mini_spec("temp-a", "10.0.0.1")).unwrap().id();
        let entry = reg.get(id).unwrap();
        assert_eq!(entry.soft_cap, 10);
        assert_eq!(entry.hard_cap, 15);
        assert_eq!(entry.status, NodeStatus::Available);

        let mega = BackendSpec {
            kind: BackendKind::Mega,
            capacity: None,
            ..mini_spec("temp-b", "10.0.0.2")
        };
        let id = reg.register(&mega).unwrap().id();
        let entry = reg.get(id).unwrap();
        assert_eq!((entry.soft_cap, entry.hard_cap), (60, 70));
    }

    #[test]
    fn test_burst_dedup_returns_same_id() {
        let (clock, reg) = registry();
        let first = reg.register(&mini_spec("temp-a", "10.0.0.1")).unwrap();
        clock.advance_secs(5);
        let second = reg.register(&mini_spec("temp-b", "10.0.0.1")).unwrap();
        assert_eq!(first.id(), second.id());
        assert!(second.reused());
        assert_eq!(reg.snapshot().len(), 1);
    }

    #[test]
    fn test_heartbeat_updates_inventory() {
        let (_clock, reg) = registry();
        let id = reg.register(&mini_spec("temp-a", "10.0.0.1")).unwrap().id();
        let stats = BackendStats {
            tps: 19.2,
            player_count: 7,
            max_capacity: 15,
            uptime_ms: 90_000,
            role: Some("duels".to_string()),
            pools: vec!["duels".to_string(), "ffa".to_string()],
        };
        reg.heartbeat(id, &stats).unwrap();
        let entry = reg.get(id).unwrap();
        assert_eq!(entry.current_players, 7);
        assert_eq!(entry.tps, 19.2);
        assert_eq!(entry.role, "duels");
        assert_eq!(entry.available_pools.len(), 2);
        assert!(entry.available_pools.contains("ffa"));
    }

    #[test]
    fn test_lifecycle_to_dead_and_recycle() {
        let (clock, reg) = registry();
        let id = reg.register(&mini_spec("temp-a", "10.0.0.1")).unwrap().id();

        clock.advance_secs(16);
        assert_eq!(reg.sweep(&POLICY).transitions[0].to, NodeStatus::Unavailable);

        // A heartbeat before the hard timeout re-promotes.
        clock.advance_secs(4);
        let transition = reg.heartbeat(id, &BackendStats::default()).unwrap();
        assert!(transition.is_some());

        // Silence past the hard timeout kills it.
        clock.advance_secs(16);
        reg.sweep(&POLICY);
        clock.advance_secs(45);
        let report = reg.sweep(&POLICY);
        assert_eq!(report.transitions[0].to, NodeStatus::Dead);

        // ID reserved through the window, recycled afterwards.
        assert_eq!(reg.register(&mini_spec("temp-b", "10.0.0.2")).unwrap().id(), 1);
        clock.advance_secs(301);
        reg.sweep(&POLICY);
        assert_eq!(reg.register(&mini_spec("temp-c", "10.0.0.3")).unwrap().id(), id);
    }

    #[test]
    fn test_evacuating_exempt_from_aging() {
        let (clock, reg) = registry();
        let id = reg.register(&mini_spec("temp-a", "10.0.0.1")).unwrap().id();
        reg.set_status(id, NodeStatus::Evacuating).unwrap();
        clock.advance_secs(600);
        assert!(reg.sweep(&POLICY).transitions.is_empty());
        // Heartbeats do not disturb EVACUATING either.
        assert!(reg.heartbeat(id, &BackendStats::default()).unwrap().is_none());
        assert_eq!(reg.get(id).unwrap().status, NodeStatus::Evacuating);
    }

    #[test]
    fn test_remove_immediate_is_idempotent() {
        let (_clock, reg) = registry();
        let id = reg.register(&mini_spec("temp-a", "10.0.0.1")).unwrap().id();
        assert!(reg.remove_immediate(id));
        assert!(!reg.remove_immediate(id));
        assert!(reg.get(id).is_none());
    }
}
