//! Proxy gateway registry.
//!
//! Tracks proxies by permanent ID, by the tempId they registered with, and
//! by `(address, port)`. All three indices live behind one mutex together
//! with the role's ID allocator, so a registration is atomic: either every
//! index and the allocator agree, or nothing changed.

use crate::clock::Clock;
use crate::error::{RegistryError, RegistryResult};
use crate::registry::alloc::{IdAllocator, IdRole};
use crate::registry::entry::{NodeStatus, ProxyEntry};
use crate::registry::{AgingPolicy, RegisterOutcome, SweepReport, Transition};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

struct ProxyTable {
    entries: BTreeMap<u32, ProxyEntry>,
    by_temp: HashMap<String, u32>,
    by_addr: HashMap<(String, u16), u32>,
    alloc: IdAllocator,
}

/// Registry of proxy gateways. Owns its entry map exclusively; consumers get
/// copies via [`snapshot`](ProxyRegistry::snapshot).
pub struct ProxyRegistry {
    table: Mutex<ProxyTable>,
    clock: Arc<dyn Clock>,
    dedup_window_ms: u64,
}

impl ProxyRegistry {
    pub fn new(clock: Arc<dyn Clock>, dedup_window_ms: u64, recycle_window_ms: u64) -> Self {
        Self {
            table: Mutex::new(ProxyTable {
                entries: BTreeMap::new(),
                by_temp: HashMap::new(),
                by_addr: HashMap::new(),
                alloc: IdAllocator::new(recycle_window_ms),
            }),
            clock,
            dedup_window_ms,
        }
    }

    /// Register a proxy, resolving burst duplicates and reconnects.
    ///
    /// Resolution order:
    /// 1. `(address, port)` held by a live entry registered inside the dedup
    ///    window: same ID (burst re-registration).
    /// 2. `(address, port)` held by an older live entry under a different
    ///    tempId: refused, the address claim stands.
    /// 3. tempId maps to a live entry: that entry.
    /// 4. tempId maps to an UNAVAILABLE entry at the same address:
    ///    reactivated. A changed address gets a fresh ID instead.
    /// 5. Otherwise a new permanent ID.
    pub fn register(
        &self,
        temp_id: &str,
        address: &str,
        port: u16,
    ) -> RegistryResult<RegisterOutcome> {
        let now_ms = self.clock.mono_ms();
        let now_wall = self.clock.wall();
        let mut guard = self.table.lock();
        let t = &mut *guard;

        let addr_key = (address.to_string(), port);
        if let Some(&id) = t.by_addr.get(&addr_key) {
            let entry = t
                .entries
                .get_mut(&id)
                .ok_or_else(|| RegistryError::Invariant(format!(
                    "address index points at missing entry proxy-{id}"
                )))?;
            if entry.status.holds_address() {
                let age_ms = (now_wall - entry.registered_at).num_milliseconds().max(0) as u64;
                if age_ms <= self.dedup_window_ms {
                    entry.last_heartbeat = now_ms;
                    t.by_temp.insert(temp_id.to_string(), id);
                    tracing::debug!(id = %IdRole::Proxy.render(id), temp_id, "Burst re-registration deduplicated");
                    return Ok(RegisterOutcome::Deduplicated { id });
                }
                if entry.temp_id != temp_id {
                    return Err(RegistryError::AddressInUse {
                        address: address.to_string(),
                        port,
                        holder: IdRole::Proxy.render(id),
                    });
                }
            }
        }

        if let Some(&id) = t.by_temp.get(temp_id)
            && let Some(entry) = t.entries.get_mut(&id)
        {
            match entry.status {
                NodeStatus::Available | NodeStatus::Evacuating => {
                    if entry.address != address || entry.port != port {
                        tracing::warn!(
                            id = %IdRole::Proxy.render(id),
                            known = %format!("{}:{}", entry.address, entry.port),
                            reported = %format!("{address}:{port}"),
                            "Live proxy re-registered with a different address"
                        );
                    }
                    entry.last_heartbeat = now_ms;
                    return Ok(RegisterOutcome::Resumed { id });
                }
                NodeStatus::Unavailable => {
                    if entry.address == address && entry.port == port {
                        entry.status = NodeStatus::Available;
                        entry.last_heartbeat = now_ms;
                        tracing::info!(id = %IdRole::Proxy.render(id), "Reactivated unavailable proxy");
                        return Ok(RegisterOutcome::Reactivated { id });
                    }
                    // The node moved. The old entry keeps aging toward DEAD
                    // and the reconnect gets a fresh identity.
                    tracing::warn!(
                        id = %IdRole::Proxy.render(id),
                        known = %format!("{}:{}", entry.address, entry.port),
                        reported = %format!("{address}:{port}"),
                        "Proxy reconnected with a new address, allocating a fresh ID"
                    );
                }
                NodeStatus::Dead => {}
            }
        }

        let id = t.alloc.allocate(IdRole::Proxy)?;
        if t.entries.contains_key(&id) {
            // Roll the allocation back before surfacing the corruption.
            t.alloc.release(IdRole::Proxy, id, true, now_ms);
            return Err(RegistryError::Invariant(format!(
                "allocated id {} already has an entry",
                IdRole::Proxy.render(id)
            )));
        }
        t.entries.insert(
            id,
            ProxyEntry {
                id,
                temp_id: temp_id.to_string(),
                address: address.to_string(),
                port,
                status: NodeStatus::Available,
                last_heartbeat: now_ms,
                registered_at: now_wall,
                current_players: 0,
                hard_cap: 0,
                dead_at: None,
            },
        );
        t.by_temp.insert(temp_id.to_string(), id);
        t.by_addr.insert(addr_key, id);
        tracing::info!(
            id = %IdRole::Proxy.render(id),
            temp_id,
            address = %format!("{address}:{port}"),
            "Proxy registered"
        );
        Ok(RegisterOutcome::Created { id })
    }

    /// Record a heartbeat. Promotes UNAVAILABLE back to AVAILABLE; leaves
    /// EVACUATING and DEAD untouched.
    ///
    /// Returns the promotion transition, if one happened.
    pub fn heartbeat(
        &self,
        id: u32,
        current_players: u32,
        hard_cap: u32,
    ) -> RegistryResult<Option<Transition>> {
        let now_ms = self.clock.mono_ms();
        let mut t = self.table.lock();
        let entry = t
            .entries
            .get_mut(&id)
            .ok_or_else(|| RegistryError::NotFound(IdRole::Proxy.render(id)))?;
        match entry.status {
            NodeStatus::Available => {
                entry.last_heartbeat = now_ms;
                entry.current_players = current_players;
                entry.hard_cap = hard_cap;
                Ok(None)
            }
            NodeStatus::Unavailable => {
                entry.status = NodeStatus::Available;
                entry.last_heartbeat = now_ms;
                entry.current_players = current_players;
                entry.hard_cap = hard_cap;
                tracing::info!(id = %IdRole::Proxy.render(id), "Proxy heartbeat resumed, promoting to AVAILABLE");
                Ok(Some(Transition {
                    id,
                    from: NodeStatus::Unavailable,
                    to: NodeStatus::Available,
                }))
            }
            NodeStatus::Evacuating | NodeStatus::Dead => Ok(None),
        }
    }

    /// Apply a status transition, enforcing the state machine.
    pub fn set_status(&self, id: u32, to: NodeStatus) -> RegistryResult<Transition> {
        let now_ms = self.clock.mono_ms();
        let mut guard = self.table.lock();
        let t = &mut *guard;
        let entry = t
            .entries
            .get_mut(&id)
            .ok_or_else(|| RegistryError::NotFound(IdRole::Proxy.render(id)))?;
        let from = entry.status;
        if !from.can_transition(to) {
            return Err(RegistryError::IllegalTransition {
                id: IdRole::Proxy.render(id),
                from: from.as_str(),
                to: to.as_str(),
            });
        }
        entry.status = to;
        if to == NodeStatus::Dead {
            entry.dead_at = Some(now_ms);
            t.by_addr.remove(&(entry.address.clone(), entry.port));
            t.alloc.release(IdRole::Proxy, id, false, now_ms);
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
        t.alloc.release(IdRole::Proxy, id, true, now_ms);
        tracing::info!(id = %IdRole::Proxy.render(id), "Proxy removed");
        true
    }

    /// Operator override for a stuck reserved ID. Drops any lingering entry
    /// and frees the ID regardless of the recycle window.
    pub fn force_release(&self, id: u32) -> bool {
        let mut guard = self.table.lock();
        let t = &mut *guard;
        if let Some(entry) = t.entries.remove(&id) {
            if t.by_temp.get(&entry.temp_id) == Some(&id) {
                t.by_temp.remove(&entry.temp_id);
            }
            t.by_addr.remove(&(entry.address.clone(), entry.port));
        }
        let released = t.alloc.force_release(IdRole::Proxy, id);
        if released {
            tracing::warn!(id = %IdRole::Proxy.render(id), "Proxy ID force-released by operator");
        }
        released
    }

    /// Age entries against the policy and reap expired ID reservations.
    ///
    /// Entries are visited in ascending ID order, a full pass per tick, so
    /// no entry starves. EVACUATING entries are exempt: the evacuation
    /// coordinator owns their transitions.
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

        // Dead entries release their address claim right away; the ID stays
        // reserved until the recycle window has passed.
        for transition in &transitions {
            if transition.to == NodeStatus::Dead
                && let Some(entry) = t.entries.get(&transition.id)
            {
                let addr_key = (entry.address.clone(), entry.port);
                t.by_addr.remove(&addr_key);
                t.alloc.release(IdRole::Proxy, transition.id, false, now_ms);
            }
        }

        let dropped = t.alloc.reap(IdRole::Proxy, now_ms);
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
    pub fn snapshot(&self) -> Vec<ProxyEntry> {
        self.table.lock().entries.values().cloned().collect()
    }

    pub fn get(&self, id: u32) -> Option<ProxyEntry> {
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
