//! Dense identifier allocation.
//!
//! Permanent IDs are role-scoped dense integers (`proxy-0`, `backend-7`):
//! the lowest free non-negative integer per role. A freed ID moves into a
//! reserved set for a cool-down window before it can be handed to a
//! different instance, so a just-dead ID never resurfaces immediately.

use crate::error::{RegistryError, RegistryResult};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Role namespace for identifier allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdRole {
    Proxy,
    Backend,
}

impl IdRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdRole::Proxy => "proxy",
            IdRole::Backend => "backend",
        }
    }

    /// Render a numeric ID as its wire token, e.g. `backend-7`.
    pub fn render(&self, id: u32) -> String {
        format!("{}-{}", self.as_str(), id)
    }

    /// Parse a wire token back into role and number.
    pub fn parse(token: &str) -> Option<(IdRole, u32)> {
        let (role, num) = token.rsplit_once('-')?;
        let id = num.parse().ok()?;
        match role {
            "proxy" => Some((IdRole::Proxy, id)),
            "backend" => Some((IdRole::Backend, id)),
            _ => None,
        }
    }
}

impl std::fmt::Display for IdRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hard ceiling on the ID space per role. Far beyond any real fleet; hitting
/// it means an allocation loop bug, not growth.
const ID_SPACE_LIMIT: u32 = 1 << 20;

#[derive(Debug, Default)]
struct RolePool {
    live: BTreeSet<u32>,
    /// Reserved ID -> monotonic ms when it was reserved.
    reserved: BTreeMap<u32, u64>,
}

impl RolePool {
    /// Lowest non-negative integer absent from both sets.
    fn lowest_free(&self) -> u32 {
        let mut candidate = 0u32;
        while self.live.contains(&candidate) || self.reserved.contains_key(&candidate) {
            candidate += 1;
        }
        candidate
    }
}

/// Dense, role-scoped identifier allocator with a reserved cool-down set.
///
/// Not internally synchronized; callers wrap it in the registry lock.
#[derive(Debug)]
pub struct IdAllocator {
    pools: HashMap<IdRole, RolePool>,
    recycle_window_ms: u64,
}

impl IdAllocator {
    pub fn new(recycle_window_ms: u64) -> Self {
        Self {
            pools: HashMap::new(),
            recycle_window_ms,
        }
    }

    fn pool(&mut self, role: IdRole) -> &mut RolePool {
        self.pools.entry(role).or_default()
    }

    /// Allocate the lowest free ID for the role and insert it into the live
    /// set. Fails only on pathological exhaustion.
    pub fn allocate(&mut self, role: IdRole) -> RegistryResult<u32> {
        let pool = self.pool(role);
        let id = pool.lowest_free();
        if id >= ID_SPACE_LIMIT {
            return Err(RegistryError::Exhausted(role.as_str()));
        }
        // Collision means the free scan and the sets disagree. That is a
        // corrupted allocator, not a retryable condition.
        if !pool.live.insert(id) {
            return Err(RegistryError::Invariant(format!(
                "allocator returned live id {}",
                role.render(id)
            )));
        }
        Ok(id)
    }

    /// Release an ID. `immediate` frees it outright (graceful shutdown);
    /// otherwise it moves to the reserved set with a timestamp and waits out
    /// the recycle window.
    pub fn release(&mut self, role: IdRole, id: u32, immediate: bool, now_ms: u64) {
        let pool = self.pool(role);
        let was_live = pool.live.remove(&id);
        if immediate {
            pool.reserved.remove(&id);
        } else if was_live {
            pool.reserved.insert(id, now_ms);
        }
    }

    /// Promote reserved entries older than the recycle window back to free.
    /// Returns the IDs that became free.
    pub fn reap(&mut self, role: IdRole, now_ms: u64) -> Vec<u32> {
        let window = self.recycle_window_ms;
        let pool = self.pool(role);
        let expired: Vec<u32> = pool
            .reserved
            .iter()
            .filter(|&(_, &reserved_at)| now_ms.saturating_sub(reserved_at) > window)
            .map(|(&id, _)| id)
            .collect();
        for id in &expired {
            pool.reserved.remove(id);
        }
        expired
    }

    /// Operator override: drop a stuck reserved ID without waiting out the
    /// window. Returns whether anything was released.
    pub fn force_release(&mut self, role: IdRole, id: u32) -> bool {
        let pool = self.pool(role);
        pool.live.remove(&id) | pool.reserved.remove(&id).is_some()
    }

    pub fn is_live(&self, role: IdRole, id: u32) -> bool {
        self.pools.get(&role).is_some_and(|p| p.live.contains(&id))
    }

    pub fn is_reserved(&self, role: IdRole, id: u32) -> bool {
        self.pools
            .get(&role)
            .is_some_and(|p| p.reserved.contains_key(&id))
    }

    /// Number of IDs sitting in the reserved set for a role.
    pub fn reserved_count(&self, role: IdRole) -> usize {
        self.pools.get(&role).map_or(0, |p| p.reserved.len())
    }
}
