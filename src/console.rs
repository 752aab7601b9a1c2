//! Operator console projection.
//!
//! Pure reader over registry snapshots: renders the `proxyregistry` and
//! `serverregistry` paged tables. Presentation stops at the string; nothing
//! here mutates registry state.

use crate::clock::Clock;
use crate::registry::backends::BackendRegistry;
use crate::registry::entry::NodeStatus;
use crate::registry::proxies::ProxyRegistry;
use crate::registry::IdRole;
use std::fmt::Write as _;
use std::sync::Arc;

/// Read-only console over both registries.
pub struct ConsoleView {
    proxies: Arc<ProxyRegistry>,
    backends: Arc<BackendRegistry>,
    clock: Arc<dyn Clock>,
    page_size: usize,
    dead_display_ms: u64,
}

struct Row {
    id: String,
    address: String,
    port: u16,
    last_heartbeat_ms: u64,
    status: NodeStatus,
    detail: String,
}

impl ConsoleView {
    pub fn new(
        proxies: Arc<ProxyRegistry>,
        backends: Arc<BackendRegistry>,
        clock: Arc<dyn Clock>,
        page_size: usize,
        dead_display_ms: u64,
    ) -> Self {
        Self {
            proxies,
            backends,
            clock,
            page_size,
            dead_display_ms,
        }
    }

    /// Dispatch an operator command line. Returns `None` for commands this
    /// console does not own.
    pub fn command(&self, line: &str) -> Option<String> {
        let mut parts = line.split_whitespace();
        let name = parts.next()?;
        let page = parts.next().and_then(|p| p.parse().ok()).unwrap_or(1);
        match name {
            "proxyregistry" => Some(self.proxy_table(page)),
            "serverregistry" => Some(self.backend_table(page)),
            _ => None,
        }
    }

    /// Render the `proxyregistry [page]` table. Pages are 1-based.
    pub fn proxy_table(&self, page: usize) -> String {
        let now_ms = self.clock.mono_ms();
        let rows: Vec<Row> = self
            .proxies
            .snapshot()
            .into_iter()
            .filter(|e| self.visible(e.status, e.dead_at, now_ms))
            .map(|e| Row {
                id: IdRole::Proxy.render(e.id),
                address: e.address,
                port: e.port,
                last_heartbeat_ms: e.last_heartbeat,
                status: e.status,
                detail: format!("{}/{}", e.current_players, e.hard_cap),
            })
            .collect();
        self.render("Proxy Registry", "players", rows, page, now_ms)
    }

    /// Render the `serverregistry [page]` table. Pages are 1-based.
    pub fn backend_table(&self, page: usize) -> String {
        let now_ms = self.clock.mono_ms();
        let rows: Vec<Row> = self
            .backends
            .snapshot()
            .into_iter()
            .filter(|e| self.visible(e.status, e.dead_at, now_ms))
            .map(|e| Row {
                id: IdRole::Backend.render(e.id),
                address: e.address,
                port: e.port,
                last_heartbeat_ms: e.last_heartbeat,
                status: e.status,
                detail: format!(
                    "{} {}/{} tps={:.1}",
                    e.role, e.current_players, e.hard_cap, e.tps
                ),
            })
            .collect();
        self.render("Server Registry", "role/load", rows, page, now_ms)
    }

    /// DEAD entries linger in the table for a short window, then disappear
    /// even if the recycle reap has not dropped them yet.
    fn visible(&self, status: NodeStatus, dead_at: Option<u64>, now_ms: u64) -> bool {
        match (status, dead_at) {
            (NodeStatus::Dead, Some(dead_at)) => {
                now_ms.saturating_sub(dead_at) <= self.dead_display_ms
            }
            _ => true,
        }
    }

    fn render(&self, title: &str, detail_header: &str, mut rows: Vec<Row>, page: usize, now_ms: u64) -> String {
        // Active entries first, dead entries last; ascending ID inside each
        // group (the snapshot is already ID-ordered).
        rows.sort_by_key(|r| r.status == NodeStatus::Dead);

        let total = rows.len();
        let dead = rows.iter().filter(|r| r.status == NodeStatus::Dead).count();
        let pages = total.div_ceil(self.page_size).max(1);
        let page = page.clamp(1, pages);
        let start = (page - 1) * self.page_size;

        let mut out = String::new();
        let _ = writeln!(out, "{title} - page {page}/{pages}");
        let _ = writeln!(
            out,
            "{:<12} {:<16} {:>5}  {:>10}  {:<11} {}",
            "id", "address", "port", "heartbeat", "status", detail_header
        );
        for row in rows.iter().skip(start).take(self.page_size) {
            let ago_secs = now_ms.saturating_sub(row.last_heartbeat_ms) / 1000;
            let _ = writeln!(
                out,
                "{:<12} {:<16} {:>5}  {:>9}s  {:<11} {}",
                row.id, row.address, row.port, ago_secs, row.status, row.detail
            );
        }
        let _ = writeln!(out, "{} total, {} active, {} dead", total, total - dead, dead);
        let _ = writeln!(
            out,
            "dead/stalled entries shown for {}s",
            self.dead_display_ms / 1000
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::entry::BackendKind;
    use crate::registry::{AgingPolicy, BackendSpec};

    fn setup() -> (Arc<ManualClock>, Arc<ProxyRegistry>, Arc<BackendRegistry>, ConsoleView) {
        let clock = Arc::new(ManualClock::new());
        let proxies = Arc::new(ProxyRegistry::new(clock.clone(), 30_000, 300_000));
        let backends = Arc::new(BackendRegistry::new(clock.clone(), 30_000, 300_000));
        let console = ConsoleView::new(
            proxies.clone(),
            backends.clone(),
            clock.clone(),
            10,
            60_000,
        );
        (clock, proxies, backends, console)
    }

    #[test]
    fn test_proxy_table_lists_entries() {
        let (_clock, proxies, _backends, console) = setup();
        proxies.register("temp-a", "10.0.0.1", 25565).unwrap();
        proxies.register("temp-b", "10.0.0.2", 25565).unwrap();

        let table = console.proxy_table(1);
        assert!(table.contains("proxy-0"));
        assert!(table.contains("proxy-1"));
        assert!(table.contains("2 total, 2 active, 0 dead"));
        assert!(table.contains("dead/stalled entries shown for 60s"));
    }

    #[test]
    fn test_dead_entries_sort_last_then_disappear() {
        let (clock, proxies, _backends, console) = setup();
        let dying = proxies.register("temp-a", "10.0.0.1", 25565).unwrap().id();
        proxies.register("temp-b", "10.0.0.2", 25565).unwrap();

        let policy = AgingPolicy {
            soft_timeout_ms: 15_000,
            hard_timeout_ms: 60_000,
        };
        clock.advance_secs(61);
        proxies.sweep(&policy);
        // Keep the survivor alive; the silent one ages through to DEAD.
        proxies.heartbeat(1, 0, 0).unwrap();
        clock.advance_secs(1);
        proxies.sweep(&policy);
        assert_eq!(proxies.get(dying).unwrap().status, NodeStatus::Dead);

        let table = console.proxy_table(1);
        let dead_pos = table.find("proxy-0").unwrap();
        let live_pos = table.find("proxy-1").unwrap();
        assert!(live_pos < dead_pos, "active rows must precede dead rows");
        assert!(table.contains("2 total, 1 active, 1 dead"));

        // Past the display window the dead row drops out of the table.
        clock.advance_secs(61);
        proxies.heartbeat(1, 0, 0).unwrap();
        let table = console.proxy_table(1);
        assert!(!table.contains("proxy-0"));
        assert!(table.contains("1 total, 1 active, 0 dead"));
    }

    #[test]
    fn test_backend_table_shows_stats() {
        let (_clock, _proxies, backends, console) = setup();
        backends
            .register(&BackendSpec {
                temp_id: "temp-a".into(),
                address: "10.0.0.1".into(),
                port: 25566,
                kind: BackendKind::Mini,
                role: "duels".into(),
                capacity: None,
            })
            .unwrap();

        let table = console.backend_table(1);
        assert!(table.contains("backend-0"));
        assert!(table.contains("duels"));
        assert!(table.contains("AVAILABLE"));
    }

    #[test]
    fn test_command_dispatch() {
        let (_clock, proxies, _backends, console) = setup();
        proxies.register("temp-a", "10.0.0.1", 25565).unwrap();

        assert!(console.command("proxyregistry").unwrap().contains("proxy-0"));
        assert!(
            console
                .command("serverregistry 1")
                .unwrap()
                .contains("0 total")
        );
        assert!(console.command("playerlist").is_none());
        // Garbage page arguments fall back to page 1.
        assert!(console.command("proxyregistry xyz").unwrap().contains("page 1/1"));
    }

    #[test]
    fn test_pagination_clamps() {
        let (_clock, proxies, _backends, console) = setup();
        for i in 0..25 {
            proxies
                .register(&format!("temp-{i}"), &format!("10.0.1.{i}"), 25565)
                .unwrap();
        }
        let page3 = console.proxy_table(3);
        assert!(page3.contains("page 3/3"));
        assert!(page3.contains("proxy-24"));
        // Out-of-range pages clamp instead of rendering nothing.
        let clamped = console.proxy_table(99);
        assert!(clamped.contains("page 3/3"));
        let first = console.proxy_table(0);
        assert!(first.contains("page 1/3"));
        assert!(first.contains("proxy-0"));
    }
}
