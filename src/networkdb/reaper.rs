//! Garbage collection of expired tombstones, networks and nodes
use std::time::Instant;

use tracing::{debug, error};

use super::NetworkDb;

/// What one sweep removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReapStats {
    pub entries: usize,
    pub networks: usize,
    pub local_networks: usize,
    pub nodes: usize,
}

impl NetworkDb {
    pub fn reap_state(&self) -> ReapStats {
        self.reap_state_at(Instant::now())
    }

    /// Remove everything whose reap deadline is at or before `now`.
    pub fn reap_state_at(&self, now: Instant) -> ReapStats {
        let mut guard = match self.write_state() {
            Ok(state) => state,
            Err(e) => {
                error!("[{}] Reaper skipped: {}", self.config.node_name, e);
                return ReapStats::default();
            }
        };
        let state = &mut *guard;
        let mut stats = ReapStats::default();

        // Entries first so a leaving network still exists while its entries go
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.is_reapable(now));
        stats.entries = before - state.entries.len();

        for networks in state.networks.values_mut() {
            let before = networks.len();
            networks.retain(|_, n| !(n.leaving && n.reap_at.is_some_and(|at| at <= now)));
            stats.networks += before - networks.len();
        }
        state.networks.retain(|_, networks| !networks.is_empty());

        let expired: Vec<String> = state
            .this_node_networks
            .iter()
            .filter(|(_, n)| n.leaving && n.reap_at.is_some_and(|at| at <= now))
            .map(|(nid, _)| nid.clone())
            .collect();
        for nid in &expired {
            state.this_node_networks.remove(nid);
            if state.network_nodes.get(nid).is_some_and(Vec::is_empty) {
                state.network_nodes.remove(nid);
            }
        }
        stats.local_networks = expired.len();

        for nodes in [&mut state.left_nodes, &mut state.failed_nodes] {
            let before = nodes.len();
            nodes.retain(|_, node| !node.reap_at.is_some_and(|at| at <= now));
            stats.nodes += before - nodes.len();
        }

        if stats != ReapStats::default() {
            debug!(
                "[{}] Reaped {} entries, {} remote networks, {} local networks, {} nodes",
                self.config.node_name,
                stats.entries,
                stats.networks,
                stats.local_networks,
                stats.nodes
            );
        }
        stats
    }
}
