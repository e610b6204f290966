//! LWW-replicated sensor state.
//!
//! Each node holds a register map from origin-scoped keys to the newest
//! [`SensorEntry`] seen for that key, ordered by `(ts_ms, origin)`. Merge
//! is commutative, associative, and idempotent, so any delivery order of
//! the same update set converges to the same map.
//!
//! Two clear-on-read buffers hang off the same lock as the map:
//!
//! - the **UI buffer** collects every accepted entry (local or remote)
//!   and feeds `GET /api/updates`;
//! - the **replication buffer** collects *locally produced* entries only
//!   and feeds the periodic publisher. Remote entries never enter it,
//!   which is what stops update loops between nodes.
//!
//! All operations are bounded: no I/O happens under the lock, and
//! snapshot serialization works on a copy released from it.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;

use crate::proto::SensorEntry;

/// Accept/reject totals, snapshot via [`HubState::metrics`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct StateMetrics {
    /// Entries that won their merge and were stored.
    pub accepted: u64,
    /// Entries discarded by the LWW order (not an error).
    pub rejected_stale: u64,
    /// Entries rejected before merge: bad key prefix or non-positive ts.
    pub rejected_invalid: u64,
}

struct Inner {
    entries: BTreeMap<String, SensorEntry>,
    ui_buf: Vec<SensorEntry>,
    repl_buf: Vec<SensorEntry>,
    metrics: StateMetrics,
}

/// The node's convergent view of the sensor space.
pub struct HubState {
    node_id: String,
    inner: Mutex<Inner>,
}

/// True when `incoming` supersedes `existing` under the `(ts_ms, origin)`
/// total order: strictly newer timestamp, or an equal timestamp with a
/// lexically greater origin.
pub(crate) fn lww_supersedes(incoming: &SensorEntry, existing: &SensorEntry) -> bool {
    incoming.ts_ms > existing.ts_ms
        || (incoming.ts_ms == existing.ts_ms && incoming.origin > existing.origin)
}

impl HubState {
    pub fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                ui_buf: Vec::new(),
                repl_buf: Vec::new(),
                metrics: StateMetrics::default(),
            }),
        }
    }

    /// Merge an entry produced by this node's own sensors.
    ///
    /// On acceptance the entry lands in BOTH buffers: the UI sees it and
    /// the next publish cycle replicates it. Returns whether the entry
    /// was stored.
    pub fn apply_local(&self, entry: SensorEntry) -> bool {
        if entry.origin != self.node_id {
            tracing::warn!(
                key = %entry.key,
                origin = %entry.origin,
                "local entry rejected: origin is not this node"
            );
            self.inner.lock().metrics.rejected_invalid += 1;
            return false;
        }
        self.merge(entry, true)
    }

    /// Merge an entry received from a peer via SENSOR_UPDATE.
    ///
    /// On acceptance the entry lands in the UI buffer ONLY — replicating
    /// it again would echo updates back and forth between nodes.
    pub fn apply_remote(&self, entry: SensorEntry) -> bool {
        self.merge(entry, false)
    }

    fn merge(&self, entry: SensorEntry, replicate: bool) -> bool {
        let mut inner = self.inner.lock();

        if entry.ts_ms <= 0 {
            tracing::warn!(key = %entry.key, ts_ms = entry.ts_ms, "entry rejected: non-positive timestamp");
            inner.metrics.rejected_invalid += 1;
            return false;
        }
        if !entry.key.starts_with(&format!("{}:", entry.origin)) {
            tracing::warn!(
                key = %entry.key,
                origin = %entry.origin,
                "entry rejected: key prefix does not match origin"
            );
            inner.metrics.rejected_invalid += 1;
            return false;
        }

        let accept = match inner.entries.get(&entry.key) {
            None => true,
            Some(existing) => lww_supersedes(&entry, existing),
        };
        if !accept {
            tracing::debug!(key = %entry.key, ts_ms = entry.ts_ms, "merge_rejected: stale under LWW order");
            inner.metrics.rejected_stale += 1;
            return false;
        }

        inner.entries.insert(entry.key.clone(), entry.clone());
        inner.ui_buf.push(entry.clone());
        if replicate {
            inner.repl_buf.push(entry);
        }
        inner.metrics.accepted += 1;
        true
    }

    /// Deterministic deep-copied view of the whole map, grouped by origin
    /// for API output. Grouping runs on the copy, outside the lock.
    pub fn snapshot_state(&self) -> BTreeMap<String, BTreeMap<String, SensorEntry>> {
        let copy: Vec<SensorEntry> = {
            let inner = self.inner.lock();
            inner.entries.values().cloned().collect()
        };
        group_by_origin(copy)
    }

    /// Atomically take the UI buffer, leaving it empty.
    pub fn drain_ui_updates(&self) -> Vec<SensorEntry> {
        std::mem::take(&mut self.inner.lock().ui_buf)
    }

    /// Atomically take the replication buffer, leaving it empty.
    pub fn drain_replication_updates(&self) -> Vec<SensorEntry> {
        std::mem::take(&mut self.inner.lock().repl_buf)
    }

    /// Number of distinct keys stored.
    pub fn key_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn metrics(&self) -> StateMetrics {
        self.inner.lock().metrics.clone()
    }
}

/// Group entries as `origin → sensor_id → entry`, both levels key-sorted.
/// Later entries for the same key replace earlier ones.
pub fn group_by_origin(
    entries: impl IntoIterator<Item = SensorEntry>,
) -> BTreeMap<String, BTreeMap<String, SensorEntry>> {
    let mut grouped: BTreeMap<String, BTreeMap<String, SensorEntry>> = BTreeMap::new();
    for entry in entries {
        let Some(sensor_id) = entry.sensor_id().map(str::to_string) else {
            continue;
        };
        grouped
            .entry(entry.origin.clone())
            .or_default()
            .insert(sensor_id, entry);
    }
    grouped
}
