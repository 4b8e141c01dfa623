/*!
 * Ketama Consistent-Hash Ring
 *
 * Weighted virtual-node placement derived from MD5, the classic Ketama
 * scheme: each node gets roughly `160 * weight / total_weight` points
 * scattered across the ring, and `get_node` binary-searches the sorted
 * point list for the first point at or after the key's hash, wrapping to
 * the start. The live point list is published behind a `RwLock<Arc<_>>` so
 * `get_node` never blocks on `add_node`/`del_node`/`init`, matching the
 * reference ring's atomic-snapshot `tickArray`.
 */

use md5::{Digest, Md5};
use parking_lot::RwLock;
use smol_str::SmolStr;
use std::sync::Arc;

const POINTS_PER_SERVER: f64 = 160.0;
const POINTS_PER_HASH: usize = 4;
const MAX_HOST_LEN: usize = 64;

pub type KeyHashFn = fn(&[u8]) -> u32;

#[derive(Clone, Copy, Debug)]
struct Tick {
    hash: u32,
    node_idx: u32,
}

struct Snapshot {
    ticks: Vec<Tick>,
    names: Vec<SmolStr>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot {
            ticks: Vec::new(),
            names: Vec::new(),
        }
    }
}

/// A Ketama hash ring. Clone-cheap to hand out (internally an `Arc`).
pub struct HashRing {
    hash: KeyHashFn,
    state: RwLock<RingState>,
}

struct RingState {
    nodes: Vec<SmolStr>,
    spots: Vec<u32>,
    snapshot: Arc<Snapshot>,
}

impl HashRing {
    /// A ring using the default FNV-1a key hash.
    pub fn ketama() -> Self {
        Self::with_hash(crate::hashkit::fnv1a)
    }

    pub fn with_hash(hash: KeyHashFn) -> Self {
        HashRing {
            hash,
            state: RwLock::new(RingState {
                nodes: Vec::new(),
                spots: Vec::new(),
                snapshot: Arc::new(Snapshot::default()),
            }),
        }
    }

    /// Replace the full node set and rebuild the point list.
    pub fn init(&self, nodes: &[SmolStr], spots: &[u32]) {
        assert_eq!(nodes.len(), spots.len(), "nodes length not equal spots length");
        let mut guard = self.state.write();
        guard.nodes = nodes.to_vec();
        guard.spots = spots.to_vec();
        let snapshot = build_snapshot(&guard.nodes, &guard.spots);
        guard.snapshot = Arc::new(snapshot);
    }

    /// Add a node (or update its weight if it already exists) and rebuild.
    pub fn add_node(&self, node: &str, spot: u32) {
        let mut guard = self.state.write();
        let mut nodes = guard.nodes.clone();
        let mut spots = guard.spots.clone();
        match nodes.iter().position(|n| n == node) {
            Some(idx) => spots[idx] = spot,
            None => {
                nodes.push(SmolStr::new(node));
                spots.push(spot);
            }
        }
        let snapshot = build_snapshot(&nodes, &spots);
        guard.nodes = nodes;
        guard.spots = spots;
        guard.snapshot = Arc::new(snapshot);
    }

    /// Remove a node (no-op if absent) and rebuild.
    pub fn del_node(&self, node: &str) {
        let mut guard = self.state.write();
        let keep: Vec<usize> = guard
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.as_str() != node)
            .map(|(i, _)| i)
            .collect();
        if keep.len() == guard.nodes.len() {
            return;
        }
        let nodes: Vec<SmolStr> = keep.iter().map(|&i| guard.nodes[i].clone()).collect();
        let spots: Vec<u32> = keep.iter().map(|&i| guard.spots[i]).collect();
        let snapshot = build_snapshot(&nodes, &spots);
        guard.nodes = nodes;
        guard.spots = spots;
        guard.snapshot = Arc::new(snapshot);
    }

    /// Look up the node responsible for `key`. `None` if the ring is empty.
    pub fn get_node(&self, key: &[u8]) -> Option<SmolStr> {
        let snapshot = self.state.read().snapshot.clone();
        if snapshot.ticks.is_empty() {
            return None;
        }
        let value = (self.hash)(key);
        let i = match snapshot.ticks.binary_search_by(|t| t.hash.cmp(&value)) {
            Ok(i) => i,
            Err(i) => i,
        };
        let i = if i >= snapshot.ticks.len() { 0 } else { i };
        Some(snapshot.names[snapshot.ticks[i].node_idx as usize].clone())
    }
}

fn build_snapshot(nodes: &[SmolStr], spots: &[u32]) -> Snapshot {
    let total_weight: u32 = spots.iter().sum();
    if total_weight == 0 || nodes.is_empty() {
        return Snapshot::default();
    }
    let svrn = nodes.len() as f64;
    let mut ticks = Vec::new();
    for (idx, _node) in nodes.iter().enumerate() {
        let pct = spots[idx] as f64 / total_weight as f64;
        let pointer_per_svr = ((pct * POINTS_PER_SERVER / POINTS_PER_HASH as f64 * svrn + 1e-10)
            * POINTS_PER_HASH as f64) as usize;
        for pidx in 1..=(pointer_per_svr / POINTS_PER_HASH) {
            let mut host = format!("{}-{}", nodes[idx], pidx - 1);
            if host.len() > MAX_HOST_LEN {
                host.truncate(MAX_HOST_LEN);
            }
            for alignment in 0..POINTS_PER_HASH {
                let hash = ketama_hash(host.as_bytes(), alignment);
                ticks.push(Tick {
                    hash,
                    node_idx: idx as u32,
                });
            }
        }
    }
    ticks.sort_by_key(|t| t.hash);
    Snapshot {
        ticks,
        names: nodes.to_vec(),
    }
}

fn ketama_hash(key: &[u8], alignment: usize) -> u32 {
    let mut hasher = Md5::new();
    hasher.update(key);
    let digest = hasher.finalize();
    let off = alignment * 4;
    u32::from_le_bytes([digest[off], digest[off + 1], digest[off + 2], digest[off + 3]])
}
