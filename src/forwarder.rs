/*!
 * Forwarder
 *
 * Owns the live membership of one cluster: the set of backend nodes, their
 * hash-ring placement, and one [`NodeConnPipe`](crate::pipeline::NodeConnPipe)
 * per node. `forward` routes each (possibly split) request to the pipe for
 * its key; `update` hot-swaps membership, reusing pipes for addresses that
 * didn't change and tearing down the rest. Mirrors the reference
 * `defaultForwarder`/`connections`: the ring itself is one long-lived object
 * mutated in place (`init`/`add_node`/`del_node`), so a node's pinger thread
 * always ejects from and re-joins the ring actually in use, never a stale
 * snapshot left behind by a later `update`.
 *
 * Routing failure (no node maps to a key) attaches to the parent message
 * rather than the individual sub-request, since the caller only ever
 * inspects `msg.err()` — matching the reference's "leave already-pushed
 * sub-requests counted, stop pushing the rest" behavior: no `WaitGroup`
 * leak, no partially-silent success.
 */

use crate::error::{ProxyError, Result};
use crate::hashkit::crc16;
use crate::message::Message;
use crate::pinger::{self, PingerConfig};
use crate::pipeline::NodeConnPipe;
use crate::ring::HashRing;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use smol_str::SmolStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One parsed `host:port:weight[ alias]` cluster-config line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub addr: SmolStr,
    pub weight: u32,
    pub alias: Option<SmolStr>,
}

/// Parse a cluster's server list. Every line is `host:port:weight` or
/// `host:port:weight alias`; if any line carries an alias every line must.
pub fn parse_servers(lines: &[String]) -> Result<Vec<ServerSpec>> {
    let mut specs = Vec::with_capacity(lines.len());
    let mut any_alias = false;
    let mut none_alias = false;
    for line in lines {
        let mut parts = line.splitn(2, ' ');
        let hostpart = parts.next().unwrap_or("");
        let alias = parts.next().map(|a| SmolStr::new(a.trim()));
        let mut hp = hostpart.rsplitn(2, ':');
        let weight_str = hp.next().ok_or_else(|| ProxyError::ConfigServerFormat(line.clone()))?;
        let weight: u32 = weight_str.parse().map_err(|_| ProxyError::ConfigServerFormat(line.clone()))?;
        let addr = hp.next().ok_or_else(|| ProxyError::ConfigServerFormat(line.clone()))?;
        if alias.is_some() {
            any_alias = true;
        } else {
            none_alias = true;
        }
        specs.push(ServerSpec {
            addr: SmolStr::new(addr),
            weight,
            alias,
        });
    }
    if any_alias && none_alias {
        return Err(ProxyError::ConfigServerFormat(
            "servers in one cluster must either all carry an alias or none".to_string(),
        ));
    }
    Ok(specs)
}

/// `{`/`}` hash-tag stripping: when both are present, only the bytes between
/// the first `{` and the following `}` participate in hashing.
pub fn trim_hash_tag(enabled: bool, key: &[u8]) -> &[u8] {
    if !enabled {
        return key;
    }
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(rel_end) = key[start + 1..].iter().position(|&b| b == b'}') {
            if rel_end > 0 {
                return &key[start + 1..start + 1 + rel_end];
            }
        }
    }
    key
}

struct NodeEntry {
    addr: SmolStr,
    pipe: Mutex<NodeConnPipe>,
    pinger_shutdown: Arc<AtomicBool>,
}

/// Immutable snapshot of one cluster's node table, published behind a
/// `RwLock<Arc<_>>` so routing never blocks on a reload. The hash ring
/// itself is *not* part of this snapshot — it's a single long-lived object
/// the forwarder owns directly, mutated in place on every `update`.
struct Connections {
    nodes: HashMap<SmolStr, Arc<NodeEntry>>,
}

pub struct ForwarderConfig {
    pub hash_tag: bool,
    pub conns_per_node: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub pinger: PingerConfig,
    pub use_crc16_ring: bool,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        ForwarderConfig {
            hash_tag: true,
            conns_per_node: 4,
            read_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            pinger: PingerConfig::default(),
            use_crc16_ring: false,
        }
    }
}

/// Routes requests to backend nodes for one cluster and hot-swaps membership
/// on reload.
pub struct Forwarder {
    name: SmolStr,
    cfg: ForwarderConfig,
    ring: Arc<HashRing>,
    conns: RwLock<Arc<Connections>>,
}

impl Forwarder {
    pub fn new(name: &str, servers: &[ServerSpec], cfg: ForwarderConfig) -> Self {
        let ring = Arc::new(if cfg.use_crc16_ring {
            HashRing::with_hash(|k| crc16(k) as u32)
        } else {
            HashRing::ketama()
        });
        let fwd = Forwarder {
            name: SmolStr::new(name),
            cfg,
            ring,
            conns: RwLock::new(Arc::new(Connections { nodes: HashMap::new() })),
        };
        fwd.apply(servers, None);
        fwd
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Route every message (splitting multi-key batches first) to its node's
    /// pipe.
    pub fn forward(&self, msgs: &mut [Message]) {
        let conns = self.conns.read().clone();
        let hash_tag = self.cfg.hash_tag;
        'outer: for msg in msgs.iter_mut() {
            if msg.is_already_answered() {
                continue;
            }
            msg.mark_start();
            if msg.is_batch() {
                for sub in msg.batch().iter_mut() {
                    let key = match sub.request() {
                        Some(r) => r.key().to_vec(),
                        None => continue,
                    };
                    let trimmed = trim_hash_tag(hash_tag, &key);
                    match self.lookup(&conns, trimmed) {
                        Some(entry) => entry.pipe.lock().push(sub),
                        None => {
                            msg.with_error(Some(ProxyError::HashNoNode));
                            continue 'outer;
                        }
                    }
                }
            } else {
                let key = match msg.request() {
                    Some(r) => r.key().to_vec(),
                    None => continue,
                };
                let trimmed = trim_hash_tag(hash_tag, &key);
                match self.lookup(&conns, trimmed) {
                    Some(entry) => entry.pipe.lock().push(msg),
                    None => msg.with_error(Some(ProxyError::HashNoNode)),
                }
            }
        }
    }

    fn lookup(&self, conns: &Connections, key: &[u8]) -> Option<Arc<NodeEntry>> {
        let name = self.ring.get_node(key)?;
        conns.nodes.get(name.as_str()).cloned()
    }

    /// Replace membership, reusing pipes/pingers for node names that are
    /// unchanged and tearing down the rest.
    pub fn update(&self, servers: &[ServerSpec]) {
        let previous = self.conns.read().clone();
        self.apply(servers, Some(previous));
    }

    fn apply(&self, servers: &[ServerSpec], previous: Option<Arc<Connections>>) {
        let mut names = Vec::with_capacity(servers.len());
        let mut spots = Vec::with_capacity(servers.len());
        let mut nodes = HashMap::new();
        for spec in servers {
            let name = spec.alias.clone().unwrap_or_else(|| spec.addr.clone());
            let reused = previous
                .as_ref()
                .and_then(|p| p.nodes.get(name.as_str()))
                .filter(|e| e.addr == spec.addr);
            let entry = match reused {
                Some(existing) => Arc::clone(existing),
                None => Arc::new(self.spawn_node(&spec.addr, &name, spec.weight)),
            };
            names.push(name.clone());
            spots.push(spec.weight);
            nodes.insert(name, entry);
        }

        // Mutate the ring in place: a reused node's pinger thread keeps
        // ejecting from/re-joining this exact object.
        self.ring.init(&names, &spots);

        let new_conns = Arc::new(Connections { nodes });
        let old = {
            let mut guard = self.conns.write();
            std::mem::replace(&mut *guard, new_conns)
        };

        if previous.is_some() {
            self.teardown_unused(&old);
        }
    }

    fn spawn_node(&self, addr: &str, name: &SmolStr, weight: u32) -> NodeEntry {
        let pipe = NodeConnPipe::new(addr, self.cfg.conns_per_node, self.cfg.read_timeout, self.cfg.write_timeout);
        let shutdown = Arc::new(AtomicBool::new(false));
        pinger::spawn(
            name.clone(),
            weight,
            Arc::clone(&self.ring),
            PingerConfig {
                interval: self.cfg.pinger.interval,
                fail_limit: self.cfg.pinger.fail_limit,
                backoff: self.cfg.pinger.backoff,
                dial_timeout: self.cfg.pinger.dial_timeout,
            },
            Arc::clone(&shutdown),
        );
        NodeEntry {
            addr: SmolStr::new(addr),
            pipe: Mutex::new(pipe),
            pinger_shutdown: shutdown,
        }
    }

    /// Stop pingers for nodes present in `old` (the just-replaced snapshot)
    /// but absent from the current one. Each `NodeEntry`'s `NodeConnPipe`
    /// closes its worker threads when the last `Arc` to it drops.
    fn teardown_unused(&self, old: &Connections) {
        let current = self.conns.read().clone();
        for (name, entry) in old.nodes.iter() {
            if !current.nodes.contains_key(name.as_str()) {
                entry.pinger_shutdown.store(true, Ordering::Release);
            }
        }
    }

    pub fn close(&self) {
        let conns = self.conns.read().clone();
        for entry in conns.nodes.values() {
            entry.pinger_shutdown.store(true, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_servers_reads_weight_and_alias() {
        let lines = vec!["127.0.0.1:7000:1 cache-a".to_string(), "127.0.0.1:7001:2 cache-b".to_string()];
        let servers = parse_servers(&lines).unwrap();
        assert_eq!(servers[0].addr.as_str(), "127.0.0.1:7000");
        assert_eq!(servers[0].weight, 1);
        assert_eq!(servers[0].alias.as_deref(), Some("cache-a"));
        assert_eq!(servers[1].weight, 2);
    }

    #[test]
    fn parse_servers_rejects_mixed_alias_usage() {
        let lines = vec!["127.0.0.1:7000:1 cache-a".to_string(), "127.0.0.1:7001:2".to_string()];
        assert!(parse_servers(&lines).is_err());
    }

    #[test]
    fn trim_hash_tag_extracts_bracketed_segment() {
        assert_eq!(trim_hash_tag(true, b"{user1000}.posts"), b"user1000");
        assert_eq!(trim_hash_tag(true, b"plainkey"), b"plainkey");
        assert_eq!(trim_hash_tag(false, b"{user1000}.posts"), b"{user1000}.posts");
    }

    #[test]
    fn empty_hash_tag_braces_fall_back_to_full_key() {
        assert_eq!(trim_hash_tag(true, b"{}.posts"), b"{}.posts");
    }
}
