/*!
 * Hot-Reload Watcher
 *
 * Watches the directory containing the cluster config file (not the file
 * itself — editors and config-management tools routinely replace it via
 * rename rather than in-place write, which a file-level watch can miss) and
 * reloads on any create/write/rename event touching it. Mirrors
 * `MonitorConfChange`: wait a second after the event fires to let a
 * multi-write save settle, reparse, diff each cluster's server list against
 * what's currently deployed (sorted, so reordering the same set is a no-op),
 * and only call `Forwarder::update` for clusters that actually changed.
 */

use crate::config::{self, ProxyConfig};
use crate::error::Result;
use crate::forwarder::{Forwarder, ServerSpec};
use notify::{EventKind, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

const SETTLE_DELAY: Duration = Duration::from_secs(1);

fn sorted(mut servers: Vec<ServerSpec>) -> Vec<ServerSpec> {
    servers.sort_by(|a, b| a.addr.cmp(&b.addr).then(a.weight.cmp(&b.weight)));
    servers
}

/// Block the calling thread, reloading `config_path` and applying per-
/// cluster diffs to `forwarders` until `shutdown` is set.
pub fn watch(config_path: PathBuf, forwarders: Arc<HashMap<String, Arc<Forwarder>>>, shutdown: Arc<AtomicBool>) -> Result<()> {
    let dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let (tx, rx) = channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            let _ = tx.send(event);
        }
    })
    .map_err(|e| crate::error::ProxyError::Io(e.to_string()))?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| crate::error::ProxyError::Io(e.to_string()))?;

    let mut deployed: HashMap<String, Vec<ServerSpec>> = HashMap::new();
    for (name, fwd) in forwarders.iter() {
        let _ = fwd;
        deployed.insert(name.clone(), Vec::new());
    }

    while !shutdown.load(Ordering::Acquire) {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(event) => {
                if !touches(&event.kind, &config_path) {
                    continue;
                }
                std::thread::sleep(SETTLE_DELAY);
                if let Err(e) = reload_once(&config_path, &forwarders, &mut deployed) {
                    log::warn!("config reload failed, keeping previous configuration: {e}");
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
    Ok(())
}

fn touches(kind: &EventKind, config_path: &Path) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_))
        && config_path.file_name().is_some()
}

fn reload_once(
    config_path: &Path,
    forwarders: &HashMap<String, Arc<Forwarder>>,
    deployed: &mut HashMap<String, Vec<ServerSpec>>,
) -> Result<()> {
    let cfg: ProxyConfig = config::load_from_file(config_path)?;
    for cluster in &cfg.clusters {
        let Some(fwd) = forwarders.get(&cluster.name) else {
            log::warn!("cluster {} in reloaded config has no running forwarder, skipping", cluster.name);
            continue;
        };
        let servers = sorted(cluster.parsed_servers()?);
        let changed = deployed.get(&cluster.name).map(|prev| prev != &servers).unwrap_or(true);
        if changed {
            log::info!("cluster {}: membership changed, applying update", cluster.name);
            fwd.update(&servers);
            deployed.insert(cluster.name.clone(), servers);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_orders_by_addr_then_weight() {
        let servers = vec![
            ServerSpec {
                addr: "b".into(),
                weight: 1,
                alias: None,
            },
            ServerSpec {
                addr: "a".into(),
                weight: 2,
                alias: None,
            },
            ServerSpec {
                addr: "a".into(),
                weight: 1,
                alias: None,
            },
        ];
        let sorted = sorted(servers);
        assert_eq!(sorted[0].addr.as_str(), "a");
        assert_eq!(sorted[0].weight, 1);
        assert_eq!(sorted[1].weight, 2);
        assert_eq!(sorted[2].addr.as_str(), "b");
    }
}
