/*!
 * Ferrule Proxy Main Entry Point
 *
 * Parses the CLI, loads the cluster TOML config, starts one listener thread
 * per cluster, and optionally a hot-reload watcher thread. Mirrors
 * `proxy.go`'s `main`/`NewProxy`/`Serve` wiring: a process hosts many
 * clusters, each an independent `Forwarder` + `Listener` pair sharing nothing
 * but the watcher's view of the config file.
 */

use anyhow::{Context, Result};
use clap::Parser;
use ferrule::config::{self, ClusterConfig, ProxyConfig};
use ferrule::forwarder::{Forwarder, ForwarderConfig};
use ferrule::listener::Listener;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Protocol-aware RESP proxy with consistent-hash routing over pipelined backend connections.
#[derive(Parser, Debug)]
#[command(name = "ferruled", version, about)]
struct Cli {
    /// Path to the cluster TOML config file.
    #[arg(short, long, default_value = "ferrule.toml")]
    config: PathBuf,

    /// Override the config's log_level (RUST_LOG still wins if set).
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(cfg: &ProxyConfig, override_level: Option<&str>) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = override_level.unwrap_or(cfg.log_level.as_str());
        std::env::set_var("RUST_LOG", level);
    }
    env_logger::init();
}

fn start_cluster(cluster: ClusterConfig, shutdown: Arc<AtomicBool>) -> Result<(Arc<Forwarder>, std::thread::JoinHandle<()>)> {
    let servers = cluster.parsed_servers().with_context(|| format!("cluster {}: invalid server list", cluster.name))?;
    let fwd_cfg = ForwarderConfig {
        hash_tag: cluster.hash_tag,
        conns_per_node: cluster.conns_per_node,
        read_timeout: cluster.read_timeout(),
        write_timeout: cluster.write_timeout(),
        pinger: cluster.pinger_config(),
        use_crc16_ring: cluster.use_crc16_ring,
    };
    let forwarder = Arc::new(Forwarder::new(&cluster.name, &servers, fwd_cfg));

    let listener = Listener::bind(&cluster.name, &cluster.listen_proto, &cluster.listen_addr)
        .with_context(|| format!("cluster {}: failed to bind {}", cluster.name, cluster.listen_addr))?;

    let name = cluster.name.clone();
    let password = cluster.password.clone();
    let max_connections = cluster.max_connections;
    let read_timeout = cluster.read_timeout();
    let write_timeout = cluster.write_timeout();
    let conns = Arc::new(AtomicI64::new(0));
    let fwd_for_thread = Arc::clone(&forwarder);

    let handle = std::thread::Builder::new()
        .name(format!("ferrule-listen-{name}"))
        .spawn(move || {
            if let Err(e) = listener.serve(fwd_for_thread, password, max_connections, conns, read_timeout, write_timeout, shutdown) {
                log::error!("cluster {name}: listener exited: {e}");
            }
        })
        .context("spawn listener thread")?;

    log::info!("cluster {}: listening on {} ({})", cluster.name, cluster.listen_addr, cluster.listen_proto);
    Ok((forwarder, handle))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_from_file(&cli.config).with_context(|| format!("loading {}", cli.config.display()))?;
    init_logging(&cfg, cli.log_level.as_deref());

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut forwarders = HashMap::new();
    let mut handles = Vec::new();

    for cluster in cfg.clusters.iter().cloned() {
        let (forwarder, handle) = start_cluster(cluster.clone(), Arc::clone(&shutdown))?;
        forwarders.insert(cluster.name.clone(), forwarder);
        handles.push(handle);
    }

    let forwarders = Arc::new(forwarders);

    if cfg.watch_config {
        let config_path = cli.config.clone();
        let watch_shutdown = Arc::clone(&shutdown);
        let watch_forwarders = Arc::clone(&forwarders);
        std::thread::Builder::new()
            .name("ferrule-watcher".to_string())
            .spawn(move || {
                if let Err(e) = ferrule::watcher::watch(config_path, watch_forwarders, watch_shutdown) {
                    log::error!("config watcher exited: {e}");
                }
            })
            .context("spawn watcher thread")?;
        log::info!("watching {} for cluster membership changes", cli.config.display());
    }

    install_shutdown_handler(Arc::clone(&shutdown))?;

    for handle in handles {
        let _ = handle.join();
    }
    for forwarder in forwarders.values() {
        forwarder.close();
    }
    Ok(())
}

fn install_shutdown_handler(shutdown: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        log::info!("shutdown requested");
        shutdown.store(true, Ordering::Release);
    })
    .context("installing signal handler")
}
