/*!
 * Node Liveness Pinger
 *
 * One thread per backend node, each issuing `PING` on a short interval and
 * tracking consecutive failures. After `fail_limit` consecutive failures the
 * node is pulled out of the hash ring (`HashRing::del_node`) so live traffic
 * stops routing to it, and the pinger backs off to a much slower retry
 * cadence; a single successful ping re-inserts it. Mirrors the reference
 * `processPing` loop embedded in the forwarder.
 *
 * A pinger's failure count is its own thread-local state, not part of any
 * `Connections` snapshot — a forwarder `Update()` that rebuilds the ring
 * does not reset it. A node mid-backoff when membership changes stays in
 * backoff.
 *
 * Pings share the wire protocol with regular traffic but not its timeout:
 * `dial_timeout` defaults to a fixed 100ms regardless of the cluster's
 * configured backend read/write timeout, so liveness checks fail fast even
 * when a cluster is tuned with generous request timeouts.
 */

use crate::bufio::{Reader, Writer};
use crate::buffer;
use crate::conn::Conn;
use crate::error::ProxyError;
use crate::resp::{Resp, RESP_ARRAY, RESP_BULK};
use crate::ring::HashRing;
use smol_str::SmolStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct PingerConfig {
    pub interval: Duration,
    pub fail_limit: u32,
    pub backoff: Duration,
    pub dial_timeout: Duration,
}

impl Default for PingerConfig {
    fn default() -> Self {
        PingerConfig {
            interval: Duration::from_secs(1),
            fail_limit: 3,
            backoff: Duration::from_secs(300),
            dial_timeout: Duration::from_millis(100),
        }
    }
}

/// Spawn a pinger thread for one node. `spot` is the node's ring weight, used
/// to re-insert it at its original weight after an ejection heals.
pub fn spawn(
    addr: SmolStr,
    spot: u32,
    ring: Arc<HashRing>,
    cfg: PingerConfig,
    shutdown: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("ferrule-pinger-{addr}"))
        .spawn(move || run(addr, spot, ring, cfg, shutdown))
        .expect("spawn pinger thread")
}

fn run(addr: SmolStr, spot: u32, ring: Arc<HashRing>, cfg: PingerConfig, shutdown: Arc<AtomicBool>) {
    let mut fail_count: u32 = 0;
    let mut ejected = false;
    while !shutdown.load(Ordering::Acquire) {
        let ok = ping_once(&addr, cfg.dial_timeout).is_ok();
        if ok {
            fail_count = 0;
            if ejected {
                ring.add_node(&addr, spot);
                ejected = false;
                log::info!("node {addr} recovered, re-added to ring");
            }
            std::thread::sleep(cfg.interval);
        } else {
            fail_count += 1;
            if fail_count >= cfg.fail_limit && !ejected {
                ring.del_node(&addr);
                ejected = true;
                log::warn!("node {addr} failed {fail_count} consecutive pings, ejected from ring");
            }
            std::thread::sleep(if ejected { cfg.backoff } else { cfg.interval });
        }
    }
}

fn ping_once(addr: &str, dial_timeout: Duration) -> crate::error::Result<()> {
    let conn = Conn::dial(addr, dial_timeout, dial_timeout, dial_timeout)?;
    let mut reader = Reader::new(conn, buffer::get(256));

    let mut ping = Resp::new();
    ping.resp_type = RESP_ARRAY;
    ping.data = b"1".to_vec();
    {
        let mut w = Writer::new(reader.get_mut());
        // Resp has no public child-append helper outside the crate; build
        // the single-element array by hand.
        let mut cmd = Resp::new();
        cmd.resp_type = RESP_BULK;
        cmd.data = b"PING".to_vec();
        ping.array = vec![cmd];
        ping.array_size = 1;
        ping.encode(&mut w)?;
        w.flush()?;
    }

    let mut reply = Resp::new();
    loop {
        match reply.decode(&mut reader) {
            Ok(()) => break,
            Err(ProxyError::BufferFull) => reader.read()?,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn ping_once_succeeds_against_a_responder() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 64];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(b"+PONG\r\n");
            }
        });
        ping_once(&addr, Duration::from_secs(1)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn ping_once_fails_against_nothing_listening() {
        assert!(ping_once("127.0.0.1:1", Duration::from_millis(200)).is_err());
    }
}
