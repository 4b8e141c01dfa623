//! End-to-end scenarios against a real listener, real backend sockets (no
//! mocking the wire), driven from a plain client `TcpStream`.

use ferrule::buffer;
use ferrule::bufio::{Reader, Writer};
use ferrule::config::ClusterConfig;
use ferrule::forwarder::{Forwarder, ForwarderConfig};
use ferrule::listener::Listener;
use ferrule::resp::{Resp, RESP_ARRAY, RESP_INT};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A backend stand-in that echoes the request's key back as a bulk reply,
/// or `:1` for DEL/EXISTS-shaped requests. Good enough to exercise routing,
/// splitting and merging without needing a real key-value store.
fn spawn_fake_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(_) => continue,
            };
            std::thread::spawn(move || serve_fake_backend(stream));
        }
    });
    addr
}

fn serve_fake_backend(stream: TcpStream) {
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut reader = Reader::new(stream.try_clone().unwrap(), buffer::get(4096));
    loop {
        let mut req = Resp::new();
        match req.decode(&mut reader) {
            Ok(()) => {}
            Err(ferrule::error::ProxyError::BufferFull) => {
                if reader.read().is_err() {
                    return;
                }
                continue;
            }
            Err(_) => return,
        }
        let cmd = req.array().first().map(|r| r.data.clone()).unwrap_or_default();
        let reply = if cmd.eq_ignore_ascii_case(b"DEL") || cmd.eq_ignore_ascii_case(b"EXISTS") {
            let mut r = Resp::new();
            r.resp_type = RESP_INT;
            r.data = b"1".to_vec();
            r
        } else {
            let key = req.array().get(1).map(|r| r.data.clone()).unwrap_or_default();
            let mut r = Resp::new();
            r.resp_type = b'$';
            r.data = key;
            r
        };
        let mut w = Writer::new(reader.get_mut());
        if reply.encode(&mut w).is_err() {
            return;
        }
        if w.flush().is_err() {
            return;
        }
    }
}

fn start_cluster(cluster_name: &str, servers: &[String], max_connections: i64) -> (SocketAddr, Arc<AtomicBool>) {
    let cfg = ClusterConfig {
        name: cluster_name.to_string(),
        listen_proto: "tcp".to_string(),
        listen_addr: "127.0.0.1:0".to_string(),
        servers: servers.to_vec(),
        hash_tag: true,
        use_crc16_ring: false,
        password: None,
        max_connections,
        conns_per_node: 2,
        read_timeout_ms: 2000,
        write_timeout_ms: 2000,
        ping_interval_ms: 1000,
        ping_fail_limit: 3,
        ping_backoff_ms: 300_000,
    };
    let parsed = cfg.parsed_servers().unwrap();
    let fwd_cfg = ForwarderConfig {
        hash_tag: cfg.hash_tag,
        conns_per_node: cfg.conns_per_node,
        read_timeout: cfg.read_timeout(),
        write_timeout: cfg.write_timeout(),
        pinger: cfg.pinger_config(),
        use_crc16_ring: cfg.use_crc16_ring,
    };
    let forwarder = Arc::new(Forwarder::new(&cfg.name, &parsed, fwd_cfg));
    let listener = Listener::bind(&cfg.name, &cfg.listen_proto, &cfg.listen_addr).unwrap();
    let bound = listener.local_addr().unwrap();
    let shutdown = Arc::new(AtomicBool::new(false));
    let conns = Arc::new(AtomicI64::new(0));
    let thread_shutdown = Arc::clone(&shutdown);
    std::thread::spawn(move || {
        let _ = listener.serve(forwarder, cfg.password, cfg.max_connections, conns, cfg.read_timeout(), cfg.write_timeout(), thread_shutdown);
    });
    std::thread::sleep(Duration::from_millis(50));
    (bound, shutdown)
}

fn send(stream: &mut TcpStream, cmd: &[u8]) -> Vec<u8> {
    stream.write_all(cmd).unwrap();
    let mut buf = [0u8; 4096];
    let n = stream.read(&mut buf).unwrap();
    buf[..n].to_vec()
}

#[test]
fn single_get_round_trips_through_one_node() {
    let backend = spawn_fake_backend();
    let (proxy_addr, _shutdown) = start_cluster("cache", &[format!("{backend}:1")], 100);

    let mut client = TcpStream::connect(proxy_addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let resp = send(&mut client, b"*2\r\n$3\r\nGET\r\n$4\r\nbaka\r\n");
    assert_eq!(resp, b"$4\r\nbaka\r\n");
}

#[test]
fn mget_splits_and_merges_across_nodes() {
    let backend_a = spawn_fake_backend();
    let backend_b = spawn_fake_backend();
    let (proxy_addr, _shutdown) = start_cluster("cache", &[format!("{backend_a}:1"), format!("{backend_b}:1")], 100);

    let mut client = TcpStream::connect(proxy_addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let resp = send(&mut client, b"*3\r\n$4\r\nMGET\r\n$1\r\nx\r\n$1\r\ny\r\n");
    assert_eq!(resp, b"*2\r\n$1\r\nx\r\n$1\r\ny\r\n");
}

#[test]
fn del_merges_counts_from_multiple_keys() {
    let backend = spawn_fake_backend();
    let (proxy_addr, _shutdown) = start_cluster("cache", &[format!("{backend}:1")], 100);

    let mut client = TcpStream::connect(proxy_addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let resp = send(&mut client, b"*3\r\n$3\r\nDEL\r\n$1\r\na\r\n$1\r\nb\r\n");
    assert_eq!(resp, b":2\r\n");
}

#[test]
fn auth_is_required_before_other_commands_when_password_is_set() {
    let backend = spawn_fake_backend();
    let cfg = ClusterConfig {
        name: "secure".to_string(),
        listen_proto: "tcp".to_string(),
        listen_addr: "127.0.0.1:0".to_string(),
        servers: vec![format!("{backend}:1")],
        hash_tag: true,
        use_crc16_ring: false,
        password: Some("hunter2".to_string()),
        max_connections: 100,
        conns_per_node: 2,
        read_timeout_ms: 2000,
        write_timeout_ms: 2000,
        ping_interval_ms: 1000,
        ping_fail_limit: 3,
        ping_backoff_ms: 300_000,
    };
    let parsed = cfg.parsed_servers().unwrap();
    let fwd_cfg = ForwarderConfig {
        hash_tag: cfg.hash_tag,
        conns_per_node: cfg.conns_per_node,
        read_timeout: cfg.read_timeout(),
        write_timeout: cfg.write_timeout(),
        pinger: cfg.pinger_config(),
        use_crc16_ring: cfg.use_crc16_ring,
    };
    let forwarder = Arc::new(Forwarder::new(&cfg.name, &parsed, fwd_cfg));
    let listener = Listener::bind(&cfg.name, &cfg.listen_proto, &cfg.listen_addr).unwrap();
    let bound = listener.local_addr().unwrap();
    let shutdown = Arc::new(AtomicBool::new(false));
    let conns = Arc::new(AtomicI64::new(0));
    let password = cfg.password.clone();
    std::thread::spawn(move || {
        let _ = listener.serve(forwarder, password, cfg.max_connections, conns, cfg.read_timeout(), cfg.write_timeout(), shutdown);
    });
    std::thread::sleep(Duration::from_millis(50));

    let mut client = TcpStream::connect(bound).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let resp = send(&mut client, b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n");
    assert_eq!(resp, b"-NOAUTH Authentication required.\r\n");

    let resp = send(&mut client, b"*2\r\n$4\r\nAUTH\r\n$6\r\nwrong1\r\n");
    assert_eq!(resp, b"-ERR invalid password\r\n");

    let resp = send(&mut client, b"*2\r\n$4\r\nAUTH\r\n$7\r\nhunter2\r\n");
    assert_eq!(resp, b"+OK\r\n");

    let resp = send(&mut client, b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n");
    assert_eq!(resp, b"$1\r\na\r\n");
}

#[test]
fn over_capacity_connection_is_rejected() {
    let backend = spawn_fake_backend();
    let (proxy_addr, _shutdown) = start_cluster("tiny", &[format!("{backend}:1")], 0);

    let mut client = TcpStream::connect(proxy_addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut buf = [0u8; 256];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"-ERR Proxy accept more than max connextions\r\n");
}

#[test]
fn unknown_command_is_rejected_without_forwarding() {
    let backend = spawn_fake_backend();
    let (proxy_addr, _shutdown) = start_cluster("cache", &[format!("{backend}:1")], 100);

    let mut client = TcpStream::connect(proxy_addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let resp = send(&mut client, b"*1\r\n$7\r\nFLUSHDB\r\n");
    assert_eq!(resp, b"-ERR unknown command\r\n");
}
