/*!
 * Listener / Acceptor
 *
 * One `mio`-driven accept loop per cluster: waits for the listening socket
 * to become readable, accepts every pending connection, and hands each one
 * off to its own OS thread running the blocking [`Handler`](crate::handler::Handler)
 * loop. A client handler blocks its thread on a `WaitGroup::wait()` for
 * however long the backend takes, so a single shared reactor thread cannot
 * own that wait without stalling every other connection — thread-per-client
 * is the direct analogue of the reference implementation's
 * goroutine-per-connection model. Mirrors `proxy.go`'s `Serve`/`accept` and
 * `listen.go`'s `tcp`/`unix` dispatch. Unix-domain listening follows the
 * rest of this crate in being unix-only.
 */

use crate::conn::Conn;
use crate::error::{ProxyError, Result};
use crate::forwarder::Forwarder;
use crate::handler::Handler;
use mio::net::TcpListener as MioTcpListener;
#[cfg(unix)]
use mio::net::UnixListener as MioUnixListener;
use mio::{Events, Interest, Poll, Token};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const ACCEPT_TOKEN: Token = Token(0);

enum RawListener {
    Tcp(MioTcpListener),
    #[cfg(unix)]
    Unix(MioUnixListener),
}

enum AcceptedStream {
    Tcp(mio::net::TcpStream),
    #[cfg(unix)]
    Unix(mio::net::UnixStream),
}

pub struct Listener {
    pub cluster: String,
    raw: RawListener,
    poll: Poll,
}

impl Listener {
    /// `proto` is `"tcp"` or `"unix"`. For `unix`, `addr` is a filesystem
    /// path and any stale socket file there is removed first.
    pub fn bind(cluster: &str, proto: &str, addr: &str) -> Result<Self> {
        let poll = Poll::new()?;
        let mut raw = match proto {
            "tcp" => {
                let sock_addr = addr
                    .parse()
                    .map_err(|_| ProxyError::ConfigServerFormat(format!("invalid tcp listen address: {addr}")))?;
                RawListener::Tcp(MioTcpListener::bind(sock_addr)?)
            }
            "unix" => return Self::bind_unix(cluster, addr, poll),
            other => {
                return Err(ProxyError::ConfigServerFormat(format!("unsupported listen protocol: {other}")));
            }
        };
        if let RawListener::Tcp(l) = &mut raw {
            poll.registry().register(l, ACCEPT_TOKEN, Interest::READABLE)?;
        }
        Ok(Listener {
            cluster: cluster.to_string(),
            raw,
            poll,
        })
    }

    #[cfg(unix)]
    fn bind_unix(cluster: &str, addr: &str, poll: Poll) -> Result<Self> {
        let _ = std::fs::remove_file(addr);
        let mut listener = MioUnixListener::bind(addr)?;
        poll.registry().register(&mut listener, ACCEPT_TOKEN, Interest::READABLE)?;
        Ok(Listener {
            cluster: cluster.to_string(),
            raw: RawListener::Unix(listener),
            poll,
        })
    }

    #[cfg(not(unix))]
    fn bind_unix(_cluster: &str, _addr: &str, _poll: Poll) -> Result<Self> {
        Err(ProxyError::ConfigServerFormat("unix sockets are not supported on this platform".to_string()))
    }

    /// The address actually bound, useful when `addr` was passed as
    /// `:0` and the OS picked a port (tests, ephemeral listeners).
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        match &self.raw {
            RawListener::Tcp(l) => Ok(l.local_addr()?),
            #[cfg(unix)]
            RawListener::Unix(_) => Err(ProxyError::ConfigServerFormat("unix listeners have no socket address".to_string())),
        }
    }

    /// Run the accept loop until `shutdown` is set. Never returns earlier
    /// than that except on an unrecoverable poll error.
    pub fn serve(
        mut self,
        forwarder: Arc<Forwarder>,
        password: Option<String>,
        max_connections: i64,
        conns: Arc<AtomicI64>,
        read_timeout: Duration,
        write_timeout: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Result<()> {
        let mut events = Events::with_capacity(128);
        loop {
            if shutdown.load(Ordering::Acquire) {
                return Ok(());
            }
            match self.poll.poll(&mut events, Some(Duration::from_millis(250))) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ProxyError::from(e)),
            }
            for event in events.iter() {
                if event.token() == ACCEPT_TOKEN {
                    self.accept_all(&forwarder, &password, max_connections, &conns, read_timeout, write_timeout);
                }
            }
        }
    }

    fn accept_all(
        &mut self,
        forwarder: &Arc<Forwarder>,
        password: &Option<String>,
        max_connections: i64,
        conns: &Arc<AtomicI64>,
        read_timeout: Duration,
        write_timeout: Duration,
    ) {
        loop {
            let accepted = match &mut self.raw {
                RawListener::Tcp(l) => l.accept().map(|(s, a)| (AcceptedStream::Tcp(s), a.to_string())),
                #[cfg(unix)]
                RawListener::Unix(l) => l.accept().map(|(s, _)| (AcceptedStream::Unix(s), "unix".to_string())),
            };
            let (stream, peer) = match accepted {
                Ok(v) => v,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::warn!("cluster {}: accept failed: {e}", self.cluster);
                    return;
                }
            };

            if conns.load(Ordering::Relaxed) >= max_connections {
                reject_over_capacity(stream);
                continue;
            }

            let conn = match into_conn(stream, peer, read_timeout, write_timeout) {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("cluster {}: converting accepted socket failed: {e}", self.cluster);
                    continue;
                }
            };

            conns.fetch_add(1, Ordering::Relaxed);
            let handler = Handler::new(Arc::clone(forwarder), password.clone(), Arc::clone(conns));
            std::thread::Builder::new()
                .name(format!("ferrule-client-{}", self.cluster))
                .spawn(move || handler.handle(conn))
                .expect("spawn client handler thread");
        }
    }
}

fn into_conn(stream: AcceptedStream, peer: String, read_timeout: Duration, write_timeout: Duration) -> Result<Conn> {
    match stream {
        AcceptedStream::Tcp(s) => {
            let std_stream = mio_tcp_to_std(s)?;
            Ok(Conn::from_tcp_stream(peer, std_stream, read_timeout, write_timeout))
        }
        #[cfg(unix)]
        AcceptedStream::Unix(s) => {
            let std_stream = mio_unix_to_std(s)?;
            Ok(Conn::from_unix_stream(peer, std_stream, read_timeout, write_timeout))
        }
    }
}

#[cfg(unix)]
fn mio_tcp_to_std(stream: mio::net::TcpStream) -> std::io::Result<std::net::TcpStream> {
    use std::os::unix::io::{FromRawFd, IntoRawFd};
    let std_stream = unsafe { std::net::TcpStream::from_raw_fd(stream.into_raw_fd()) };
    std_stream.set_nonblocking(false)?;
    Ok(std_stream)
}

#[cfg(unix)]
fn mio_unix_to_std(stream: mio::net::UnixStream) -> std::io::Result<std::os::unix::net::UnixStream> {
    use std::os::unix::io::{FromRawFd, IntoRawFd};
    let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(stream.into_raw_fd()) };
    std_stream.set_nonblocking(false)?;
    Ok(std_stream)
}

/// Reject a connection over the cluster's `max_connections` admission limit
/// with a one-off error reply, then drop it without spawning a handler.
fn reject_over_capacity(stream: AcceptedStream) {
    use std::io::Write;
    let msg: &[u8] = b"-ERR Proxy accept more than max connextions\r\n";
    match stream {
        AcceptedStream::Tcp(mut s) => {
            let _ = s.write_all(msg);
        }
        #[cfg(unix)]
        AcceptedStream::Unix(mut s) => {
            let _ = s.write_all(msg);
        }
    }
}
