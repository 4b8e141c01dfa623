/*!
 * Timeout-Wrapped Connection
 *
 * A thin wrapper around a blocking `TcpStream` (or Unix socket) that sets a
 * fresh read/write deadline before every operation and turns "already
 * closed" into a typed error instead of an OS error. Both client-facing
 * connections (via the listener) and backend node connections (via the
 * pipeline) go through this.
 */

use crate::error::{ProxyError, Result};
use std::io::{IoSlice, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Transport enum so one `Conn` type serves both TCP and Unix-domain
/// sockets, matching the listener's `tcp`/`unix` protocol choice.
pub enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

pub struct Conn {
    addr: String,
    transport: Option<Transport>,
    closed: bool,
    dial_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl Conn {
    pub fn dial(addr: &str, dial_timeout: Duration, read_timeout: Duration, write_timeout: Duration) -> Result<Self> {
        let sock_addr: SocketAddr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ProxyError::Io(format!("unresolvable address: {addr}")))?;
        let stream = TcpStream::connect_timeout(&sock_addr, dial_timeout)?;
        stream.set_nodelay(true).ok();
        Ok(Conn {
            addr: addr.to_string(),
            transport: Some(Transport::Tcp(stream)),
            closed: false,
            dial_timeout,
            read_timeout,
            write_timeout,
        })
    }

    pub fn from_tcp_stream(addr: String, stream: TcpStream, read_timeout: Duration, write_timeout: Duration) -> Self {
        stream.set_nodelay(true).ok();
        Conn {
            addr,
            transport: Some(Transport::Tcp(stream)),
            closed: false,
            dial_timeout: Duration::ZERO,
            read_timeout,
            write_timeout,
        }
    }

    #[cfg(unix)]
    pub fn from_unix_stream(
        addr: String,
        stream: std::os::unix::net::UnixStream,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Conn {
            addr,
            transport: Some(Transport::Unix(stream)),
            closed: false,
            dial_timeout: Duration::ZERO,
            read_timeout,
            write_timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Re-dial using this connection's original address and timeouts.
    /// Only meaningful for TCP-backed connections (backend node pipes).
    pub fn redial(&self) -> Result<Self> {
        Conn::dial(&self.addr, self.dial_timeout, self.read_timeout, self.write_timeout)
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.transport = None;
        }
    }
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::new(std::io::ErrorKind::NotConnected, ProxyError::ConnClosed));
        }
        match self.transport.as_mut().expect("checked not closed") {
            Transport::Tcp(s) => {
                if !self.read_timeout.is_zero() {
                    s.set_read_timeout(Some(self.read_timeout))?;
                }
                s.read(buf)
            }
            #[cfg(unix)]
            Transport::Unix(s) => {
                if !self.read_timeout.is_zero() {
                    s.set_read_timeout(Some(self.read_timeout))?;
                }
                s.read(buf)
            }
        }
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::new(std::io::ErrorKind::NotConnected, ProxyError::ConnClosed));
        }
        match self.transport.as_mut().expect("checked not closed") {
            Transport::Tcp(s) => {
                if !self.write_timeout.is_zero() {
                    s.set_write_timeout(Some(self.write_timeout))?;
                }
                s.write(buf)
            }
            #[cfg(unix)]
            Transport::Unix(s) => {
                if !self.write_timeout.is_zero() {
                    s.set_write_timeout(Some(self.write_timeout))?;
                }
                s.write(buf)
            }
        }
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::new(std::io::ErrorKind::NotConnected, ProxyError::ConnClosed));
        }
        match self.transport.as_mut().expect("checked not closed") {
            Transport::Tcp(s) => {
                if !self.write_timeout.is_zero() {
                    s.set_write_timeout(Some(self.write_timeout))?;
                }
                s.write_vectored(bufs)
            }
            #[cfg(unix)]
            Transport::Unix(s) => {
                if !self.write_timeout.is_zero() {
                    s.set_write_timeout(Some(self.write_timeout))?;
                }
                s.write_vectored(bufs)
            }
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.close();
    }
}
