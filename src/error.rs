/*!
 * Error Types
 *
 * A typed error hierarchy for the proxy's library surface. Library APIs
 * return `Result<T, ProxyError>`; the binary and the config loader use
 * `anyhow::Error` for the extra context that only matters at the process
 * boundary.
 */

use thiserror::Error;

/// Errors surfaced by the proxy core.
#[derive(Debug, Error, Clone)]
pub enum ProxyError {
    /// Malformed RESP input or wrong command arity.
    #[error("bad request")]
    BadRequest,

    /// The decoder needs more bytes than are currently buffered.
    ///
    /// Internal signal only; never reaches a client.
    #[error("buffer full")]
    BufferFull,

    /// A `Request` trait object didn't downcast the way the codec expected.
    #[error("bad assert")]
    BadAssert,

    /// A `count`-merged sub-reply wasn't an integer.
    #[error("bad count")]
    BadCount,

    /// A server entry in a cluster's server list didn't parse.
    #[error("servers config format error: {0}")]
    ConfigServerFormat(String),

    /// The hash ring returned no node for a key.
    #[error("forwarder hash no hit node")]
    HashNoNode,

    /// `Forward` was called after `Close`.
    #[error("forwarder already closed")]
    ForwarderClosed,

    /// A forwarder's connection bundle was never initialized.
    #[error("connection of forwarder is not initialized")]
    ConnectionNotExist,

    /// A shard's bounded input queue was full.
    #[error("pipe chan is full")]
    PipeChanFull,

    /// The underlying socket has already been closed.
    #[error("connection is closed")]
    ConnClosed,

    /// Sentinel meaning the client sent QUIT; not a real error, never logged as one.
    #[error("close client conn")]
    Quit,

    /// Transport-level I/O failure, preserved as text since `io::Error` isn't `Clone`.
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        ProxyError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
