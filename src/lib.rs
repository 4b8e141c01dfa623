// Core modules for Ferrule, a protocol-aware RESP proxy
pub mod bufio; // buffered Reader/Writer over any Read/Write
pub mod buffer; // pooled, power-of-two sized byte buffers
pub mod config; // TOML cluster configuration
pub mod conn; // backend/client transport (TCP + unix)
pub mod error; // ProxyError + Result
pub mod forwarder; // per-cluster routing and membership
pub mod handler; // per-connection client loop
pub mod hashkit; // CRC16 + FNV1a
pub mod listener; // mio accept loop
pub mod message; // Request/Message pooling, command splitting
pub mod pinger; // backend liveness checks
pub mod pipeline; // per-node pipelined connection pool
pub mod resp; // RESP codec
pub mod ring; // consistent-hash ring (ketama + pluggable)
pub mod watcher; // hot-reload config watcher

pub use config::*;
pub use error::*;
pub use forwarder::*;
pub use handler::*;
pub use listener::*;
pub use message::*;
pub use resp::*;

/// Default proxy listen address when a cluster config doesn't set one.
pub const DEFAULT_ADDR: &str = "0.0.0.0:6400";
