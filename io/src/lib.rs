//! Buffered non-blocking IO for gale.
//!
//! The crate is split in three layers:
//! - [io] defines the [AsyncIo](io::AsyncIo) readiness contract shared by all
//!   socket types.
//! - [net] wraps tokio's TCP/Unix types so they satisfy that contract.
//! - [stream] builds the buffered [Stream](stream::Stream) pipe on top, with
//!   delimiter/regex/fixed-size reads, ordered write completion and TLS
//!   upgrade.

#![forbid(unsafe_code)]

pub mod error;
pub mod io;
pub mod net;
pub mod resolver;
pub mod stream;
pub mod tls;

mod connect;

pub use self::{
    connect::{TcpConnector, connect_to},
    error::{CloseCause, ConnectError, ResolveError, StreamError},
    net::{Listener, TcpStream},
    resolver::{AddrFamily, OverrideResolver, Resolve, StaticResolver, ThreadedResolver},
    stream::{Stream, StreamConfig, WriteHandle},
};

/// re-export of the bytes crate used by all buffer APIs in this crate.
pub mod bytes {
    pub use bytes::*;
}
