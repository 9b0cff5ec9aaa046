use core::fmt;

use gale_http::ProtoError;
use gale_io::{ConnectError, ResolveError, StreamError};
use gale_ws::{HandshakeError, ProtocolError};

/// the synthetic status code reported for client-side timeouts.
pub const TIMEOUT_STATUS: u16 = 599;

#[derive(Debug)]
pub enum ClientError {
    /// url missing scheme/host or carrying an unsupported scheme.
    InvalidUrl(&'static str),
    Resolve(ResolveError),
    Connect(ConnectError),
    /// the request deadline expired. maps to status 599.
    Timeout,
    /// malformed response from the server.
    Proto(ProtoError),
    /// connection died mid-exchange.
    Closed(StreamError),
    /// TLS requested without a client configuration, or handshake failure.
    Tls(String),
    /// websocket upgrade was refused or the accept key did not verify.
    WebSocket(String),
}

impl ClientError {
    /// numeric status for error reporting; 599 for timeouts, 0 otherwise.
    pub fn code(&self) -> u16 {
        match self {
            Self::Timeout => TIMEOUT_STATUS,
            _ => 0,
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUrl(msg) => write!(f, "invalid url: {msg}"),
            Self::Resolve(e) => fmt::Display::fmt(e, f),
            Self::Connect(e) => fmt::Display::fmt(e, f),
            Self::Timeout => f.write_str("request timed out (599)"),
            Self::Proto(e) => fmt::Display::fmt(e, f),
            Self::Closed(e) => fmt::Display::fmt(e, f),
            Self::Tls(msg) => write!(f, "tls failure: {msg}"),
            Self::WebSocket(msg) => write!(f, "websocket failure: {msg}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ResolveError> for ClientError {
    fn from(e: ResolveError) -> Self {
        Self::Resolve(e)
    }
}

impl From<ConnectError> for ClientError {
    fn from(e: ConnectError) -> Self {
        match e {
            ConnectError::Timeout => Self::Timeout,
            other => Self::Connect(other),
        }
    }
}

impl From<ProtoError> for ClientError {
    fn from(e: ProtoError) -> Self {
        match e {
            ProtoError::Timeout => Self::Timeout,
            ProtoError::Stream(e) => Self::Closed(e),
            other => Self::Proto(other),
        }
    }
}

impl From<StreamError> for ClientError {
    fn from(e: StreamError) -> Self {
        Self::Closed(e)
    }
}

impl From<HandshakeError> for ClientError {
    fn from(e: HandshakeError) -> Self {
        Self::WebSocket(e.to_string())
    }
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        Self::WebSocket(e.to_string())
    }
}
