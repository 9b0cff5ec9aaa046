use core::fmt;

use std::{io, sync::Arc};

/// Cause recorded when a stream is torn down. Connection-reset class errors
/// are reported as plain EOF while the original error stays reachable here.
#[derive(Clone, Debug)]
pub enum CloseCause {
    /// peer closed the connection in an orderly way.
    Eof,
    /// stream was closed by its owner.
    Local,
    /// read buffer grew past the configured limit.
    BufferFull,
    /// a bounded read ran out of budget before its condition matched.
    Unsatisfiable,
    /// an io error observed while reading or writing.
    Io(Arc<io::Error>),
}

impl CloseCause {
    pub(crate) fn from_io(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }

    /// the underlying io error when the close originated from one.
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eof => f.write_str("peer closed connection"),
            Self::Local => f.write_str("stream closed locally"),
            Self::BufferFull => f.write_str("read buffer limit exceeded"),
            Self::Unsatisfiable => f.write_str("bounded read can not be satisfied"),
            Self::Io(e) => fmt::Display::fmt(e, f),
        }
    }
}

/// Error type produced by [Stream](crate::stream::Stream) operations.
#[derive(Clone, Debug)]
pub enum StreamError {
    /// operation on a stream that is already closed, or close was observed
    /// while the operation was in flight.
    Closed(Option<CloseCause>),
    /// `max_bytes` were buffered without the read condition matching.
    UnsatisfiableRead,
    /// queued writes would exceed `max_write_buffer_size`.
    WriteBufferFull,
    /// the read buffer limit was exceeded while looking for a match.
    ReadBufferFull,
    /// io error that does not close the stream by itself.
    Io(Arc<io::Error>),
}

impl StreamError {
    pub(crate) fn from_io(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    /// cause attached to a [StreamError::Closed] error.
    pub fn close_cause(&self) -> Option<&CloseCause> {
        match self {
            Self::Closed(cause) => cause.as_ref(),
            _ => None,
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(Some(cause)) => write!(f, "stream closed: {cause}"),
            Self::Closed(None) => f.write_str("stream closed"),
            Self::UnsatisfiableRead => f.write_str("read can not be satisfied within max_bytes"),
            Self::WriteBufferFull => f.write_str("write buffer limit reached"),
            Self::ReadBufferFull => f.write_str("read buffer limit reached"),
            Self::Io(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl std::error::Error for StreamError {}

impl From<io::Error> for StreamError {
    fn from(e: io::Error) -> Self {
        Self::from_io(e)
    }
}

/// Error type produced by hostname resolution.
#[derive(Debug)]
pub enum ResolveError {
    Io(io::Error),
    /// resolver produced no address for the hostname.
    NoAddress,
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "resolve failed: {e}"),
            Self::NoAddress => f.write_str("hostname did not resolve to any address"),
        }
    }
}

impl std::error::Error for ResolveError {}

impl From<io::Error> for ResolveError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Error type produced by [TcpConnector](crate::connect::TcpConnector).
#[derive(Debug)]
pub enum ConnectError {
    Resolve(ResolveError),
    /// the overall connect deadline expired.
    Timeout,
    /// every address was attempted and failed. carries the last io error.
    AllAttemptsFailed(Option<io::Error>),
    Io(io::Error),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolve(e) => fmt::Display::fmt(e, f),
            Self::Timeout => f.write_str("connect timed out"),
            Self::AllAttemptsFailed(Some(e)) => write!(f, "all connect attempts failed: {e}"),
            Self::AllAttemptsFailed(None) => f.write_str("all connect attempts failed"),
            Self::Io(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl std::error::Error for ConnectError {}

impl From<ResolveError> for ConnectError {
    fn from(e: ResolveError) -> Self {
        Self::Resolve(e)
    }
}

impl From<io::Error> for ConnectError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
