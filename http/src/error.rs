use core::fmt;

use std::io;

use gale_io::StreamError;
use gale_runtime::TimeoutError;

/// Parse failures on malformed wire input.
#[derive(Debug, Eq, PartialEq)]
pub enum Parse {
    Method,
    Uri,
    Version,
    HeaderName,
    HeaderValue,
    /// conflicting or malformed Content-Length headers.
    ContentLength,
    /// a transfer encoding other than exactly `chunked`.
    TransferEncoding,
    ChunkSize,
    StatusLine,
}

impl fmt::Display for Parse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Method => "invalid method",
            Self::Uri => "invalid uri",
            Self::Version => "invalid version",
            Self::HeaderName => "invalid header name",
            Self::HeaderValue => "invalid header value",
            Self::ContentLength => "invalid content-length",
            Self::TransferEncoding => "unsupported transfer-encoding",
            Self::ChunkSize => "invalid chunk size line",
            Self::StatusLine => "invalid status line",
        };
        f.write_str(name)
    }
}

/// Error produced while reading or writing an HTTP/1 message.
#[derive(Debug)]
pub enum ProtoError {
    /// malformed input. the connection is closed without a response when
    /// the head was already committed, with 400 otherwise.
    Parse(Parse),
    /// request head exceeded `max_header_size`.
    HeaderTooLarge,
    /// body exceeded `max_body_size`, buffered or streamed.
    BodyTooLarge,
    /// `header_timeout` or `body_timeout` expired.
    Timeout,
    /// peer closed mid-message.
    UnexpectedEof,
    /// gzip content decoding failed.
    Decompress(io::Error),
    /// transport failure.
    Stream(StreamError),
    /// local API misuse, e.g. finishing a response twice.
    State(&'static str),
}

impl ProtoError {
    /// true when the peer is at fault and a 400 class answer is warranted.
    pub fn is_input_error(&self) -> bool {
        matches!(self, Self::Parse(_) | Self::HeaderTooLarge | Self::BodyTooLarge)
    }
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(p) => write!(f, "malformed message: {p}"),
            Self::HeaderTooLarge => f.write_str("header section too large"),
            Self::BodyTooLarge => f.write_str("body exceeds configured maximum"),
            Self::Timeout => f.write_str("message timed out"),
            Self::UnexpectedEof => f.write_str("connection closed mid message"),
            Self::Decompress(e) => write!(f, "content decoding failed: {e}"),
            Self::Stream(e) => fmt::Display::fmt(e, f),
            Self::State(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for ProtoError {}

impl From<Parse> for ProtoError {
    fn from(p: Parse) -> Self {
        Self::Parse(p)
    }
}

impl From<StreamError> for ProtoError {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::UnsatisfiableRead => Self::HeaderTooLarge,
            StreamError::Closed(_) => Self::UnexpectedEof,
            other => Self::Stream(other),
        }
    }
}

impl From<TimeoutError> for ProtoError {
    fn from(_: TimeoutError) -> Self {
        Self::Timeout
    }
}

impl From<httparse::Error> for ProtoError {
    fn from(e: httparse::Error) -> Self {
        let parse = match e {
            httparse::Error::HeaderName => Parse::HeaderName,
            httparse::Error::HeaderValue => Parse::HeaderValue,
            httparse::Error::Token => Parse::Method,
            httparse::Error::Version => Parse::Version,
            httparse::Error::Status => Parse::StatusLine,
            _ => Parse::HeaderName,
        };
        Self::Parse(parse)
    }
}
