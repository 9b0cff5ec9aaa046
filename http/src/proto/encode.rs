use bytes::BytesMut;
use http::{
    Method, Version,
    header::{CONNECTION, CONTENT_LENGTH, DATE, HOST, TRANSFER_ENCODING},
};
use tracing::warn;

use crate::{date::DateService, error::ProtoError};

use super::{codec::TransferCoding, head::{RequestHead, ResponseHead}};

/// declared size of an outgoing body, deciding the framing headers when the
/// caller supplied none.
#[derive(Clone, Copy, Debug)]
pub enum BodySize {
    /// no body at all.
    None,
    Sized(usize),
    /// length unknown in advance; chunked on HTTP/1.1, close-delimited on
    /// HTTP/1.0.
    Unknown,
}

/// Outcome of serializing a message head.
pub struct Encoded {
    pub coding: TransferCoding,
    /// serializing forced the connection closed (HTTP/1.0 body of unknown
    /// length has no other way to signal its end).
    pub close: bool,
}

/// serialize a response head into `buf` and derive the body encoder.
pub fn encode_response_head(
    head: &ResponseHead,
    request_method: &Method,
    body: BodySize,
    mut close: bool,
    date: &DateService,
    buf: &mut BytesMut,
) -> Result<Encoded, ProtoError> {
    encode_status_line(head, buf);

    let body_allowed = *request_method != Method::HEAD && !head.body_forbidden();

    let mut coding = None;
    let mut saw_date = false;
    let mut saw_connection = false;

    for (name, value) in head.headers.iter() {
        match *name {
            CONTENT_LENGTH => {
                let len = content_length_value(value.as_bytes())?;
                coding.get_or_insert(TransferCoding::length(len));
            }
            TRANSFER_ENCODING => {
                coding.get_or_insert(TransferCoding::encode_chunked());
            }
            CONNECTION => {
                saw_connection = true;
                if value.as_bytes().eq_ignore_ascii_case(b"close") {
                    close = true;
                }
            }
            DATE => saw_date = true,
            _ => {}
        }

        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    // decide framing when the caller did not.
    let mut coding = match coding {
        Some(coding) => coding,
        None => match body {
            BodySize::None => TransferCoding::eof(),
            BodySize::Sized(len) => {
                write_content_length(len, buf);
                TransferCoding::length(len as u64)
            }
            BodySize::Unknown => {
                if head.version == Version::HTTP_11 {
                    buf.extend_from_slice(b"transfer-encoding: chunked\r\n");
                    TransferCoding::encode_chunked()
                } else {
                    // 1.0 peers learn the body end from the close.
                    close = true;
                    TransferCoding::unbounded()
                }
            }
        },
    };

    if !body_allowed {
        // HEAD responses advertise framing but transmit nothing.
        if !matches!(coding, TransferCoding::Eof) && *request_method != Method::HEAD {
            warn!(target: "h1_encode", "response with status {} must not carry a body", head.status);
        }
        coding = TransferCoding::eof();
    }

    if close && !saw_connection {
        buf.extend_from_slice(b"connection: close\r\n");
    }

    if !saw_date {
        buf.extend_from_slice(b"date: ");
        date.with_date(|slice| buf.extend_from_slice(slice));
        buf.extend_from_slice(b"\r\n");
    }

    buf.extend_from_slice(b"\r\n");

    Ok(Encoded { coding, close })
}

fn encode_status_line(head: &ResponseHead, buf: &mut BytesMut) {
    match head.version {
        Version::HTTP_10 => buf.extend_from_slice(b"HTTP/1.0 "),
        _ => buf.extend_from_slice(b"HTTP/1.1 "),
    }
    buf.extend_from_slice(head.status.as_str().as_bytes());
    buf.extend_from_slice(b" ");
    // a reason phrase is always written; plenty of parsers expect one.
    let reason = head
        .reason
        .as_deref()
        .or_else(|| head.status.canonical_reason())
        .unwrap_or("Unknown");
    buf.extend_from_slice(reason.as_bytes());
    buf.extend_from_slice(b"\r\n");
}

/// serialize a request head into `buf` and derive the body encoder.
pub fn encode_request_head(head: &RequestHead, body: BodySize, buf: &mut BytesMut) -> Result<Encoded, ProtoError> {
    buf.extend_from_slice(head.method.as_str().as_bytes());
    buf.extend_from_slice(b" ");
    let target = head
        .target
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    buf.extend_from_slice(target.as_bytes());
    match head.version {
        Version::HTTP_10 => buf.extend_from_slice(b" HTTP/1.0\r\n"),
        _ => buf.extend_from_slice(b" HTTP/1.1\r\n"),
    }

    let mut coding = None;
    let mut saw_host = false;

    for (name, value) in head.headers.iter() {
        match *name {
            CONTENT_LENGTH => {
                let len = content_length_value(value.as_bytes())?;
                coding.get_or_insert(TransferCoding::length(len));
            }
            TRANSFER_ENCODING => {
                coding.get_or_insert(TransferCoding::encode_chunked());
            }
            HOST => saw_host = true,
            _ => {}
        }

        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    if !saw_host {
        if let Some(authority) = head.target.authority() {
            buf.extend_from_slice(b"host: ");
            buf.extend_from_slice(authority.as_str().as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
    }

    let coding = match coding {
        Some(coding) => coding,
        None => match body {
            BodySize::None => TransferCoding::eof(),
            BodySize::Sized(len) => {
                write_content_length(len, buf);
                TransferCoding::length(len as u64)
            }
            BodySize::Unknown => {
                buf.extend_from_slice(b"transfer-encoding: chunked\r\n");
                TransferCoding::encode_chunked()
            }
        },
    };

    buf.extend_from_slice(b"\r\n");

    Ok(Encoded { coding, close: false })
}

fn write_content_length(len: usize, buf: &mut BytesMut) {
    let mut itoa = itoa::Buffer::new();
    let digits = itoa.format(len);
    buf.extend_from_slice(b"content-length: ");
    buf.extend_from_slice(digits.as_bytes());
    buf.extend_from_slice(b"\r\n");
}

fn content_length_value(value: &[u8]) -> Result<u64, ProtoError> {
    let s = std::str::from_utf8(value).map_err(|_| ProtoError::Parse(crate::error::Parse::ContentLength))?;
    s.trim()
        .parse()
        .map_err(|_| ProtoError::Parse(crate::error::Parse::ContentLength))
}
