use core::mem;

use bytes::{Buf, Bytes, BytesMut};
use tracing::warn;

use crate::error::{Parse, ProtoError};

/// Body framing state machine, one per message and direction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransferCoding {
    /// the message has no body.
    Eof,
    /// fixed length body with the remaining byte count.
    Length(u64),
    /// decoder for `Transfer-Encoding: chunked` input.
    DecodeChunked(ChunkedState, u64),
    /// encoder framing output as chunked.
    EncodeChunked,
    /// tunneled bytes pass through untouched until the connection closes.
    Unbounded,
}

impl TransferCoding {
    #[inline]
    pub const fn eof() -> Self {
        Self::Eof
    }

    #[inline]
    pub const fn length(len: u64) -> Self {
        Self::Length(len)
    }

    #[inline]
    pub const fn decode_chunked() -> Self {
        Self::DecodeChunked(ChunkedState::Size, 0)
    }

    #[inline]
    pub const fn encode_chunked() -> Self {
        Self::EncodeChunked
    }

    #[inline]
    pub const fn unbounded() -> Self {
        Self::Unbounded
    }

    /// true once the decoder gracefully consumed its entire body.
    #[inline]
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }

    /// merge a framing requirement discovered in a later header line.
    /// conflicting requirements are a fatal parse error.
    pub fn try_set(&mut self, other: Self) -> Result<(), ProtoError> {
        match (&self, &other) {
            (Self::Unbounded, Self::Unbounded) => Ok(()),
            (Self::Length(a), Self::Length(b)) => {
                // duplicate Content-Length headers agreeing on the value
                // collapse to one; a mismatch can not be trusted.
                if a == b {
                    Ok(())
                } else {
                    Err(ProtoError::Parse(Parse::ContentLength))
                }
            }
            (Self::Unbounded, _) | (Self::DecodeChunked(..), _) | (Self::Length(_), _) => {
                Err(ProtoError::Parse(Parse::TransferEncoding))
            }
            _ => {
                *self = other;
                Ok(())
            }
        }
    }

    #[inline]
    pub fn set_eof(&mut self) {
        *self = Self::Eof;
    }
}

/// Decoder progress. [ChunkResult::Ok] hands out a non-empty chunk of body
/// bytes; the terminal states let the caller observe end-of-body exactly
/// once.
#[derive(Debug)]
pub enum ChunkResult {
    Ok(Bytes),
    /// more input required.
    InsufficientData,
    /// body complete.
    Eof,
    /// body was already complete on a previous call.
    AlreadyEof,
    Err(ProtoError),
}

impl TransferCoding {
    /// decode body bytes out of `src`, consuming what was used.
    pub fn decode(&mut self, src: &mut BytesMut) -> ChunkResult {
        match *self {
            Self::Length(0) | Self::DecodeChunked(ChunkedState::End, _) => {
                *self = Self::Eof;
                ChunkResult::Eof
            }
            Self::Eof => ChunkResult::AlreadyEof,
            _ if src.is_empty() => ChunkResult::InsufficientData,
            Self::Length(ref mut rem) => ChunkResult::Ok(bounded_split(rem, src)),
            Self::Unbounded => ChunkResult::Ok(src.split().freeze()),
            Self::DecodeChunked(ref mut state, ref mut size) => loop {
                let mut out = None;
                *state = match state.step(src, size, &mut out) {
                    Ok(Some(state)) => state,
                    Ok(None) => return ChunkResult::InsufficientData,
                    Err(e) => return ChunkResult::Err(e),
                };

                if matches!(state, ChunkedState::End) {
                    return self.decode(src);
                }

                if let Some(out) = out {
                    return ChunkResult::Ok(out);
                }
            },
            Self::EncodeChunked => unreachable!("encoder can not decode"),
        }
    }

    /// encode one body chunk, pushing framing and payload into `out`.
    /// payload bytes are passed through by reference, never copied.
    pub fn encode(&mut self, bytes: Bytes, out: &mut Vec<Bytes>) {
        if bytes.is_empty() {
            return;
        }

        match *self {
            Self::Unbounded => out.push(bytes),
            Self::EncodeChunked => {
                use std::fmt::Write;
                let mut head = String::with_capacity(18);
                // chunk sizes are hexadecimal. writing into a stack string
                // can not fail.
                let _ = write!(head, "{:x}\r\n", bytes.len());
                out.push(Bytes::from(head.into_bytes()));
                out.push(bytes);
                out.push(Bytes::from_static(b"\r\n"));
            }
            Self::Length(ref mut rem) => {
                let len = bytes.len() as u64;
                if *rem >= len {
                    *rem -= len;
                    out.push(bytes);
                } else {
                    let rem = mem::replace(rem, 0);
                    warn!(target: "h1_encode", "chunk exceeds declared content-length, truncating");
                    out.push(bytes.slice(..rem as usize));
                }
            }
            Self::Eof => warn!(target: "h1_encode", "body write on a message without body"),
            Self::DecodeChunked(..) => unreachable!("decoder can not encode"),
        }
    }

    /// terminate the encoded body. emits the final zero chunk when framing
    /// is chunked.
    pub fn encode_eof(&mut self, out: &mut Vec<Bytes>) {
        match *self {
            Self::Eof | Self::Unbounded | Self::Length(0) => {}
            Self::EncodeChunked => out.push(Bytes::from_static(b"0\r\n\r\n")),
            Self::Length(n) => warn!(target: "h1_encode", "body finished {n} bytes short of content-length"),
            Self::DecodeChunked(..) => unreachable!("decoder can not encode"),
        }
    }
}

fn bounded_split(rem: &mut u64, buf: &mut BytesMut) -> Bytes {
    let len = buf.len() as u64;
    if *rem >= len {
        *rem -= len;
        buf.split().freeze()
    } else {
        let rem = mem::replace(rem, 0);
        buf.split_to(rem as usize).freeze()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChunkedState {
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

macro_rules! byte (
    ($rdr:ident) => ({
        if $rdr.len() > 0 {
            let b = $rdr[0];
            $rdr.advance(1);
            b
        } else {
            return Ok(None);
        }
    })
);

impl ChunkedState {
    fn step(&mut self, body: &mut BytesMut, size: &mut u64, out: &mut Option<Bytes>) -> Result<Option<Self>, ProtoError> {
        match *self {
            Self::Size => Self::read_size(body, size),
            Self::SizeLws => Self::read_size_lws(body),
            Self::Extension => Self::read_extension(body),
            Self::SizeLf => Self::read_size_lf(body, size),
            Self::Body => Self::read_body(body, size, out),
            Self::BodyCr => Self::expect(body, b'\r', Self::BodyLf),
            Self::BodyLf => Self::expect(body, b'\n', Self::Size),
            Self::Trailer => Self::read_trailer(body),
            Self::TrailerLf => Self::expect(body, b'\n', Self::EndCr),
            Self::EndCr => Self::read_end_cr(body),
            Self::EndLf => Self::expect(body, b'\n', Self::End),
            Self::End => Ok(Some(Self::End)),
        }
    }

    fn read_size(rdr: &mut BytesMut, size: &mut u64) -> Result<Option<Self>, ProtoError> {
        macro_rules! or_overflow {
            ($e:expr) => {
                match $e {
                    Some(val) => val,
                    None => return Err(ProtoError::Parse(Parse::ChunkSize)),
                }
            };
        }

        match byte!(rdr) {
            b @ b'0'..=b'9' => {
                *size = or_overflow!(size.checked_mul(16));
                *size = or_overflow!(size.checked_add((b - b'0') as u64));
            }
            b @ b'a'..=b'f' => {
                *size = or_overflow!(size.checked_mul(16));
                *size = or_overflow!(size.checked_add((b + 10 - b'a') as u64));
            }
            b @ b'A'..=b'F' => {
                *size = or_overflow!(size.checked_mul(16));
                *size = or_overflow!(size.checked_add((b + 10 - b'A') as u64));
            }
            b'\t' | b' ' => return Ok(Some(Self::SizeLws)),
            b';' => return Ok(Some(Self::Extension)),
            b'\r' => return Ok(Some(Self::SizeLf)),
            _ => return Err(ProtoError::Parse(Parse::ChunkSize)),
        }

        Ok(Some(Self::Size))
    }

    fn read_size_lws(rdr: &mut BytesMut) -> Result<Option<Self>, ProtoError> {
        match byte!(rdr) {
            // whitespace may trail the size but no further digits can come.
            b'\t' | b' ' => Ok(Some(Self::SizeLws)),
            b';' => Ok(Some(Self::Extension)),
            b'\r' => Ok(Some(Self::SizeLf)),
            _ => Err(ProtoError::Parse(Parse::ChunkSize)),
        }
    }

    fn read_extension(rdr: &mut BytesMut) -> Result<Option<Self>, ProtoError> {
        match byte!(rdr) {
            b'\r' => Ok(Some(Self::SizeLf)),
            b'\n' => Err(ProtoError::Parse(Parse::ChunkSize)),
            // extensions are tolerated and skipped.
            _ => Ok(Some(Self::Extension)),
        }
    }

    fn read_size_lf(rdr: &mut BytesMut, size: &mut u64) -> Result<Option<Self>, ProtoError> {
        match byte!(rdr) {
            b'\n' if *size > 0 => Ok(Some(Self::Body)),
            b'\n' => Ok(Some(Self::EndCr)),
            _ => Err(ProtoError::Parse(Parse::ChunkSize)),
        }
    }

    fn read_body(rdr: &mut BytesMut, rem: &mut u64, out: &mut Option<Bytes>) -> Result<Option<Self>, ProtoError> {
        if rdr.is_empty() {
            Ok(None)
        } else {
            *out = Some(bounded_split(rem, rdr));
            if *rem > 0 {
                Ok(Some(Self::Body))
            } else {
                Ok(Some(Self::BodyCr))
            }
        }
    }

    fn read_trailer(rdr: &mut BytesMut) -> Result<Option<Self>, ProtoError> {
        match byte!(rdr) {
            b'\r' => Ok(Some(Self::TrailerLf)),
            // trailer content is discarded.
            _ => Ok(Some(Self::Trailer)),
        }
    }

    fn read_end_cr(rdr: &mut BytesMut) -> Result<Option<Self>, ProtoError> {
        match byte!(rdr) {
            b'\r' => Ok(Some(Self::EndLf)),
            _ => Ok(Some(Self::Trailer)),
        }
    }

    fn expect(rdr: &mut BytesMut, want: u8, next: Self) -> Result<Option<Self>, ProtoError> {
        match byte!(rdr) {
            b if b == want => Ok(Some(next)),
            _ => Err(ProtoError::Parse(Parse::ChunkSize)),
        }
    }
}
