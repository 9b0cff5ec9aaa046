//! permessage-deflate extension (RFC 7692).

use std::io;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tracing::debug;

use crate::error::ProtocolError;

/// trailing bytes every sync-flushed deflate block ends with. stripped from
/// outgoing messages and re-appended before inflating incoming ones.
const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Local preferences applied during negotiation.
#[derive(Clone, Copy, Debug)]
pub struct DeflateOptions {
    /// compression level for outgoing messages.
    pub level: u32,
    /// request that the peer drop its compression context between messages.
    pub request_no_context_takeover: bool,
}

impl Default for DeflateOptions {
    fn default() -> Self {
        Self {
            level: 6,
            request_no_context_takeover: false,
        }
    }
}

/// Parameters both sides agreed on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeflateConfig {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    /// LZ77 window the server compresses with.
    pub server_max_window_bits: u8,
    /// LZ77 window the client compresses with.
    pub client_max_window_bits: u8,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: 15,
            client_max_window_bits: 15,
        }
    }
}

impl DeflateConfig {
    /// serialize as the `Sec-WebSocket-Extensions` response value.
    pub fn response_header(&self) -> String {
        let mut out = String::from("permessage-deflate");
        if self.server_no_context_takeover {
            out.push_str("; server_no_context_takeover");
        }
        if self.client_no_context_takeover {
            out.push_str("; client_no_context_takeover");
        }
        if self.server_max_window_bits < 15 {
            out.push_str("; server_max_window_bits=");
            out.push_str(itoa(self.server_max_window_bits));
        }
        if self.client_max_window_bits < 15 {
            out.push_str("; client_max_window_bits=");
            out.push_str(itoa(self.client_max_window_bits));
        }
        out
    }

    /// the offer a client sends.
    pub fn offer_header() -> &'static str {
        "permessage-deflate; client_max_window_bits"
    }
}

fn itoa(bits: u8) -> &'static str {
    match bits {
        8 => "8",
        9 => "9",
        10 => "10",
        11 => "11",
        12 => "12",
        13 => "13",
        14 => "14",
        _ => "15",
    }
}

/// server side: pick the first acceptable `permessage-deflate` offer from
/// the request's `Sec-WebSocket-Extensions` value.
pub fn negotiate(offers: &str, options: &DeflateOptions) -> Option<DeflateConfig> {
    for offer in offers.split(',') {
        match parse_offer(offer) {
            Some(mut config) => {
                if options.request_no_context_takeover {
                    config.client_no_context_takeover = true;
                    config.server_no_context_takeover = true;
                }
                return Some(config);
            }
            None => {
                debug!(target: "ws_deflate", "declining unusable extension offer: {offer}");
            }
        }
    }
    None
}

fn parse_offer(offer: &str) -> Option<DeflateConfig> {
    let mut parts = offer.split(';').map(str::trim);
    if !parts.next()?.eq_ignore_ascii_case("permessage-deflate") {
        return None;
    }

    let mut config = DeflateConfig::default();
    let mut seen = [false; 4];

    for part in parts {
        let (name, value) = match part.split_once('=') {
            Some((n, v)) => (n.trim(), Some(v.trim().trim_matches('"'))),
            None => (part, None),
        };
        match name {
            "server_no_context_takeover" if !seen[0] && value.is_none() => {
                seen[0] = true;
                config.server_no_context_takeover = true;
            }
            "client_no_context_takeover" if !seen[1] && value.is_none() => {
                seen[1] = true;
                config.client_no_context_takeover = true;
            }
            "server_max_window_bits" if !seen[2] => {
                seen[2] = true;
                config.server_max_window_bits = parse_window_bits(value?)?;
            }
            "client_max_window_bits" if !seen[3] => {
                seen[3] = true;
                if let Some(value) = value {
                    config.client_max_window_bits = parse_window_bits(value)?;
                }
            }
            // unknown or duplicated parameter: the whole offer is unusable.
            _ => return None,
        }
    }

    Some(config)
}

/// client side: parse the parameters the server accepted. `None` means the
/// server's answer is not a usable permessage-deflate acceptance.
pub fn parse_response(value: &str) -> Option<DeflateConfig> {
    parse_offer(value)
}

fn parse_window_bits(value: &str) -> Option<u8> {
    let bits: u8 = value.parse().ok()?;
    (8..=15).contains(&bits).then_some(bits)
}

/// Streaming compression state for one direction each.
///
/// When the matching `no_context_takeover` flag is set the context resets
/// after every message, trading ratio for memory.
pub struct DeflateContext {
    compress: Compress,
    decompress: Decompress,
    reset_compress: bool,
    reset_decompress: bool,
}

impl DeflateContext {
    /// `server` selects which half of the negotiated parameters applies to
    /// the compressing direction.
    pub fn new(config: &DeflateConfig, options: &DeflateOptions, server: bool) -> Self {
        let (window, reset_compress, reset_decompress) = if server {
            (
                config.server_max_window_bits,
                config.server_no_context_takeover,
                config.client_no_context_takeover,
            )
        } else {
            (
                config.client_max_window_bits,
                config.client_no_context_takeover,
                config.server_no_context_takeover,
            )
        };

        // zlib raw streams do not support a window of 8 bits; it is bumped
        // to 9 like every mainstream implementation does.
        let window = window.max(9);

        Self {
            compress: Compress::new_with_window_bits(Compression::new(options.level), false, window),
            // inflating with the maximum window accepts every smaller one.
            decompress: Decompress::new_with_window_bits(false, 15),
            reset_compress,
            reset_decompress,
        }
    }

    /// compress a whole message, stripping the trailing sync-flush marker.
    pub fn compress(&mut self, input: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut output = Vec::with_capacity(input.len() / 4 + 64);
        let mut consumed = 0;

        loop {
            output.reserve(1024);
            let before = self.compress.total_in();
            self.compress
                .compress_vec(&input[consumed..], &mut output, FlushCompress::Sync)
                .map_err(|e| ProtocolError::Deflate(io::Error::other(e)))?;
            consumed += (self.compress.total_in() - before) as usize;

            // a sync flush is complete once all input is consumed and the
            // last call left spare output capacity.
            if consumed == input.len() && output.len() < output.capacity() {
                break;
            }
        }

        if output.ends_with(&DEFLATE_TAIL) {
            output.truncate(output.len() - DEFLATE_TAIL.len());
        }

        if self.reset_compress {
            self.compress.reset();
        }

        Ok(output)
    }

    /// inflate a whole message, bounding the output against `max_size`.
    pub fn decompress(&mut self, input: &[u8], max_size: usize) -> Result<Vec<u8>, ProtocolError> {
        let mut data = Vec::with_capacity(input.len() + DEFLATE_TAIL.len());
        data.extend_from_slice(input);
        data.extend_from_slice(&DEFLATE_TAIL);

        let mut output = Vec::with_capacity((input.len() * 2).clamp(256, 16 * 1024));
        let mut consumed = 0;

        loop {
            output.reserve(1024);
            let before = self.decompress.total_in();
            let status = self
                .decompress
                .decompress_vec(&data[consumed..], &mut output, FlushDecompress::None)
                .map_err(|e| ProtocolError::Deflate(io::Error::other(e)))?;
            consumed += (self.decompress.total_in() - before) as usize;

            if output.len() > max_size {
                return Err(ProtocolError::MessageTooBig);
            }

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if consumed == data.len() && output.len() < output.capacity() {
                        break;
                    }
                }
            }
        }

        if self.reset_decompress {
            self.decompress.reset(false);
        }

        Ok(output)
    }
}
