use std::io::{self, Write};

use flate2::write::GzDecoder;

/// Streaming gzip decoder for request bodies sent with
/// `Content-Encoding: gzip`.
///
/// Compressed input is fed in as it arrives; decompressed output is drained
/// after every feed so the caller can enforce its size limit before more
/// input is accepted.
pub struct GzipDecoder {
    inner: GzDecoder<Vec<u8>>,
}

impl Default for GzipDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl GzipDecoder {
    pub fn new() -> Self {
        Self {
            inner: GzDecoder::new(Vec::new()),
        }
    }

    /// decompress `data`, returning everything produced so far.
    pub fn feed(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        self.inner.write_all(data)?;
        self.inner.flush()?;
        Ok(std::mem::take(self.inner.get_mut()))
    }

    /// signal end of compressed input, validating the gzip trailer and
    /// returning any final output.
    pub fn finish(mut self) -> io::Result<Vec<u8>> {
        self.inner.try_finish()?;
        Ok(std::mem::take(self.inner.get_mut()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use flate2::{Compression, write::GzEncoder};

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn roundtrip_in_pieces() {
        let payload = b"the quick brown fox jumps over the lazy dog".repeat(100);
        let wire = gzip(&payload);

        let mut decoder = GzipDecoder::new();
        let mut out = Vec::new();
        for piece in wire.chunks(7) {
            out.extend(decoder.feed(piece).unwrap());
        }
        out.extend(decoder.finish().unwrap());
        assert_eq!(out, payload);
    }

    #[test]
    fn truncated_input_fails_on_finish() {
        let wire = gzip(b"hello world");
        let mut decoder = GzipDecoder::new();
        decoder.feed(&wire[..wire.len() / 2]).unwrap();
        assert!(decoder.finish().is_err());
    }
}
