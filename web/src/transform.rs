//! response body transforms applied at flush time.

use std::io::Write;

use bytes::Bytes;
use flate2::{Compression, write::GzEncoder};
use gale_http::{
    StatusCode,
    header::{self, HeaderMap, HeaderValue},
};
use tracing::trace;

/// body size below which compressing a complete response is not worth it.
const MIN_COMPRESS_LEN: usize = 1024;

/// content types worth compressing besides `text/*`.
const COMPRESSIBLE_TYPES: &[&str] = &[
    "application/javascript",
    "application/x-javascript",
    "application/xml",
    "application/atom+xml",
    "application/json",
    "application/xhtml+xml",
    "image/svg+xml",
];

/// `Content-Encoding: gzip` output transform.
///
/// Activates on the first flush when the client accepts gzip, the content
/// type is compressible, and a complete response is at least
/// [MIN_COMPRESS_LEN] bytes. Streamed responses compress regardless of
/// size since their total is unknown at activation time.
pub(crate) struct GzipTransform {
    client_accepts: bool,
    encoder: Option<GzEncoder<Vec<u8>>>,
}

impl GzipTransform {
    pub(crate) fn new(accept_encoding: Option<&str>) -> Self {
        let client_accepts = accept_encoding
            .map(|v| v.split(',').any(|token| token.trim().split(';').next() == Some("gzip")))
            .unwrap_or(false);
        Self {
            client_accepts,
            encoder: None,
        }
    }

    /// inspect the response head and first body chunk; mutates the headers
    /// when compression activates.
    pub(crate) fn first_chunk(
        &mut self,
        status: StatusCode,
        headers: &mut HeaderMap,
        chunk: Bytes,
        finishing: bool,
    ) -> Bytes {
        if !self.should_compress(status, headers, chunk.len(), finishing) {
            return chunk;
        }

        trace!(target: "gzip_transform", "compressing response body");
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        // length of the compressed stream is unknown up front.
        headers.remove(header::CONTENT_LENGTH);
        append_vary(headers);

        self.encoder = Some(GzEncoder::new(Vec::new(), Compression::new(6)));
        self.transform_chunk(chunk, finishing)
    }

    /// pass one body chunk through the compressor (when active).
    pub(crate) fn transform_chunk(&mut self, chunk: Bytes, finishing: bool) -> Bytes {
        let Some(encoder) = self.encoder.as_mut() else {
            return chunk;
        };

        encoder.write_all(&chunk).expect("writing to a vec can not fail");
        if finishing {
            let encoder = self.encoder.take().unwrap();
            Bytes::from(encoder.finish().expect("finishing a vec encoder can not fail"))
        } else {
            encoder.flush().expect("flushing a vec encoder can not fail");
            Bytes::from(std::mem::take(encoder.get_mut()))
        }
    }

    fn should_compress(&self, status: StatusCode, headers: &HeaderMap, len: usize, finishing: bool) -> bool {
        if !self.client_accepts || status.is_informational() || status == StatusCode::NO_CONTENT {
            return false;
        }
        if headers.contains_key(header::CONTENT_ENCODING) {
            return false;
        }
        if finishing && len < MIN_COMPRESS_LEN {
            return false;
        }
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let base = content_type.split(';').next().unwrap_or("").trim();
        base.starts_with("text/") || COMPRESSIBLE_TYPES.contains(&base)
    }
}

fn append_vary(headers: &mut HeaderMap) {
    match headers.get(header::VARY).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => {
            let combined = format!("{existing}, Accept-Encoding");
            if let Ok(value) = HeaderValue::from_str(&combined) {
                headers.insert(header::VARY, value);
            }
        }
        _ => {
            headers.insert(header::VARY, HeaderValue::from_static("Accept-Encoding"));
        }
    }
}

#[cfg(test)]
mod test {
    use flate2::read::GzDecoder;
    use std::io::Read;

    use super::*;

    fn text_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html; charset=UTF-8"));
        headers
    }

    fn gunzip(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        GzDecoder::new(data).read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn compresses_large_text_response() {
        let mut transform = GzipTransform::new(Some("gzip, deflate"));
        let mut headers = text_headers();
        let body = Bytes::from(vec![b'a'; 4096]);
        let out = transform.first_chunk(StatusCode::OK, &mut headers, body, true);
        assert_eq!(headers.get(header::CONTENT_ENCODING).unwrap(), "gzip");
        assert_eq!(headers.get(header::VARY).unwrap(), "Accept-Encoding");
        assert!(out.len() < 4096);
        assert_eq!(gunzip(&out), vec![b'a'; 4096]);
    }

    #[test]
    fn small_complete_bodies_stay_plain() {
        let mut transform = GzipTransform::new(Some("gzip"));
        let mut headers = text_headers();
        let out = transform.first_chunk(StatusCode::OK, &mut headers, Bytes::from_static(b"tiny"), true);
        assert_eq!(&out[..], b"tiny");
        assert!(headers.get(header::CONTENT_ENCODING).is_none());
    }

    #[test]
    fn streamed_bodies_compress_regardless_of_size() {
        let mut transform = GzipTransform::new(Some("gzip"));
        let mut headers = text_headers();
        let first = transform.first_chunk(StatusCode::OK, &mut headers, Bytes::from_static(b"part one "), false);
        let last = transform.transform_chunk(Bytes::from_static(b"part two"), true);
        assert_eq!(headers.get(header::CONTENT_ENCODING).unwrap(), "gzip");
        let mut wire = first.to_vec();
        wire.extend_from_slice(&last);
        assert_eq!(gunzip(&wire), b"part one part two");
    }

    #[test]
    fn respects_client_and_content_type() {
        // client does not accept gzip.
        let mut transform = GzipTransform::new(Some("br"));
        let mut headers = text_headers();
        let body = Bytes::from(vec![b'a'; 4096]);
        let out = transform.first_chunk(StatusCode::OK, &mut headers, body.clone(), true);
        assert_eq!(out.len(), 4096);

        // binary content type.
        let mut transform = GzipTransform::new(Some("gzip"));
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
        let out = transform.first_chunk(StatusCode::OK, &mut headers, body.clone(), true);
        assert_eq!(out.len(), 4096);

        // already encoded.
        let mut transform = GzipTransform::new(Some("gzip"));
        let mut headers = text_headers();
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("br"));
        let out = transform.first_chunk(StatusCode::OK, &mut headers, body, true);
        assert_eq!(out.len(), 4096);
    }

    #[test]
    fn json_is_compressible() {
        let mut transform = GzipTransform::new(Some("gzip"));
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let body = Bytes::from(vec![b'{'; 2048]);
        let out = transform.first_chunk(StatusCode::OK, &mut headers, body, true);
        assert!(out.len() < 2048);
    }
}
