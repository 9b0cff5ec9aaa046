use core::time::Duration;

/// Per-connection HTTP/1 behavior knobs.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub(crate) no_keep_alive: bool,
    pub(crate) chunk_size: usize,
    pub(crate) max_header_size: usize,
    pub(crate) header_timeout: Option<Duration>,
    pub(crate) body_timeout: Option<Duration>,
    pub(crate) max_body_size: Option<usize>,
    pub(crate) decompress: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpConfig {
    pub const fn new() -> Self {
        Self {
            no_keep_alive: false,
            chunk_size: 65536,
            max_header_size: 65536,
            header_timeout: None,
            body_timeout: None,
            max_body_size: None,
            decompress: false,
        }
    }

    /// force `Connection: close` on every response.
    pub fn no_keep_alive(mut self, value: bool) -> Self {
        self.no_keep_alive = value;
        self
    }

    /// granularity of body reads and of decompressed output chunks.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn max_header_size(mut self, size: usize) -> Self {
        self.max_header_size = size;
        self
    }

    pub fn header_timeout(mut self, dur: Duration) -> Self {
        self.header_timeout = Some(dur);
        self
    }

    pub fn body_timeout(mut self, dur: Duration) -> Self {
        self.body_timeout = Some(dur);
        self
    }

    /// cap on the request body. `None` falls back to the stream's
    /// `max_buffer_size`.
    pub fn max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = Some(size);
        self
    }

    /// accept `Content-Encoding: gzip` request bodies and hand the delegate
    /// decompressed bytes.
    pub fn decompress(mut self, value: bool) -> Self {
        self.decompress = value;
        self
    }

    pub(crate) fn effective_max_body(&self, stream_max: usize) -> usize {
        self.max_body_size.unwrap_or(stream_max)
    }
}
