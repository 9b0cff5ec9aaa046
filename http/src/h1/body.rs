use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use gale_io::{Stream, io::AsyncIo};
use gale_runtime::timeout_at;
use tokio::time::Instant;

use crate::{
    config::HttpConfig,
    error::ProtoError,
    proto::{ChunkResult, TransferCoding, decompress::GzipDecoder},
};

/// Pull-style reader for one message body.
///
/// Wraps the [TransferCoding] decoder, feeding it from the stream in
/// `chunk_size` slices, optionally piping the result through a streaming
/// gzip decoder, and enforcing `max_body_size` and `body_timeout` over the
/// whole body.
pub struct BodyReader {
    coding: TransferCoding,
    decode_buf: BytesMut,
    gzip: Option<GzipDecoder>,
    /// decompressed chunks waiting to be handed out.
    pending: VecDeque<Bytes>,
    received: usize,
    max_body_size: usize,
    chunk_size: usize,
    deadline: Option<Instant>,
    done: bool,
}

impl BodyReader {
    pub fn new(coding: TransferCoding, gzip: bool, config: &HttpConfig, stream_max: usize) -> Self {
        Self {
            coding,
            decode_buf: BytesMut::new(),
            gzip: gzip.then(GzipDecoder::new),
            pending: VecDeque::new(),
            received: 0,
            max_body_size: config.effective_max_body(stream_max),
            chunk_size: config.chunk_size,
            deadline: config.body_timeout.map(|dur| Instant::now() + dur),
            done: false,
        }
    }

    /// declared length of a fixed-size body, when known up front.
    pub fn declared_length(&self) -> Option<u64> {
        match self.coding {
            TransferCoding::Length(n) => Some(n),
            _ => None,
        }
    }

    /// true once the body was consumed to its end.
    pub fn is_complete(&self) -> bool {
        self.done
    }

    /// next decoded (and possibly decompressed) body chunk; `None` at end
    /// of body.
    pub async fn read_chunk<Io: AsyncIo>(&mut self, stream: &mut Stream<Io>) -> Result<Option<Bytes>, ProtoError> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Ok(Some(chunk));
            }
            if self.done {
                return Ok(None);
            }

            match self.coding.decode(&mut self.decode_buf) {
                ChunkResult::Ok(bytes) => {
                    match self.gzip.as_mut() {
                        Some(gzip) => {
                            let out = gzip.feed(&bytes).map_err(ProtoError::Decompress)?;
                            self.account(out.len())?;
                            self.push_decompressed(out);
                        }
                        None => {
                            self.account(bytes.len())?;
                            return Ok(Some(bytes));
                        }
                    }
                }
                ChunkResult::Eof | ChunkResult::AlreadyEof => {
                    self.done = true;
                    if let Some(gzip) = self.gzip.take() {
                        let out = gzip.finish().map_err(ProtoError::Decompress)?;
                        self.account(out.len())?;
                        self.push_decompressed(out);
                    }
                }
                ChunkResult::InsufficientData => {
                    if self.coding == TransferCoding::Unbounded {
                        // close delimited body: EOF is the terminator.
                        match self.fill(stream).await {
                            Ok(()) => {}
                            Err(ProtoError::UnexpectedEof) => {
                                self.coding.set_eof();
                            }
                            Err(e) => return Err(e),
                        }
                    } else {
                        self.fill(stream).await?;
                    }
                }
                ChunkResult::Err(e) => return Err(e),
            }
        }
    }

    /// drain the remaining body without handing it to anyone. used before
    /// connection reuse when a handler did not consume its request body.
    pub async fn drain<Io: AsyncIo>(&mut self, stream: &mut Stream<Io>) -> Result<(), ProtoError> {
        while self.read_chunk(stream).await?.is_some() {}
        Ok(())
    }

    async fn fill<Io: AsyncIo>(&mut self, stream: &mut Stream<Io>) -> Result<(), ProtoError> {
        let read = stream.read_bytes_partial(self.chunk_size);
        let bytes = match self.deadline {
            Some(at) => timeout_at(at, read).await??,
            None => read.await?,
        };
        self.decode_buf.extend_from_slice(&bytes);
        Ok(())
    }

    fn account(&mut self, len: usize) -> Result<(), ProtoError> {
        self.received += len;
        if self.received > self.max_body_size {
            return Err(ProtoError::BodyTooLarge);
        }
        Ok(())
    }

    fn push_decompressed(&mut self, out: Vec<u8>) {
        // decompressed output is re-chunked so no single chunk exceeds the
        // configured read granularity.
        let mut out = Bytes::from(out);
        while !out.is_empty() {
            let take = out.len().min(self.chunk_size);
            self.pending.push_back(out.split_to(take));
        }
    }
}

