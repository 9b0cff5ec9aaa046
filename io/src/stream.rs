//! buffered byte pipe over a non-blocking socket.

use core::ops::DerefMut;

use std::{collections::VecDeque, io, io::Write};

use bytes::{Buf, Bytes, BytesMut};
use rustls::{ConnectionCommon, SideData};
use tokio::sync::oneshot;
use tracing::trace;

use crate::{
    error::{CloseCause, StreamError},
    io::{AsyncIo, Interest},
    tls::TlsStream,
};

/// chunks below this size are coalesced into a shared buffer to amortize
/// syscalls; larger chunks are queued by reference without copying.
const COALESCE_LIMIT: usize = 2048;

/// Per-stream buffer and chunking limits.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// upper bound of the read buffer. exceeding it closes the stream.
    pub max_buffer_size: usize,
    /// upper bound of queued writes. `None` means unbounded.
    pub max_write_buffer_size: Option<usize>,
    /// granularity of socket reads.
    pub read_chunk_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 100 * 1024 * 1024,
            max_write_buffer_size: None,
            read_chunk_size: 65536,
        }
    }
}

/// Completion handle of a queued write. Resolves once the chunk has been
/// handed to the socket, in the order writes were submitted.
#[derive(Debug)]
pub struct WriteHandle(oneshot::Receiver<Result<(), StreamError>>);

impl WriteHandle {
    /// wait for the chunk to reach the socket.
    pub async fn wait(self) -> Result<(), StreamError> {
        match self.0.await {
            Ok(res) => res,
            // sender dropped without resolving: stream was dropped wholesale.
            Err(_) => Err(StreamError::Closed(None)),
        }
    }
}

enum WriteChunk {
    Small(BytesMut),
    Large(Bytes),
}

impl WriteChunk {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Small(b) => b,
            Self::Large(b) => b,
        }
    }

    fn advance(&mut self, n: usize) {
        match self {
            Self::Small(b) => b.advance(n),
            Self::Large(b) => b.advance(n),
        }
    }

    fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

#[derive(Default)]
struct WriteQueue {
    chunks: VecDeque<WriteChunk>,
    // (absolute offset after which the write is complete, completion sender)
    completions: VecDeque<(u64, oneshot::Sender<Result<(), StreamError>>)>,
    queued: usize,
    written: u64,
}

impl WriteQueue {
    fn push(&mut self, chunk: Bytes) -> WriteHandle {
        let len = chunk.len();
        if len < COALESCE_LIMIT {
            match self.chunks.back_mut() {
                Some(WriteChunk::Small(tail)) => tail.extend_from_slice(&chunk),
                _ => self.chunks.push_back(WriteChunk::Small(BytesMut::from(&chunk[..]))),
            }
        } else {
            self.chunks.push_back(WriteChunk::Large(chunk));
        }
        self.queued += len;
        let (tx, rx) = oneshot::channel();
        self.completions.push_back((self.written + self.queued as u64, tx));
        WriteHandle(rx)
    }

    fn want_write(&self) -> bool {
        self.queued != 0
    }

    /// write queued chunks until the io blocks or the queue drains.
    fn write_to<Io: Write>(&mut self, io: &mut Io) -> io::Result<()> {
        while let Some(front) = self.chunks.front_mut() {
            match io.write(front.as_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    front.advance(n);
                    self.queued -= n;
                    self.written += n as u64;
                    if front.is_empty() {
                        self.chunks.pop_front();
                    }
                    self.resolve_completions();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn resolve_completions(&mut self) {
        while let Some((target, _)) = self.completions.front() {
            if *target > self.written {
                break;
            }
            let (_, tx) = self.completions.pop_front().unwrap();
            let _ = tx.send(Ok(()));
        }
    }

    fn fail_all(&mut self, cause: Option<&CloseCause>) {
        self.chunks.clear();
        self.queued = 0;
        for (_, tx) in self.completions.drain(..) {
            let _ = tx.send(Err(StreamError::Closed(cause.cloned())));
        }
    }
}

enum Fill {
    /// at least one byte landed in the read buffer.
    Data,
    /// peer closed. the cause (if any) has been recorded on the stream.
    Eof,
}

/// Buffered, non-blocking byte pipe over an [AsyncIo] socket.
///
/// At most one read can be outstanding, which the `&mut self` receivers
/// enforce at compile time. Writes queue in order; each returns a
/// [WriteHandle] resolving when its bytes reached the socket, in FIFO order.
pub struct Stream<Io> {
    io: Io,
    read_buf: BytesMut,
    write_queue: WriteQueue,
    config: StreamConfig,
    closed: bool,
    close_cause: Option<CloseCause>,
    close_callback: Option<Box<dyn FnOnce()>>,
}

impl<Io: AsyncIo> Stream<Io> {
    pub fn new(io: Io) -> Self {
        Self::with_config(io, StreamConfig::default())
    }

    pub fn with_config(io: Io, config: StreamConfig) -> Self {
        Self {
            io,
            read_buf: BytesMut::new(),
            write_queue: WriteQueue::default(),
            config,
            closed: false,
            close_cause: None,
            close_callback: None,
        }
    }

    /// access the wrapped socket.
    pub fn io_ref(&self) -> &Io {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut Io {
        &mut self.io
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// true once the stream observed close, either locally or from the peer.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// the recorded reason for the close, once closed.
    pub fn close_cause(&self) -> Option<&CloseCause> {
        self.close_cause.as_ref()
    }

    /// register a callback invoked exactly once when the stream closes.
    pub fn set_close_callback<F>(&mut self, f: F)
    where
        F: FnOnce() + 'static,
    {
        self.close_callback = Some(Box::new(f));
    }

    /// bytes buffered but not yet consumed by a read operation.
    pub fn buffered(&self) -> &[u8] {
        &self.read_buf
    }

    /// consume up to `n` buffered bytes without touching the socket.
    pub fn consume(&mut self, n: usize) -> Bytes {
        let n = n.min(self.read_buf.len());
        self.read_buf.split_to(n).freeze()
    }

    /// push bytes back in front of the read buffer. used when a protocol
    /// layer over-read past its own message boundary.
    pub fn unconsume(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        let mut buf = BytesMut::with_capacity(bytes.len() + self.read_buf.len());
        buf.extend_from_slice(&bytes);
        buf.extend_from_slice(&self.read_buf);
        self.read_buf = buf;
    }

    /// read until (and including) the first occurrence of `delimiter`.
    ///
    /// fails with [StreamError::UnsatisfiableRead] when `max_bytes` are
    /// buffered without a match and with [StreamError::Closed] when the peer
    /// closes first. both failure modes close the stream.
    pub async fn read_until(&mut self, delimiter: &[u8], max_bytes: Option<usize>) -> Result<Bytes, StreamError> {
        debug_assert!(!delimiter.is_empty());
        let finder = memchr::memmem::Finder::new(delimiter);
        // bytes scanned in previous rounds can only match across the seam,
        // so rewind the scan start by one delimiter length.
        let mut scanned = 0usize;
        loop {
            let start = scanned.saturating_sub(delimiter.len() - 1);
            if let Some(pos) = finder.find(&self.read_buf[start..]) {
                let end = start + pos + delimiter.len();
                self.check_read_budget(end, max_bytes)?;
                return Ok(self.read_buf.split_to(end).freeze());
            }
            scanned = self.read_buf.len();
            self.check_read_budget(usize::MAX, max_bytes)?;
            if let Fill::Eof = self.fill().await? {
                return Err(self.eof_error());
            }
        }
    }

    /// read until the first match of `re`, resolving with everything up to
    /// and including the match.
    pub async fn read_until_regex(
        &mut self,
        re: &regex::bytes::Regex,
        max_bytes: Option<usize>,
    ) -> Result<Bytes, StreamError> {
        loop {
            if let Some(m) = re.find(&self.read_buf) {
                let end = m.end();
                self.check_read_budget(end, max_bytes)?;
                return Ok(self.read_buf.split_to(end).freeze());
            }
            self.check_read_budget(usize::MAX, max_bytes)?;
            if let Fill::Eof = self.fill().await? {
                return Err(self.eof_error());
            }
        }
    }

    /// read exactly `n` bytes.
    pub async fn read_bytes(&mut self, n: usize) -> Result<Bytes, StreamError> {
        while self.read_buf.len() < n {
            self.check_buffer_limit(n)?;
            if let Fill::Eof = self.fill().await? {
                return Err(self.eof_error());
            }
        }
        Ok(self.read_buf.split_to(n).freeze())
    }

    /// read between 1 and `n` bytes, resolving as soon as any are available.
    pub async fn read_bytes_partial(&mut self, n: usize) -> Result<Bytes, StreamError> {
        while self.read_buf.is_empty() {
            if let Fill::Eof = self.fill().await? {
                return Err(self.eof_error());
            }
        }
        let take = n.min(self.read_buf.len());
        Ok(self.read_buf.split_to(take).freeze())
    }

    /// read into a caller owned buffer until `buf` gained `n` bytes, or any
    /// bytes at all with `partial`.
    pub async fn read_into(&mut self, buf: &mut BytesMut, n: usize, partial: bool) -> Result<usize, StreamError> {
        let mut copied = 0;
        loop {
            if !self.read_buf.is_empty() {
                let take = (n - copied).min(self.read_buf.len());
                buf.extend_from_slice(&self.read_buf.split_to(take));
                copied += take;
            }
            if copied == n || (partial && copied > 0) {
                return Ok(copied);
            }
            if let Fill::Eof = self.fill().await? {
                return Err(self.eof_error());
            }
        }
    }

    /// read everything remaining until the peer closes.
    pub async fn read_until_close(&mut self) -> Result<Bytes, StreamError> {
        loop {
            if self.read_buf.len() > self.config.max_buffer_size {
                return Err(self.overflow_error());
            }
            match self.fill().await? {
                Fill::Data => {}
                Fill::Eof => return Ok(self.read_buf.split().freeze()),
            }
        }
    }

    /// queue `chunk` for writing. the returned handle resolves once the
    /// chunk has been written to the socket.
    ///
    /// fails synchronously when the stream is closed or the write buffer
    /// limit would be exceeded. queued bytes are pushed opportunistically
    /// whenever the socket is writable; await [Stream::drain] to force them
    /// out.
    pub fn write(&mut self, chunk: Bytes) -> Result<WriteHandle, StreamError> {
        if self.closed {
            return Err(StreamError::Closed(self.close_cause.clone()));
        }
        if let Some(limit) = self.config.max_write_buffer_size {
            if self.write_queue.queued + chunk.len() > limit {
                return Err(StreamError::WriteBufferFull);
            }
        }
        Ok(self.write_queue.push(chunk))
    }

    /// number of bytes queued and not yet written to the socket.
    pub fn write_queue_len(&self) -> usize {
        self.write_queue.queued
    }

    /// write the queued chunks until the socket blocks.
    fn try_write(&mut self) -> Result<(), StreamError> {
        if let Err(e) = self.write_queue.write_to(&mut self.io) {
            let cause = CloseCause::from_io(e);
            self.close_with(cause.clone());
            return Err(StreamError::Closed(Some(cause)));
        }
        Ok(())
    }

    /// push all queued writes to the socket.
    pub async fn drain(&mut self) -> Result<(), StreamError> {
        while self.write_queue.want_write() {
            if self.closed {
                return Err(StreamError::Closed(self.close_cause.clone()));
            }
            self.io.ready(Interest::WRITABLE).await.map_err(StreamError::from_io)?;
            self.try_write()?;
        }
        loop {
            match self.io.flush() {
                Ok(()) => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    let cause = CloseCause::from_io(e);
                    self.close_with(cause.clone());
                    return Err(StreamError::Closed(Some(cause)));
                }
            }
            self.io.ready(Interest::WRITABLE).await.map_err(StreamError::from_io)?;
        }
    }

    /// wait for readiness and move bytes from the socket into the read
    /// buffer. also drains queued writes while waiting, so back-pressure on
    /// one direction never starves the other.
    async fn fill(&mut self) -> Result<Fill, StreamError> {
        if self.closed {
            return Err(StreamError::Closed(self.close_cause.clone()));
        }
        loop {
            let interest = if self.write_queue.want_write() {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            let ready = self.io.ready(interest).await.map_err(StreamError::from_io)?;
            if ready.is_writable() {
                self.try_write()?;
            }
            if !ready.is_readable() {
                continue;
            }
            match self.read_chunk() {
                Ok(0) => {
                    trace!(target: "stream", "eof from peer");
                    self.close_with(CloseCause::Eof);
                    return Ok(Fill::Eof);
                }
                Ok(_) => return Ok(Fill::Data),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if is_connection_reset(&e) => {
                    // reset class errors count as EOF. the real cause stays
                    // reachable through close_cause.
                    self.close_with(CloseCause::from_io(e));
                    return Ok(Fill::Eof);
                }
                Err(e) => {
                    let cause = CloseCause::from_io(e);
                    self.close_with(cause.clone());
                    return Err(StreamError::Closed(Some(cause)));
                }
            }
        }
    }

    /// one bounded read syscall into the read buffer.
    fn read_chunk(&mut self) -> io::Result<usize> {
        let len = self.read_buf.len();
        let chunk = self.config.read_chunk_size;
        self.read_buf.resize(len + chunk, 0);
        let res = io::Read::read(&mut self.io, &mut self.read_buf[len..]);
        match res {
            Ok(n) => {
                self.read_buf.truncate(len + n);
                Ok(n)
            }
            Err(e) => {
                self.read_buf.truncate(len);
                Err(e)
            }
        }
    }

    /// close the stream. pending write completions fail with
    /// [StreamError::Closed], the close callback (if any) runs once.
    pub fn close(&mut self, cause: Option<CloseCause>) {
        self.close_with(cause.unwrap_or(CloseCause::Local));
    }

    fn close_with(&mut self, cause: CloseCause) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.close_cause = Some(cause);
        self.write_queue.fail_all(self.close_cause.as_ref());
        if let Some(cb) = self.close_callback.take() {
            cb();
        }
    }

    fn eof_error(&self) -> StreamError {
        StreamError::Closed(self.close_cause.clone())
    }

    fn overflow_error(&mut self) -> StreamError {
        self.close_with(CloseCause::BufferFull);
        StreamError::ReadBufferFull
    }

    fn unsatisfiable_error(&mut self) -> StreamError {
        self.close_with(CloseCause::Unsatisfiable);
        StreamError::UnsatisfiableRead
    }

    /// shared budget check for bounded reads. `needed` is the number of
    /// buffered bytes a match would consume, or `usize::MAX` when no match
    /// has been found yet.
    fn check_read_budget(&mut self, needed: usize, max_bytes: Option<usize>) -> Result<(), StreamError> {
        if let Some(max) = max_bytes {
            if needed != usize::MAX && needed > max {
                return Err(self.unsatisfiable_error());
            }
            if needed == usize::MAX && self.read_buf.len() >= max {
                return Err(self.unsatisfiable_error());
            }
        }
        if needed == usize::MAX && self.read_buf.len() > self.config.max_buffer_size {
            return Err(self.overflow_error());
        }
        Ok(())
    }

    fn check_buffer_limit(&mut self, needed: usize) -> Result<(), StreamError> {
        if needed > self.config.max_buffer_size {
            return Err(self.overflow_error());
        }
        Ok(())
    }

    /// upgrade the transport to TLS.
    ///
    /// requires a quiet stream: nothing buffered on the read side and no
    /// queued writes, otherwise plaintext bytes would leak into or out of
    /// the TLS session.
    pub async fn start_tls<C, S>(self, session: C) -> Result<Stream<TlsStream<C, Io>>, StreamError>
    where
        C: DerefMut<Target = ConnectionCommon<S>> + Unpin,
        S: SideData + Unpin,
    {
        if !self.read_buf.is_empty() || self.write_queue.want_write() {
            return Err(StreamError::from_io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "start_tls requires empty buffers",
            )));
        }
        if self.closed {
            return Err(StreamError::Closed(self.close_cause.clone()));
        }
        let config = self.config.clone();
        let tls = TlsStream::handshake(self.io, session).await.map_err(StreamError::from_io)?;
        Ok(Stream::with_config(tls, config))
    }
}

fn is_connection_reset(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
    )
}

impl Stream<crate::net::TcpStream> {
    /// disable Nagle's algorithm on the underlying TCP socket.
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.io.set_nodelay(nodelay)
    }
}
