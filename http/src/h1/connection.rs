use bytes::{Bytes, BytesMut};
use gale_io::{Stream, StreamError, WriteHandle, io::AsyncIo};
use gale_runtime::timeout_at;
use http::{Method, header::CONTENT_ENCODING};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{
    config::HttpConfig,
    date::DateService,
    delegate::MessageDelegate,
    error::ProtoError,
    proto::{
        TransferCoding,
        decode::{self, Decoded},
        encode::{self, BodySize},
        head::{RequestHead, ResponseHead},
    },
};

use super::body::BodyReader;

const CONTINUE_LINE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Server side of one HTTP/1 connection.
///
/// Owns the [Stream] for the connection's whole life. Requests are read one
/// at a time; the response write path runs through the same object so the
/// keep-alive decision can account for both directions. A protocol upgrade
/// takes the stream out with [Http1Connection::detach].
pub struct Http1Connection<Io> {
    stream: Stream<Io>,
    config: HttpConfig,
    date: DateService,
    /// method of the request currently being answered.
    request_method: Method,
    /// the connection must close once the current response is finished.
    close: bool,
    body: Option<BodyReader>,
    encoder: Option<TransferCoding>,
    requests_seen: usize,
}

impl<Io: AsyncIo> Http1Connection<Io> {
    pub fn new(stream: Stream<Io>, config: HttpConfig) -> Self {
        let close = config.no_keep_alive;
        Self {
            stream,
            config,
            date: DateService::new(),
            request_method: Method::GET,
            close,
            body: None,
            encoder: None,
            requests_seen: 0,
        }
    }

    pub fn stream(&mut self) -> &mut Stream<Io> {
        &mut self.stream
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// read and parse the next request head.
    ///
    /// `Ok(None)` means the peer closed cleanly between requests. Anything
    /// malformed, oversized or slower than `header_timeout` is an error.
    pub async fn read_request(&mut self) -> Result<Option<RequestHead>, ProtoError> {
        debug_assert!(self.body.is_none(), "previous request body not finished");

        let read = self.stream.read_until(b"\r\n\r\n", Some(self.config.max_header_size));
        let head_bytes = match self.config.header_timeout {
            Some(dur) => timeout_at(Instant::now() + dur, read).await?,
            None => read.await,
        };

        let head_bytes = match head_bytes {
            Ok(bytes) => bytes,
            Err(StreamError::Closed(_)) => {
                // EOF at a message boundary is a normal connection end.
                return Ok(None);
            }
            Err(StreamError::UnsatisfiableRead) => return Err(ProtoError::HeaderTooLarge),
            Err(e) => return Err(e.into()),
        };

        let Decoded { head, coding, close } = decode::decode_request_head(&head_bytes)?;

        self.requests_seen += 1;
        self.request_method = head.method.clone();
        self.close = self.close || close;
        self.encoder = None;

        let gzip = self.config.decompress && request_is_gzipped(&head);
        let body = BodyReader::new(coding, gzip, &self.config, self.stream.config().max_buffer_size);

        // a declared length beyond the limit is rejected before any body
        // byte is read.
        if let Some(len) = body.declared_length() {
            if len > self.config.effective_max_body(self.stream.config().max_buffer_size) as u64 {
                return Err(ProtoError::BodyTooLarge);
            }
        }

        self.body = Some(body);
        trace!(target: "h1_conn", "request head parsed: {} {}", head.method, head.target);
        Ok(Some(head))
    }

    /// emit the interim `100 Continue` line. call once the request head was
    /// accepted and before the body is read.
    pub async fn send_continue(&mut self) -> Result<(), ProtoError> {
        self.stream.write(Bytes::from_static(CONTINUE_LINE))?;
        self.stream.drain().await?;
        Ok(())
    }

    /// next chunk of the current request body, `None` at its end.
    pub async fn read_body_chunk(&mut self) -> Result<Option<Bytes>, ProtoError> {
        let body = self.body.as_mut().expect("read_body_chunk before read_request");
        match body.read_chunk(&mut self.stream).await {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => Ok(None),
            Err(e) => {
                self.close = true;
                Err(e)
            }
        }
    }

    /// serialize and queue the response head. `body` sizes the framing when
    /// the head carries neither `Content-Length` nor `Transfer-Encoding`.
    pub fn write_response_head(&mut self, head: &ResponseHead, body: BodySize) -> Result<(), ProtoError> {
        if self.encoder.is_some() {
            return Err(ProtoError::State("response head already written"));
        }
        let mut buf = BytesMut::with_capacity(256);
        let encoded =
            encode::encode_response_head(head, &self.request_method, body, self.close, &self.date, &mut buf)?;
        self.close = encoded.close;
        self.encoder = Some(encoded.coding);
        self.stream.write(buf.freeze())?;
        Ok(())
    }

    /// queue one response body chunk, framed according to the negotiated
    /// coding. the returned handle resolves when the bytes reach the socket.
    pub fn write_body_chunk(&mut self, chunk: Bytes) -> Result<Option<WriteHandle>, ProtoError> {
        let encoder = self.encoder.as_mut().ok_or(ProtoError::State("body write before response head"))?;
        let mut out = Vec::with_capacity(3);
        encoder.encode(chunk, &mut out);
        let mut handle = None;
        for bytes in out {
            handle = Some(self.stream.write(bytes)?);
        }
        Ok(handle)
    }

    /// terminate the response: write the chunked trailer if any, push
    /// everything to the socket and settle the keep-alive decision.
    pub async fn finish_response(&mut self) -> Result<(), ProtoError> {
        let mut encoder = self
            .encoder
            .take()
            .ok_or(ProtoError::State("finish before response head"))?;
        let mut out = Vec::with_capacity(1);
        encoder.encode_eof(&mut out);
        for bytes in out {
            self.stream.write(bytes)?;
        }
        self.stream.drain().await?;

        // an unconsumed request body poisons reuse: its bytes would be
        // parsed as the next request head.
        match self.body.take() {
            Some(body) if body.is_complete() => {}
            Some(mut body) if !self.close => match body.drain(&mut self.stream).await {
                Ok(()) => {}
                Err(e) => {
                    debug!(target: "h1_conn", "discarding connection, request body unreadable: {e}");
                    self.close = true;
                }
            },
            _ => self.close = true,
        }

        Ok(())
    }

    /// whether the connection can serve another request.
    pub fn reusable(&self) -> bool {
        !self.close && !self.stream.is_closed()
    }

    /// number of requests read so far.
    pub fn requests_seen(&self) -> usize {
        self.requests_seen
    }

    /// force the connection closed after the current response.
    pub fn set_close(&mut self) {
        self.close = true;
    }

    /// hand the underlying stream to another protocol.
    ///
    /// Legal only between delivering a request head and starting the
    /// response; afterwards the stream state is part-way through a message
    /// exchange and useless to an upgrade.
    pub fn detach(self) -> Stream<Io> {
        debug_assert!(self.encoder.is_none(), "detach after response start");
        self.stream
    }

    /// drive one full message through `delegate`.
    ///
    /// returns `Ok(true)` when the message completed and the connection may
    /// carry another, `Ok(false)` on clean connection end.
    pub async fn read_message<D>(&mut self, delegate: &mut D) -> Result<bool, ProtoError>
    where
        D: MessageDelegate<RequestHead>,
    {
        let head = match self.read_request().await {
            Ok(Some(head)) => head,
            Ok(None) => {
                delegate.on_connection_close();
                return Ok(false);
            }
            Err(e) => {
                delegate.on_connection_close();
                return Err(e);
            }
        };

        let expect_continue = head.expect_continue;
        delegate.headers_received(head).await?;

        if expect_continue {
            self.send_continue().await?;
        }

        loop {
            match self.read_body_chunk().await {
                Ok(Some(chunk)) => delegate.data_received(chunk).await?,
                Ok(None) => break,
                Err(e) => {
                    delegate.on_connection_close();
                    return Err(e);
                }
            }
        }

        delegate.finish();
        Ok(true)
    }
}

fn request_is_gzipped(head: &RequestHead) -> bool {
    head.headers
        .get(CONTENT_ENCODING)
        .map(|v| v.as_bytes().eq_ignore_ascii_case(b"gzip"))
        .unwrap_or(false)
}

#[cfg(test)]
mod test {
    use gale_io::net::TcpStream;
    use http::StatusCode;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
    }

    async fn pair() -> (Http1Connection<TcpStream>, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        let conn = Http1Connection::new(Stream::new(TcpStream::from_tokio(accepted)), HttpConfig::default());
        (conn, peer)
    }

    struct RecordingDelegate {
        head: Option<RequestHead>,
        data: Vec<u8>,
        finished: usize,
        closed: usize,
    }

    impl RecordingDelegate {
        fn new() -> Self {
            Self {
                head: None,
                data: Vec::new(),
                finished: 0,
                closed: 0,
            }
        }
    }

    impl MessageDelegate<RequestHead> for RecordingDelegate {
        async fn headers_received(&mut self, head: RequestHead) -> Result<(), ProtoError> {
            self.head = Some(head);
            Ok(())
        }

        async fn data_received(&mut self, chunk: Bytes) -> Result<(), ProtoError> {
            self.data.extend_from_slice(&chunk);
            Ok(())
        }

        fn finish(&mut self) {
            self.finished += 1;
        }

        fn on_connection_close(&mut self) {
            self.closed += 1;
        }
    }

    #[test]
    fn chunked_upload_reaches_delegate() {
        rt().block_on(async {
            let (mut conn, mut peer) = pair().await;
            peer.write_all(b"POST /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n")
                .await
                .unwrap();

            let mut delegate = RecordingDelegate::new();
            let keep_going = conn.read_message(&mut delegate).await.unwrap();
            assert!(keep_going);
            assert_eq!(delegate.data, b"hello");
            assert_eq!(delegate.finished, 1);
            assert_eq!(delegate.closed, 0);
            let head = delegate.head.unwrap();
            assert_eq!(head.method, Method::POST);
            assert_eq!(head.target.path(), "/u");
        });
    }

    #[test]
    fn clean_eof_reports_connection_close() {
        rt().block_on(async {
            let (mut conn, peer) = pair().await;
            drop(peer);
            let mut delegate = RecordingDelegate::new();
            let keep_going = conn.read_message(&mut delegate).await.unwrap();
            assert!(!keep_going);
            assert_eq!(delegate.closed, 1);
            assert_eq!(delegate.finished, 0);
        });
    }

    #[test]
    fn fixed_length_body_and_response_roundtrip() {
        rt().block_on(async {
            let (mut conn, mut peer) = pair().await;
            peer.write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc")
                .await
                .unwrap();

            let head = conn.read_request().await.unwrap().unwrap();
            assert_eq!(head.method, Method::POST);

            let mut body = Vec::new();
            while let Some(chunk) = conn.read_body_chunk().await.unwrap() {
                body.extend_from_slice(&chunk);
            }
            assert_eq!(body, b"abc");

            let res = ResponseHead::new(StatusCode::OK);
            conn.write_response_head(&res, BodySize::Sized(3)).unwrap();
            conn.write_body_chunk(Bytes::from_static(b"abc")).unwrap();
            conn.finish_response().await.unwrap();
            assert!(conn.reusable());

            let mut got = vec![0u8; 1024];
            let n = peer.read(&mut got).await.unwrap();
            let text = std::str::from_utf8(&got[..n]).unwrap();
            assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
            assert!(text.ends_with("\r\n\r\nabc"), "{text}");
        });
    }

    #[test]
    fn oversized_header_rejected() {
        rt().block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let mut peer = tokio::net::TcpStream::connect(addr).await.unwrap();
            let (accepted, _) = listener.accept().await.unwrap();
            let config = HttpConfig::default().max_header_size(128);
            let mut conn = Http1Connection::new(Stream::new(TcpStream::from_tokio(accepted)), config);

            let huge = format!("GET / HTTP/1.1\r\nx-filler: {}\r\n\r\n", "y".repeat(512));
            peer.write_all(huge.as_bytes()).await.unwrap();

            let err = conn.read_request().await.unwrap_err();
            assert!(matches!(err, ProtoError::HeaderTooLarge));
        });
    }

    #[test]
    fn body_over_limit_rejected() {
        rt().block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let mut peer = tokio::net::TcpStream::connect(addr).await.unwrap();
            let (accepted, _) = listener.accept().await.unwrap();
            let config = HttpConfig::default().max_body_size(4);
            let mut conn = Http1Connection::new(Stream::new(TcpStream::from_tokio(accepted)), config);

            // declared length over the limit fails at the head.
            peer.write_all(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789")
                .await
                .unwrap();
            let err = conn.read_request().await.unwrap_err();
            assert!(matches!(err, ProtoError::BodyTooLarge));
        });
    }

    #[test]
    fn chunked_body_over_limit_rejected_mid_stream() {
        rt().block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let mut peer = tokio::net::TcpStream::connect(addr).await.unwrap();
            let (accepted, _) = listener.accept().await.unwrap();
            let config = HttpConfig::default().max_body_size(4);
            let mut conn = Http1Connection::new(Stream::new(TcpStream::from_tokio(accepted)), config);

            peer.write_all(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n8\r\nabcdefgh\r\n0\r\n\r\n")
                .await
                .unwrap();
            conn.read_request().await.unwrap().unwrap();
            let mut saw_error = false;
            loop {
                match conn.read_body_chunk().await {
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(e) => {
                        assert!(matches!(e, ProtoError::BodyTooLarge));
                        saw_error = true;
                        break;
                    }
                }
            }
            assert!(saw_error);
            assert!(!conn.reusable());
        });
    }

    #[test]
    fn expect_continue_emitted_before_body() {
        rt().block_on(async {
            let (mut conn, mut peer) = pair().await;
            peer.write_all(b"POST / HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 2\r\n\r\n")
                .await
                .unwrap();

            let head = conn.read_request().await.unwrap().unwrap();
            assert!(head.expect_continue);
            conn.send_continue().await.unwrap();

            let mut interim = [0u8; CONTINUE_LINE.len()];
            peer.read_exact(&mut interim).await.unwrap();
            assert_eq!(&interim, CONTINUE_LINE);

            peer.write_all(b"ok").await.unwrap();
            let chunk = conn.read_body_chunk().await.unwrap().unwrap();
            assert_eq!(&chunk[..], b"ok");
            assert!(conn.read_body_chunk().await.unwrap().is_none());
        });
    }

    #[test]
    fn gzip_request_body_is_decompressed() {
        use flate2::{Compression, write::GzEncoder};
        use std::io::Write as _;

        rt().block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let mut peer = tokio::net::TcpStream::connect(addr).await.unwrap();
            let (accepted, _) = listener.accept().await.unwrap();
            let config = HttpConfig::default().decompress(true);
            let mut conn = Http1Connection::new(Stream::new(TcpStream::from_tokio(accepted)), config);

            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            enc.write_all(b"compressed payload").unwrap();
            let gz = enc.finish().unwrap();

            let head = format!(
                "POST / HTTP/1.1\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
                gz.len()
            );
            peer.write_all(head.as_bytes()).await.unwrap();
            peer.write_all(&gz).await.unwrap();

            conn.read_request().await.unwrap().unwrap();
            let mut body = Vec::new();
            while let Some(chunk) = conn.read_body_chunk().await.unwrap() {
                body.extend_from_slice(&chunk);
            }
            assert_eq!(body, b"compressed payload");
        });
    }

    #[test]
    fn keep_alive_serves_two_requests() {
        rt().block_on(async {
            let (mut conn, mut peer) = pair().await;
            peer.write_all(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();

            for (path, reusable) in [("/a", true), ("/b", false)] {
                let head = conn.read_request().await.unwrap().unwrap();
                assert_eq!(head.target.path(), path);
                while conn.read_body_chunk().await.unwrap().is_some() {}
                let res = ResponseHead::new(StatusCode::OK);
                conn.write_response_head(&res, BodySize::Sized(0)).unwrap();
                conn.finish_response().await.unwrap();
                assert_eq!(conn.reusable(), reusable, "{path}");
            }
        });
    }
}
