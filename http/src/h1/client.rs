use bytes::{Bytes, BytesMut};
use gale_io::{Stream, io::AsyncIo};
use gale_runtime::timeout_at;
use http::{Method, StatusCode};
use tokio::time::Instant;
use tracing::trace;

use crate::{
    config::HttpConfig,
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

/// Client side of one HTTP/1 connection.
///
/// The write path serializes one request at a time; the read path parses
/// the matching response, skipping interim 1xx responses other than `101
/// Switching Protocols`. At most one exchange is in flight per connection.
pub struct Http1ClientConnection<Io> {
    stream: Stream<Io>,
    config: HttpConfig,
    request_method: Method,
    encoder: Option<TransferCoding>,
    body: Option<BodyReader>,
    close: bool,
}

impl<Io: AsyncIo> Http1ClientConnection<Io> {
    pub fn new(stream: Stream<Io>, config: HttpConfig) -> Self {
        let close = config.no_keep_alive;
        Self {
            stream,
            config,
            request_method: Method::GET,
            encoder: None,
            body: None,
            close,
        }
    }

    pub fn stream(&mut self) -> &mut Stream<Io> {
        &mut self.stream
    }

    /// serialize and queue the request head.
    pub fn write_request_head(&mut self, head: &RequestHead, body: BodySize) -> Result<(), ProtoError> {
        if self.encoder.is_some() {
            return Err(ProtoError::State("request already in flight"));
        }
        self.request_method = head.method.clone();
        self.body = None;
        let mut buf = BytesMut::with_capacity(256);
        let encoded = encode::encode_request_head(head, body, &mut buf)?;
        self.encoder = Some(encoded.coding);
        self.stream.write(buf.freeze())?;
        Ok(())
    }

    pub fn write_body_chunk(&mut self, chunk: Bytes) -> Result<(), ProtoError> {
        let encoder = self.encoder.as_mut().ok_or(ProtoError::State("body write before request head"))?;
        let mut out = Vec::with_capacity(3);
        encoder.encode(chunk, &mut out);
        for bytes in out {
            self.stream.write(bytes)?;
        }
        Ok(())
    }

    /// terminate the request body and push everything to the socket.
    pub async fn finish_request(&mut self) -> Result<(), ProtoError> {
        let mut encoder = self
            .encoder
            .take()
            .ok_or(ProtoError::State("finish before request head"))?;
        let mut out = Vec::with_capacity(1);
        encoder.encode_eof(&mut out);
        for bytes in out {
            self.stream.write(bytes)?;
        }
        self.stream.drain().await?;
        Ok(())
    }

    /// read the response head, optionally bounded by an absolute deadline.
    /// interim 1xx responses (other than 101) are consumed and skipped.
    pub async fn read_response(&mut self, deadline: Option<Instant>) -> Result<ResponseHead, ProtoError> {
        loop {
            let read = self.stream.read_until(b"\r\n\r\n", Some(self.config.max_header_size));
            let head_bytes = match deadline {
                Some(at) => timeout_at(at, read).await??,
                None => read.await?,
            };

            let Decoded { head, coding, close } = decode::decode_response_head(&head_bytes, &self.request_method)?;

            if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
                trace!(target: "h1_client", "skipping interim response {}", head.status);
                continue;
            }

            self.close = self.close || close;
            self.body = Some(BodyReader::new(
                coding,
                false,
                &self.config,
                self.stream.config().max_buffer_size,
            ));
            return Ok(head);
        }
    }

    /// next chunk of the response body, `None` at its end.
    pub async fn read_body_chunk(&mut self) -> Result<Option<Bytes>, ProtoError> {
        let body = self.body.as_mut().ok_or(ProtoError::State("body read before response head"))?;
        body.read_chunk(&mut self.stream).await
    }

    /// buffer the whole response body.
    pub async fn read_body(&mut self) -> Result<Bytes, ProtoError> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.read_body_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// drive a whole response through `delegate`.
    pub async fn read_message<D>(&mut self, delegate: &mut D, deadline: Option<Instant>) -> Result<(), ProtoError>
    where
        D: MessageDelegate<ResponseHead>,
    {
        let head = match self.read_response(deadline).await {
            Ok(head) => head,
            Err(e) => {
                delegate.on_connection_close();
                return Err(e);
            }
        };
        delegate.headers_received(head).await?;
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
        Ok(())
    }

    /// whether the connection can carry another exchange.
    pub fn reusable(&self) -> bool {
        !self.close
            && !self.stream.is_closed()
            && self.body.as_ref().map(BodyReader::is_complete).unwrap_or(true)
            && self.encoder.is_none()
    }

    /// hand the underlying stream to another protocol after a 101 response.
    pub fn detach(self) -> Stream<Io> {
        self.stream
    }
}

impl<Io: AsyncIo> Http1ClientConnection<Io> {
    /// convenience for error mapping at call sites that treat any transport
    /// failure as a closed connection.
    pub fn close_reason(&self) -> Option<&gale_io::CloseCause> {
        self.stream.close_cause()
    }
}

#[cfg(test)]
mod test {
    use gale_io::net::TcpStream;
    use http::Uri;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
    }

    async fn pair() -> (Http1ClientConnection<TcpStream>, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let conn = Http1ClientConnection::new(Stream::new(TcpStream::from_tokio(client)), HttpConfig::default());
        (conn, server)
    }

    #[test]
    fn request_response_roundtrip() {
        rt().block_on(async {
            let (mut conn, mut server) = pair().await;

            let head = RequestHead::new(Method::GET, Uri::from_static("http://h/echo?x=1"));
            conn.write_request_head(&head, BodySize::None).unwrap();
            conn.finish_request().await.unwrap();

            let mut got = vec![0u8; 512];
            let n = server.read(&mut got).await.unwrap();
            let text = std::str::from_utf8(&got[..n]).unwrap();
            assert!(text.starts_with("GET /echo?x=1 HTTP/1.1\r\n"), "{text}");

            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi")
                .await
                .unwrap();

            let res = conn.read_response(None).await.unwrap();
            assert_eq!(res.status, StatusCode::OK);
            let body = conn.read_body().await.unwrap();
            assert_eq!(&body[..], b"hi");
            assert!(conn.reusable());
        });
    }

    #[test]
    fn interim_responses_are_skipped() {
        rt().block_on(async {
            let (mut conn, mut server) = pair().await;

            let head = RequestHead::new(Method::POST, Uri::from_static("http://h/u"));
            conn.write_request_head(&head, BodySize::Sized(0)).unwrap();
            conn.finish_request().await.unwrap();

            server
                .write_all(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n")
                .await
                .unwrap();

            let res = conn.read_response(None).await.unwrap();
            assert_eq!(res.status, StatusCode::NO_CONTENT);
            assert_eq!(conn.read_body().await.unwrap().len(), 0);
        });
    }

    #[test]
    fn close_delimited_body() {
        rt().block_on(async {
            let (mut conn, mut server) = pair().await;

            let head = RequestHead::new(Method::GET, Uri::from_static("http://h/"));
            conn.write_request_head(&head, BodySize::None).unwrap();
            conn.finish_request().await.unwrap();

            server.write_all(b"HTTP/1.0 200 OK\r\n\r\nuntil the end").await.unwrap();
            drop(server);

            let res = conn.read_response(None).await.unwrap();
            assert_eq!(res.status, StatusCode::OK);
            let body = conn.read_body().await.unwrap();
            assert_eq!(&body[..], b"until the end");
            assert!(!conn.reusable());
        });
    }

    #[test]
    fn head_response_has_no_body() {
        rt().block_on(async {
            let (mut conn, mut server) = pair().await;

            let head = RequestHead::new(Method::HEAD, Uri::from_static("http://h/"));
            conn.write_request_head(&head, BodySize::None).unwrap();
            conn.finish_request().await.unwrap();

            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n")
                .await
                .unwrap();

            let res = conn.read_response(None).await.unwrap();
            assert_eq!(res.status, StatusCode::OK);
            assert_eq!(conn.read_body().await.unwrap().len(), 0);
        });
    }

    #[test]
    fn response_deadline_surfaces_timeout() {
        rt().block_on(async {
            let (mut conn, _server) = pair().await;
            let head = RequestHead::new(Method::GET, Uri::from_static("http://h/slow"));
            conn.write_request_head(&head, BodySize::None).unwrap();
            conn.finish_request().await.unwrap();

            let deadline = Instant::now() + std::time::Duration::from_millis(30);
            let err = conn.read_response(Some(deadline)).await.unwrap_err();
            assert!(matches!(err, ProtoError::Timeout));
        });
    }
}
