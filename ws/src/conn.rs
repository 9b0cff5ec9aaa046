//! message-level WebSocket connection over a detached stream.

use core::time::Duration;

use bytes::{Bytes, BytesMut};
use gale_io::{Stream, StreamError, io::AsyncIo};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{
    codec::{Codec, Item, Message},
    deflate::{DeflateConfig, DeflateContext, DeflateOptions},
    error::ProtocolError,
    proto::{CloseCode, CloseReason},
};

/// socket read granularity while waiting for frames.
const READ_CHUNK: usize = 65536;

/// Connection level knobs.
#[derive(Clone, Copy, Debug)]
pub struct WsConfig {
    pub max_message_size: usize,
    /// interval of keep-alive pings; `None` disables them.
    pub ping_interval: Option<Duration>,
    /// how long to wait for a pong before aborting. defaults to
    /// `max(3 * ping_interval, 30s)`.
    pub ping_timeout: Option<Duration>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            max_message_size: 10 * 1024 * 1024,
            ping_interval: None,
            ping_timeout: None,
        }
    }
}

impl WsConfig {
    fn effective_ping_timeout(&self) -> Option<Duration> {
        let interval = self.ping_interval?;
        Some(self.ping_timeout.unwrap_or_else(|| (interval * 3).max(Duration::from_secs(30))))
    }
}

/// A complete application-level message.
#[derive(Debug, Eq, PartialEq)]
pub enum WsMessage {
    Text(String),
    Binary(Bytes),
}

struct FragmentBuf {
    text: bool,
    compressed: bool,
    data: BytesMut,
}

/// One established WebSocket connection, either role.
///
/// Owns the stream detached from the HTTP connection after the upgrade.
/// [read_message](Self::read_message) runs the frame loop including control
/// frame handling and keep-alive pings; it resolves with `None` once the
/// connection is closed (cleanly or not).
pub struct WebSocketConnection<Io> {
    stream: Stream<Io>,
    codec: Codec,
    deflate: Option<DeflateContext>,
    config: WsConfig,
    read_buf: BytesMut,
    fragments: Option<FragmentBuf>,
    close_sent: bool,
    close_received: Option<CloseReason>,
    closed: bool,
    // keep-alive bookkeeping.
    next_ping: Option<Instant>,
    waiting_pong_since: Option<Instant>,
    ping_counter: u64,
    last_pong_payload: Option<Bytes>,
    pong_callback: Option<Box<dyn FnMut(&Bytes)>>,
}

impl<Io: AsyncIo> WebSocketConnection<Io> {
    /// server role: inbound frames masked, outbound clear.
    pub fn server(stream: Stream<Io>, config: WsConfig, deflate: Option<(DeflateConfig, DeflateOptions)>) -> Self {
        Self::new(stream, config, deflate, true)
    }

    /// client role: outbound frames masked.
    pub fn client(stream: Stream<Io>, config: WsConfig, deflate: Option<(DeflateConfig, DeflateOptions)>) -> Self {
        Self::new(stream, config, deflate, false)
    }

    fn new(
        stream: Stream<Io>,
        config: WsConfig,
        deflate: Option<(DeflateConfig, DeflateOptions)>,
        server: bool,
    ) -> Self {
        let mut codec = Codec::new().max_size(config.max_message_size);
        if !server {
            codec = codec.client_mode();
        }
        let deflate = deflate.map(|(cfg, options)| {
            codec = codec.with_deflate();
            DeflateContext::new(&cfg, &options, server)
        });

        let next_ping = config.ping_interval.map(|interval| Instant::now() + interval);

        Self {
            stream,
            codec,
            deflate,
            config,
            read_buf: BytesMut::new(),
            fragments: None,
            close_sent: false,
            close_received: None,
            closed: false,
            next_ping,
            waiting_pong_since: None,
            ping_counter: 0,
            last_pong_payload: None,
            pong_callback: None,
        }
    }

    /// observe every pong the peer sends.
    pub fn set_pong_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&Bytes) + 'static,
    {
        self.pong_callback = Some(Box::new(callback));
    }

    /// the close reason the peer sent, once a close frame arrived.
    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_received.as_ref()
    }

    /// payload of the most recent pong.
    pub fn last_pong(&self) -> Option<&Bytes> {
        self.last_pong_payload.as_ref()
    }

    /// next complete message; `None` once the connection closed.
    pub async fn read_message(&mut self) -> Result<Option<WsMessage>, ProtocolError> {
        loop {
            if self.closed {
                return Ok(None);
            }

            match self.codec.decode(&mut self.read_buf) {
                Ok(Some(message)) => match self.handle_message(message).await {
                    Ok(Some(message)) => return Ok(Some(message)),
                    Ok(None) => continue,
                    Err(e) => {
                        self.fail(&e).await;
                        return Err(e);
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    self.fail(&e).await;
                    return Err(e);
                }
            }

            if !self.fill_or_tick().await? {
                return Ok(None);
            }
        }
    }

    /// send a text message. resolves once the frame reached the socket.
    pub async fn write_text(&mut self, text: impl Into<String>) -> Result<(), ProtocolError> {
        let payload = Bytes::from(text.into().into_bytes());
        self.write_data(payload, true).await
    }

    /// send a binary message. resolves once the frame reached the socket.
    pub async fn write_binary(&mut self, payload: Bytes) -> Result<(), ProtocolError> {
        self.write_data(payload, false).await
    }

    async fn write_data(&mut self, payload: Bytes, text: bool) -> Result<(), ProtocolError> {
        if self.closed || self.close_sent {
            return Err(ProtocolError::Closed);
        }

        let (payload, compressed) = match self.deflate.as_mut() {
            Some(deflate) => (Bytes::from(deflate.compress(&payload)?), true),
            None => (payload, false),
        };

        let message = if text {
            Message::Text { payload, compressed }
        } else {
            Message::Binary { payload, compressed }
        };

        let mut wire = BytesMut::new();
        self.codec.encode(message, &mut wire);
        self.stream.write(wire.freeze())?;
        self.stream.drain().await?;
        Ok(())
    }

    /// send a ping frame with an arbitrary payload.
    pub async fn ping(&mut self, payload: Bytes) -> Result<(), ProtocolError> {
        if self.closed {
            return Err(ProtocolError::Closed);
        }
        let mut wire = BytesMut::new();
        self.codec.encode(Message::Ping(payload), &mut wire);
        self.stream.write(wire.freeze())?;
        self.stream.drain().await?;
        Ok(())
    }

    /// initiate (or answer) the closing handshake.
    pub async fn close(&mut self, reason: Option<CloseReason>) -> Result<(), ProtocolError> {
        if !self.close_sent && !self.closed {
            self.close_sent = true;
            // stop keep-alive pings once closing starts.
            self.next_ping = None;
            let mut wire = BytesMut::new();
            self.codec.encode(Message::Close(reason), &mut wire);
            self.stream.write(wire.freeze())?;
            self.stream.drain().await?;
        }
        if self.close_received.is_some() {
            self.shutdown();
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        if !self.closed {
            self.closed = true;
            self.stream.close(None);
        }
    }

    /// handle one decoded frame. returns a message when a complete
    /// application message is ready.
    async fn handle_message(&mut self, message: Message) -> Result<Option<WsMessage>, ProtocolError> {
        match message {
            Message::Ping(payload) => {
                trace!(target: "ws_conn", "ping received, {} bytes", payload.len());
                let mut wire = BytesMut::new();
                self.codec.encode(Message::Pong(payload), &mut wire);
                self.stream.write(wire.freeze())?;
                self.stream.drain().await?;
                Ok(None)
            }
            Message::Pong(payload) => {
                self.waiting_pong_since = None;
                if let Some(callback) = self.pong_callback.as_mut() {
                    callback(&payload);
                }
                self.last_pong_payload = Some(payload);
                Ok(None)
            }
            Message::Close(reason) => {
                debug!(target: "ws_conn", "close frame received: {reason:?}");
                self.close_received = Some(reason.clone().unwrap_or(CloseReason {
                    code: CloseCode::Abnormal,
                    description: None,
                }));
                if !self.close_sent {
                    self.close_sent = true;
                    let mut wire = BytesMut::new();
                    self.codec.encode(Message::Close(reason), &mut wire);
                    self.stream.write(wire.freeze())?;
                    let _ = self.stream.drain().await;
                }
                self.shutdown();
                Ok(None)
            }
            Message::Text { payload, compressed } => self.complete(payload, compressed, true).map(Some),
            Message::Binary { payload, compressed } => self.complete(payload, compressed, false).map(Some),
            Message::Continuation(item) => self.handle_fragment(item),
        }
    }

    fn handle_fragment(&mut self, item: Item) -> Result<Option<WsMessage>, ProtocolError> {
        match item {
            Item::FirstText { payload, compressed } => {
                self.start_fragments(true, compressed, payload)?;
                Ok(None)
            }
            Item::FirstBinary { payload, compressed } => {
                self.start_fragments(false, compressed, payload)?;
                Ok(None)
            }
            Item::Continue(payload) => {
                self.append_fragment(&payload)?;
                Ok(None)
            }
            Item::Last(payload) => {
                self.append_fragment(&payload)?;
                let buf = self.fragments.take().unwrap();
                self.complete(buf.data.freeze(), buf.compressed, buf.text).map(Some)
            }
        }
    }

    fn start_fragments(&mut self, text: bool, compressed: bool, payload: Bytes) -> Result<(), ProtocolError> {
        debug_assert!(self.fragments.is_none(), "codec enforces single open message");
        self.fragments = Some(FragmentBuf {
            text,
            compressed,
            data: BytesMut::from(&payload[..]),
        });
        Ok(())
    }

    fn append_fragment(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        let buf = self.fragments.as_mut().expect("codec enforces open message");
        if buf.data.len() + payload.len() > self.config.max_message_size {
            return Err(ProtocolError::MessageTooBig);
        }
        buf.data.extend_from_slice(payload);
        Ok(())
    }

    fn complete(&mut self, payload: Bytes, compressed: bool, text: bool) -> Result<WsMessage, ProtocolError> {
        let payload = if compressed {
            let deflate = self.deflate.as_mut().expect("codec rejects rsv1 without deflate");
            Bytes::from(deflate.decompress(&payload, self.config.max_message_size)?)
        } else {
            payload
        };

        if text {
            let text = String::from_utf8(payload.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)?;
            Ok(WsMessage::Text(text))
        } else {
            Ok(WsMessage::Binary(payload))
        }
    }

    /// wait for socket data or the next keep-alive tick. returns `false`
    /// once the connection is gone.
    async fn fill_or_tick(&mut self) -> Result<bool, ProtocolError> {
        // a pending pong wait bounds the read even between pings.
        let timeout_at = self
            .waiting_pong_since
            .zip(self.config.effective_ping_timeout())
            .map(|(since, timeout)| since + timeout);
        let wake_at = match (self.next_ping, timeout_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let data = match wake_at {
            Some(at) => {
                tokio::select! {
                    biased;
                    r = self.stream.read_bytes_partial(READ_CHUNK) => Some(r),
                    _ = tokio::time::sleep_until(at) => None,
                }
            }
            None => Some(self.stream.read_bytes_partial(READ_CHUNK).await),
        };

        match data {
            Some(Ok(bytes)) => {
                self.read_buf.extend_from_slice(&bytes);
                Ok(true)
            }
            Some(Err(StreamError::Closed(_))) => {
                debug!(target: "ws_conn", "peer went away without closing handshake");
                self.closed = true;
                Ok(false)
            }
            Some(Err(e)) => Err(e.into()),
            None => self.keep_alive_tick().await,
        }
    }

    async fn keep_alive_tick(&mut self) -> Result<bool, ProtocolError> {
        let now = Instant::now();

        if let (Some(since), Some(timeout)) = (self.waiting_pong_since, self.config.effective_ping_timeout()) {
            if now >= since + timeout {
                debug!(target: "ws_conn", "no pong within {timeout:?}, aborting connection");
                self.shutdown();
                return Ok(false);
            }
        }

        if let (Some(at), Some(interval)) = (self.next_ping, self.config.ping_interval) {
            if now >= at {
                self.ping_counter += 1;
                let payload = Bytes::from(self.ping_counter.to_string().into_bytes());
                let mut wire = BytesMut::new();
                self.codec.encode(Message::Ping(payload), &mut wire);
                self.stream.write(wire.freeze())?;
                self.stream.drain().await?;
                if self.waiting_pong_since.is_none() {
                    self.waiting_pong_since = Some(now);
                }
                self.next_ping = Some(now + interval);
            }
        }

        Ok(true)
    }

    /// best-effort close frame for a protocol violation, then teardown.
    async fn fail(&mut self, error: &ProtocolError) {
        if !self.close_sent && !self.closed {
            self.close_sent = true;
            let reason = CloseReason {
                code: CloseCode::from(error.close_code()),
                description: None,
            };
            let mut wire = BytesMut::new();
            self.codec.encode(Message::Close(Some(reason)), &mut wire);
            if self.stream.write(wire.freeze()).is_ok() {
                let _ = self.stream.drain().await;
            }
        }
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use gale_io::net::TcpStream;
    use tokio::net::TcpListener;

    use super::*;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
    }

    async fn stream_pair() -> (Stream<TcpStream>, Stream<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (
            Stream::new(TcpStream::from_tokio(server)),
            Stream::new(TcpStream::from_tokio(client)),
        )
    }

    #[test]
    fn text_echo() {
        rt().block_on(async {
            let (server_io, client_io) = stream_pair().await;
            let mut server = WebSocketConnection::server(server_io, WsConfig::default(), None);
            let mut client = WebSocketConnection::client(client_io, WsConfig::default(), None);

            client.write_text("hello there").await.unwrap();
            let got = server.read_message().await.unwrap().unwrap();
            assert_eq!(got, WsMessage::Text("hello there".to_string()));

            server.write_binary(Bytes::from_static(&[1, 2, 3])).await.unwrap();
            let got = client.read_message().await.unwrap().unwrap();
            assert_eq!(got, WsMessage::Binary(Bytes::from_static(&[1, 2, 3])));
        });
    }

    #[test]
    fn deflate_echo() {
        rt().block_on(async {
            let (server_io, client_io) = stream_pair().await;
            let negotiated = (DeflateConfig::default(), DeflateOptions::default());
            let mut server = WebSocketConnection::server(server_io, WsConfig::default(), Some(negotiated));
            let mut client = WebSocketConnection::client(client_io, WsConfig::default(), Some(negotiated));

            client.write_text("ping").await.unwrap();
            let got = server.read_message().await.unwrap().unwrap();
            assert_eq!(got, WsMessage::Text("ping".to_string()));

            server.write_text("ping").await.unwrap();
            let got = client.read_message().await.unwrap().unwrap();
            assert_eq!(got, WsMessage::Text("ping".to_string()));
        });
    }

    #[test]
    fn deflate_server_frame_has_rsv1_and_no_mask() {
        rt().block_on(async {
            let (server_io, mut client_io) = stream_pair().await;
            let negotiated = (DeflateConfig::default(), DeflateOptions::default());
            let mut server = WebSocketConnection::server(server_io, WsConfig::default(), Some(negotiated));

            server.write_text("ping").await.unwrap();
            let raw = client_io.read_bytes_partial(1024).await.unwrap();
            // fin + rsv1 + text opcode.
            assert_eq!(raw[0], 0xc1);
            // no mask bit on server to client frames.
            assert_eq!(raw[1] & 0x80, 0);
        });
    }

    #[test]
    fn ping_is_answered_with_same_payload() {
        rt().block_on(async {
            let (server_io, client_io) = stream_pair().await;
            let mut server = WebSocketConnection::server(server_io, WsConfig::default(), None);
            let mut client = WebSocketConnection::client(client_io, WsConfig::default(), None);

            client.ping(Bytes::from_static(b"mark")).await.unwrap();
            client.write_text("follow-up").await.unwrap();

            // the server answers the ping while working toward the message.
            let got = server.read_message().await.unwrap().unwrap();
            assert_eq!(got, WsMessage::Text("follow-up".to_string()));

            // the pong precedes this message on the wire and is consumed
            // internally while reading it.
            server.write_text("done").await.unwrap();
            let got = client.read_message().await.unwrap().unwrap();
            assert_eq!(got, WsMessage::Text("done".to_string()));
            assert_eq!(client.last_pong().map(|b| &b[..]), Some(&b"mark"[..]));
        });
    }

    #[test]
    fn close_handshake_echoes_reason() {
        rt().block_on(async {
            let (server_io, client_io) = stream_pair().await;
            let mut server = WebSocketConnection::server(server_io, WsConfig::default(), None);
            let mut client = WebSocketConnection::client(client_io, WsConfig::default(), None);

            client
                .close(Some(CloseReason::from((CloseCode::Normal, "done"))))
                .await
                .unwrap();

            // server observes the close and echoes it.
            assert_eq!(server.read_message().await.unwrap(), None);
            assert_eq!(
                server.close_reason().unwrap(),
                &CloseReason::from((CloseCode::Normal, "done"))
            );

            // client sees the echoed close.
            assert_eq!(client.read_message().await.unwrap(), None);
            assert_eq!(
                client.close_reason().unwrap(),
                &CloseReason::from((CloseCode::Normal, "done"))
            );
        });
    }

    #[test]
    fn missing_pong_aborts_connection() {
        rt().block_on(async {
            let (server_io, mut client_io) = stream_pair().await;
            let config = WsConfig {
                ping_interval: Some(Duration::from_millis(20)),
                ping_timeout: Some(Duration::from_millis(60)),
                ..WsConfig::default()
            };
            let mut server = WebSocketConnection::server(server_io, config, None);

            let started = Instant::now();
            // the peer never answers pings, so the read ends with an abort.
            let got = server.read_message().await.unwrap();
            assert_eq!(got, None);
            assert!(started.elapsed() >= Duration::from_millis(60));
            assert!(started.elapsed() < Duration::from_secs(5));

            // the peer did receive at least one ping frame.
            let raw = client_io.read_bytes_partial(1024).await.unwrap();
            assert_eq!(raw[0], 0x89);
        });
    }

    #[test]
    fn write_after_close_fails() {
        rt().block_on(async {
            let (server_io, _client_io) = stream_pair().await;
            let mut server = WebSocketConnection::server(server_io, WsConfig::default(), None);
            server.close(None).await.unwrap();
            assert!(matches!(server.write_text("nope").await, Err(ProtocolError::Closed)));
        });
    }

    #[test]
    fn fragmented_message_reassembles() {
        rt().block_on(async {
            let (server_io, client_io) = stream_pair().await;
            let mut server = WebSocketConnection::server(server_io, WsConfig::default(), None);
            let mut client_stream = client_io;

            // hand-built fragmented masked message: "he" + "ll" + "o".
            let mut wire = BytesMut::new();
            let mut codec = Codec::new().client_mode();
            codec.encode(
                Message::Continuation(Item::FirstText {
                    payload: Bytes::from_static(b"he"),
                    compressed: false,
                }),
                &mut wire,
            );
            codec.encode(Message::Continuation(Item::Continue(Bytes::from_static(b"ll"))), &mut wire);
            codec.encode(Message::Continuation(Item::Last(Bytes::from_static(b"o"))), &mut wire);
            client_stream.write(wire.freeze()).unwrap();
            client_stream.drain().await.unwrap();

            let got = server.read_message().await.unwrap().unwrap();
            assert_eq!(got, WsMessage::Text("hello".to_string()));
        });
    }

    #[test]
    fn invalid_utf8_text_is_rejected() {
        rt().block_on(async {
            let (server_io, mut client_stream) = stream_pair().await;
            let mut server = WebSocketConnection::server(server_io, WsConfig::default(), None);

            let mut wire = BytesMut::new();
            let mut codec = Codec::new().client_mode();
            codec.encode(
                Message::Text {
                    payload: Bytes::from_static(&[0xff, 0xfe, 0xfd]),
                    compressed: false,
                },
                &mut wire,
            );
            client_stream.write(wire.freeze()).unwrap();
            client_stream.drain().await.unwrap();

            let err = server.read_message().await.unwrap_err();
            assert!(matches!(err, ProtocolError::InvalidUtf8));

            // the violation produced a 1007 close frame on the wire.
            let raw = client_stream.read_bytes_partial(64).await.unwrap();
            assert_eq!(raw[0], 0x88);
            assert_eq!(u16::from_be_bytes([raw[2], raw[3]]), 1007);
        });
    }
}
