//! client-side WebSocket connect.

use bytes::Bytes;
use gale_http::{
    Method, StatusCode, Uri,
    header::{self, HeaderValue},
    proto::{encode::BodySize, head::RequestHead},
};
use gale_io::{io::AsyncIo, net::TcpStream, tls::TlsStream};
use gale_io::resolver::Resolve;
use gale_ws::{
    CloseReason, ProtocolError, WebSocketConnection, WsConfig, WsMessage,
    deflate::{self, DeflateConfig, DeflateOptions},
};
use tracing::debug;

use crate::{
    client::{Client, Connection, Target},
    error::ClientError,
};

/// Options of one websocket connect call.
#[derive(Default)]
pub struct WsConnectOptions {
    pub subprotocols: Vec<String>,
    /// offer permessage-deflate with these parameters.
    pub compression: Option<DeflateOptions>,
    pub config: WsConfig,
}

impl<R: Resolve> Client<R> {
    /// open a websocket connection to a `ws://` or `wss://` url.
    pub async fn websocket_connect(
        &self,
        url: &str,
        options: WsConnectOptions,
    ) -> Result<ClientWebSocket, ClientError> {
        let uri: Uri = url.parse().map_err(|_| ClientError::InvalidUrl("unparseable url"))?;
        let target = Target::from_uri(&uri)?;

        let key = gale_ws::generate_key();

        let mut head = RequestHead::new(Method::GET, uri);
        head.headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        head.headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        head.headers
            .insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        head.headers.insert(
            header::SEC_WEBSOCKET_KEY,
            HeaderValue::from_str(&key).expect("generated key is ascii"),
        );
        if !options.subprotocols.is_empty() {
            let value = options.subprotocols.join(", ");
            head.headers.insert(
                header::SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_str(&value).map_err(|_| ClientError::InvalidUrl("invalid subprotocol"))?,
            );
        }
        if options.compression.is_some() {
            head.headers.insert(
                header::SEC_WEBSOCKET_EXTENSIONS,
                HeaderValue::from_static(DeflateConfig::offer_header()),
            );
        }

        // websockets never reuse pooled connections; each gets its own.
        let conn = self.connect(&target).await?;
        match conn {
            Connection::Plain(conn) => {
                let (ws, subprotocol) = upgrade_on(conn, head, &key, &options).await?;
                Ok(ClientWebSocket {
                    inner: InnerWs::Plain(ws),
                    subprotocol,
                })
            }
            Connection::Tls(conn) => {
                let (ws, subprotocol) = upgrade_on(conn, head, &key, &options).await?;
                Ok(ClientWebSocket {
                    inner: InnerWs::Tls(ws),
                    subprotocol,
                })
            }
        }
    }
}

async fn upgrade_on<Io: AsyncIo>(
    mut conn: gale_http::Http1ClientConnection<Io>,
    head: RequestHead,
    key: &str,
    options: &WsConnectOptions,
) -> Result<(WebSocketConnection<Io>, Option<String>), ClientError> {
    conn.write_request_head(&head, BodySize::None)?;
    conn.finish_request().await?;

    let response = conn.read_response(None).await?;
    if response.status != StatusCode::SWITCHING_PROTOCOLS {
        return Err(ClientError::WebSocket(format!(
            "server refused upgrade with status {}",
            response.status
        )));
    }

    let accept = response
        .headers
        .get(header::SEC_WEBSOCKET_ACCEPT)
        .ok_or_else(|| ClientError::WebSocket("missing Sec-WebSocket-Accept".to_string()))?;
    if !gale_ws::verify_accept(key.as_bytes(), accept.as_bytes()) {
        return Err(ClientError::WebSocket("Sec-WebSocket-Accept mismatch".to_string()));
    }

    let subprotocol = response
        .headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Some(selected) = &subprotocol {
        if !options.subprotocols.iter().any(|p| p == selected) {
            return Err(ClientError::WebSocket(format!(
                "server selected unoffered subprotocol {selected:?}"
            )));
        }
    }

    let deflate = match (
        options.compression,
        response
            .headers
            .get(header::SEC_WEBSOCKET_EXTENSIONS)
            .and_then(|v| v.to_str().ok()),
    ) {
        (Some(opts), Some(value)) => match deflate::parse_response(value) {
            Some(config) => Some((config, opts)),
            None => {
                return Err(ClientError::WebSocket(format!(
                    "unusable extension response {value:?}"
                )));
            }
        },
        (None, Some(_)) => {
            return Err(ClientError::WebSocket("server accepted an unoffered extension".to_string()));
        }
        _ => None,
    };

    debug!(target: "ws_client", "websocket established, deflate: {}", deflate.is_some());
    Ok((
        WebSocketConnection::client(conn.detach(), options.config, deflate),
        subprotocol,
    ))
}

enum InnerWs {
    Plain(WebSocketConnection<TcpStream>),
    Tls(WebSocketConnection<TlsStream<rustls::ClientConnection, TcpStream>>),
}

/// An established client-side websocket over either transport.
pub struct ClientWebSocket {
    inner: InnerWs,
    subprotocol: Option<String>,
}

macro_rules! delegate {
    ($self: ident, $ws: ident => $e: expr) => {
        match &mut $self.inner {
            InnerWs::Plain($ws) => $e,
            InnerWs::Tls($ws) => $e,
        }
    };
}

impl ClientWebSocket {
    /// subprotocol the server selected, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// next complete message; `None` once the connection closed.
    pub async fn read_message(&mut self) -> Result<Option<WsMessage>, ProtocolError> {
        delegate!(self, ws => ws.read_message().await)
    }

    pub async fn write_text(&mut self, text: impl Into<String>) -> Result<(), ProtocolError> {
        let text = text.into();
        delegate!(self, ws => ws.write_text(text).await)
    }

    pub async fn write_binary(&mut self, payload: impl Into<Bytes>) -> Result<(), ProtocolError> {
        let payload = payload.into();
        delegate!(self, ws => ws.write_binary(payload).await)
    }

    pub async fn ping(&mut self, payload: impl Into<Bytes>) -> Result<(), ProtocolError> {
        let payload = payload.into();
        delegate!(self, ws => ws.ping(payload).await)
    }

    pub async fn close(&mut self, reason: Option<CloseReason>) -> Result<(), ProtocolError> {
        delegate!(self, ws => ws.close(reason).await)
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        match &self.inner {
            InnerWs::Plain(ws) => ws.close_reason(),
            InnerWs::Tls(ws) => ws.close_reason(),
        }
    }
}
