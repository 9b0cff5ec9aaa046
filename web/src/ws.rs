//! WebSocket upgrade handling inside the dispatcher.

use std::{cell::RefCell, rc::Rc};

use async_trait::async_trait;
use bytes::Bytes;
use gale_http::{
    Http1Connection, StatusCode,
    header::{self, HeaderValue},
    proto::{encode::BodySize, head::{RequestHead, ResponseHead}},
};
use gale_io::io::AsyncIo;
use gale_ws::{
    CloseReason, HandshakeError, ProtocolError, WebSocketConnection, WsConfig, WsMessage,
    deflate::{self, DeflateConfig, DeflateOptions},
};
use tracing::{debug, info, warn};

use crate::{request::HttpRequest, settings::Settings};

/// A WebSocket endpoint. One instance serves exactly one connection, from
/// upgrade to close.
#[async_trait(?Send)]
pub trait WebSocketHandler {
    /// origin policy. the default accepts only same-host browsers (and
    /// non-browser clients that send no `Origin` at all).
    fn check_origin(&self, origin: &str, host: Option<&str>) -> bool {
        let origin_host = origin
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(origin)
            .split('/')
            .next()
            .unwrap_or("");
        match host {
            Some(host) => origin_host.eq_ignore_ascii_case(host),
            None => false,
        }
    }

    /// pick one of the subprotocols the client offered.
    fn select_subprotocol(&self, _offered: &[&str]) -> Option<String> {
        None
    }

    /// the connection is established.
    async fn open(&mut self, _ws: &mut WsSession<'_>, _request: &HttpRequest) {}

    /// one complete message arrived.
    async fn on_message(&mut self, _ws: &mut WsSession<'_>, _message: WsMessage) {}

    /// a pong frame arrived.
    fn on_pong(&mut self, _payload: &[u8]) {}

    /// the connection ended. `reason` is the peer's close reason when the
    /// closing handshake completed.
    fn on_close(&mut self, _reason: Option<&CloseReason>) {}
}

/// write half of an established WebSocket, independent of the socket type.
#[async_trait(?Send)]
trait WsChannel {
    async fn write_text(&mut self, text: String) -> Result<(), ProtocolError>;
    async fn write_binary(&mut self, payload: Bytes) -> Result<(), ProtocolError>;
    async fn ping(&mut self, payload: Bytes) -> Result<(), ProtocolError>;
    async fn close(&mut self, reason: Option<CloseReason>) -> Result<(), ProtocolError>;
}

#[async_trait(?Send)]
impl<Io: AsyncIo> WsChannel for WebSocketConnection<Io> {
    async fn write_text(&mut self, text: String) -> Result<(), ProtocolError> {
        WebSocketConnection::write_text(self, text).await
    }

    async fn write_binary(&mut self, payload: Bytes) -> Result<(), ProtocolError> {
        WebSocketConnection::write_binary(self, payload).await
    }

    async fn ping(&mut self, payload: Bytes) -> Result<(), ProtocolError> {
        WebSocketConnection::ping(self, payload).await
    }

    async fn close(&mut self, reason: Option<CloseReason>) -> Result<(), ProtocolError> {
        WebSocketConnection::close(self, reason).await
    }
}

/// Handle onto the connection passed into [WebSocketHandler] callbacks.
pub struct WsSession<'a> {
    chan: &'a mut dyn WsChannel,
}

impl WsSession<'_> {
    pub async fn write_text(&mut self, text: impl Into<String>) -> Result<(), ProtocolError> {
        self.chan.write_text(text.into()).await
    }

    pub async fn write_binary(&mut self, payload: impl Into<Bytes>) -> Result<(), ProtocolError> {
        self.chan.write_binary(payload.into()).await
    }

    pub async fn ping(&mut self, payload: impl Into<Bytes>) -> Result<(), ProtocolError> {
        self.chan.ping(payload.into()).await
    }

    pub async fn close(&mut self, reason: Option<CloseReason>) -> Result<(), ProtocolError> {
        self.chan.close(reason).await
    }
}

/// negotiate the upgrade and run the message loop until close.
pub(crate) async fn serve_websocket<Io: AsyncIo + 'static>(
    settings: &Settings,
    mut conn: Http1Connection<Io>,
    head: RequestHead,
    request: HttpRequest,
    handler: Box<dyn WebSocketHandler>,
) {
    let accept = match gale_ws::handshake(&head.method, head.version, &head.headers) {
        Ok(response) => response,
        Err(e) => {
            debug!(target: "ws_upgrade", "rejecting websocket upgrade: {e}");
            let status = match e {
                HandshakeError::GetMethodRequired => StatusCode::METHOD_NOT_ALLOWED,
                HandshakeError::UnsupportedVersion => StatusCode::UPGRADE_REQUIRED,
                _ => StatusCode::BAD_REQUEST,
            };
            let mut response = ResponseHead::new(status);
            if status == StatusCode::METHOD_NOT_ALLOWED {
                response.headers.insert(header::ALLOW, HeaderValue::from_static("GET"));
            }
            if status == StatusCode::UPGRADE_REQUIRED {
                response
                    .headers
                    .insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
            }
            respond_and_close(&mut conn, response).await;
            return;
        }
    };

    // browsers always send Origin on websocket requests; its absence means
    // a non-browser client which the policy hook sees as trusted.
    if let Some(origin) = head.headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        if !handler.check_origin(origin, request.host()) {
            info!(target: "ws_upgrade", "origin {origin} rejected");
            respond_and_close(&mut conn, ResponseHead::new(StatusCode::FORBIDDEN)).await;
            return;
        }
    }

    let mut response = ResponseHead::new(StatusCode::SWITCHING_PROTOCOLS);
    response.headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    response.headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    response.headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept.accept());

    // subprotocol selection.
    if let Some(offered) = head
        .headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
    {
        let offered: Vec<&str> = offered.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
        if let Some(selected) = handler.select_subprotocol(&offered) {
            match HeaderValue::from_str(&selected) {
                Ok(value) => {
                    response.headers.insert(header::SEC_WEBSOCKET_PROTOCOL, value);
                }
                Err(_) => warn!(target: "ws_upgrade", "selected subprotocol is not header-safe, skipping"),
            }
        }
    }

    // permessage-deflate negotiation.
    let deflate: Option<(DeflateConfig, DeflateOptions)> = settings.websocket_compression.and_then(|options| {
        let offers = head
            .headers
            .get(header::SEC_WEBSOCKET_EXTENSIONS)
            .and_then(|v| v.to_str().ok())?;
        let config = deflate::negotiate(offers, &options)?;
        Some((config, options))
    });
    if let Some((config, _)) = &deflate {
        match HeaderValue::from_str(&config.response_header()) {
            Ok(value) => {
                response.headers.insert(header::SEC_WEBSOCKET_EXTENSIONS, value);
            }
            Err(_) => warn!(target: "ws_upgrade", "extension response header unserializable"),
        }
    }

    if conn.write_response_head(&response, BodySize::None).is_err() {
        return;
    }
    if conn.finish_response().await.is_err() {
        return;
    }

    let config = WsConfig {
        max_message_size: settings.websocket_max_message_size,
        ping_interval: settings.websocket_ping_interval,
        ping_timeout: settings.websocket_ping_timeout,
    };
    let ws = WebSocketConnection::server(conn.detach(), config, deflate);

    run_session(ws, request, handler).await;
}

async fn run_session<Io: AsyncIo + 'static>(
    mut ws: WebSocketConnection<Io>,
    request: HttpRequest,
    handler: Box<dyn WebSocketHandler>,
) {
    let handler = Rc::new(RefCell::new(handler));

    let pong_handler = handler.clone();
    ws.set_pong_callback(move |payload| {
        pong_handler.borrow_mut().on_pong(payload);
    });

    {
        let mut session = WsSession { chan: &mut ws };
        let mut handler = handler.borrow_mut();
        handler.open(&mut session, &request).await;
    }

    loop {
        match ws.read_message().await {
            Ok(Some(message)) => {
                let mut session = WsSession { chan: &mut ws };
                let mut handler = handler.borrow_mut();
                handler.on_message(&mut session, message).await;
            }
            Ok(None) => break,
            Err(e) => {
                debug!(target: "ws_conn", "websocket terminated on protocol error: {e}");
                break;
            }
        }
    }

    let reason = ws.close_reason().cloned();
    handler.borrow_mut().on_close(reason.as_ref());
}

async fn respond_and_close<Io: AsyncIo>(conn: &mut Http1Connection<Io>, head: ResponseHead) {
    conn.set_close();
    if conn.write_response_head(&head, BodySize::Sized(0)).is_ok() {
        let _ = conn.finish_response().await;
    }
}
