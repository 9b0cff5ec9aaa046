//! WebSocket protocol (RFC 6455) for gale.
//!
//! [handshake] verifies an upgrade request and produces the `101` response
//! headers. The frame [codec](Codec) and [deflate] negotiation are pure;
//! [WebSocketConnection](conn::WebSocketConnection) owns a detached stream
//! and runs the message loop with ping keep-alive.

#![forbid(unsafe_code)]

mod codec;
mod error;
mod frame;
mod mask;
mod proto;

pub mod conn;
pub mod deflate;

pub use self::{
    codec::{Codec, Item, Message},
    conn::{WebSocketConnection, WsConfig, WsMessage},
    error::{HandshakeError, ProtocolError},
    frame::{Frame, Parser},
    proto::{CloseCode, CloseReason, OpCode, hash_key},
};

use http::{
    HeaderMap, Method, Version,
    header::{self, HeaderValue},
};

/// Verify a server-side WebSocket handshake request and produce the header
/// values of the `101 Switching Protocols` response.
///
/// Origin policy and subprotocol selection stay with the caller; deflate
/// negotiation is separate, see [deflate::negotiate].
pub fn handshake(method: &Method, version: Version, headers: &HeaderMap) -> Result<HandshakeResponse, HandshakeError> {
    let key = verify_handshake(method, version, headers)?;
    Ok(HandshakeResponse {
        accept: accept_value(key),
    })
}

/// Accept header material for a successful handshake.
#[derive(Debug)]
pub struct HandshakeResponse {
    accept: [u8; 28],
}

impl HandshakeResponse {
    /// value of the `Sec-WebSocket-Accept` header.
    pub fn accept(&self) -> HeaderValue {
        // base64 output is always header-safe ascii.
        HeaderValue::from_bytes(&self.accept).unwrap()
    }
}

fn verify_handshake<'a>(
    method: &Method,
    version: Version,
    headers: &'a HeaderMap,
) -> Result<&'a [u8], HandshakeError> {
    if method != Method::GET {
        return Err(HandshakeError::GetMethodRequired);
    }

    if version != Version::HTTP_11 {
        return Err(HandshakeError::WrongHttpVersion);
    }

    let has_upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !has_upgrade {
        return Err(HandshakeError::NoWebsocketUpgrade);
    }

    let has_connection_upgrade = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    if !has_connection_upgrade {
        return Err(HandshakeError::NoConnectionUpgrade);
    }

    match headers.get(header::SEC_WEBSOCKET_VERSION) {
        Some(version) if version == "13" => {}
        Some(_) => return Err(HandshakeError::UnsupportedVersion),
        None => return Err(HandshakeError::NoVersionHeader),
    }

    headers
        .get(header::SEC_WEBSOCKET_KEY)
        .map(|v| v.as_bytes())
        .ok_or(HandshakeError::BadWebsocketKey)
}

fn accept_value(key: &[u8]) -> [u8; 28] {
    proto::hash_key(key)
}

/// generate a random client handshake key.
pub fn generate_key() -> String {
    use base64::engine::Engine;
    use rand::Rng;

    let bytes: [u8; 16] = rand::thread_rng().r#gen();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// validate the `Sec-WebSocket-Accept` value a server replied with.
pub fn verify_accept(key: &[u8], accept: &[u8]) -> bool {
    proto::hash_key(key) == accept
}

#[cfg(test)]
mod test {
    use super::*;

    fn upgrade_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        headers.insert(
            header::SEC_WEBSOCKET_KEY,
            HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="),
        );
        headers
    }

    #[test]
    fn rfc_sample_accept_value() {
        let response = handshake(&Method::GET, Version::HTTP_11, &upgrade_headers()).unwrap();
        assert_eq!(response.accept(), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn handshake_requires_get() {
        let err = handshake(&Method::POST, Version::HTTP_11, &upgrade_headers()).unwrap_err();
        assert_eq!(err, HandshakeError::GetMethodRequired);
    }

    #[test]
    fn handshake_requires_http11() {
        let err = handshake(&Method::GET, Version::HTTP_10, &upgrade_headers()).unwrap_err();
        assert_eq!(err, HandshakeError::WrongHttpVersion);
    }

    #[test]
    fn handshake_requires_version_13() {
        let mut headers = upgrade_headers();
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("8"));
        let err = handshake(&Method::GET, Version::HTTP_11, &headers).unwrap_err();
        assert_eq!(err, HandshakeError::UnsupportedVersion);
    }

    #[test]
    fn handshake_requires_upgrade_headers() {
        let mut headers = upgrade_headers();
        headers.remove(header::UPGRADE);
        assert_eq!(
            handshake(&Method::GET, Version::HTTP_11, &headers).unwrap_err(),
            HandshakeError::NoWebsocketUpgrade
        );

        let mut headers = upgrade_headers();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        assert_eq!(
            handshake(&Method::GET, Version::HTTP_11, &headers).unwrap_err(),
            HandshakeError::NoConnectionUpgrade
        );
    }

    #[test]
    fn generated_keys_verify() {
        let key = generate_key();
        assert_eq!(key.len(), 24);
        let accept = accept_value(key.as_bytes());
        assert!(verify_accept(key.as_bytes(), &accept));
        assert!(!verify_accept(b"another key here....", &accept));
    }
}
