use bytes::Bytes;
use gale_http::{HeaderMap, StatusCode, Version, proto::head::ResponseHead};
use serde::de::DeserializeOwned;

/// A complete response: head plus buffered body.
#[derive(Debug)]
pub struct ClientResponse {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub version: Version,
    pub headers: HeaderMap,
    body: Bytes,
}

impl ClientResponse {
    pub(crate) fn new(head: ResponseHead, body: Bytes) -> Self {
        Self {
            status: head.status,
            reason: head.reason,
            version: head.version,
            headers: head.headers,
            body,
        }
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}
