use bytes::Bytes;
use gale_http::{
    Method, Uri,
    header::{HeaderValue, IntoHeaderName, USER_AGENT},
    proto::head::RequestHead,
};
use gale_io::resolver::Resolve;
use serde::Serialize;

use crate::{client::Client, error::ClientError, response::ClientResponse};

/// A request under construction; [RequestBuilder::send] runs it.
pub struct RequestBuilder<'c, R: Resolve> {
    client: &'c Client<R>,
    head: Result<RequestHead, ClientError>,
    body: Bytes,
}

impl<'c, R: Resolve> RequestBuilder<'c, R> {
    pub(crate) fn new(client: &'c Client<R>, method: Method, url: String) -> Self {
        let head = url
            .parse::<Uri>()
            .map_err(|_| ClientError::InvalidUrl("unparseable url"))
            .map(|uri| RequestHead::new(method, uri));
        Self {
            client,
            head,
            body: Bytes::new(),
        }
    }

    /// add a request header.
    pub fn header<K: IntoHeaderName>(mut self, name: K, value: &str) -> Self {
        self.head = match (self.head, HeaderValue::from_str(value)) {
            (Ok(mut head), Ok(value)) => {
                head.headers.append(name, value);
                Ok(head)
            }
            (Ok(_), Err(_)) => Err(ClientError::InvalidUrl("invalid header value")),
            (Err(e), _) => Err(e),
        };
        self
    }

    /// set the request body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// set a JSON request body with the matching content type.
    pub fn json<T: Serialize>(mut self, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => {
                self.body = Bytes::from(body);
                self.header(gale_http::header::CONTENT_TYPE, "application/json")
            }
            Err(_) => {
                self.head = Err(ClientError::InvalidUrl("unserializable json body"));
                self
            }
        }
    }

    /// run the request and buffer the response.
    pub async fn send(self) -> Result<ClientResponse, ClientError> {
        let mut head = self.head?;
        if let Some(agent) = self.client.user_agent() {
            if !head.headers.contains_key(USER_AGENT) {
                if let Ok(value) = HeaderValue::from_str(agent) {
                    head.headers.insert(USER_AGENT, value);
                }
            }
        }
        self.client.execute(head, self.body).await
    }
}
