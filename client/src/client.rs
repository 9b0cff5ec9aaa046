use std::{cell::RefCell, collections::HashMap, sync::Arc};

use bytes::Bytes;
use gale_http::{
    Http1ClientConnection, HttpConfig, Method, Uri,
    proto::{encode::BodySize, head::{RequestHead, ResponseHead}},
};
use gale_io::{
    Stream, TcpConnector,
    io::AsyncIo,
    net::TcpStream,
    resolver::{Resolve, ThreadedResolver},
    tls::TlsStream,
};
use gale_runtime::timeout_at;
use rustls::pki_types::ServerName;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{error::ClientError, request::RequestBuilder, response::ClientResponse, timeout::TimeoutConfig};

type PoolKey = (String, u16, bool);

pub(crate) enum Connection {
    Plain(Http1ClientConnection<TcpStream>),
    Tls(Http1ClientConnection<TlsStream<rustls::ClientConnection, TcpStream>>),
}

impl Connection {
    fn reusable(&self) -> bool {
        match self {
            Self::Plain(conn) => conn.reusable(),
            Self::Tls(conn) => conn.reusable(),
        }
    }

    pub(crate) async fn exchange(
        &mut self,
        head: &RequestHead,
        body: &Bytes,
        deadline: Instant,
    ) -> Result<(ResponseHead, Bytes), ClientError> {
        match self {
            Self::Plain(conn) => exchange_on(conn, head, body, deadline).await,
            Self::Tls(conn) => exchange_on(conn, head, body, deadline).await,
        }
    }
}

async fn exchange_on<Io: AsyncIo>(
    conn: &mut Http1ClientConnection<Io>,
    head: &RequestHead,
    body: &Bytes,
    deadline: Instant,
) -> Result<(ResponseHead, Bytes), ClientError> {
    let size = if body.is_empty() && !body_expected(&head.method) {
        BodySize::None
    } else {
        BodySize::Sized(body.len())
    };

    let exchange = async {
        conn.write_request_head(head, size)?;
        if !body.is_empty() {
            conn.write_body_chunk(body.clone())?;
        }
        conn.finish_request().await?;

        let response = conn.read_response(Some(deadline)).await?;
        let body = conn.read_body().await?;
        Ok::<_, ClientError>((response, body))
    };

    timeout_at(deadline, exchange).await.map_err(|_| ClientError::Timeout)?
}

fn body_expected(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Connection settings, collected through the builder.
pub struct ClientBuilder<R = ThreadedResolver> {
    resolver: R,
    timeouts: TimeoutConfig,
    tls: Option<Arc<rustls::ClientConfig>>,
    http: HttpConfig,
    user_agent: Option<String>,
}

impl ClientBuilder<ThreadedResolver> {
    pub fn new() -> Self {
        Self {
            resolver: ThreadedResolver,
            timeouts: TimeoutConfig::default(),
            tls: None,
            http: HttpConfig::default(),
            user_agent: None,
        }
    }
}

impl Default for ClientBuilder<ThreadedResolver> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Resolve> ClientBuilder<R> {
    /// swap in a custom resolver (e.g. an
    /// [OverrideResolver](gale_io::OverrideResolver) for tests).
    pub fn resolver<R2: Resolve>(self, resolver: R2) -> ClientBuilder<R2> {
        ClientBuilder {
            resolver,
            timeouts: self.timeouts,
            tls: self.tls,
            http: self.http,
            user_agent: self.user_agent,
        }
    }

    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// TLS configuration used for `https`/`wss` urls. without one such
    /// urls fail with [ClientError::Tls].
    pub fn tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    pub fn http_config(mut self, config: HttpConfig) -> Self {
        self.http = config;
        self
    }

    pub fn user_agent(mut self, value: impl Into<String>) -> Self {
        self.user_agent = Some(value.into());
        self
    }

    pub fn finish(self) -> Client<R> {
        Client {
            connector: TcpConnector::new(self.resolver),
            timeouts: self.timeouts,
            tls: self.tls,
            http: self.http,
            user_agent: self.user_agent,
            pool: RefCell::new(HashMap::new()),
        }
    }
}

/// HTTP/1.1 client keeping one reusable connection per authority.
pub struct Client<R: Resolve = ThreadedResolver> {
    pub(crate) connector: TcpConnector<R>,
    pub(crate) timeouts: TimeoutConfig,
    pub(crate) tls: Option<Arc<rustls::ClientConfig>>,
    pub(crate) http: HttpConfig,
    pub(crate) user_agent: Option<String>,
    pool: RefCell<HashMap<PoolKey, Connection>>,
}

impl Client<ThreadedResolver> {
    pub fn new() -> Self {
        ClientBuilder::new().finish()
    }

    pub fn builder() -> ClientBuilder<ThreadedResolver> {
        ClientBuilder::new()
    }
}

impl Default for Client<ThreadedResolver> {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! method {
    ($name: ident, $method: ident) => {
        #[doc = concat!("start a ", stringify!($method), " request to `url`.")]
        pub fn $name(&self, url: impl Into<String>) -> RequestBuilder<'_, R> {
            RequestBuilder::new(self, Method::$method, url.into())
        }
    };
}

impl<R: Resolve> Client<R> {
    method!(get, GET);
    method!(post, POST);
    method!(put, PUT);
    method!(patch, PATCH);
    method!(delete, DELETE);
    method!(head, HEAD);
    method!(options, OPTIONS);

    pub(crate) fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    /// run one request/response exchange.
    pub(crate) async fn execute(&self, head: RequestHead, body: Bytes) -> Result<ClientResponse, ClientError> {
        let deadline = Instant::now() + self.timeouts.request;
        let target = Target::from_uri(&head.target)?;
        let key = target.pool_key();

        // at most one connection per authority is kept; a request takes it
        // out and puts it back when still reusable afterwards.
        let pooled = self.pool.borrow_mut().remove(&key);
        let mut conn = match pooled {
            Some(conn) => {
                trace!(target: "client", "reusing pooled connection to {}:{}", target.host, target.port);
                conn
            }
            None => self.connect(&target).await?,
        };

        let result = conn.exchange(&head, &body, deadline).await;

        match result {
            Ok((response, body)) => {
                if conn.reusable() {
                    self.pool.borrow_mut().insert(key, conn);
                }
                Ok(ClientResponse::new(response, body))
            }
            Err(e) => {
                debug!(target: "client", "exchange with {}:{} failed: {e}", target.host, target.port);
                Err(e)
            }
        }
    }

    pub(crate) async fn connect(&self, target: &Target) -> Result<Connection, ClientError> {
        let stream = self
            .connector
            .connect(&target.host, target.port, None, Some(self.timeouts.connect))
            .await?;

        if target.tls {
            let stream = self.start_tls(stream, &target.host).await?;
            Ok(Connection::Tls(Http1ClientConnection::new(stream, self.http.clone())))
        } else {
            Ok(Connection::Plain(Http1ClientConnection::new(stream, self.http.clone())))
        }
    }

    pub(crate) async fn start_tls(
        &self,
        stream: Stream<TcpStream>,
        host: &str,
    ) -> Result<Stream<TlsStream<rustls::ClientConnection, TcpStream>>, ClientError> {
        let config = self
            .tls
            .clone()
            .ok_or_else(|| ClientError::Tls("no tls configuration supplied".to_string()))?;
        let name = ServerName::try_from(host.to_string()).map_err(|e| ClientError::Tls(e.to_string()))?;
        let session = rustls::ClientConnection::new(config, name).map_err(|e| ClientError::Tls(e.to_string()))?;
        stream.start_tls(session).await.map_err(|e| ClientError::Tls(e.to_string()))
    }
}

/// scheme/host/port triple a url resolves to.
pub(crate) struct Target {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Target {
    pub(crate) fn from_uri(uri: &Uri) -> Result<Self, ClientError> {
        let host = uri.host().ok_or(ClientError::InvalidUrl("missing host"))?.to_string();
        let tls = match uri.scheme_str() {
            Some("http" | "ws") => false,
            Some("https" | "wss") => true,
            _ => return Err(ClientError::InvalidUrl("unsupported scheme")),
        };
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
        Ok(Self { host, port, tls })
    }

    fn pool_key(&self) -> PoolKey {
        (self.host.clone(), self.port, self.tls)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn target_parsing() {
        let t = Target::from_uri(&Uri::from_static("http://example.com/path")).unwrap();
        assert_eq!((t.host.as_str(), t.port, t.tls), ("example.com", 80, false));

        let t = Target::from_uri(&Uri::from_static("https://example.com:8443/")).unwrap();
        assert_eq!((t.host.as_str(), t.port, t.tls), ("example.com", 8443, true));

        let t = Target::from_uri(&Uri::from_static("ws://example.com/chat")).unwrap();
        assert_eq!((t.host.as_str(), t.port, t.tls), ("example.com", 80, false));

        let t = Target::from_uri(&Uri::from_static("wss://example.com/chat")).unwrap();
        assert_eq!((t.host.as_str(), t.port, t.tls), ("example.com", 443, true));

        assert!(Target::from_uri(&Uri::from_static("ftp://example.com/")).is_err());
        assert!(Target::from_uri(&Uri::from_static("/relative/only")).is_err());
    }
}
