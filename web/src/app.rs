use core::net::SocketAddr;

use std::rc::Rc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use gale_http::{
    Http1Connection, Method, ProtoError, StatusCode,
    header::{self, HeaderValue},
    proto::{encode::BodySize, head::{RequestHead, ResponseHead}},
};
use gale_io::{Listener, Stream, io::AsyncIo};
use gale_router::{Params, Router, Rule};
use tracing::{debug, error, info, warn};

use crate::{
    error::HttpError,
    handler::{Handler, HttpChannel, RequestContext},
    request::HttpRequest,
    settings::Settings,
    static_files::{StaticFileHandler, StaticFiles},
    ws::{WebSocketHandler, serve_websocket},
};

/// methods that mutate state and therefore require an XSRF token when the
/// protection is enabled.
const UNSAFE_METHODS: &[Method] = &[Method::POST, Method::PUT, Method::PATCH, Method::DELETE];

const ALLOWED_METHODS: &str = "DELETE, GET, HEAD, OPTIONS, PATCH, POST, PUT";

/// Routing target: a plain request handler or a websocket endpoint.
#[derive(Clone)]
pub enum RouteTarget {
    Http(Rc<dyn Fn() -> Box<dyn Handler>>),
    WebSocket(Rc<dyn Fn() -> Box<dyn WebSocketHandler>>),
}

impl RouteTarget {
    pub fn http<H, F>(factory: F) -> Self
    where
        H: Handler + 'static,
        F: Fn() -> H + 'static,
    {
        Self::Http(Rc::new(move || Box::new(factory())))
    }

    pub fn websocket<H, F>(factory: F) -> Self
    where
        H: WebSocketHandler + 'static,
        F: Fn() -> H + 'static,
    {
        Self::WebSocket(Rc::new(move || Box::new(factory())))
    }
}

/// The application: a router over handler factories plus settings.
///
/// Constructed once, shared by every connection on the loop via `Rc`.
pub struct App {
    router: Router<RouteTarget>,
    settings: Rc<Settings>,
    static_files: Option<Rc<StaticFiles>>,
}

impl App {
    pub fn new(settings: Settings) -> Self {
        let settings = Rc::new(settings);
        let static_files = settings.static_path.clone().map(|root| {
            Rc::new(StaticFiles::new(
                root,
                settings.static_url_prefix.clone(),
                settings.default_filename.clone(),
            ))
        });

        let mut router = Router::new();
        if static_files.is_some() {
            let pattern = format!("{}(.*)", regex::escape(&settings.static_url_prefix));
            router
                .route(&pattern, RouteTarget::http(|| StaticFileHandler))
                .expect("static prefix compiles as a route pattern");
        }

        Self {
            router,
            settings,
            static_files,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// register a handler for a path pattern.
    pub fn handler<H, F>(mut self, pattern: &str, factory: F) -> Self
    where
        H: Handler + 'static,
        F: Fn() -> H + 'static,
    {
        self.router
            .route(pattern, RouteTarget::http(factory))
            .unwrap_or_else(|e| panic!("route {pattern:?}: {e}"));
        self
    }

    /// register a websocket endpoint for a path pattern.
    pub fn websocket<H, F>(mut self, pattern: &str, factory: F) -> Self
    where
        H: WebSocketHandler + 'static,
        F: Fn() -> H + 'static,
    {
        self.router
            .route(pattern, RouteTarget::websocket(factory))
            .unwrap_or_else(|e| panic!("route {pattern:?}: {e}"));
        self
    }

    /// register a fully configured rule (host patterns, method sets).
    pub fn rule(mut self, rule: Rule<RouteTarget>) -> Self {
        self.router.add(rule);
        self
    }

    /// accept connections forever, one task per connection.
    pub async fn serve(self, listener: Listener) -> std::io::Result<()> {
        let app = Rc::new(self);
        loop {
            let (stream, addr) = listener.accept().await?;
            let app = app.clone();
            gale_runtime::spawn(async move {
                handle_connection(app, stream, addr, "http").await;
            });
        }
    }
}

/// serve one accepted connection to completion.
pub async fn handle_connection<Io: AsyncIo + 'static>(
    app: Rc<App>,
    stream: Stream<Io>,
    addr: SocketAddr,
    protocol: &'static str,
) {
    let mut conn = Http1Connection::new(stream, app.settings.http.clone());

    loop {
        let head = match conn.read_request().await {
            Ok(Some(head)) => head,
            Ok(None) => return,
            Err(e) => {
                if e.is_input_error() {
                    debug!(target: "web", "malformed request from {addr}: {e}");
                    bad_request_response(&mut conn, &e).await;
                } else {
                    debug!(target: "web", "connection from {addr} failed: {e}");
                }
                return;
            }
        };

        let host = head
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let path = head.target.path().to_string();

        let (target, params) = match app.router.at(&path, host.as_deref(), &head.method) {
            Some(found) => (found.value.clone(), found.params),
            None => (RouteTarget::http(move || NotFoundHandler), Params::default()),
        };

        match target {
            RouteTarget::Http(factory) => {
                let handler = factory();
                if serve_request(&app, &mut conn, head, params, handler, addr, protocol).await.is_err() {
                    conn.set_close();
                }
            }
            RouteTarget::WebSocket(factory) => {
                let request = HttpRequest::new(
                    RequestHead {
                        method: head.method.clone(),
                        target: head.target.clone(),
                        version: head.version,
                        headers: head.headers.clone(),
                        expect_continue: false,
                    },
                    Bytes::new(),
                    addr,
                    protocol,
                    params,
                );
                serve_websocket(&app.settings, conn, head, request, factory()).await;
                return;
            }
        }

        if !conn.reusable() {
            return;
        }
    }
}

/// drive one request through a handler, translating failures into error
/// responses.
async fn serve_request<Io: AsyncIo + 'static>(
    app: &Rc<App>,
    conn: &mut Http1Connection<Io>,
    head: RequestHead,
    params: Params,
    mut handler: Box<dyn Handler>,
    addr: SocketAddr,
    protocol: &'static str,
) -> Result<(), ProtoError> {
    let method = head.method.clone();
    let path = head.target.path().to_string();
    let started = std::time::Instant::now();

    let streaming = handler.streaming_body();
    let expect_continue = head.expect_continue;

    // buffered mode: consume the body before the handler runs so form
    // arguments are available to it.
    let body = if streaming {
        Bytes::new()
    } else {
        if expect_continue {
            conn.send_continue().await?;
        }
        let mut buf = BytesMut::new();
        loop {
            match conn.read_body_chunk().await {
                Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(e) if e.is_input_error() => {
                    bad_request_response(conn, &e).await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
        buf.freeze()
    };

    let request = HttpRequest::new(head, body, addr, protocol, params);
    let mut ctx = RequestContext::new(request, app.settings.clone(), app.static_files.clone(), conn);

    let outcome = run_handler(handler.as_mut(), &mut ctx, streaming, expect_continue).await;

    match outcome {
        Ok(()) => {
            if !ctx.finished() {
                if let Err(e) = ctx.finish().await {
                    warn!(target: "web", "finishing response failed: {e}");
                    return Err(ProtoError::State("finish failed"));
                }
            }
        }
        Err(err) => {
            respond_error(handler.as_mut(), &mut ctx, err).await?;
        }
    }

    let status = ctx.status();
    handler.on_finish();
    log_request(status, &method, &path, addr, started.elapsed());
    Ok(())
}

async fn run_handler(
    handler: &mut dyn Handler,
    ctx: &mut RequestContext<'_>,
    streaming: bool,
    expect_continue: bool,
) -> Result<(), HttpError> {
    handler.set_default_headers(ctx);

    // the XSRF check runs before any handler code touches the request.
    if ctx.settings().xsrf_cookies && UNSAFE_METHODS.contains(&ctx.request.method) {
        ctx.check_xsrf_cookie()?;
    }

    handler.prepare(ctx).await?;
    if ctx.finished() {
        return Ok(());
    }

    if streaming {
        if expect_continue {
            ctx.send_continue().await?;
        }
        while let Some(chunk) = ctx.read_body_chunk().await? {
            handler.data_received(ctx, chunk).await?;
        }
    }

    match ctx.request.method.clone() {
        Method::GET => handler.get(ctx).await,
        Method::HEAD => handler.head(ctx).await,
        Method::POST => handler.post(ctx).await,
        Method::PUT => handler.put(ctx).await,
        Method::PATCH => handler.patch(ctx).await,
        Method::DELETE => handler.delete(ctx).await,
        Method::OPTIONS => handler.options(ctx).await,
        _ => Err(HttpError::method_not_allowed()),
    }
}

/// reset the response and render `err` through the handler's error hook.
async fn respond_error(
    handler: &mut dyn Handler,
    ctx: &mut RequestContext<'_>,
    err: HttpError,
) -> Result<(), ProtoError> {
    if err.status.is_server_error() {
        error!(target: "web", "{} {} failed: {err}", ctx.request.method, ctx.request.path());
    } else {
        info!(target: "web", "{} {} rejected: {err}", ctx.request.method, ctx.request.path());
    }

    if ctx.headers_written() {
        // the preamble is on the wire; the only honest option left is to
        // drop the connection mid-body.
        warn!(target: "web", "error after response started, closing connection");
        return Err(ProtoError::State("error after response started"));
    }

    ctx.clear();
    if err.status == StatusCode::METHOD_NOT_ALLOWED {
        ctx.set_header(header::ALLOW, ALLOWED_METHODS);
    }
    if let Err(render_err) = handler.write_error(ctx, &err).await {
        warn!(target: "web", "error page rendering failed: {render_err}");
        ctx.clear();
        ctx.set_status(StatusCode::INTERNAL_SERVER_ERROR);
    }
    if !ctx.finished() {
        ctx.finish().await.map_err(|_| ProtoError::State("finish failed"))?;
    }
    Ok(())
}

/// minimal 400 answer for requests that never reached a handler.
async fn bad_request_response<Io: AsyncIo>(conn: &mut Http1Connection<Io>, e: &ProtoError) {
    conn.set_close();
    let status = match e {
        ProtoError::HeaderTooLarge => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
        ProtoError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::BAD_REQUEST,
    };
    let mut head = ResponseHead::new(status);
    head.headers
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    if conn.write_response_head(&head, BodySize::Sized(0)).is_ok() {
        let _ = conn.finish_response().await;
    }
}

fn log_request(status: StatusCode, method: &Method, path: &str, addr: SocketAddr, elapsed: std::time::Duration) {
    let millis = elapsed.as_secs_f64() * 1000.0;
    if status.is_server_error() {
        error!(target: "access", "{} {} {} ({}) {:.2}ms", status.as_u16(), method, path, addr.ip(), millis);
    } else if status.is_client_error() {
        warn!(target: "access", "{} {} {} ({}) {:.2}ms", status.as_u16(), method, path, addr.ip(), millis);
    } else {
        info!(target: "access", "{} {} {} ({}) {:.2}ms", status.as_u16(), method, path, addr.ip(), millis);
    }
}

/// fallback handler for unrouted paths.
struct NotFoundHandler;

#[async_trait(?Send)]
impl Handler for NotFoundHandler {
    async fn prepare(&mut self, _ctx: &mut RequestContext<'_>) -> Result<(), HttpError> {
        Err(HttpError::not_found())
    }
}

#[async_trait(?Send)]
impl<Io: AsyncIo> HttpChannel for Http1Connection<Io> {
    fn write_head(&mut self, head: &ResponseHead, body: BodySize) -> Result<(), ProtoError> {
        self.write_response_head(head, body)
    }

    fn queue_chunk(&mut self, chunk: Bytes) -> Result<(), ProtoError> {
        self.write_body_chunk(chunk).map(|_| ())
    }

    async fn flush_io(&mut self) -> Result<(), ProtoError> {
        self.stream().drain().await.map_err(ProtoError::from)
    }

    async fn finish_io(&mut self) -> Result<(), ProtoError> {
        self.finish_response().await
    }

    async fn read_body_chunk(&mut self) -> Result<Option<Bytes>, ProtoError> {
        Http1Connection::read_body_chunk(self).await
    }

    async fn send_continue(&mut self) -> Result<(), ProtoError> {
        Http1Connection::send_continue(self).await
    }
}

/// convenience: bind and serve in one call.
pub async fn listen_and_serve(app: App, addr: SocketAddr) -> std::io::Result<()> {
    let listener = Listener::bind(addr)?;
    info!(target: "web", "listening on {}", listener.local_addr()?);
    app.serve(listener).await
}
