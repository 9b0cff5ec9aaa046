use std::rc::Rc;

use async_trait::async_trait;
use bytes::Bytes;
use cookie::Cookie;
use gale_http::{
    ProtoError, StatusCode,
    header::{self, HeaderMap, HeaderName, HeaderValue, IntoHeaderName},
    proto::{encode::BodySize, head::ResponseHead},
};
use serde::Serialize;
use tracing::warn;

use crate::{
    error::HttpError,
    request::HttpRequest,
    settings::Settings,
    signed,
    static_files::StaticFiles,
    transform::GzipTransform,
    xsrf::XsrfToken,
};

/// access to the underlying connection, independent of its socket type.
#[async_trait(?Send)]
pub(crate) trait HttpChannel {
    fn write_head(&mut self, head: &ResponseHead, body: BodySize) -> Result<(), ProtoError>;
    fn queue_chunk(&mut self, chunk: Bytes) -> Result<(), ProtoError>;
    /// push queued bytes to the socket.
    async fn flush_io(&mut self) -> Result<(), ProtoError>;
    /// terminate the response framing and push everything out.
    async fn finish_io(&mut self) -> Result<(), ProtoError>;
    /// next request body chunk, for streaming handlers.
    async fn read_body_chunk(&mut self) -> Result<Option<Bytes>, ProtoError>;
    /// emit the interim 100 Continue response.
    async fn send_continue(&mut self) -> Result<(), ProtoError>;
}

/// Per-request state shared by the dispatcher and the handler: the parsed
/// request plus the response under construction.
pub struct RequestContext<'a> {
    pub request: HttpRequest,

    settings: Rc<Settings>,
    static_files: Option<Rc<StaticFiles>>,
    channel: &'a mut dyn HttpChannel,

    status: StatusCode,
    reason: Option<String>,
    headers: HeaderMap,
    body: Vec<Bytes>,
    body_len: usize,
    transform: Option<GzipTransform>,
    headers_written: bool,
    finished: bool,
    xsrf: Option<XsrfToken>,
}

impl<'a> RequestContext<'a> {
    pub(crate) fn new(
        request: HttpRequest,
        settings: Rc<Settings>,
        static_files: Option<Rc<StaticFiles>>,
        channel: &'a mut dyn HttpChannel,
    ) -> Self {
        let transform = settings.compress_response.then(|| {
            let accept = request
                .headers
                .get(header::ACCEPT_ENCODING)
                .and_then(|v| v.to_str().ok());
            GzipTransform::new(accept)
        });

        let mut ctx = Self {
            request,
            settings,
            static_files,
            channel,
            status: StatusCode::OK,
            reason: None,
            headers: HeaderMap::new(),
            body: Vec::new(),
            body_len: 0,
            transform,
            headers_written: false,
            finished: false,
            xsrf: None,
        };
        ctx.reset_headers();
        ctx
    }

    fn reset_headers(&mut self) {
        self.headers.clear();
        self.headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html; charset=UTF-8"));
        self.headers.insert(header::SERVER, HeaderValue::from_static("gale"));
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    /// set the response status with its canonical reason.
    pub fn set_status(&mut self, status: StatusCode) {
        self.set_status_reason(status, None::<String>);
    }

    /// set the response status with a custom reason phrase.
    pub fn set_status_reason(&mut self, status: StatusCode, reason: Option<impl Into<String>>) {
        debug_assert!(!self.headers_written, "status change after flush");
        self.status = status;
        self.reason = reason.map(Into::into);
    }

    /// replace a response header.
    pub fn set_header<K: IntoHeaderName>(&mut self, name: K, value: &str) {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers.insert(name, value);
            }
            Err(_) => warn!(target: "web", "dropping header with invalid value"),
        }
    }

    /// add a response header occurrence, keeping existing ones.
    pub fn add_header<K: IntoHeaderName>(&mut self, name: K, value: &str) {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers.append(name, value);
            }
            Err(_) => warn!(target: "web", "dropping header with invalid value"),
        }
    }

    pub fn clear_header(&mut self, name: &HeaderName) {
        self.headers.remove(name);
    }

    /// append a chunk to the response body buffer.
    pub fn write(&mut self, chunk: impl Into<Bytes>) -> Result<(), HttpError> {
        if self.finished {
            return Err(HttpError::internal("write after finish"));
        }
        let chunk: Bytes = chunk.into();
        self.body_len += chunk.len();
        self.body.push(chunk);
        Ok(())
    }

    /// serialize `value` as the JSON response body.
    ///
    /// Top-level arrays are refused: their constant prefix makes them
    /// exploitable cross-site via `<script>` inclusion on legacy browsers.
    pub fn write_json<T: Serialize>(&mut self, value: &T) -> Result<(), HttpError> {
        let json = serde_json::to_string(value).map_err(|e| HttpError::internal(e.to_string()))?;
        if json.starts_with('[') {
            return Err(HttpError::internal("refusing to write a top-level JSON list"));
        }
        // keep the payload safe for embedding into html script contexts.
        let json = json.replace("</", "<\\/");
        self.set_header(header::CONTENT_TYPE, "application/json; charset=UTF-8");
        self.write(json)
    }

    /// write the response preamble (first call) and everything buffered so
    /// far. resolves once the bytes reached the socket.
    pub async fn flush(&mut self) -> Result<(), HttpError> {
        self.flush_inner(false).await
    }

    async fn flush_inner(&mut self, finishing: bool) -> Result<(), HttpError> {
        let mut chunk = coalesce(std::mem::take(&mut self.body), self.body_len);
        self.body_len = 0;

        if !self.headers_written {
            self.headers_written = true;

            if let Some(transform) = self.transform.as_mut() {
                chunk = transform.first_chunk(self.status, &mut self.headers, chunk, finishing);
            }

            let body_size = if finishing {
                BodySize::Sized(chunk.len())
            } else {
                BodySize::Unknown
            };
            let mut head = ResponseHead::new(self.status);
            head.version = self.request.version;
            head.reason = self.reason.clone();
            head.headers = std::mem::take(&mut self.headers);
            self.channel.write_head(&head, body_size)?;
        } else if let Some(transform) = self.transform.as_mut() {
            chunk = transform.transform_chunk(chunk, finishing);
        }

        if !chunk.is_empty() {
            self.channel.queue_chunk(chunk)?;
        }
        if !finishing {
            self.channel.flush_io().await?;
        }
        Ok(())
    }

    /// finish the response: flush everything, terminate the body framing
    /// and run the connection-level bookkeeping. finishing twice is an
    /// error.
    pub async fn finish(&mut self) -> Result<(), HttpError> {
        if self.finished {
            return Err(HttpError::internal("finish called twice"));
        }
        self.maybe_set_xsrf_cookie();
        self.flush_inner(true).await?;
        self.finished = true;
        self.channel.finish_io().await?;
        Ok(())
    }

    /// finish with one last body chunk.
    pub async fn finish_with(&mut self, chunk: impl Into<Bytes>) -> Result<(), HttpError> {
        self.write(chunk)?;
        self.finish().await
    }

    /// redirect to `url`. 301 when `permanent`, else 302; use
    /// [RequestContext::redirect_with_status] for 303/307.
    pub async fn redirect(&mut self, url: &str, permanent: bool) -> Result<(), HttpError> {
        let status = if permanent {
            StatusCode::MOVED_PERMANENTLY
        } else {
            StatusCode::FOUND
        };
        self.redirect_with_status(url, status).await
    }

    pub async fn redirect_with_status(&mut self, url: &str, status: StatusCode) -> Result<(), HttpError> {
        debug_assert!(status.is_redirection(), "redirect needs a 3xx status");
        if self.headers_written {
            return Err(HttpError::internal("redirect after flush"));
        }
        self.set_status(status);
        self.set_header(header::LOCATION, url);
        self.finish().await
    }

    /// discard the response built so far and send the default error page
    /// for `status` instead.
    pub async fn send_error(&mut self, status: StatusCode, reason: Option<&str>) -> Result<(), HttpError> {
        if self.headers_written {
            return Err(HttpError::internal("send_error after flush"));
        }
        self.clear();
        let reason_text = reason
            .or_else(|| status.canonical_reason())
            .unwrap_or("Unknown")
            .to_string();
        self.set_status_reason(status, reason.map(str::to_string));
        let page = error_page(status, &reason_text, None);
        self.write(page)?;
        self.finish().await
    }

    /// reset everything buffered for the response. only possible before
    /// the preamble went out.
    pub fn clear(&mut self) {
        debug_assert!(!self.headers_written, "clear after flush");
        self.status = StatusCode::OK;
        self.reason = None;
        self.body.clear();
        self.body_len = 0;
        self.reset_headers();
    }

    pub(crate) fn headers_written(&self) -> bool {
        self.headers_written
    }

    pub(crate) async fn read_body_chunk(&mut self) -> Result<Option<Bytes>, ProtoError> {
        self.channel.read_body_chunk().await
    }

    pub(crate) async fn send_continue(&mut self) -> Result<(), ProtoError> {
        self.channel.send_continue().await
    }

    // --- cookies -----------------------------------------------------

    /// append a `Set-Cookie` header.
    pub fn set_cookie(&mut self, cookie: Cookie<'_>) {
        self.add_header(header::SET_COOKIE, &cookie.to_string());
    }

    /// expire a cookie. domain/path/secure/samesite must match the cookie
    /// being cleared for modern browsers to honor the removal.
    pub fn clear_cookie(&mut self, mut cookie: Cookie<'static>) {
        cookie.set_value("");
        cookie.set_expires(cookie::time::OffsetDateTime::UNIX_EPOCH);
        cookie.set_max_age(cookie::time::Duration::ZERO);
        self.set_cookie(cookie);
    }

    /// sign `value` with the configured secret and set it as a cookie.
    pub fn set_signed_cookie(&mut self, name: &str, value: &[u8]) -> Result<(), HttpError> {
        let keys = self
            .settings
            .cookie_secret
            .as_ref()
            .ok_or_else(|| HttpError::internal("cookie_secret setting required for signed cookies"))?;
        let signed = signed::create_signed_value(keys, name, value);
        self.set_cookie(Cookie::build((name.to_string(), signed)).path("/").build());
        Ok(())
    }

    /// decode a signed cookie from the request. `None` on absence, bad
    /// signature or expiry.
    pub fn get_signed_cookie(&mut self, name: &str, max_age_days: f64) -> Option<Vec<u8>> {
        let value = self.request.cookie(name)?;
        let keys = self.settings.cookie_secret.as_ref()?;
        signed::decode_signed_value(keys, name, &value, Some(max_age_days), None)
    }

    // --- xsrf --------------------------------------------------------

    /// the masked XSRF token for this response, generating (and setting)
    /// the cookie on first use.
    pub fn xsrf_token(&mut self) -> String {
        self.load_xsrf();
        self.xsrf.as_ref().unwrap().masked()
    }

    fn load_xsrf(&mut self) {
        if self.xsrf.is_none() {
            let from_cookie = self.request.cookie("_xsrf").and_then(|v| XsrfToken::from_cookie(&v));
            self.xsrf = Some(from_cookie.unwrap_or_else(XsrfToken::generate));
        }
    }

    fn maybe_set_xsrf_cookie(&mut self) {
        if self.headers_written {
            return;
        }
        if let Some(token) = self.xsrf.as_ref().filter(|t| t.fresh) {
            let cookie = Cookie::build(("_xsrf".to_string(), token.cookie_value())).path("/").build();
            self.set_cookie(cookie);
        }
    }

    /// verify the token supplied with an unsafe request against the
    /// `_xsrf` cookie.
    pub fn check_xsrf_cookie(&mut self) -> Result<(), HttpError> {
        let supplied = self
            .request
            .get_argument("_xsrf")
            .or_else(|| header_string(&self.request.headers, "x-xsrftoken"))
            .or_else(|| header_string(&self.request.headers, "x-csrftoken"))
            .ok_or_else(|| HttpError::forbidden("'_xsrf' argument missing"))?;

        let cookie = self
            .request
            .cookie("_xsrf")
            .and_then(|v| XsrfToken::from_cookie(&v))
            .ok_or_else(|| HttpError::forbidden("'_xsrf' cookie missing"))?;

        if !cookie.verify(&supplied) {
            return Err(HttpError::forbidden("XSRF cookie does not match token"));
        }

        if let Some(max_age) = self.settings.xsrf_token_max_age {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock before epoch")
                .as_secs();
            if cookie.age(now) > max_age.as_secs() {
                return Err(HttpError::forbidden("expired XSRF token"));
            }
        }

        // keep the verified token for the response cookie when it needs
        // re-issuing (version upgrade).
        self.xsrf = Some(cookie);
        Ok(())
    }

    // --- static files -------------------------------------------------

    /// versioned url of a static asset.
    pub fn static_url(&self, path: &str) -> String {
        match &self.static_files {
            Some(files) => files.static_url(path),
            None => {
                warn!(target: "web", "static_url without static_path setting");
                path.to_string()
            }
        }
    }

    pub(crate) fn static_files(&self) -> Option<Rc<StaticFiles>> {
        self.static_files.clone()
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn coalesce(chunks: Vec<Bytes>, total: usize) -> Bytes {
    match chunks.len() {
        0 => Bytes::new(),
        1 => chunks.into_iter().next().unwrap(),
        _ => {
            let mut out = Vec::with_capacity(total);
            for chunk in chunks {
                out.extend_from_slice(&chunk);
            }
            Bytes::from(out)
        }
    }
}

/// the minimal HTML error page.
pub(crate) fn error_page(status: StatusCode, reason: &str, detail: Option<&str>) -> String {
    let code = status.as_u16();
    match detail {
        Some(detail) => format!(
            "<html><title>{code}: {reason}</title><body>{code}: {reason}<pre>{detail}</pre></body></html>"
        ),
        None => format!("<html><title>{code}: {reason}</title><body>{code}: {reason}</body></html>"),
    }
}

/// A request handler. One instance serves exactly one request.
///
/// Per-method entry points default to `405 Method Not Allowed`; `head`
/// falls back to `get` with the body suppressed by the connection. Errors
/// returned from any entry point are rendered through
/// [Handler::write_error].
#[async_trait(?Send)]
pub trait Handler {
    /// opt into receiving the request body incrementally through
    /// [Handler::data_received] instead of buffered in the request.
    fn streaming_body(&self) -> bool {
        false
    }

    /// override headers set on every response of this handler.
    fn set_default_headers(&mut self, _ctx: &mut RequestContext<'_>) {}

    /// runs before the body is consumed (streaming mode) or right after it
    /// was buffered. a finished response here skips the method dispatch.
    async fn prepare(&mut self, _ctx: &mut RequestContext<'_>) -> Result<(), HttpError> {
        Ok(())
    }

    /// one chunk of the request body in streaming mode.
    async fn data_received(&mut self, _ctx: &mut RequestContext<'_>, _chunk: Bytes) -> Result<(), HttpError> {
        Ok(())
    }

    async fn get(&mut self, _ctx: &mut RequestContext<'_>) -> Result<(), HttpError> {
        Err(HttpError::method_not_allowed())
    }

    async fn head(&mut self, ctx: &mut RequestContext<'_>) -> Result<(), HttpError> {
        // the connection suppresses the body for HEAD responses.
        self.get(ctx).await
    }

    async fn post(&mut self, _ctx: &mut RequestContext<'_>) -> Result<(), HttpError> {
        Err(HttpError::method_not_allowed())
    }

    async fn put(&mut self, _ctx: &mut RequestContext<'_>) -> Result<(), HttpError> {
        Err(HttpError::method_not_allowed())
    }

    async fn patch(&mut self, _ctx: &mut RequestContext<'_>) -> Result<(), HttpError> {
        Err(HttpError::method_not_allowed())
    }

    async fn delete(&mut self, _ctx: &mut RequestContext<'_>) -> Result<(), HttpError> {
        Err(HttpError::method_not_allowed())
    }

    async fn options(&mut self, _ctx: &mut RequestContext<'_>) -> Result<(), HttpError> {
        Err(HttpError::method_not_allowed())
    }

    /// render an error response. the response state was reset before this
    /// runs (unless the preamble already went out).
    async fn write_error(&mut self, ctx: &mut RequestContext<'_>, error: &HttpError) -> Result<(), HttpError> {
        let reason = error
            .reason
            .clone()
            .or_else(|| error.status.canonical_reason().map(str::to_string))
            .unwrap_or_else(|| "Unknown".to_string());
        let detail = if ctx.settings().serve_traceback() {
            error.log_message.as_deref()
        } else {
            None
        };
        let page = error_page(error.status, &reason, detail);
        ctx.set_status_reason(error.status, error.reason.clone());
        ctx.write(page)?;
        Ok(())
    }

    /// runs after the response was fully sent.
    fn on_finish(&mut self) {}

    /// runs when the connection died before the response completed.
    fn on_connection_close(&mut self) {}
}
