use core::net::SocketAddr;

use bytes::Bytes;
use cookie::Cookie;
use gale_http::{HeaderMap, Method, RequestHead, Uri, Version, header};
use gale_router::Params;

use crate::form::{Arguments, UploadedFile, parse_body_arguments, parse_qs};

/// One parsed request as the dispatcher hands it to a handler.
pub struct HttpRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub remote_addr: SocketAddr,
    /// `http` or `https`, depending on the transport the connection used.
    pub protocol: &'static str,
    /// the buffered request body. empty in streaming mode.
    pub body: Bytes,
    /// captures of the matched route pattern.
    pub path_params: Params,

    query_arguments: Arguments,
    body_arguments: Arguments,
    files: Vec<(String, UploadedFile)>,
    cookies: Option<Vec<Cookie<'static>>>,
}

impl HttpRequest {
    pub(crate) fn new(
        head: RequestHead,
        body: Bytes,
        remote_addr: SocketAddr,
        protocol: &'static str,
        path_params: Params,
    ) -> Self {
        let query_arguments = head.target.query().map(|q| parse_qs(q.as_bytes())).unwrap_or_default();

        let content_type = head
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let (body_arguments, files) = parse_body_arguments(content_type, &body);

        Self {
            method: head.method,
            uri: head.target,
            version: head.version,
            headers: head.headers,
            remote_addr,
            protocol,
            body,
            path_params,
            query_arguments,
            body_arguments,
            files,
            cookies: None,
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn host(&self) -> Option<&str> {
        self.headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| self.uri.host())
    }

    /// full request url, reconstructed from protocol, host and target.
    pub fn full_url(&self) -> String {
        let host = self.host().unwrap_or("localhost");
        let target = self
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("{}://{}{}", self.protocol, host, target)
    }

    /// query string arguments, in submission order.
    pub fn query_arguments(&self) -> &Arguments {
        &self.query_arguments
    }

    /// form body arguments (urlencoded or multipart fields).
    pub fn body_arguments(&self) -> &Arguments {
        &self.body_arguments
    }

    /// all values for `name`, query and body arguments combined (query
    /// first, matching submission order across both sources).
    pub fn get_arguments(&self, name: &str) -> Vec<Bytes> {
        let mut out: Vec<Bytes> = self.query_arguments.get_all(name).to_vec();
        out.extend_from_slice(self.body_arguments.get_all(name));
        out
    }

    /// the last value for `name`, body overriding query.
    pub fn get_argument(&self, name: &str) -> Option<String> {
        self.body_arguments.get(name).or_else(|| self.query_arguments.get(name))
    }

    /// uploads from a multipart body.
    pub fn files(&self) -> &[(String, UploadedFile)] {
        &self.files
    }

    /// cookies from the `Cookie` header. parsed once, unparseable pairs
    /// are skipped.
    pub fn cookies(&mut self) -> &[Cookie<'static>] {
        if self.cookies.is_none() {
            let parsed = self
                .headers
                .get_all(header::COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .flat_map(Cookie::split_parse)
                .filter_map(Result::ok)
                .map(Cookie::into_owned)
                .collect();
            self.cookies = Some(parsed);
        }
        self.cookies.as_deref().unwrap()
    }

    pub fn cookie(&mut self, name: &str) -> Option<String> {
        self.cookies()
            .iter()
            .find(|c| c.name() == name)
            .map(|c| c.value().to_string())
    }
}

#[cfg(test)]
mod test {
    use gale_http::http::HeaderValue;

    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    fn request(target: &str, body: &'static [u8], content_type: Option<&str>) -> HttpRequest {
        let mut head = RequestHead::new(Method::POST, target.parse().unwrap());
        if let Some(ct) = content_type {
            head.headers.insert(header::CONTENT_TYPE, HeaderValue::from_str(ct).unwrap());
        }
        HttpRequest::new(head, Bytes::from_static(body), addr(), "http", Params::default())
    }

    #[test]
    fn query_arguments_in_order() {
        let req = request("/echo?x=1&x=2", b"", None);
        assert_eq!(
            req.get_arguments("x"),
            vec![Bytes::from_static(b"1"), Bytes::from_static(b"2")]
        );
    }

    #[test]
    fn body_overrides_query_for_single_lookup() {
        let req = request("/a?k=query", b"k=body", Some("application/x-www-form-urlencoded"));
        assert_eq!(req.get_argument("k").as_deref(), Some("body"));
        assert_eq!(
            req.get_arguments("k"),
            vec![Bytes::from_static(b"query"), Bytes::from_static(b"body")]
        );
    }

    #[test]
    fn cookies_parse_lazily() {
        let mut head = RequestHead::new(Method::GET, "/".parse().unwrap());
        head.headers
            .insert(header::COOKIE, HeaderValue::from_static("a=1; b=two"));
        let mut req = HttpRequest::new(head, Bytes::new(), addr(), "http", Params::default());
        assert_eq!(req.cookie("a").as_deref(), Some("1"));
        assert_eq!(req.cookie("b").as_deref(), Some("two"));
        assert_eq!(req.cookie("c"), None);
    }

    #[test]
    fn full_url_reconstruction() {
        let mut head = RequestHead::new(Method::GET, "/p?q=1".parse().unwrap());
        head.headers.insert(header::HOST, HeaderValue::from_static("h:8080"));
        let req = HttpRequest::new(head, Bytes::new(), addr(), "https", Params::default());
        assert_eq!(req.full_url(), "https://h:8080/p?q=1");
    }
}
