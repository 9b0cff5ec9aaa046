use http::{HeaderMap, Method, StatusCode, Uri, Version};

/// Parsed request start-line plus headers.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    /// the peer sent `Expect: 100-continue` and is waiting for the interim
    /// response before transmitting the body.
    pub expect_continue: bool,
}

impl RequestHead {
    pub fn new(method: Method, target: Uri) -> Self {
        Self {
            method,
            target,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            expect_continue: false,
        }
    }
}

/// Response start-line plus headers.
#[derive(Debug)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    /// custom reason phrase; the canonical one is used when absent.
    pub reason: Option<String>,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: Version::HTTP_11,
            status,
            reason: None,
            headers: HeaderMap::new(),
        }
    }

    /// whether a response with this status never carries a body, regardless
    /// of its framing headers.
    pub fn body_forbidden(&self) -> bool {
        self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
    }
}
