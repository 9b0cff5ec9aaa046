use core::fmt;

use http::StatusCode;

/// A handler's way to end the request with a specific HTTP status.
///
/// `reason` replaces the canonical status phrase in the response;
/// `log_message` only ever reaches the server log (and the error page body
/// when the server runs with `serve_traceback`).
#[derive(Debug)]
pub struct HttpError {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub log_message: Option<String>,
}

impl HttpError {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            log_message: None,
        }
    }

    pub fn with_log(status: StatusCode, log_message: impl Into<String>) -> Self {
        Self {
            status,
            reason: None,
            log_message: Some(log_message.into()),
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn bad_request(log_message: impl Into<String>) -> Self {
        Self::with_log(StatusCode::BAD_REQUEST, log_message)
    }

    pub fn forbidden(log_message: impl Into<String>) -> Self {
        Self::with_log(StatusCode::FORBIDDEN, log_message)
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND)
    }

    pub fn method_not_allowed() -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED)
    }

    pub fn internal(log_message: impl Into<String>) -> Self {
        Self::with_log(StatusCode::INTERNAL_SERVER_ERROR, log_message)
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP {}", self.status)?;
        if let Some(reason) = &self.reason {
            write!(f, " ({reason})")?;
        }
        if let Some(log) = &self.log_message {
            write!(f, ": {log}")?;
        }
        Ok(())
    }
}

impl std::error::Error for HttpError {}

impl From<gale_http::ProtoError> for HttpError {
    fn from(e: gale_http::ProtoError) -> Self {
        if e.is_input_error() {
            Self::with_log(StatusCode::BAD_REQUEST, e.to_string())
        } else {
            Self::with_log(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
