//! low resolution date header values.

use std::{
    cell::RefCell,
    time::{Instant, SystemTime},
};

/// length of an RFC 7231 IMF-fixdate, e.g. `Tue, 01 Jul 2025 10:00:00 GMT`.
pub const DATE_VALUE_LENGTH: usize = 29;

/// Caches the formatted `Date` header value for up to a second so the hot
/// path avoids a syscall and a format per response.
pub struct DateService {
    cached: RefCell<(Instant, String)>,
}

impl Default for DateService {
    fn default() -> Self {
        Self::new()
    }
}

impl DateService {
    pub fn new() -> Self {
        Self {
            cached: RefCell::new((Instant::now(), httpdate::fmt_http_date(SystemTime::now()))),
        }
    }

    /// run `f` with the current date value as ascii bytes.
    pub fn with_date<F, O>(&self, f: F) -> O
    where
        F: FnOnce(&[u8]) -> O,
    {
        let mut cached = self.cached.borrow_mut();
        if cached.0.elapsed().as_secs() >= 1 {
            *cached = (Instant::now(), httpdate::fmt_http_date(SystemTime::now()));
        }
        f(cached.1.as_bytes())
    }
}
