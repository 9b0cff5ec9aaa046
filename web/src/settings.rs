use core::time::Duration;

use std::path::PathBuf;

use gale_http::HttpConfig;
use gale_ws::deflate::DeflateOptions;

use crate::signed::KeySet;

/// Application-wide configuration.
pub struct Settings {
    /// secret material for signed cookies; `None` disables them.
    pub cookie_secret: Option<KeySet>,
    /// require an XSRF token on unsafe methods.
    pub xsrf_cookies: bool,
    /// maximum accepted XSRF token age; `None` accepts any age.
    pub xsrf_token_max_age: Option<Duration>,
    /// serve error details in error pages and disable caches.
    pub debug: bool,
    /// gzip response bodies for clients that accept it.
    pub compress_response: bool,

    pub static_path: Option<PathBuf>,
    pub static_url_prefix: String,
    pub default_filename: Option<String>,

    pub websocket_ping_interval: Option<Duration>,
    pub websocket_ping_timeout: Option<Duration>,
    pub websocket_max_message_size: usize,
    /// enable permessage-deflate with these options; `None` declines it.
    pub websocket_compression: Option<DeflateOptions>,

    /// connection level protocol knobs.
    pub http: HttpConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cookie_secret: None,
            xsrf_cookies: false,
            xsrf_token_max_age: None,
            debug: false,
            compress_response: false,
            static_path: None,
            static_url_prefix: "/static/".to_string(),
            default_filename: None,
            websocket_ping_interval: None,
            websocket_ping_timeout: None,
            websocket_max_message_size: 10 * 1024 * 1024,
            websocket_compression: None,
            http: HttpConfig::default(),
        }
    }
}

impl Settings {
    /// whether error responses may carry failure details.
    pub fn serve_traceback(&self) -> bool {
        self.debug
    }
}
