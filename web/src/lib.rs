//! The gale web layer: routing, request handlers, cookies, XSRF
//! protection, static files and websocket endpoints over the gale HTTP/1
//! runtime.
//!
//! An application is a set of route patterns mapped to handler factories:
//!
//! ```no_run
//! use gale_web::{App, Handler, HttpError, RequestContext, Settings};
//!
//! struct Echo;
//!
//! #[async_trait::async_trait(?Send)]
//! impl Handler for Echo {
//!     async fn get(&mut self, ctx: &mut RequestContext<'_>) -> Result<(), HttpError> {
//!         let who = ctx.request.get_argument("who").unwrap_or_else(|| "world".into());
//!         ctx.write(format!("hello {who}"))
//!     }
//! }
//!
//! # async fn run() -> std::io::Result<()> {
//! let app = App::new(Settings::default()).handler("/hello", || Echo);
//! gale_web::listen_and_serve(app, "127.0.0.1:8080".parse().unwrap()).await
//! # }
//! ```

#![forbid(unsafe_code)]

mod app;
mod error;
mod form;
mod handler;
mod request;
mod settings;
mod transform;
mod ws;

pub mod signed;
pub mod static_files;
pub mod xsrf;

pub use self::{
    app::{App, RouteTarget, handle_connection, listen_and_serve},
    error::HttpError,
    form::{Arguments, UploadedFile},
    handler::{Handler, RequestContext},
    request::HttpRequest,
    settings::Settings,
    signed::KeySet,
    ws::{WebSocketHandler, WsSession},
};

pub use gale_http::{Method, StatusCode, Version};
pub use gale_ws::{CloseCode, CloseReason, WsMessage};

/// re-export of the cookie crate used by the cookie APIs.
pub use cookie::Cookie;
