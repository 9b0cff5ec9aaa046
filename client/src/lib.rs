//! Non-blocking HTTP/1.1 and WebSocket client for gale.
//!
//! [Client] resolves hostnames, dials with the dual-stack happy-eyeballs
//! connector, optionally upgrades to TLS, and keeps one reusable
//! connection per authority. Every request carries an absolute deadline;
//! an expired deadline surfaces as [ClientError::Timeout], the synthetic
//! 599 of the server side's taxonomy.

#![forbid(unsafe_code)]

mod client;
mod error;
mod request;
mod response;
mod timeout;
mod ws;

pub use self::{
    client::{Client, ClientBuilder},
    error::ClientError,
    request::RequestBuilder,
    response::ClientResponse,
    timeout::TimeoutConfig,
    ws::{ClientWebSocket, WsConnectOptions},
};

pub use gale_ws::WsMessage;
