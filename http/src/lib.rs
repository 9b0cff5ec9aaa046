//! HTTP/1.1 wire codec for gale.
//!
//! [proto] holds the pure parsing/serialization pieces: transfer coding
//! state machine, head decoding and encoding. [h1] drives a full server or
//! client connection over a buffered [Stream](gale_io::Stream), delivering
//! each message to a [MessageDelegate](delegate::MessageDelegate).

#![forbid(unsafe_code)]

pub mod config;
pub mod date;
pub mod delegate;
pub mod error;
pub mod h1;
pub mod proto;

pub use self::{
    config::HttpConfig,
    delegate::MessageDelegate,
    error::{Parse, ProtoError},
    h1::{Http1ClientConnection, Http1Connection},
    proto::head::{RequestHead, ResponseHead},
};

/// re-export of http crate types used across the framework.
pub use http::{self, HeaderMap, Method, StatusCode, Uri, Version, header};

/// re-export of the bytes crate as module.
pub use gale_io::bytes;
