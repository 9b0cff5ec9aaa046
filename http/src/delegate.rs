use core::future::Future;

use bytes::Bytes;

use crate::error::ProtoError;

/// Consumer of one parsed HTTP/1 message.
///
/// The connection driver calls `headers_received` exactly once, then
/// `data_received` zero or more times with decoded body bytes, then exactly
/// one of `finish` (message completed) or `on_connection_close` (the
/// transport died first).
pub trait MessageDelegate<H> {
    /// the message head was parsed. returning an error aborts the message
    /// and closes the connection.
    fn headers_received(&mut self, head: H) -> impl Future<Output = Result<(), ProtoError>>;

    /// one decoded body chunk. chunk boundaries carry no meaning.
    fn data_received(&mut self, chunk: Bytes) -> impl Future<Output = Result<(), ProtoError>>;

    /// the message completed normally.
    fn finish(&mut self);

    /// the connection went away before the message completed.
    fn on_connection_close(&mut self);
}
