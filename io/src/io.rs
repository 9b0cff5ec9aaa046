//! readiness based non-blocking IO contract.

pub use tokio::io::{AsyncRead, AsyncWrite, Interest, Ready};

use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use std::io;

/// Contract for a non-blocking IO type.
///
/// Read and write are the synchronous [io::Read]/[io::Write] traits returning
/// [io::ErrorKind::WouldBlock] when the socket is not ready. Readiness is
/// awaited separately through [AsyncIo::ready]. The split keeps buffered
/// callers in control of when syscalls happen.
pub trait AsyncIo: io::Read + io::Write + Unpin {
    /// asynchronously wait for the IO type and return its state as [Ready].
    ///
    /// # Errors
    ///
    /// ready should only fail on runtime shutdown. Actual io errors surface
    /// from the [io::Read]/[io::Write] methods afterwards.
    fn ready(&self, interest: Interest) -> impl Future<Output = io::Result<Ready>> + Send;

    /// poll flavor of [AsyncIo::ready].
    fn poll_ready(&self, interest: Interest, cx: &mut Context<'_>) -> Poll<io::Result<Ready>>;

    /// shutdown the write half of the io.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}
