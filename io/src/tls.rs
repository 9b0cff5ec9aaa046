//! TLS session state machine driven over non-blocking IO.

use core::{
    future::Future,
    ops::DerefMut,
    pin::Pin,
    task::{Context, Poll},
};

use std::io;

use rustls::{ConnectionCommon, SideData};

use crate::io::{AsyncIo, Interest, Ready};

/// A socket whose bytes pass through a `rustls` session.
///
/// `C` is either a [rustls::ClientConnection] or [rustls::ServerConnection];
/// the stream arms read or write readiness depending on what the handshake
/// and record layer ask for.
pub struct TlsStream<C, Io> {
    session: C,
    io: Io,
}

impl<C, S, Io> TlsStream<C, Io>
where
    C: DerefMut<Target = ConnectionCommon<S>>,
    S: SideData,
    Io: io::Read + io::Write,
{
    fn process_new_packets(&mut self) -> io::Result<()> {
        match self.session.process_new_packets() {
            Ok(_) => Ok(()),
            Err(e) => {
                // flush a pending alert describing the failure before
                // surfacing the original error.
                let _ = self.write_tls();
                Err(io::Error::new(io::ErrorKind::InvalidData, e))
            }
        }
    }

    fn write_tls(&mut self) -> io::Result<usize> {
        self.session.write_tls(&mut self.io)
    }

    fn read_tls(&mut self) -> io::Result<usize> {
        self.session.read_tls(&mut self.io)
    }
}

impl<C, S, Io> TlsStream<C, Io>
where
    C: DerefMut<Target = ConnectionCommon<S>> + Unpin,
    S: SideData,
    Io: AsyncIo,
{
    /// reference to the session type, for peeking at negotiated parameters.
    pub fn session(&self) -> &C {
        &self.session
    }

    /// run the handshake to completion, arming whichever readiness the
    /// session asks for.
    pub async fn handshake(mut io: Io, mut session: C) -> io::Result<Self> {
        while let Err(e) = session.complete_io(&mut io) {
            if e.kind() != io::ErrorKind::WouldBlock {
                return Err(e);
            }
            let interest = match (session.wants_read(), session.wants_write()) {
                (true, true) => Interest::READABLE | Interest::WRITABLE,
                (true, false) => Interest::READABLE,
                (false, true) => Interest::WRITABLE,
                (false, false) => unreachable!("complete_io blocked without wanting io"),
            };
            io.ready(interest).await?;
        }
        Ok(TlsStream { io, session })
    }
}

impl<C, S, Io> AsyncIo for TlsStream<C, Io>
where
    C: DerefMut<Target = ConnectionCommon<S>> + Unpin,
    S: SideData + Unpin,
    Io: AsyncIo,
{
    #[inline]
    fn ready(&self, interest: Interest) -> impl Future<Output = io::Result<Ready>> + Send {
        self.io.ready(interest)
    }

    #[inline]
    fn poll_ready(&self, interest: Interest, cx: &mut Context<'_>) -> Poll<io::Result<Ready>> {
        self.io.poll_ready(interest, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncIo::poll_shutdown(Pin::new(&mut self.get_mut().io), cx)
    }
}

impl<C, S, Io> io::Read for TlsStream<C, Io>
where
    C: DerefMut<Target = ConnectionCommon<S>>,
    S: SideData,
    Io: io::Read + io::Write,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.session.wants_read() {
            let n = self.read_tls()?;
            self.process_new_packets()?;
            if n == 0 {
                break;
            }
        }
        self.session.reader().read(buf)
    }
}

impl<C, S, Io> io::Write for TlsStream<C, Io>
where
    C: DerefMut<Target = ConnectionCommon<S>>,
    S: SideData,
    Io: io::Read + io::Write,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let n = self.session.writer().write(buf)?;
            // a zero length write means the record layer buffer is full
            // (or the input was empty). flush and retry.
            if n == 0 && self.session.wants_write() {
                io::Write::flush(self)?;
                continue;
            }
            return Ok(n);
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        while self.session.wants_write() {
            if self.write_tls()? == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
        }
        Ok(())
    }
}
