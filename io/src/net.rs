//! wrappers over tokio network types implementing [AsyncIo].

use core::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use std::io;

use tracing::trace;

use crate::{
    io::{AsyncIo, AsyncWrite, Interest, Ready},
    stream::{Stream, StreamConfig},
};

macro_rules! aio_impl {
    ($ty: ty) => {
        impl AsyncIo for $ty {
            #[inline]
            fn ready(&self, interest: Interest) -> impl Future<Output = io::Result<Ready>> + Send {
                self.0.ready(interest)
            }

            fn poll_ready(&self, interest: Interest, cx: &mut Context<'_>) -> Poll<io::Result<Ready>> {
                if interest == Interest::READABLE {
                    self.0.poll_read_ready(cx).map_ok(|_| Ready::READABLE)
                } else if interest == Interest::WRITABLE {
                    self.0.poll_write_ready(cx).map_ok(|_| Ready::WRITABLE)
                } else {
                    unimplemented!("tokio can not poll read and write readiness at once")
                }
            }

            fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                AsyncWrite::poll_shutdown(Pin::new(&mut self.get_mut().0), cx)
            }
        }

        impl io::Read for $ty {
            #[inline]
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                self.0.try_read(buf)
            }
        }

        impl io::Write for $ty {
            #[inline]
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.try_write(buf)
            }

            #[inline]
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
    };
}

/// non-blocking TCP stream.
pub struct TcpStream(tokio::net::TcpStream);

aio_impl!(TcpStream);

impl TcpStream {
    pub fn from_tokio(io: tokio::net::TcpStream) -> Self {
        Self(io)
    }

    pub fn into_tokio(self) -> tokio::net::TcpStream {
        self.0
    }

    /// disable(or re-enable) Nagle's algorithm.
    #[inline]
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.0.set_nodelay(nodelay)
    }

    #[inline]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.local_addr()
    }

    #[inline]
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.0.peer_addr()
    }
}

#[cfg(unix)]
/// non-blocking unix domain stream.
pub struct UnixStream(tokio::net::UnixStream);

#[cfg(unix)]
aio_impl!(UnixStream);

#[cfg(unix)]
impl UnixStream {
    pub fn from_tokio(io: tokio::net::UnixStream) -> Self {
        Self(io)
    }
}

/// TCP listener producing buffered [Stream]s.
pub struct Listener {
    inner: tokio::net::TcpListener,
    config: StreamConfig,
}

impl Listener {
    /// bind to the given address with the default stream configuration.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        Self::bind_with(addr, 1024, StreamConfig::default())
    }

    /// bind with an explicit listen backlog and per-connection stream config.
    pub fn bind_with(addr: SocketAddr, backlog: u32, config: StreamConfig) -> io::Result<Self> {
        let socket = match addr {
            SocketAddr::V4(_) => tokio::net::TcpSocket::new_v4()?,
            SocketAddr::V6(_) => tokio::net::TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let inner = socket.listen(backlog)?;
        Ok(Self { inner, config })
    }

    pub fn from_tokio(inner: tokio::net::TcpListener, config: StreamConfig) -> Self {
        Self { inner, config }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// accept one connection and wrap it in a buffered [Stream].
    pub async fn accept(&self) -> io::Result<(Stream<TcpStream>, SocketAddr)> {
        let (io, addr) = self.inner.accept().await?;
        trace!(target: "listener", "accepted connection from {addr}");
        let _ = io.set_nodelay(true);
        let stream = Stream::with_config(TcpStream::from_tokio(io), self.config.clone());
        Ok((stream, addr))
    }
}
