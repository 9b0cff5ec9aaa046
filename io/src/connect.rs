//! dual-stack "Happy Eyeballs" connection factory (RFC 6555).

use core::{future::Future, net::SocketAddr, pin::Pin, time::Duration};

use std::io;

use tracing::{debug, trace};

use crate::{
    error::{ConnectError, StreamError},
    net::TcpStream,
    resolver::{AddrFamily, Resolve},
    stream::{Stream, StreamConfig},
};

/// delay before a parallel attempt to the other address family starts.
const INITIAL_CONNECT_TIMEOUT: Duration = Duration::from_millis(300);

type Attempt = Pin<Box<dyn Future<Output = io::Result<tokio::net::TcpStream>>>>;

/// Dual-stack TCP connection factory.
///
/// Addresses are partitioned by family, with the family of the first
/// resolved address considered primary. The first attempt goes to the first
/// primary address; if it has not completed within 300ms a parallel attempt
/// to the first secondary address begins. At most one attempt per family is
/// in flight; the first established connection wins and all other attempts
/// are dropped, which closes their sockets.
pub struct TcpConnector<R> {
    resolver: R,
    stream_config: StreamConfig,
    initial_connect_timeout: Duration,
    source_addr: Option<SocketAddr>,
}

impl<R: Resolve> TcpConnector<R> {
    pub fn new(resolver: R) -> Self {
        Self {
            resolver,
            stream_config: StreamConfig::default(),
            initial_connect_timeout: INITIAL_CONNECT_TIMEOUT,
            source_addr: None,
        }
    }

    pub fn stream_config(mut self, config: StreamConfig) -> Self {
        self.stream_config = config;
        self
    }

    /// bind outgoing sockets to a fixed source address and/or port.
    pub fn source_addr(mut self, addr: SocketAddr) -> Self {
        self.source_addr = Some(addr);
        self
    }

    pub fn initial_connect_timeout(mut self, dur: Duration) -> Self {
        self.initial_connect_timeout = dur;
        self
    }

    /// resolve `host` and dial it, failing with [ConnectError::Timeout] when
    /// `timeout` elapses first. the timeout covers resolution and all dial
    /// attempts together; on expiry every in-flight attempt is cancelled.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        family: Option<AddrFamily>,
        timeout: Option<Duration>,
    ) -> Result<Stream<TcpStream>, ConnectError> {
        let fut = self.connect_inner(host, port, family);
        match timeout {
            Some(dur) => tokio::time::timeout(dur, fut).await.map_err(|_| ConnectError::Timeout)?,
            None => fut.await,
        }
    }

    async fn connect_inner(
        &self,
        host: &str,
        port: u16,
        family: Option<AddrFamily>,
    ) -> Result<Stream<TcpStream>, ConnectError> {
        let addrs = self.resolver.resolve(host, port, family).await?;
        let io = connect_to(addrs, self.initial_connect_timeout, self.source_addr).await?;
        let _ = io.set_nodelay(true);
        Ok(Stream::with_config(TcpStream::from_tokio(io), self.stream_config.clone()))
    }
}

/// race connection attempts over an already resolved address list.
pub async fn connect_to(
    addrs: Vec<SocketAddr>,
    stagger: Duration,
    source_addr: Option<SocketAddr>,
) -> Result<tokio::net::TcpStream, ConnectError> {
    let (primary, secondary) = split(addrs);
    if primary.is_empty() {
        return Err(ConnectError::AllAttemptsFailed(None));
    }

    let mut primary = primary.into_iter();
    let mut secondary = secondary.into_iter();

    let mut primary_attempt: Option<Attempt> = primary.next().map(|a| attempt(a, source_addr));
    let mut secondary_attempt: Option<Attempt> = None;
    let mut stagger_timer = (secondary.len() > 0).then(|| Box::pin(tokio::time::sleep(stagger)));
    let mut last_error = None;

    loop {
        if primary_attempt.is_none() && secondary_attempt.is_none() {
            // both lanes idle: refill or give up.
            primary_attempt = primary.next().map(|a| attempt(a, source_addr));
            secondary_attempt = secondary.next().map(|a| attempt(a, source_addr));
            if primary_attempt.is_none() && secondary_attempt.is_none() {
                return Err(ConnectError::AllAttemptsFailed(last_error));
            }
        }

        tokio::select! {
            res = async { primary_attempt.as_mut().unwrap().await }, if primary_attempt.is_some() => {
                primary_attempt = None;
                match res {
                    Ok(io) => return Ok(io),
                    Err(e) => {
                        debug!(target: "connector", "primary connect attempt failed: {e}");
                        last_error = Some(e);
                        primary_attempt = primary.next().map(|a| attempt(a, source_addr));
                        if secondary_attempt.is_none() {
                            stagger_timer = None;
                            secondary_attempt = secondary.next().map(|a| attempt(a, source_addr));
                        }
                    }
                }
            }
            res = async { secondary_attempt.as_mut().unwrap().await }, if secondary_attempt.is_some() => {
                secondary_attempt = None;
                match res {
                    Ok(io) => return Ok(io),
                    Err(e) => {
                        debug!(target: "connector", "secondary connect attempt failed: {e}");
                        last_error = Some(e);
                        secondary_attempt = secondary.next().map(|a| attempt(a, source_addr));
                    }
                }
            }
            _ = async { stagger_timer.as_mut().unwrap().await }, if stagger_timer.is_some() => {
                trace!(target: "connector", "stagger timer fired, starting secondary family attempt");
                stagger_timer = None;
                if secondary_attempt.is_none() {
                    secondary_attempt = secondary.next().map(|a| attempt(a, source_addr));
                }
            }
        }
    }
}

/// partition addresses by family. the first list holds the first entry and
/// everything sharing its family, the second holds the rest.
fn split(addrs: Vec<SocketAddr>) -> (Vec<SocketAddr>, Vec<SocketAddr>) {
    let mut primary = Vec::new();
    let mut secondary = Vec::new();
    let mut primary_family = None;
    for addr in addrs {
        let family = AddrFamily::of(&addr);
        match primary_family {
            None => {
                primary_family = Some(family);
                primary.push(addr);
            }
            Some(f) if f == family => primary.push(addr),
            Some(_) => secondary.push(addr),
        }
    }
    (primary, secondary)
}

fn attempt(addr: SocketAddr, source_addr: Option<SocketAddr>) -> Attempt {
    Box::pin(async move {
        match source_addr {
            Some(source) => {
                let socket = match addr {
                    SocketAddr::V4(_) => tokio::net::TcpSocket::new_v4()?,
                    SocketAddr::V6(_) => tokio::net::TcpSocket::new_v6()?,
                };
                socket.set_reuseaddr(true)?;
                socket.bind(source)?;
                socket.connect(addr).await
            }
            None => tokio::net::TcpStream::connect(addr).await,
        }
    })
}

impl From<StreamError> for ConnectError {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::Io(io) => {
                Self::Io(std::sync::Arc::try_unwrap(io).unwrap_or_else(|e| io::Error::new(e.kind(), e.to_string())))
            }
            other => Self::Io(io::Error::other(other.to_string())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::time::Instant;

    use tokio::net::TcpListener;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
    }

    #[test]
    fn split_partitions_by_first_family() {
        let v6: SocketAddr = "[::1]:1".parse().unwrap();
        let v4: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let v4b: SocketAddr = "127.0.0.2:1".parse().unwrap();
        let (p, s) = split(vec![v6, v4, v4b]);
        assert_eq!(p, vec![v6]);
        assert_eq!(s, vec![v4, v4b]);
    }

    #[test]
    fn secondary_family_wins_over_dead_primary() {
        rt().block_on(async {
            // documentation-prefix v6 address: either unroutable (fails the
            // primary attempt fast) or blackholed (primary hangs until the
            // stagger timer starts the v4 lane). the v4 listener wins both
            // ways.
            let dead_v6: SocketAddr = "[2001:db8::1]:9".parse().unwrap();

            let reachable = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let good_addr = reachable.local_addr().unwrap();

            let start = Instant::now();
            let io = connect_to(vec![dead_v6, good_addr], Duration::from_millis(50), None)
                .await
                .unwrap();
            assert_eq!(io.peer_addr().unwrap(), good_addr);
            assert!(start.elapsed() < Duration::from_secs(5));
        });
    }

    #[test]
    fn overall_timeout_cancels_attempts() {
        rt().block_on(async {
            let dead_v4: SocketAddr = "192.0.2.1:9".parse().unwrap();
            let res = tokio::time::timeout(
                Duration::from_millis(200),
                connect_to(vec![dead_v4], Duration::from_millis(300), None),
            )
            .await;
            // either the deadline fired while the attempt hung, or the
            // environment rejected the route outright. a connection must
            // not exist in any case.
            match res {
                Err(_elapsed) => {}
                Ok(Err(_)) => {}
                Ok(Ok(_)) => panic!("connect to TEST-NET-1 must not succeed"),
            }
        });
    }
}
