//! non-blocking hostname resolution.

use core::future::Future;
use core::net::SocketAddr;

use std::{collections::HashMap, net::ToSocketAddrs};

use crate::error::ResolveError;

/// address family filter for resolution results.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AddrFamily {
    V4,
    V6,
}

impl AddrFamily {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Self::V4,
            SocketAddr::V6(_) => Self::V6,
        }
    }
}

/// Trait for pluggable DNS resolution.
///
/// Implementations may block in other threads but the future they hand back
/// must be awaitable on the loop thread without blocking it.
pub trait Resolve {
    /// resolve hostname (without port suffix) to socket addresses,
    /// optionally restricted to one address family.
    fn resolve(
        &self,
        host: &str,
        port: u16,
        family: Option<AddrFamily>,
    ) -> impl Future<Output = Result<Vec<SocketAddr>, ResolveError>>;
}

/// Default resolver delegating to the platform's getaddrinfo on a worker
/// thread, marshalling results back to the loop.
#[derive(Clone, Copy, Default)]
pub struct ThreadedResolver;

impl Resolve for ThreadedResolver {
    async fn resolve(
        &self,
        host: &str,
        port: u16,
        family: Option<AddrFamily>,
    ) -> Result<Vec<SocketAddr>, ResolveError> {
        let host = host.to_string();
        let addrs = tokio::task::spawn_blocking(move || (host.as_str(), port).to_socket_addrs())
            .await
            .expect("getaddrinfo worker must not panic")?;
        let addrs: Vec<_> = match family {
            Some(family) => addrs.filter(|a| AddrFamily::of(a) == family).collect(),
            None => addrs.collect(),
        };
        if addrs.is_empty() {
            return Err(ResolveError::NoAddress);
        }
        Ok(addrs)
    }
}

#[derive(Eq, PartialEq, Hash)]
enum OverrideKey {
    Host(String),
    HostPort(String, u16),
    HostPortFamily(String, u16, AddrFamily),
}

/// Resolver wrapping another with a static override table.
///
/// Overrides are looked up most-specific first: `(host, port, family)`,
/// then `(host, port)`, then `host`. A miss falls through to the wrapped
/// resolver.
pub struct OverrideResolver<R> {
    inner: R,
    map: HashMap<OverrideKey, Vec<SocketAddr>>,
}

impl<R> OverrideResolver<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, map: HashMap::new() }
    }

    pub fn add_host(mut self, host: impl Into<String>, addrs: Vec<SocketAddr>) -> Self {
        self.map.insert(OverrideKey::Host(host.into()), addrs);
        self
    }

    pub fn add_host_port(mut self, host: impl Into<String>, port: u16, addrs: Vec<SocketAddr>) -> Self {
        self.map.insert(OverrideKey::HostPort(host.into(), port), addrs);
        self
    }

    pub fn add_host_port_family(
        mut self,
        host: impl Into<String>,
        port: u16,
        family: AddrFamily,
        addrs: Vec<SocketAddr>,
    ) -> Self {
        self.map.insert(OverrideKey::HostPortFamily(host.into(), port, family), addrs);
        self
    }

    fn lookup(&self, host: &str, port: u16, family: Option<AddrFamily>) -> Option<&Vec<SocketAddr>> {
        if let Some(family) = family {
            if let Some(addrs) = self.map.get(&OverrideKey::HostPortFamily(host.to_string(), port, family)) {
                return Some(addrs);
            }
        }
        self.map
            .get(&OverrideKey::HostPort(host.to_string(), port))
            .or_else(|| self.map.get(&OverrideKey::Host(host.to_string())))
    }
}

impl<R: Resolve> Resolve for OverrideResolver<R> {
    async fn resolve(
        &self,
        host: &str,
        port: u16,
        family: Option<AddrFamily>,
    ) -> Result<Vec<SocketAddr>, ResolveError> {
        match self.lookup(host, port, family) {
            Some(addrs) => Ok(addrs.clone()),
            None => self.inner.resolve(host, port, family).await,
        }
    }
}

/// Resolver answering from a fixed list. Mostly useful in tests.
pub struct StaticResolver(pub Vec<SocketAddr>);

impl Resolve for StaticResolver {
    async fn resolve(
        &self,
        _host: &str,
        _port: u16,
        family: Option<AddrFamily>,
    ) -> Result<Vec<SocketAddr>, ResolveError> {
        let addrs: Vec<_> = match family {
            Some(family) => self.0.iter().copied().filter(|a| AddrFamily::of(a) == family).collect(),
            None => self.0.clone(),
        };
        if addrs.is_empty() {
            return Err(ResolveError::NoAddress);
        }
        Ok(addrs)
    }
}
