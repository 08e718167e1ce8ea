//! Outbound connection cache: one socket per destination host.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, Result};
use crate::reporter::Reporter;

const TARGET: &str = "router";

/// Opens outbound connections for the cache.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: &str) -> io::Result<TcpStream>;
}

/// Plain TCP dialer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str) -> io::Result<TcpStream> {
        TcpStream::connect(addr).await
    }
}

fn route_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "route is closed")
}

/// An open outbound connection shared by every sender to one host.
#[derive(Debug)]
pub struct Route {
    host: String,
    // `None` once the route has been closed.
    socket: Mutex<Option<TcpStream>>,
    closed: CancellationToken,
}

impl Route {
    fn new(host: String, stream: TcpStream) -> Self {
        Self {
            host,
            socket: Mutex::new(Some(stream)),
            closed: CancellationToken::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Writes `line` in full.  Concurrent writers are serialised so lines
    /// never interleave on the wire.
    ///
    /// Closing the route aborts a write that is waiting on the peer.
    pub async fn write(&self, line: &[u8]) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(route_closed());
        }

        let result = tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(route_closed()),
            res = self.write_locked(line) => res,
        };

        if self.closed.is_cancelled() {
            // An aborted write leaves the stream behind for us to drop.
            if let Ok(mut socket) = self.socket.try_lock() {
                socket.take();
            }
        }
        result
    }

    async fn write_locked(&self, line: &[u8]) -> io::Result<()> {
        let mut socket = self.socket.lock().await;
        let stream = socket.as_mut().ok_or_else(route_closed)?;
        stream.write_all(line).await?;
        stream.flush().await
    }

    /// Shuts the connection down without waiting for in-flight writes.
    /// Closing twice is harmless.
    pub async fn close(&self) {
        self.closed.cancel();
        let stream = match self.socket.try_lock() {
            Ok(mut socket) => socket.take(),
            // The writer holding the lock drops the stream once it sees
            // the cancellation.
            Err(_) => None,
        };
        if let Some(mut stream) = stream {
            let _ = stream.shutdown().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Maps destination hosts to their [`Route`].
///
/// The whole check-dial-insert sequence runs under one lock, so two callers
/// racing on an unseen host produce a single dial.
pub struct RouteCache {
    port: u16,
    dial_timeout: Option<Duration>,
    reporter: Arc<dyn Reporter>,
    connector: Arc<dyn Connector>,
    routes: Mutex<HashMap<String, Arc<Route>>>,
}

impl RouteCache {
    pub fn new(port: u16, dial_timeout: Option<Duration>, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            port,
            dial_timeout,
            reporter,
            connector: Arc::new(TcpConnector),
            routes: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Returns the cached route for `host`, dialing one first if needed.
    /// A failed dial caches nothing.
    pub async fn get_or_create(&self, host: &str) -> Result<Arc<Route>> {
        let mut routes = self.routes.lock().await;
        if let Some(route) = routes.get(host) {
            return Ok(Arc::clone(route));
        }

        let addr = dial_addr(host, self.port);
        let stream = match self.dial(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                self.reporter
                    .error(TARGET, &format!("Could not create route to {}: {}", host, e));
                return Err(e);
            }
        };
        self.reporter
            .info(TARGET, &format!("Creating new route to {} ({})", host, addr));

        let route = Arc::new(Route::new(host.to_string(), stream));
        routes.insert(host.to_string(), Arc::clone(&route));
        Ok(route)
    }

    async fn dial(&self, addr: &str) -> Result<TcpStream> {
        let connect = self.connector.connect(addr);
        let connected = match self.dial_timeout {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                RelayError::DialTimeout {
                    addr: addr.to_string(),
                    timeout: limit,
                }
            })?,
            None => connect.await,
        };
        let stream = connected.map_err(|source| RelayError::Dial {
            addr: addr.to_string(),
            source,
        })?;
        if let Err(e) = stream.set_nodelay(true) {
            self.reporter
                .debug(TARGET, &format!("Could not set TCP_NODELAY on {}: {}", addr, e));
        }
        Ok(stream)
    }

    /// Removes and closes the route for `host`, if any.
    pub async fn evict(&self, host: &str) -> bool {
        let removed = self.routes.lock().await.remove(host);
        match removed {
            Some(route) => {
                route.close().await;
                self.reporter
                    .info(TARGET, &format!("Closed route to {}", host));
                true
            }
            None => false,
        }
    }

    /// Closes `route` and drops it from the cache, unless the cache already
    /// holds a different route for its host.  Returns whether it was removed.
    pub async fn evict_route(&self, route: &Arc<Route>) -> bool {
        let removed = {
            let mut routes = self.routes.lock().await;
            match routes.get(route.host()) {
                Some(cached) if Arc::ptr_eq(cached, route) => {
                    routes.remove(route.host());
                    true
                }
                _ => false,
            }
        };
        route.close().await;
        removed
    }

    /// Closes every cached route.
    pub async fn clear(&self) {
        let drained: Vec<_> = self.routes.lock().await.drain().collect();
        for (host, route) in drained {
            route.close().await;
            self.reporter
                .info(TARGET, &format!("Closed route to {}", host));
        }
    }

    pub async fn len(&self) -> usize {
        self.routes.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.routes.lock().await.is_empty()
    }

    pub async fn contains(&self, host: &str) -> bool {
        self.routes.lock().await.contains_key(host)
    }
}

/// Resolves the address to dial for `host`.  A host that already names a
/// port is used as is.
fn dial_addr(host: &str, port: u16) -> String {
    if host.parse::<SocketAddr>().is_ok() {
        host.to_string()
    } else if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
