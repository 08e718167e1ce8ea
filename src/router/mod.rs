//! Inter-node relay.
//!
//! A [`Router`] plays both roles a node needs: it listens for updates
//! relayed by peers ([`Router::handle_updates`]) and forwards updates to
//! the node holding a client's connection ([`Router::send_update`]).

use std::sync::Arc;

use tokio::net::TcpListener;

use crate::codec;
use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::reporter::{NoopReporter, Reporter};
use crate::types::Update;
use crate::updater::Updater;

pub mod listener;
pub mod routes;

pub use listener::UpdateListener;
pub use routes::{Route, RouteCache};

use listener::ReadLimits;

const TARGET: &str = "router";

pub struct Router {
    config: Config,
    reporter: Arc<dyn Reporter>,
    routes: RouteCache,
}

impl Router {
    /// Builds a router that reports nothing.
    pub fn new(config: Config) -> Self {
        Self::with_reporter(config, Arc::new(NoopReporter))
    }

    pub fn with_reporter(config: Config, reporter: Arc<dyn Reporter>) -> Self {
        let routes = RouteCache::new(config.port, config.dial_timeout(), Arc::clone(&reporter));
        Self {
            config,
            reporter,
            routes,
        }
    }

    /// Binds the update listener without accepting yet.
    ///
    /// A bind failure is reported as critical: the relay cannot run.
    pub async fn listen(&self) -> Result<UpdateListener> {
        let addr = (self.config.bind_ip, self.config.port);
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                let err = RelayError::Bind {
                    addr: format!("{}:{}", self.config.bind_ip, self.config.port),
                    source,
                };
                self.reporter.critical(TARGET, &err.to_string());
                return Err(err);
            }
        };

        let local = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| format!("*:{}", self.config.port));
        self.reporter
            .info(TARGET, &format!("Listening for updates on {}", local));

        let limits = ReadLimits {
            read_buffer: self.config.read_buffer_bytes,
            max_line: self.config.max_line_bytes,
        };
        Ok(UpdateListener::new(
            listener,
            Arc::clone(&self.reporter),
            limits,
            self.config.accept_backoff(),
        ))
    }

    /// Listens on the configured port and hands every update peers relay
    /// to `updater`.  Only returns if the listener cannot be bound.
    pub async fn handle_updates(&self, updater: Arc<dyn Updater>) -> Result<()> {
        self.listen().await?.serve(updater).await;
        Ok(())
    }

    /// Forwards one update to `host`, dialing it first if no route is
    /// cached.
    ///
    /// A failed write closes and evicts the route so the next send dials
    /// again.  Nothing is retried here.
    pub async fn send_update(
        &self,
        host: &str,
        client_id: &str,
        channel_id: &str,
        version: i64,
    ) -> Result<()> {
        let line = codec::encode(&Update::new(client_id, channel_id, version))?;
        let route = self.routes.get_or_create(host).await?;

        self.reporter
            .debug(TARGET, &format!("Writing to host {}", host));
        if let Err(source) = route.write(&line).await {
            self.reporter
                .error(TARGET, &format!("Closing route to {}: {}", host, source));
            self.routes.evict_route(&route).await;
            return Err(RelayError::Write {
                host: host.to_string(),
                source,
            });
        }
        Ok(())
    }

    /// Drops the cached route to `host`, closing its connection.
    pub async fn evict(&self, host: &str) -> bool {
        self.routes.evict(host).await
    }

    /// Closes every outbound route, e.g. on shutdown.
    pub async fn close_routes(&self) {
        self.routes.clear().await;
    }

    pub async fn route_count(&self) -> usize {
        self.routes.len().await
    }

    pub async fn has_route(&self, host: &str) -> bool {
        self.routes.contains(host).await
    }
}
