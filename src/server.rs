//! HTTP server lifecycle

use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::connection::Connector;
use crate::environment::DatabaseRegistry;
use crate::pool::ConnectionPoolManager;
use crate::router::routes;
use crate::{Result, ServerError};

/// Transactions API server for one connector
pub struct ApiServer<C: Connector> {
    config: Config,
    manager: Arc<ConnectionPoolManager<C>>,
}

impl<C: Connector> ApiServer<C> {
    pub fn new(config: Config, registry: DatabaseRegistry, connector: C) -> Self {
        let manager = Arc::new(ConnectionPoolManager::new(
            connector,
            Arc::new(registry),
            config.pool.clone(),
        ));

        Self { config, manager }
    }

    pub fn manager(&self) -> &Arc<ConnectionPoolManager<C>> {
        &self.manager
    }

    /// Serve until `shutdown` resolves, then close every database pool
    pub async fn run<S>(self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let addr = self.config.server.socket_addr()?;
        let filter = routes(Arc::clone(&self.manager), self.config.server.request_timeout());

        let (bound, server) = warp::serve(filter)
            .try_bind_with_graceful_shutdown(addr, shutdown)
            .map_err(|e| {
                ServerError::configuration_error(
                    "server.listen_addr".to_string(),
                    format!("cannot listen on {}: {}", addr, e),
                )
            })?;

        if self.config.pool.eager_connect {
            let report = self.manager.connect_all().await;
            for (id, reason) in &report.failed {
                warn!(database_id = %id, "Database unavailable at startup: {}", reason);
            }
        }

        let monitor = if self.config.pool.health_check_enabled {
            Some(self.manager.spawn_health_monitor())
        } else {
            None
        };

        info!("Transactions API listening on http://{}", bound);
        server.await;
        info!("HTTP server stopped, releasing database pools");

        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
        self.manager.shutdown().await;

        info!("Server shutdown complete");
        Ok(())
    }
}
