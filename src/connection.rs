//! Database connection seam
//!
//! The pool manager only talks to [`Connector`] and [`DatabaseHandle`], so the
//! MySQL backend here and the in-memory backend in [`crate::memory`] are
//! interchangeable.

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::Connection;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::environment::{DatabaseConfig, DatabaseSource};
use crate::error::ConnectionFailureKind;
use crate::repository::{MySqlTransactionRepository, TransactionRepository};
use crate::{Result, ServerError};

/// A live, pooled connection to one database
#[async_trait]
pub trait DatabaseHandle: Clone + Send + Sync + 'static {
    type Repository: TransactionRepository;

    /// Cheap liveness check
    async fn ping(&self) -> Result<()>;

    /// Release every underlying connection. Idempotent.
    async fn close(&self);

    /// Repository bound to this handle
    fn repository(&self) -> Self::Repository;
}

/// Opens handles from configuration
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Handle: DatabaseHandle;

    /// Build a pool for `config` and verify it with one ping
    async fn open(&self, config: &DatabaseConfig, settings: &PoolConfig) -> Result<Self::Handle>;
}

/// Opens `sqlx` MySQL pools
#[derive(Debug, Clone, Default)]
pub struct MySqlConnector;

impl MySqlConnector {
    pub fn new() -> Self {
        Self
    }
}

/// Driver options for a configured database
pub fn connect_options(config: &DatabaseConfig) -> Result<MySqlConnectOptions> {
    match &config.source {
        DatabaseSource::ConnectionString(dsn) => MySqlConnectOptions::from_str(dsn).map_err(|e| {
            ServerError::configuration_error(
                format!("{} connection string", config.id),
                e.to_string(),
            )
        }),
        DatabaseSource::Components {
            host,
            port,
            name,
            user,
            password,
        } => Ok(MySqlConnectOptions::new()
            .host(host)
            .port(*port)
            .database(name)
            .username(user)
            .password(password)),
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    type Handle = MySqlHandle;

    async fn open(&self, config: &DatabaseConfig, settings: &PoolConfig) -> Result<MySqlHandle> {
        info!(
            database_id = %config.id,
            url = %config.masked_connection_url(),
            "Opening database pool"
        );

        let options = connect_options(config)?;

        let pool = MySqlPoolOptions::new()
            .max_connections(settings.max_open_connections)
            .min_connections(settings.max_idle_connections)
            .max_lifetime(settings.max_lifetime())
            .idle_timeout(settings.idle_timeout())
            .acquire_timeout(settings.connect_timeout())
            .connect_lazy_with(options);

        let handle = MySqlHandle {
            pool,
            database_id: config.id.clone(),
        };

        // Closes the pool if this future is dropped before verification ends
        let guard = CloseOnDrop(Some(handle.pool.clone()));

        if let Err(err) = handle.ping().await {
            handle.close().await;
            guard.disarm();
            return Err(err);
        }

        guard.disarm();
        debug!(database_id = %config.id, "Database pool verified");
        Ok(handle)
    }
}

/// Closes a pool that never made it out of [`MySqlConnector::open`]
struct CloseOnDrop(Option<MySqlPool>);

impl CloseOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        let Some(pool) = self.0.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("Closing pool abandoned during open");
                runtime.spawn(async move { pool.close().await });
            }
            Err(_) => warn!("No runtime available to close an abandoned pool"),
        }
    }
}

/// A verified MySQL pool for one database
#[derive(Debug, Clone)]
pub struct MySqlHandle {
    pool: MySqlPool,
    database_id: String,
}

impl MySqlHandle {
    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

#[async_trait]
impl DatabaseHandle for MySqlHandle {
    type Repository = MySqlTransactionRepository;

    async fn ping(&self) -> Result<()> {
        if self.pool.is_closed() {
            return Err(ServerError::connection_failed(
                &self.database_id,
                ConnectionFailureKind::Closed,
                "pool is closed".to_string(),
            ));
        }

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| ServerError::from_driver(&self.database_id, &e))?;

        conn.ping().await.map_err(|e| {
            let kind = match ConnectionFailureKind::classify(&e) {
                ConnectionFailureKind::Unknown => ConnectionFailureKind::ProbeFailed,
                kind => kind,
            };
            ServerError::connection_failed(&self.database_id, kind, e.to_string())
        })
    }

    async fn close(&self) {
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!(database_id = %self.database_id, "Database pool closed");
        } else {
            warn!(database_id = %self.database_id, "Database pool already closed");
        }
    }

    fn repository(&self) -> MySqlTransactionRepository {
        MySqlTransactionRepository::new(self.pool.clone(), self.database_id.clone())
    }
}
