//! Crypto ledger API
//!
//! An HTTP API over a `transactions` table that lives in several independently
//! configured MySQL databases. Each request names its database in the path;
//! the connection pool manager connects lazily, probes handles before reuse,
//! backs off after failures and recovers databases in the background.

pub mod config;
pub mod connection;
pub mod environment;
pub mod error;
pub mod handlers;
#[doc(hidden)]
pub mod memory;
pub mod pool;
pub mod repository;
pub mod router;
pub mod server;
pub mod transaction;

pub use config::{Config, PoolConfig, RetryPolicy, ServerConfig};
pub use environment::{DatabaseConfig, DatabaseRegistry, DatabaseSource};
pub use error::{ConnectionFailureKind, Result, ServerError, ValidationCode};
pub use pool::ConnectionPoolManager;
pub use server::ApiServer;
