//! In-process backend
//!
//! Implements the connection seam without a database server. Reachability of
//! each database can be flipped at runtime and opens/closes are counted, which
//! is what the pool lifecycle and HTTP tests drive.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::PoolConfig;
use crate::connection::{Connector, DatabaseHandle};
use crate::environment::DatabaseConfig;
use crate::error::ConnectionFailureKind;
use crate::repository::TransactionRepository;
use crate::transaction::{NewTransaction, PageRequest, Transaction};
use crate::{Result, ServerError};

#[derive(Debug)]
struct MemoryDatabase {
    reachable: AtomicBool,
    rows: RwLock<Vec<Transaction>>,
    next_sequence: AtomicI64,
}

impl MemoryDatabase {
    fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            rows: RwLock::new(Vec::new()),
            next_sequence: AtomicI64::new(1),
        }
    }
}

#[derive(Debug, Default)]
struct ConnectorState {
    databases: RwLock<HashMap<String, Arc<MemoryDatabase>>>,
    opens: AtomicUsize,
    closes: Arc<AtomicUsize>,
    open_delay_ms: AtomicU64,
}

/// Connector over in-memory databases
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    state: Arc<ConnectorState>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or reset to reachable) a database. Unknown ids refuse to open.
    pub async fn add_database(&self, id: &str) {
        let mut databases = self.state.databases.write().await;
        databases
            .entry(id.to_lowercase())
            .or_insert_with(|| Arc::new(MemoryDatabase::new()))
            .reachable
            .store(true, Ordering::SeqCst);
    }

    /// Take a database down or bring it back. Existing handles see the change.
    pub async fn set_reachable(&self, id: &str, reachable: bool) {
        if let Some(db) = self.state.databases.read().await.get(&id.to_lowercase()) {
            db.reachable.store(reachable, Ordering::SeqCst);
        }
    }

    /// Delay every open, to widen race windows in tests
    pub fn set_open_delay(&self, delay: Duration) {
        self.state.open_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of open attempts so far
    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Number of `close` calls on handles so far
    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Handle = MemoryHandle;

    async fn open(&self, config: &DatabaseConfig, _settings: &PoolConfig) -> Result<MemoryHandle> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);

        let delay = self.state.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let database = self.state.databases.read().await.get(&config.id).cloned();
        match database {
            Some(database) if database.reachable.load(Ordering::SeqCst) => Ok(MemoryHandle {
                database_id: config.id.clone(),
                database,
                closed: Arc::new(AtomicBool::new(false)),
                closes: self.state.closes.clone(),
            }),
            _ => Err(ServerError::connection_failed(
                &config.id,
                ConnectionFailureKind::Refused,
                "in-memory database is unreachable".to_string(),
            )),
        }
    }
}

/// Handle to one in-memory database
#[derive(Debug, Clone)]
pub struct MemoryHandle {
    database_id: String,
    database: Arc<MemoryDatabase>,
    closed: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
}

impl MemoryHandle {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatabaseHandle for MemoryHandle {
    type Repository = MemoryRepository;

    async fn ping(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ServerError::connection_failed(
                &self.database_id,
                ConnectionFailureKind::Closed,
                "handle is closed".to_string(),
            ));
        }

        if !self.database.reachable.load(Ordering::SeqCst) {
            return Err(ServerError::connection_failed(
                &self.database_id,
                ConnectionFailureKind::ProbeFailed,
                "in-memory database is unreachable".to_string(),
            ));
        }

        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn repository(&self) -> MemoryRepository {
        MemoryRepository {
            database_id: self.database_id.clone(),
            database: self.database.clone(),
        }
    }
}

/// Repository over an in-memory table
#[derive(Debug, Clone)]
pub struct MemoryRepository {
    database_id: String,
    database: Arc<MemoryDatabase>,
}

impl MemoryRepository {
    fn check_reachable(&self) -> Result<()> {
        if self.database.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ServerError::connection_failed(
                &self.database_id,
                ConnectionFailureKind::Lost,
                "in-memory database went away".to_string(),
            ))
        }
    }
}

#[async_trait]
impl TransactionRepository for MemoryRepository {
    async fn list_transactions(&self, page: PageRequest) -> Result<Vec<Transaction>> {
        self.check_reachable()?;

        let mut rows = self.database.rows.read().await.clone();
        rows.sort_by(|a, b| {
            b.transaction_date
                .cmp(&a.transaction_date)
                .then(b.sequence_id.cmp(&a.sequence_id))
        });

        Ok(rows
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .collect())
    }

    async fn create_transaction(&self, transaction: &NewTransaction) -> Result<i64> {
        self.check_reachable()?;

        let mut rows = self.database.rows.write().await;
        let sequence_id = self.database.next_sequence.fetch_add(1, Ordering::SeqCst);

        rows.push(Transaction {
            sequence_id,
            coin_symbol: transaction.coin_symbol.clone(),
            transaction_type: transaction.transaction_type.clone(),
            quantity: transaction.quantity,
            price_per_unit: transaction.price_per_unit,
            total_cost: transaction.total_cost,
            transaction_date: transaction.transaction_date,
            exchange: transaction.exchange.clone(),
            notes: transaction.notes.clone(),
            created_at: Utc::now(),
        });

        Ok(sequence_id)
    }

    async fn get_transaction(&self, sequence_id: i64) -> Result<Transaction> {
        self.check_reachable()?;

        self.database
            .rows
            .read()
            .await
            .iter()
            .find(|t| t.sequence_id == sequence_id)
            .cloned()
            .ok_or_else(|| ServerError::not_found("transaction", sequence_id.to_string()))
    }
}
