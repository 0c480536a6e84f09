//! Transaction storage

use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlRow};
use sqlx::Row;
use tracing::debug;

use crate::transaction::{NewTransaction, PageRequest, Transaction};
use crate::{Result, ServerError};

/// Storage operations on the `transactions` table of one database
#[async_trait]
pub trait TransactionRepository: Send + Sync + 'static {
    /// Newest first: `transaction_date` descending, then sequence descending
    async fn list_transactions(&self, page: PageRequest) -> Result<Vec<Transaction>>;

    /// Insert a row and return its assigned sequence id
    async fn create_transaction(&self, transaction: &NewTransaction) -> Result<i64>;

    async fn get_transaction(&self, sequence_id: i64) -> Result<Transaction>;
}

const SELECT_COLUMNS: &str = "SELECT transactions_seq, coin_symbol, transaction_type, quantity, \
     price_per_unit, total_cost, transaction_date, exchange, notes, created_at FROM transactions";

/// MySQL-backed repository bound to one pool
#[derive(Debug, Clone)]
pub struct MySqlTransactionRepository {
    pool: MySqlPool,
    database_id: String,
}

impl MySqlTransactionRepository {
    pub fn new(pool: MySqlPool, database_id: String) -> Self {
        Self { pool, database_id }
    }

    fn map_row(row: &MySqlRow) -> std::result::Result<Transaction, sqlx::Error> {
        Ok(Transaction {
            sequence_id: row.try_get("transactions_seq")?,
            coin_symbol: row.try_get("coin_symbol")?,
            transaction_type: row.try_get("transaction_type")?,
            quantity: row.try_get("quantity")?,
            price_per_unit: row.try_get("price_per_unit")?,
            total_cost: row.try_get("total_cost")?,
            transaction_date: row.try_get("transaction_date")?,
            exchange: row.try_get("exchange")?,
            notes: row.try_get("notes")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl TransactionRepository for MySqlTransactionRepository {
    async fn list_transactions(&self, page: PageRequest) -> Result<Vec<Transaction>> {
        let sql = format!(
            "{} ORDER BY transaction_date DESC, transactions_seq DESC LIMIT ? OFFSET ?",
            SELECT_COLUMNS
        );

        let rows = sqlx::query(&sql)
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ServerError::query_error(&self.database_id, "list_transactions", e))?;

        debug!(
            database_id = %self.database_id,
            rows = rows.len(),
            page = page.page,
            "Listed transactions"
        );

        rows.iter()
            .map(Self::map_row)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ServerError::query_error(&self.database_id, "list_transactions", e))
    }

    async fn create_transaction(&self, transaction: &NewTransaction) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO transactions (coin_symbol, transaction_type, quantity, price_per_unit, \
             total_cost, transaction_date, exchange, notes) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&transaction.coin_symbol)
        .bind(&transaction.transaction_type)
        .bind(transaction.quantity)
        .bind(transaction.price_per_unit)
        .bind(transaction.total_cost)
        .bind(transaction.transaction_date)
        .bind(&transaction.exchange)
        .bind(transaction.notes.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| ServerError::query_error(&self.database_id, "create_transaction", e))?;

        let sequence_id = result.last_insert_id() as i64;
        debug!(database_id = %self.database_id, sequence_id, "Created transaction");

        Ok(sequence_id)
    }

    async fn get_transaction(&self, sequence_id: i64) -> Result<Transaction> {
        let sql = format!("{} WHERE transactions_seq = ?", SELECT_COLUMNS);

        let row = sqlx::query(&sql)
            .bind(sequence_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ServerError::query_error(&self.database_id, "get_transaction", e))?;

        match row {
            Some(row) => Self::map_row(&row)
                .map_err(|e| ServerError::query_error(&self.database_id, "get_transaction", e)),
            None => Err(ServerError::not_found("transaction", sequence_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::connection::{Connector, DatabaseHandle, MySqlConnector};
    use crate::environment::DatabaseConfig;
    use crate::transaction::CreateTransactionRequest;

    /// Runs against `TEST_DATABASE_URL` when set, expecting `schema.sql` applied
    #[tokio::test]
    async fn test_create_list_get_round_trip() {
        let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
            eprintln!("TEST_DATABASE_URL not set, skipping");
            return;
        };

        let config = DatabaseConfig::from_dsn("real", &url);
        let handle = MySqlConnector::new().open(&config, &PoolConfig::default()).await.unwrap();
        let repo = handle.repository();

        let new_tx = CreateTransactionRequest::from_json(
            br#"{"coin_symbol":"BTC","transaction_type":"BUY","quantity":0.5,
                "price_per_unit":42000,"total_cost":21000,"transaction_date":"2999-01-15",
                "exchange":"TEST_EXCHANGE","notes":""}"#,
        )
        .unwrap()
        .validate()
        .unwrap();

        let id = repo.create_transaction(&new_tx).await.unwrap();
        assert!(id > 0);

        let stored = repo.get_transaction(id).await.unwrap();
        assert_eq!(stored.coin_symbol, "BTC");
        assert_eq!(stored.notes, None);

        // Far-future date sorts first
        let page = repo.list_transactions(PageRequest::default()).await.unwrap();
        assert_eq!(page.first().map(|t| t.sequence_id), Some(id));

        sqlx::query("DELETE FROM transactions WHERE exchange = 'TEST_EXCHANGE'")
            .execute(handle.pool())
            .await
            .unwrap();

        let err = repo.get_transaction(id).await.unwrap_err();
        assert_eq!(err.status_code(), 404);

        handle.close().await;
    }
}
