//! Request handlers and JSON response helpers

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::Reply;

use crate::connection::Connector;
use crate::pool::{ConnectionPoolManager, ReadinessStatus};
use crate::repository::TransactionRepository;
use crate::transaction::{CreateTransactionRequest, PageRequest, TransactionPage};
use crate::{Result, ServerError};

/// Per-request dependencies for one resolved database
#[derive(Debug, Clone)]
pub struct DatabaseContext<R> {
    /// Lowercase id from the request path
    pub database_id: String,
    pub repository: R,
}

/// Body of every error response
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub code: String,
}

pub fn json_response<T: Serialize>(body: &T, status: StatusCode) -> Response {
    warp::reply::with_status(warp::reply::json(body), status).into_response()
}

/// Error response with an explicit status and code
pub fn error_reply(status: StatusCode, error: &str, message: &str, code: &str) -> Response {
    json_response(
        &ErrorBody {
            error: error.to_string(),
            message: message.to_string(),
            code: code.to_string(),
        },
        status,
    )
}

/// Map a server error to its HTTP response. Only client-safe text is sent.
pub fn error_response(err: &ServerError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    debug!(
        status = status.as_u16(),
        code = err.error_code(),
        "{}",
        err.detailed_message()
    );
    error_reply(status, err.title(), &err.user_message(), err.error_code())
}

/// Collapse a handler result into a response
pub fn respond(result: Result<Response>) -> Response {
    result.unwrap_or_else(|err| error_response(&err))
}

/// `GET /api/{database_id}/crypto/transactions`
pub async fn list_transactions<R: TransactionRepository>(
    ctx: DatabaseContext<R>,
    page: PageRequest,
) -> Result<Response> {
    let data = ctx.repository.list_transactions(page).await?;

    debug!(database_id = %ctx.database_id, rows = data.len(), "Listing transactions");

    Ok(json_response(
        &TransactionPage {
            data,
            page: page.page,
            page_size: page.page_size,
        },
        StatusCode::OK,
    ))
}

/// `POST /api/{database_id}/crypto/transactions`
pub async fn create_transaction<R: TransactionRepository>(
    ctx: DatabaseContext<R>,
    body: &[u8],
) -> Result<Response> {
    let transaction = CreateTransactionRequest::from_json(body)?.validate()?;
    let sequence_id = ctx.repository.create_transaction(&transaction).await?;

    info!(
        database_id = %ctx.database_id,
        sequence_id,
        coin_symbol = %transaction.coin_symbol,
        "Transaction created"
    );

    Ok(json_response(
        &json!({ "status": "created", "sequence_id": sequence_id }),
        StatusCode::CREATED,
    ))
}

/// `GET /api/{database_id}/crypto/transactions/{sequence_id}`
pub async fn get_transaction<R: TransactionRepository>(
    ctx: DatabaseContext<R>,
    sequence_id: i64,
) -> Result<Response> {
    let transaction = ctx.repository.get_transaction(sequence_id).await?;
    Ok(json_response(&transaction, StatusCode::OK))
}

/// `GET /health`: liveness only, no database access
pub fn health() -> Response {
    json_response(
        &json!({ "status": "ok", "timestamp": Utc::now() }),
        StatusCode::OK,
    )
}

/// `GET /health/readiness`
pub async fn readiness<C: Connector>(manager: &ConnectionPoolManager<C>) -> Response {
    let report = manager.readiness().await;
    let status = match report.status {
        ReadinessStatus::NotReady => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    json_response(&report, status)
}

#[derive(Debug, Serialize)]
struct DatabaseSummary {
    id: String,
    connected: bool,
}

/// `GET /databases`
pub async fn list_databases<C: Connector>(manager: &ConnectionPoolManager<C>) -> Response {
    let connected = manager.connected_ids().await;
    let databases: Vec<DatabaseSummary> = manager
        .registry()
        .ids()
        .map(|id| DatabaseSummary {
            id: id.to_string(),
            connected: connected.iter().any(|c| c == id),
        })
        .collect();

    json_response(
        &json!({ "count": databases.len(), "databases": databases }),
        StatusCode::OK,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::connection::DatabaseHandle;
    use crate::environment::DatabaseConfig;
    use crate::memory::{MemoryConnector, MemoryRepository};

    async fn context() -> DatabaseContext<MemoryRepository> {
        let connector = MemoryConnector::new();
        connector.add_database("main").await;
        let handle = connector
            .open(&DatabaseConfig::from_dsn("main", "mysql://u:p@h/db"), &PoolConfig::default())
            .await
            .unwrap();

        DatabaseContext {
            database_id: "main".to_string(),
            repository: handle.repository(),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = warp::hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let ctx = context().await;
        let body = br#"{"coin_symbol":"SOL","transaction_type":"SELL","quantity":3,
            "price_per_unit":100,"total_cost":300,
            "transaction_date":"2024-05-01","exchange":"Binance"}"#;

        let response = create_transaction(ctx.clone(), body).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["status"], "created");

        let id = created["sequence_id"].as_i64().unwrap();
        let response = get_transaction(ctx, id).await.unwrap();
        let tx = body_json(response).await;
        assert_eq!(tx["coin_symbol"], "SOL");
        assert_eq!(tx["quantity"], 3.0);
        assert_eq!(tx["transaction_date"], "2024-05-01");
        assert!(tx["notes"].is_null());
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let err = ServerError::config_not_found("ghost");
        let response = error_response(&err);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_json(response).await;
        assert_eq!(body["error"], "Database Not Found");
        assert_eq!(body["code"], "DB_NOT_FOUND");
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn test_validation_failure_inserts_nothing() {
        let ctx = context().await;
        let body = br#"{"coin_symbol":"BTC","transaction_type":"BUY","quantity":1,
            "price_per_unit":1,"total_cost":1,"transaction_date":"01/15/2024","exchange":"X"}"#;

        let err = create_transaction(ctx.clone(), body).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_DATE_FORMAT");

        let response = list_transactions(ctx, PageRequest::default()).await.unwrap();
        let page = body_json(response).await;
        assert_eq!(page["data"].as_array().unwrap().len(), 0);
        assert_eq!(page["page"], 1);
        assert_eq!(page["page_size"], 20);
    }

    #[tokio::test]
    async fn test_health_has_timestamp() {
        let body = body_json(health()).await;
        assert_eq!(body["status"], "ok");
        assert!(body["timestamp"].is_string());
    }
}
