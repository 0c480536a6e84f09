//! HTTP routes
//!
//! Every API route resolves its database inside the handler, so a bad id or an
//! unavailable database becomes a JSON response rather than a warp rejection.
//! Rejections are left for genuinely unmatched requests and are turned into
//! JSON by [`handle_rejection`].

use futures::{pin_mut, Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};
use warp::http::StatusCode;
use warp::hyper::body::Buf;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::connection::{Connector, DatabaseHandle};
use crate::handlers::{self, error_reply, respond, DatabaseContext};
use crate::pool::ConnectionPoolManager;
use crate::transaction::PageRequest;
use crate::{Result, ServerError};

/// Largest accepted request body
const MAX_BODY_BYTES: u64 = 64 * 1024;

/// Why a request body was refused
#[derive(Debug, PartialEq, Eq)]
enum BodyError {
    LengthRequired,
    TooLarge,
    Unreadable,
}

impl BodyError {
    fn into_response(self) -> Response {
        match self {
            BodyError::LengthRequired => error_reply(
                StatusCode::LENGTH_REQUIRED,
                "Length Required",
                "A Content-Length header is required",
                "LENGTH_REQUIRED",
            ),
            BodyError::TooLarge => error_reply(
                StatusCode::PAYLOAD_TOO_LARGE,
                "Payload Too Large",
                "The request body is too large",
                "PAYLOAD_TOO_LARGE",
            ),
            BodyError::Unreadable => error_reply(
                StatusCode::BAD_REQUEST,
                "Bad Request",
                "The request body could not be read",
                "INVALID_BODY",
            ),
        }
    }
}

fn invalid_query() -> Response {
    error_reply(
        StatusCode::BAD_REQUEST,
        "Bad Request",
        "The query string could not be parsed",
        "INVALID_QUERY",
    )
}

/// Read at most [`MAX_BODY_BYTES`] of `body`
async fn read_body<S, B>(
    content_length: Option<u64>,
    body: S,
) -> std::result::Result<Vec<u8>, BodyError>
where
    S: Stream<Item = std::result::Result<B, warp::Error>>,
    B: Buf,
{
    let declared = content_length.ok_or(BodyError::LengthRequired)?;
    if declared > MAX_BODY_BYTES {
        return Err(BodyError::TooLarge);
    }

    pin_mut!(body);
    let mut bytes = Vec::with_capacity(declared as usize);
    while let Some(chunk) = body.next().await {
        let mut chunk = chunk.map_err(|e| {
            debug!("Failed to read request body: {}", e);
            BodyError::Unreadable
        })?;

        while chunk.has_remaining() {
            let part = chunk.chunk();
            if (bytes.len() + part.len()) as u64 > MAX_BODY_BYTES {
                return Err(BodyError::TooLarge);
            }
            bytes.extend_from_slice(part);
            let read = part.len();
            chunk.advance(read);
        }
    }

    Ok(bytes)
}

/// Raw paging parameters; parsed leniently by [`PageRequest::from_raw`]
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub page: Option<String>,
    pub page_size: Option<String>,
}

/// Shared state for the API routes
pub struct RouteState<C: Connector> {
    pub manager: Arc<ConnectionPoolManager<C>>,
    pub request_timeout: Duration,
}

impl<C: Connector> Clone for RouteState<C> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            request_timeout: self.request_timeout,
        }
    }
}

impl<C: Connector> RouteState<C> {
    /// Resolve the path selector to a repository
    async fn resolve(
        &self,
        database_id: &str,
    ) -> Result<DatabaseContext<<C::Handle as DatabaseHandle>::Repository>> {
        let database_id = database_id.to_lowercase();
        let handle = self.manager.get_connection(&database_id).await?;

        Ok(DatabaseContext {
            database_id,
            repository: handle.repository(),
        })
    }

    /// Bound resolution plus handling by the request timeout
    async fn with_deadline<F>(&self, work: F) -> Response
    where
        F: Future<Output = Result<Response>>,
    {
        let limit = self.request_timeout;
        respond(match tokio::time::timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => Err(ServerError::timeout_error(
                "request".to_string(),
                limit.as_millis() as u64,
            )),
        })
    }
}

fn with_state<C: Connector>(
    state: RouteState<C>,
) -> impl Filter<Extract = (RouteState<C>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// `None` when the query string did not parse
async fn list_route<C: Connector>(
    database_id: String,
    query: Option<ListQuery>,
    state: RouteState<C>,
) -> std::result::Result<Response, Infallible> {
    Ok(state
        .with_deadline(async {
            let ctx = state.resolve(&database_id).await?;
            let Some(query) = query else {
                return Ok(invalid_query());
            };

            let page = PageRequest::from_raw(query.page.as_deref(), query.page_size.as_deref());
            handlers::list_transactions(ctx, page).await
        })
        .await)
}

async fn create_route<C, S, B>(
    database_id: String,
    state: RouteState<C>,
    content_length: Option<u64>,
    body: S,
) -> std::result::Result<Response, Infallible>
where
    C: Connector,
    S: Stream<Item = std::result::Result<B, warp::Error>> + Send,
    B: Buf + Send,
{
    Ok(state
        .with_deadline(async {
            let ctx = state.resolve(&database_id).await?;
            let body = match read_body(content_length, body).await {
                Ok(body) => body,
                Err(e) => return Ok(e.into_response()),
            };

            handlers::create_transaction(ctx, &body).await
        })
        .await)
}

async fn get_route<C: Connector>(
    database_id: String,
    sequence_id: i64,
    state: RouteState<C>,
) -> std::result::Result<Response, Infallible> {
    Ok(state
        .with_deadline(async {
            let ctx = state.resolve(&database_id).await?;
            handlers::get_transaction(ctx, sequence_id).await
        })
        .await)
}

async fn readiness_route<C: Connector>(
    state: RouteState<C>,
) -> std::result::Result<Response, Infallible> {
    Ok(handlers::readiness(&state.manager).await)
}

async fn databases_route<C: Connector>(
    state: RouteState<C>,
) -> std::result::Result<Response, Infallible> {
    Ok(handlers::list_databases(&state.manager).await)
}

/// All routes, with CORS, request tracing and JSON rejections
pub fn routes<C: Connector>(
    manager: Arc<ConnectionPoolManager<C>>,
    request_timeout: Duration,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let state = RouteState {
        manager,
        request_timeout,
    };

    // Query and body problems are reported only after the database resolves
    let query = warp::query::<ListQuery>()
        .map(Some)
        .or(warp::any().map(|| None::<ListQuery>))
        .unify();

    let list = warp::path!("api" / String / "crypto" / "transactions")
        .and(warp::get())
        .and(query)
        .and(with_state(state.clone()))
        .and_then(list_route::<C>);

    let create = warp::path!("api" / String / "crypto" / "transactions")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(warp::header::optional::<u64>("content-length"))
        .and(warp::body::stream())
        .and_then(create_route::<C, _, _>);

    let get_one = warp::path!("api" / String / "crypto" / "transactions" / i64)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_route::<C>);

    let health = warp::path!("health").and(warp::get()).map(handlers::health);

    let readiness = warp::path!("health" / "readiness")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(readiness_route::<C>);

    let databases = warp::path!("databases")
        .and(warp::get())
        .and(with_state(state))
        .and_then(databases_route::<C>);

    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(vec!["content-type", "authorization", "accept"])
        .allow_methods(vec!["GET", "POST", "OPTIONS"]);

    list.or(create)
        .unify()
        .or(get_one)
        .unify()
        .or(health)
        .unify()
        .or(readiness)
        .unify()
        .or(databases)
        .unify()
        .with(cors)
        .recover(handle_rejection)
        .with(warp::trace::request())
}

/// Turn unmatched requests into JSON errors
pub async fn handle_rejection(err: Rejection) -> std::result::Result<Response, Infallible> {
    if err.is_not_found() {
        return Ok(error_reply(
            StatusCode::NOT_FOUND,
            "Not Found",
            "The requested route does not exist",
            "ROUTE_NOT_FOUND",
        ));
    }

    if let Some(server_error) = err.find::<ServerError>() {
        return Ok(handlers::error_response(server_error));
    }

    // warp keeps a sibling route's MethodNotAllowed next to the real cause, so
    // it is checked last
    if err.find::<warp::reject::InvalidQuery>().is_some() {
        return Ok(invalid_query());
    }

    if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        return Ok(BodyError::TooLarge.into_response());
    }

    if err.find::<warp::reject::LengthRequired>().is_some() {
        return Ok(BodyError::LengthRequired.into_response());
    }

    if err.find::<warp::reject::InvalidHeader>().is_some() {
        return Ok(error_reply(
            StatusCode::BAD_REQUEST,
            "Bad Request",
            "A request header could not be parsed",
            "INVALID_HEADER",
        ));
    }

    if err.find::<warp::cors::CorsForbidden>().is_some() {
        return Ok(error_reply(
            StatusCode::FORBIDDEN,
            "Forbidden",
            "The CORS request is not allowed",
            "CORS_FORBIDDEN",
        ));
    }

    if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        return Ok(error_reply(
            StatusCode::METHOD_NOT_ALLOWED,
            "Method Not Allowed",
            "The requested method is not supported for this route",
            "METHOD_NOT_ALLOWED",
        ));
    }

    error!("Unhandled rejection: {:?}", err);
    Ok(error_reply(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal Server Error",
        "An unexpected error occurred",
        "INTERNAL_ERROR",
    ))
}

impl warp::reject::Reject for ServerError {}
