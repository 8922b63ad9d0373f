//! Origin server the connection core is tested against.
//!
//! Each route exercises one piece of HTTP/1.1 connection behaviour:
//! keep-alive reuse (`/inspect` numbers every request it sees), server-side
//! close (`/close`), `Expect: 100-continue` (`/echo`, hyper answers the
//! expectation once the handler reads the body), and bodyless statuses
//! (`/status/{code}`). `HEAD` works on every `GET` route.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use uuid::Uuid;

/// What `/inspect` saw of a request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Inspection {
    pub id: Uuid,
    /// Position of this request among all requests the server handled.
    pub sequence: u64,
    pub method: String,
    pub path: String,
    pub connection: Option<String>,
    pub body_len: usize,
}

pub type Sequence = Arc<AtomicU64>;

pub fn app() -> Router {
    let sequence: Sequence = Arc::new(AtomicU64::new(0));
    Router::new()
        .route("/hello", get(hello))
        .route("/inspect", get(inspect).post(inspect))
        .route("/close", get(close))
        .route("/echo", post(echo))
        .route("/status/{code}", get(status))
        .with_state(sequence)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

async fn hello() -> &'static str {
    "hello"
}

async fn inspect(
    State(sequence): State<Sequence>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Inspection> {
    Json(Inspection {
        id: Uuid::new_v4(),
        sequence: sequence.fetch_add(1, Ordering::SeqCst) + 1,
        method: method.to_string(),
        path: uri.path().to_string(),
        connection: headers
            .get(header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body_len: body.len(),
    })
}

async fn close() -> impl IntoResponse {
    ([(header::CONNECTION, "close")], "bye")
}

async fn echo(body: Bytes) -> Bytes {
    body
}

async fn status(Path(code): Path<u16>) -> Result<StatusCode, StatusCode> {
    StatusCode::from_u16(code).map_err(|_| StatusCode::BAD_REQUEST)
}
