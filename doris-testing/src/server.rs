//! In-process stand-in for a Doris FE/BE pair speaking the stream load protocol.
//!
//! The FE answers every `PUT /api/{db}/{table}/_stream_load` with a `307` pointing at the BE. The
//! BE parses the body according to the `format` and delimiter headers, commits the rows under the
//! request label and answers with the same JSON document a real BE returns.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::put;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error_injector::ErrorInjector;

const STREAM_LOAD_PATH: &str = "/api/{db}/{table}/_stream_load";

/// A stream load request as received by the BE.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub database: String,
    pub table: String,
    pub label: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

/// State shared by the FE and BE handlers.
#[derive(Debug)]
pub(crate) struct MockState {
    be_addr: SocketAddr,
    credentials: Option<(String, String)>,
    injector: Arc<ErrorInjector>,
    /// committed rows per `(database, table)`
    tables: Mutex<HashMap<(String, String), Vec<Value>>>,
    /// committed labels in commit order
    labels: Mutex<Vec<String>>,
    requests: Mutex<Vec<LoadRequest>>,
    next_txn_id: AtomicI64,
}

impl MockState {
    pub(crate) fn new(be_addr: SocketAddr, credentials: Option<(String, String)>) -> Self {
        Self {
            be_addr,
            credentials,
            injector: Arc::new(ErrorInjector::new()),
            tables: Mutex::new(HashMap::new()),
            labels: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            next_txn_id: AtomicI64::new(1000),
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some((username, password)) = &self.credentials else {
            return true;
        };
        let Some(encoded) = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Basic "))
        else {
            return false;
        };
        BASE64_STANDARD
            .decode(encoded)
            .ok()
            .and_then(|decoded| String::from_utf8(decoded).ok())
            .is_some_and(|decoded| decoded == format!("{username}:{password}"))
    }

    fn label_exists(&self, label: &str) -> bool {
        self.labels.lock().iter().any(|committed| committed == label)
    }

    fn commit(&self, database: &str, table: &str, label: &str, rows: Vec<Value>) -> i64 {
        self.tables
            .lock()
            .entry((database.to_string(), table.to_string()))
            .or_default()
            .extend(rows);
        self.labels.lock().push(label.to_string());
        self.next_txn_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Router of the FE node.
pub(crate) fn fe_router(state: Arc<MockState>) -> Router {
    Router::new()
        .route(STREAM_LOAD_PATH, put(fe_stream_load))
        .with_state(state)
}

/// Router of the BE node.
pub(crate) fn be_router(state: Arc<MockState>) -> Router {
    Router::new()
        .route(STREAM_LOAD_PATH, put(be_stream_load))
        .with_state(state)
}

async fn fe_stream_load(
    State(state): State<Arc<MockState>>,
    Path((database, table)): Path<(String, String)>,
    headers: HeaderMap,
    _body: Bytes,
) -> Response {
    if !state.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    if state.injector.should_drop_redirect_location() {
        return StatusCode::TEMPORARY_REDIRECT.into_response();
    }
    let location = format!(
        "http://{}/api/{database}/{table}/_stream_load",
        state.be_addr
    );
    debug!(%location, "Redirecting stream load to BE");
    (
        StatusCode::TEMPORARY_REDIRECT,
        [(header::LOCATION, location)],
    )
        .into_response()
}

async fn be_stream_load(
    State(state): State<Arc<MockState>>,
    Path((database, table)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    if let Some(latency) = state.injector.load_latency() {
        tokio::time::sleep(latency).await;
    }

    let label = headers
        .get("label")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| {
            format!(
                "mock_{}",
                state.next_txn_id.fetch_add(1, Ordering::Relaxed)
            )
        });
    state.requests.lock().push(LoadRequest {
        database: database.clone(),
        table: table.clone(),
        label: label.clone(),
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect(),
        body: body.clone(),
    });

    if state.injector.should_fail_load() {
        warn!(%label, "Injected stream load failure");
        return (StatusCode::INTERNAL_SERVER_ERROR, "injected failure").into_response();
    }

    if state.label_exists(&label) {
        return axum::Json(json!({
            "Label": label,
            "Status": "Label Already Exists",
            "ExistingJobStatus": "FINISHED",
            "Message": format!("Label [{label}] has already been used."),
        }))
        .into_response();
    }

    if state.injector.should_reject_load() {
        return failed(
            &label,
            "[ANALYSIS_ERROR]errCode = 2, detailMessage = unknown column",
        );
    }

    let rows = match parse_rows(&headers, &body) {
        Ok(rows) => rows,
        Err(message) => return failed(&label, &message),
    };
    let loaded = rows.len();
    let txn_id = state.commit(&database, &table, &label, rows);
    debug!(%label, txn_id, loaded, "Stream load committed");

    if state.injector.should_lose_response() {
        warn!(%label, "Dropping stream load response after commit");
        return (StatusCode::INTERNAL_SERVER_ERROR, "connection reset").into_response();
    }

    axum::Json(json!({
        "TxnId": txn_id,
        "Label": label,
        "Status": "Success",
        "Message": "OK",
        "NumberTotalRows": loaded,
        "NumberLoadedRows": loaded,
        "NumberFilteredRows": 0,
        "NumberUnselectedRows": 0,
        "LoadBytes": body.len(),
        "ErrorURL": Value::Null,
    }))
    .into_response()
}

fn failed(label: &str, message: &str) -> Response {
    axum::Json(json!({
        "Label": label,
        "Status": "Fail",
        "Message": message,
        "NumberTotalRows": 0,
        "NumberLoadedRows": 0,
    }))
    .into_response()
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Decodes `\xNN` escapes used for delimiters.
fn unescape(value: &str) -> String {
    let mut bytes = Vec::with_capacity(value.len());
    let mut rest = value.as_bytes();
    while let Some((&first, tail)) = rest.split_first() {
        if first == b'\\'
            && let Some(hex) = tail.strip_prefix(b"x").and_then(|t| t.get(..2))
            && let Some(byte) = std::str::from_utf8(hex)
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok())
        {
            bytes.push(byte);
            rest = tail.get(3..).unwrap_or_default();
            continue;
        }
        bytes.push(first);
        rest = tail;
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// CSV rows become arrays of strings (`\N` is null), JSON rows are kept as documents.
fn parse_rows(headers: &HeaderMap, body: &[u8]) -> Result<Vec<Value>, String> {
    let text = std::str::from_utf8(body)
        .map_err(|e| format!("[DATA_QUALITY_ERROR]body is not utf-8: {e}"))?;
    let format = header_value(headers, "format").unwrap_or("csv");

    if format.eq_ignore_ascii_case("json") {
        let strip_outer_array = header_value(headers, "strip_outer_array") == Some("true");
        let by_line = header_value(headers, "read_json_by_line") == Some("true");
        let invalid = |e: serde_json::Error| format!("[DATA_QUALITY_ERROR]invalid json: {e}");
        return if strip_outer_array {
            match serde_json::from_str(text).map_err(invalid)? {
                Value::Array(rows) => Ok(rows),
                _ => Err("[DATA_QUALITY_ERROR]expected a json array".to_string()),
            }
        } else if by_line {
            text.lines()
                .filter(|line| !line.is_empty())
                .map(|line| serde_json::from_str(line).map_err(invalid))
                .collect()
        } else {
            serde_json::from_str(text).map(|row| vec![row]).map_err(invalid)
        };
    }

    let separator = header_value(headers, "column_separator")
        .map(unescape)
        .unwrap_or_else(|| "\t".to_string());
    let delimiter = header_value(headers, "line_delimiter")
        .map(unescape)
        .unwrap_or_else(|| "\n".to_string());
    Ok(text
        .split(delimiter.as_str())
        .filter(|line| !line.is_empty())
        .map(|line| {
            Value::Array(
                line.split(separator.as_str())
                    .map(|field| match field {
                        "\\N" => Value::Null,
                        field => Value::String(field.to_string()),
                    })
                    .collect(),
            )
        })
        .collect())
}

/// A running FE/BE pair bound to ephemeral localhost ports. Both servers stop on drop.
pub struct MockDoris {
    fe_addr: SocketAddr,
    be_addr: SocketAddr,
    state: Arc<MockState>,
    servers: Vec<JoinHandle<()>>,
}

impl MockDoris {
    /// Starts a pair that accepts any credentials.
    pub async fn start() -> std::io::Result<Self> {
        Self::launch(None).await
    }

    /// Starts a pair that only accepts the given user.
    pub async fn with_credentials(username: &str, password: &str) -> std::io::Result<Self> {
        Self::launch(Some((username.to_string(), password.to_string()))).await
    }

    async fn launch(credentials: Option<(String, String)>) -> std::io::Result<Self> {
        let fe_listener = TcpListener::bind("127.0.0.1:0").await?;
        let be_listener = TcpListener::bind("127.0.0.1:0").await?;
        let fe_addr = fe_listener.local_addr()?;
        let be_addr = be_listener.local_addr()?;
        let state = Arc::new(MockState::new(be_addr, credentials));

        let fe = fe_router(Arc::clone(&state));
        let be = be_router(Arc::clone(&state));
        let servers = vec![
            tokio::spawn(async move {
                if let Err(e) = axum::serve(fe_listener, fe).await {
                    warn!(?e, "Mock FE stopped");
                }
            }),
            tokio::spawn(async move {
                if let Err(e) = axum::serve(be_listener, be).await {
                    warn!(?e, "Mock BE stopped");
                }
            }),
        ];

        Ok(Self {
            fe_addr,
            be_addr,
            state,
            servers,
        })
    }

    /// `host:port` of the FE, usable as a `fenodes` entry.
    pub fn fenode(&self) -> String {
        self.fe_addr.to_string()
    }

    pub fn be_node(&self) -> String {
        self.be_addr.to_string()
    }

    pub fn error_injector(&self) -> Arc<ErrorInjector> {
        Arc::clone(&self.state.injector)
    }

    /// Rows committed into `database.table`, in commit order.
    pub fn rows(&self, database: &str, table: &str) -> Vec<Value> {
        self.state
            .tables
            .lock()
            .get(&(database.to_string(), table.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Labels of committed loads, in commit order.
    pub fn labels(&self) -> Vec<String> {
        self.state.labels.lock().clone()
    }

    /// Every load request that reached the BE, including failed ones.
    pub fn requests(&self) -> Vec<LoadRequest> {
        self.state.requests.lock().clone()
    }
}

impl Drop for MockDoris {
    fn drop(&mut self) {
        for server in &self.servers {
            server.abort();
        }
    }
}
