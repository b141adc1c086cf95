//! Stream load submission.
//!
//! A batch is `PUT` to `/api/<db>/<table>/_stream_load` on an FE node. The FE usually answers with
//! a redirect to the BE that executes the load; the request is then re-sent there with the same
//! label and body. The JSON answer is classified into a [LoadOutcome] or a transient/fatal
//! [Error].

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use reqwest::header::{CONTENT_TYPE, EXPECT, HeaderMap, HeaderName, HeaderValue, LOCATION};
use reqwest::{Client, StatusCode, Url, redirect};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::buffer::Batch;
use crate::config::load::{
    PROP_COLUMN_SEPARATOR, PROP_FORMAT, PROP_LINE_DELIMITER, PROP_READ_JSON_BY_LINE,
};
use crate::config::{ConnectionOptions, LoadOptions, WireFormat};
use crate::error::{Error, FatalKind, Result};

const LABEL_HEADER: &str = "label";
const COLUMNS_HEADER: &str = "columns";
const MAX_REDIRECTS: usize = 3;

const STATUS_SUCCESS: &str = "Success";
const STATUS_PUBLISH_TIMEOUT: &str = "Publish Timeout";
const STATUS_LABEL_EXISTS: &str = "Label Already Exists";

/// Message fragments of a rejected load that no retry can fix.
const SCHEMA_ERRORS: &[&str] = &[
    "data_quality_error",
    "too many filtered rows",
    "analysis_error",
    "unknown column",
    "unknown table",
    "column count mismatch",
];
const AUTH_ERRORS: &[&str] = &["access denied", "authentication failed"];

/// Result of a stream load as reported by the store.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct LoadResponse {
    #[serde(alias = "status")]
    pub status: String,
    #[serde(default, alias = "Msg", alias = "msg")]
    pub message: String,
    pub label: Option<String>,
    pub txn_id: Option<i64>,
    pub existing_job_status: Option<String>,
    #[serde(default)]
    pub number_total_rows: u64,
    #[serde(default)]
    pub number_loaded_rows: u64,
    #[serde(default)]
    pub number_filtered_rows: u64,
    #[serde(rename = "ErrorURL")]
    pub error_url: Option<String>,
}

/// Successful end of a load.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded(LoadResponse),
    /// A previous attempt with the same label already committed the rows.
    AlreadyLoaded { label: String },
}

/// Submits one batch. `attempt` is 1 for the first try of a batch and grows on every retry.
#[trait_variant::make(Loader: Send)]
#[allow(async_fn_in_trait)]
pub trait LocalLoader {
    async fn load(&self, batch: &Batch, attempt: usize) -> Result<LoadOutcome>;
}

/// [Loader] speaking the HTTP stream load protocol.
#[derive(Debug, Clone)]
pub struct StreamLoader {
    client: Client,
    connection: Arc<ConnectionOptions>,
    headers: HeaderMap,
    format: WireFormat,
}

impl StreamLoader {
    /// `columns` is the column list of structured mode, see [crate::RowSerializer::columns].
    pub fn new(
        connection: Arc<ConnectionOptions>,
        options: &LoadOptions,
        columns: Option<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .connect_timeout(connection.connect_timeout())
            .timeout(connection.request_timeout())
            .build()
            .map_err(|e| Error::Config(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            connection,
            headers: load_headers(options, columns)?,
            format: options.properties().format().clone(),
        })
    }

    /// FE node for this try. Batches start round-robin and every retry moves to the next node.
    fn fenode(&self, batch: &Batch, attempt: usize) -> Result<&str> {
        let nodes = self.connection.fenodes();
        let idx = (batch.generation() as usize)
            .wrapping_add(attempt.saturating_sub(1))
            .checked_rem(nodes.len())
            .unwrap_or_default();
        nodes
            .get(idx)
            .map(String::as_str)
            .ok_or_else(|| Error::Config("no fenodes configured".to_string()))
    }

    /// Sends the load, following the FE to BE redirect.
    async fn send(&self, fenode: &str, label: &str, body: Bytes) -> Result<reqwest::Response> {
        let mut url = Url::parse(&self.connection.load_url(fenode)).map_err(|e| {
            Error::fatal(
                FatalKind::MalformedRequest,
                format!("invalid fenode {fenode:?}: {e}"),
            )
        })?;

        for _ in 0..=MAX_REDIRECTS {
            let response = self
                .client
                .put(url.clone())
                .basic_auth(self.connection.username(), Some(self.connection.password()))
                .headers(self.headers.clone())
                .header(LABEL_HEADER, label)
                .body(body.clone())
                .send()
                .await?;

            if !response.status().is_redirection() {
                return Ok(response);
            }
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|location| location.to_str().ok())
                .ok_or_else(|| {
                    Error::fatal(
                        FatalKind::MalformedRequest,
                        format!("{} redirect without a location", response.status()),
                    )
                })?;
            let next = response.url().join(location).map_err(|e| {
                Error::fatal(
                    FatalKind::MalformedRequest,
                    format!("invalid redirect location {location:?}: {e}"),
                )
            })?;
            debug!(label, from = %url, to = %next, "Following stream load redirect");
            url = next;
        }

        Err(Error::fatal(
            FatalKind::MalformedRequest,
            format!("more than {MAX_REDIRECTS} redirects"),
        ))
    }
}

impl Loader for StreamLoader {
    async fn load(&self, batch: &Batch, attempt: usize) -> Result<LoadOutcome> {
        let fenode = self.fenode(batch, attempt)?;
        debug!(
            label = batch.label(),
            rows = batch.len(),
            bytes = batch.bytes(),
            attempt,
            fenode,
            "Submitting stream load"
        );

        let response = self
            .send(fenode, batch.label(), payload(batch, &self.format))
            .await?;
        let status = response.status();
        let body = response.text().await?;
        check_http_status(status, &body)?;

        let parsed: LoadResponse = serde_json::from_str(&body).map_err(|e| {
            Error::TransientLoad(format!("unreadable stream load response {body:?}: {e}"))
        })?;
        let outcome = classify(parsed, batch.label())?;
        match &outcome {
            LoadOutcome::Loaded(response) => info!(
                label = batch.label(),
                txn_id = ?response.txn_id,
                loaded = response.number_loaded_rows,
                filtered = response.number_filtered_rows,
                "Stream load finished"
            ),
            LoadOutcome::AlreadyLoaded { label } => {
                warn!(%label, "Label already loaded by a previous attempt")
            }
        }
        Ok(outcome)
    }
}

/// Headers shared by every load of a sink.
fn load_headers(options: &LoadOptions, columns: Option<String>) -> Result<HeaderMap> {
    let properties = options.properties();
    let mut headers = HeaderMap::new();
    headers.insert(EXPECT, HeaderValue::from_static("100-continue"));
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=UTF-8"),
    );

    // delimiters are sent in hex so control characters stay valid header values
    let defaults: Vec<(&str, String)> = match properties.format() {
        WireFormat::Csv(csv) => vec![
            (PROP_FORMAT, "csv".to_string()),
            (PROP_COLUMN_SEPARATOR, hex_escape(&csv.column_separator)),
            (PROP_LINE_DELIMITER, hex_escape(&csv.line_delimiter)),
        ],
        WireFormat::Json { strip_outer_array } => {
            let mut defaults = vec![(PROP_FORMAT, "json".to_string())];
            if !strip_outer_array {
                defaults.push((PROP_READ_JSON_BY_LINE, "true".to_string()));
            }
            defaults
        }
    };
    let columns = columns.map(|columns| (COLUMNS_HEADER, columns));

    let props = properties.iter().map(|(k, v)| (k, v.to_string()));
    let derived = defaults
        .into_iter()
        .chain(columns)
        .filter(|(key, _)| properties.get(key).is_none());
    for (key, value) in props.chain(derived) {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| Error::Config(format!("invalid load property name {key:?}: {e}")))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|e| Error::Config(format!("invalid value for load property {key:?}: {e}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

fn hex_escape(delimiter: &str) -> String {
    delimiter.bytes().map(|b| format!("\\x{b:02x}")).collect()
}

/// Request body: rows concatenated, or a JSON array when `strip_outer_array` is set.
pub(crate) fn payload(batch: &Batch, format: &WireFormat) -> Bytes {
    let mut buf = BytesMut::with_capacity(batch.bytes() + 2);
    match format {
        WireFormat::Json {
            strip_outer_array: true,
        } => {
            buf.put_u8(b'[');
            for (idx, row) in batch.rows().iter().enumerate() {
                if idx > 0 {
                    buf.put_u8(b',');
                }
                let bytes = row.as_bytes();
                buf.put_slice(bytes.strip_suffix(b"\n").unwrap_or(bytes));
            }
            buf.put_u8(b']');
        }
        _ => {
            for row in batch.rows() {
                buf.put_slice(row.as_bytes());
            }
        }
    }
    buf.freeze()
}

fn check_http_status(status: StatusCode, body: &str) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("stream load returned {status}: {body}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(Error::fatal(FatalKind::Authentication, message))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            Err(Error::TransientLoad(message))
        }
        s if s.is_server_error() => Err(Error::TransientLoad(message)),
        _ => Err(Error::fatal(FatalKind::MalformedRequest, message)),
    }
}

/// Maps the store's verdict onto an outcome or an error class.
pub(crate) fn classify(response: LoadResponse, label: &str) -> Result<LoadOutcome> {
    match response.status.as_str() {
        STATUS_SUCCESS | STATUS_PUBLISH_TIMEOUT => Ok(LoadOutcome::Loaded(response)),
        STATUS_LABEL_EXISTS => match response.existing_job_status.as_deref() {
            Some("RUNNING") | Some("PREPARE") => Err(Error::TransientLoad(format!(
                "label {label} is still being loaded by a previous attempt"
            ))),
            _ => Ok(LoadOutcome::AlreadyLoaded {
                label: label.to_string(),
            }),
        },
        status => {
            let mut message = format!("{status}: {}", response.message);
            if let Some(url) = &response.error_url {
                message.push_str(&format!(" (errors at {url})"));
            }
            let lowered = response.message.to_lowercase();
            if AUTH_ERRORS.iter().any(|fragment| lowered.contains(fragment)) {
                Err(Error::fatal(FatalKind::Authentication, message))
            } else if SCHEMA_ERRORS.iter().any(|fragment| lowered.contains(fragment)) {
                Err(Error::fatal(FatalKind::SchemaMismatch, message))
            } else {
                Err(Error::TransientLoad(message))
            }
        }
    }
}
