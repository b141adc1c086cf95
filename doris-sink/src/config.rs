//! Sink configuration.
//!
//! The owning runtime hands the sink a flat, camelCase JSON object (optionally base64 encoded in
//! the [ENV_SINK_CONFIG] environment variable). [SinkConfig] is that raw shape; it is validated
//! into the immutable [ConnectionOptions], [LoadOptions] and optional [Schema] the engine runs on.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::record::Schema;

pub use connection::{ConnectionOptions, ConnectionOptionsBuilder};
pub use load::{CsvFormat, LoadOptions, LoadOptionsBuilder, LoadProperties, RetryBackoff, WireFormat};

mod connection;
pub(crate) mod load;

/// Environment variable holding the base64 encoded JSON [SinkConfig].
pub const ENV_SINK_CONFIG: &str = "DORIS_SINK_CONFIG";

/// Entry endpoints, either `"fe1:8030,fe2:8030"` or `["fe1:8030", "fe2:8030"]`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Fenodes {
    Joined(String),
    List(Vec<String>),
}

impl Fenodes {
    fn into_list(self) -> Vec<String> {
        match self {
            Fenodes::Joined(joined) => joined.split(',').map(str::to_string).collect(),
            Fenodes::List(list) => list,
        }
    }
}

/// Raw sink configuration as provided by the runtime.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SinkConfig {
    pub fenodes: Fenodes,
    pub table: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub batch_rows: Option<usize>,
    pub batch_bytes: Option<usize>,
    pub batch_interval_ms: Option<u64>,
    pub max_retries: Option<usize>,
    #[serde(default)]
    pub load_properties: HashMap<String, String>,
    pub field_names: Option<Vec<String>>,
    pub field_types: Option<Vec<String>>,
    pub label_prefix: Option<String>,
    pub enable_delete: Option<bool>,
    pub retry_interval_ms: Option<u64>,
    pub retry_backoff: Option<String>,
    pub shutdown_grace_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
}

impl SinkConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Decodes a base64 encoded JSON configuration.
    pub fn decode(encoded: &str) -> Result<Self> {
        let raw = BASE64_STANDARD
            .decode(encoded.trim().as_bytes())
            .map_err(|e| Error::Config(format!("config is not valid base64: {e}")))?;
        let json = String::from_utf8(raw)
            .map_err(|e| Error::Config(format!("config is not valid utf-8: {e}")))?;
        Self::from_json(&json)
    }

    /// Loads the configuration from [ENV_SINK_CONFIG].
    pub fn from_env() -> Result<Self> {
        let encoded = env::var(ENV_SINK_CONFIG)
            .map_err(|_| Error::Config(format!("{ENV_SINK_CONFIG} is not set")))?;
        Self::decode(&encoded)
    }

    /// Validates the raw configuration into the option structs used by the sink.
    pub fn into_options(self) -> Result<(ConnectionOptions, LoadOptions, Option<Schema>)> {
        let mut connection = ConnectionOptions::builder()
            .fenodes(self.fenodes.into_list())
            .table_identifier(self.table)
            .username(self.username)
            .password(self.password);
        if let Some(ms) = self.connect_timeout_ms {
            connection = connection.connect_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.request_timeout_ms {
            connection = connection.request_timeout(Duration::from_millis(ms));
        }

        let schema = match (self.field_names, self.field_types) {
            (Some(names), Some(types)) => Some(Schema::from_names_and_types(&names, &types)?),
            (None, None) => None,
            _ => {
                return Err(Error::Config(
                    "fieldNames and fieldTypes must be configured together".to_string(),
                ));
            }
        };

        let mut load = LoadOptions::builder().stream_load_props(self.load_properties);
        if let Some(rows) = self.batch_rows {
            load = load.batch_rows(rows);
        }
        if let Some(bytes) = self.batch_bytes {
            load = load.batch_bytes(bytes);
        }
        if let Some(ms) = self.batch_interval_ms {
            load = load.batch_interval_ms(ms);
        }
        if let Some(retries) = self.max_retries {
            load = load.max_retries(retries);
        }
        if let Some(prefix) = self.label_prefix {
            load = load.label_prefix(prefix);
        }
        if let Some(enable) = self.enable_delete {
            load = load.enable_delete(enable);
        }
        if let Some(ms) = self.shutdown_grace_ms {
            load = load.shutdown_grace(Duration::from_millis(ms));
        }
        if self.retry_backoff.is_some() || self.retry_interval_ms.is_some() {
            load = load.retry_backoff(RetryBackoff::parse(
                self.retry_backoff.as_deref().unwrap_or("linear"),
                self.retry_interval_ms,
            )?);
        }

        Ok((connection.build()?, load.build()?, schema))
    }
}
