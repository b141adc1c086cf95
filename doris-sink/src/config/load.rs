use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use backoff::strategy::exponential::Exponential;
use backoff::strategy::{fixed, linear};

use crate::error::{Error, Result};

const DEFAULT_BATCH_ROWS: usize = 10_000;
const DEFAULT_BATCH_BYTES: usize = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_BATCH_INTERVAL_MS: u64 = 10_000;
const DEFAULT_MAX_RETRIES: usize = 3;
const DEFAULT_RETRY_INTERVAL_MS: u64 = 1_000;
const DEFAULT_EXPONENTIAL_CAP: Duration = Duration::from_secs(60);
const DEFAULT_LABEL_PREFIX: &str = "doris_sink";
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const MAX_LABEL_PREFIX_LEN: usize = 64;

const DEFAULT_COLUMN_SEPARATOR: &str = "\t";
const DEFAULT_LINE_DELIMITER: &str = "\n";
const DEFAULT_ESCAPE: char = '\\';

pub(crate) const PROP_FORMAT: &str = "format";
pub(crate) const PROP_COLUMN_SEPARATOR: &str = "column_separator";
pub(crate) const PROP_LINE_DELIMITER: &str = "line_delimiter";
pub(crate) const PROP_STRIP_OUTER_ARRAY: &str = "strip_outer_array";
pub(crate) const PROP_READ_JSON_BY_LINE: &str = "read_json_by_line";
const PROP_ENCLOSE: &str = "enclose";
const PROP_ESCAPE: &str = "escape";

/// Delay shape between two attempts of the same batch.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryBackoff {
    Fixed(Duration),
    /// `step * retry`, the default with a one second step.
    Linear(Duration),
    Exponential {
        base: Duration,
        cap: Duration,
        factor: f64,
        jitter: f64,
    },
}

impl Default for RetryBackoff {
    fn default() -> Self {
        RetryBackoff::Linear(Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS))
    }
}

impl RetryBackoff {
    /// Parses `fixed`, `linear` or `exponential` with an optional interval (the step, or the
    /// base of the exponential).
    pub fn parse(kind: &str, interval_ms: Option<u64>) -> Result<Self> {
        let interval = Duration::from_millis(interval_ms.unwrap_or(DEFAULT_RETRY_INTERVAL_MS));
        match kind.to_lowercase().as_str() {
            "fixed" => Ok(RetryBackoff::Fixed(interval)),
            "linear" => Ok(RetryBackoff::Linear(interval)),
            "exponential" => Ok(RetryBackoff::Exponential {
                base: interval,
                cap: DEFAULT_EXPONENTIAL_CAP,
                factor: 2.0,
                jitter: 0.0,
            }),
            other => Err(Error::Config(format!("unknown retry backoff {other:?}"))),
        }
    }

    /// Delays before each of at most `retries` retries.
    pub(crate) fn schedule(&self, retries: usize) -> Box<dyn Iterator<Item = Duration> + Send> {
        match self {
            RetryBackoff::Fixed(delay) => Box::new(fixed::Interval::new(*delay).take(retries)),
            RetryBackoff::Linear(step) => Box::new(linear::Linear::new(*step).take(retries)),
            RetryBackoff::Exponential {
                base,
                cap,
                factor,
                jitter,
            } => Box::new(
                Exponential::new(*base, *cap, *factor)
                    .with_jitter(*jitter)
                    .take(retries),
            ),
        }
    }
}

/// CSV wire settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvFormat {
    pub column_separator: String,
    pub line_delimiter: String,
    /// Quote character for values that contain a separator, delimiter or the quote itself.
    pub enclose: Option<char>,
    pub escape: char,
}

impl Default for CsvFormat {
    fn default() -> Self {
        Self {
            column_separator: DEFAULT_COLUMN_SEPARATOR.to_string(),
            line_delimiter: DEFAULT_LINE_DELIMITER.to_string(),
            enclose: None,
            escape: DEFAULT_ESCAPE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFormat {
    Csv(CsvFormat),
    Json { strip_outer_array: bool },
}

impl WireFormat {
    /// Terminator appended to every serialized row.
    pub fn record_delimiter(&self) -> &str {
        match self {
            WireFormat::Csv(csv) => &csv.line_delimiter,
            WireFormat::Json { .. } => "\n",
        }
    }
}

/// Stream load properties. They are forwarded as request headers verbatim, and the format
/// related ones are parsed once so rows can be serialized accordingly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadProperties {
    raw: BTreeMap<String, String>,
    format: WireFormat,
}

impl Default for LoadProperties {
    fn default() -> Self {
        Self {
            raw: BTreeMap::new(),
            format: WireFormat::Csv(CsvFormat::default()),
        }
    }
}

impl LoadProperties {
    pub fn new(props: HashMap<String, String>) -> Result<Self> {
        let raw: BTreeMap<String, String> = props.into_iter().collect();
        let format = match raw.get(PROP_FORMAT).map(|f| f.to_lowercase()).as_deref() {
            None | Some("csv") => WireFormat::Csv(CsvFormat {
                column_separator: raw
                    .get(PROP_COLUMN_SEPARATOR)
                    .map(|s| parse_delimiter(s))
                    .transpose()?
                    .unwrap_or_else(|| DEFAULT_COLUMN_SEPARATOR.to_string()),
                line_delimiter: raw
                    .get(PROP_LINE_DELIMITER)
                    .map(|s| parse_delimiter(s))
                    .transpose()?
                    .unwrap_or_else(|| DEFAULT_LINE_DELIMITER.to_string()),
                enclose: raw.get(PROP_ENCLOSE).map(|s| single_char(PROP_ENCLOSE, s)).transpose()?,
                escape: raw
                    .get(PROP_ESCAPE)
                    .map(|s| single_char(PROP_ESCAPE, s))
                    .transpose()?
                    .unwrap_or(DEFAULT_ESCAPE),
            }),
            Some("json") => WireFormat::Json {
                strip_outer_array: raw
                    .get(PROP_STRIP_OUTER_ARRAY)
                    .is_some_and(|v| v.eq_ignore_ascii_case("true")),
            },
            Some(other) => {
                return Err(Error::Config(format!("unsupported load format {other:?}")));
            }
        };
        if let WireFormat::Csv(csv) = &format
            && (csv.column_separator.is_empty() || csv.line_delimiter.is_empty())
        {
            return Err(Error::Config("csv delimiters must not be empty".to_string()));
        }
        Ok(Self { raw, format })
    }

    pub fn format(&self) -> &WireFormat {
        &self.format
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.raw.get(key).map(String::as_str)
    }

    /// Properties in a stable order, ready to be sent as headers.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.raw.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Delimiters may be written as hex escapes, `\x01` or `\x0d\x0a`, to pass control characters.
fn parse_delimiter(value: &str) -> Result<String> {
    let Some(hex) = value
        .strip_prefix("\\x")
        .or_else(|| value.strip_prefix("\\X"))
    else {
        return Ok(value.to_string());
    };

    let hex = hex.replace("\\x", "").replace("\\X", "");
    if hex.is_empty() || hex.len() % 2 != 0 {
        return Err(Error::Config(format!("invalid hex delimiter {value:?}")));
    }
    let bytes = (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| Error::Config(format!("invalid hex delimiter {value:?}")))
        })
        .collect::<Result<Vec<u8>>>()?;
    String::from_utf8(bytes)
        .map_err(|_| Error::Config(format!("hex delimiter {value:?} is not valid utf-8")))
}

fn single_char(key: &str, value: &str) -> Result<char> {
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(Error::Config(format!(
            "{key} must be a single character, got {value:?}"
        ))),
    }
}

/// Batching and retry knobs. Read-only after construction and shared by every batch of one sink.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOptions {
    batch_rows: usize,
    batch_bytes: usize,
    batch_interval: Option<Duration>,
    max_retries: usize,
    retry_backoff: RetryBackoff,
    label_prefix: String,
    enable_delete: bool,
    shutdown_grace: Duration,
    properties: LoadProperties,
}

impl LoadOptions {
    pub fn builder() -> LoadOptionsBuilder {
        LoadOptionsBuilder::default()
    }

    pub fn batch_rows(&self) -> usize {
        self.batch_rows
    }

    pub fn batch_bytes(&self) -> usize {
        self.batch_bytes
    }

    /// `None` when interval based flushing is disabled.
    pub fn batch_interval(&self) -> Option<Duration> {
        self.batch_interval
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn retry_backoff(&self) -> &RetryBackoff {
        &self.retry_backoff
    }

    pub fn label_prefix(&self) -> &str {
        &self.label_prefix
    }

    pub fn enable_delete(&self) -> bool {
        self.enable_delete
    }

    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    pub fn properties(&self) -> &LoadProperties {
        &self.properties
    }
}

#[derive(Debug)]
pub struct LoadOptionsBuilder {
    batch_rows: usize,
    batch_bytes: usize,
    batch_interval_ms: u64,
    max_retries: usize,
    retry_backoff: RetryBackoff,
    label_prefix: String,
    enable_delete: bool,
    shutdown_grace: Duration,
    props: HashMap<String, String>,
}

impl Default for LoadOptionsBuilder {
    fn default() -> Self {
        Self {
            batch_rows: DEFAULT_BATCH_ROWS,
            batch_bytes: DEFAULT_BATCH_BYTES,
            batch_interval_ms: DEFAULT_BATCH_INTERVAL_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: RetryBackoff::default(),
            label_prefix: DEFAULT_LABEL_PREFIX.to_string(),
            enable_delete: false,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            props: HashMap::new(),
        }
    }
}

impl LoadOptionsBuilder {
    pub fn batch_rows(mut self, rows: usize) -> Self {
        self.batch_rows = rows;
        self
    }

    pub fn batch_bytes(mut self, bytes: usize) -> Self {
        self.batch_bytes = bytes;
        self
    }

    /// `0` turns interval based flushing off.
    pub fn batch_interval_ms(mut self, ms: u64) -> Self {
        self.batch_interval_ms = ms;
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn retry_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn label_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.label_prefix = prefix.into();
        self
    }

    pub fn enable_delete(mut self, enable: bool) -> Self {
        self.enable_delete = enable;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn stream_load_props(mut self, props: HashMap<String, String>) -> Self {
        self.props = props;
        self
    }

    pub fn stream_load_prop(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<LoadOptions> {
        if self.batch_rows == 0 {
            return Err(Error::Config("batchRows must be greater than 0".to_string()));
        }
        if self.batch_bytes == 0 {
            return Err(Error::Config("batchBytes must be greater than 0".to_string()));
        }
        if self.label_prefix.is_empty()
            || self.label_prefix.len() > MAX_LABEL_PREFIX_LEN
            || !self
                .label_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':'))
        {
            return Err(Error::Config(format!(
                "label prefix {:?} must be 1-{MAX_LABEL_PREFIX_LEN} characters of [-_A-Za-z0-9:]",
                self.label_prefix
            )));
        }

        Ok(LoadOptions {
            batch_rows: self.batch_rows,
            batch_bytes: self.batch_bytes,
            batch_interval: (self.batch_interval_ms > 0)
                .then(|| Duration::from_millis(self.batch_interval_ms)),
            max_retries: self.max_retries,
            retry_backoff: self.retry_backoff,
            label_prefix: self.label_prefix,
            enable_delete: self.enable_delete,
            shutdown_grace: self.shutdown_grace,
            properties: LoadProperties::new(self.props)?,
        })
    }
}
