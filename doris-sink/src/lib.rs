//! Streaming sink that delivers records into an Apache Doris table through stream load.
//!
//! Records handed to a [SinkWriter] are serialized ([RowSerializer]), accumulated in a
//! [BatchBuffer] and, once the [FlushTrigger] fires, sealed into an immutable, labelled [Batch].
//! The batch is submitted by the [RetryController] wrapping a [Loader] (the HTTP [StreamLoader]
//! in production), retrying transient failures with the same label so the store can deduplicate.
//!
//! ```no_run
//! use doris_sink::{SinkConfig, open};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> doris_sink::Result<()> {
//! let config = SinkConfig::from_json(
//!     r#"{"fenodes": "FE_IP:8030", "table": "db.table", "username": "root", "password": ""}"#,
//! )?;
//! let writer = open(config, CancellationToken::new())?;
//! writer.invoke(r#"{"id": 1, "name": "doris"}"#).await?;
//! writer.close().await?;
//! # Ok(())
//! # }
//! ```

pub use crate::buffer::{AppendResult, Batch, BatchBuffer};
pub use crate::config::{
    ConnectionOptions, ConnectionOptionsBuilder, CsvFormat, ENV_SINK_CONFIG, Fenodes, LoadOptions,
    LoadOptionsBuilder, LoadProperties, RetryBackoff, SinkConfig, WireFormat,
};
pub use crate::error::{Error, FatalKind, Result};
pub use crate::loader::{LoadOutcome, LoadResponse, Loader, LocalLoader, StreamLoader};
pub use crate::record::{Field, FieldType, FieldValue, Record, Row, RowKind, Schema};
pub use crate::retry::RetryController;
pub use crate::serializer::{RowSerializer, SerializedRow};
pub use crate::sinker::{SinkState, SinkWriter, SinkWriterBuilder, open};
pub use crate::trigger::{FlushReason, FlushTrigger};

/// Error types and the crate wide [Result].
mod error;

/// Configuration parsing and the validated option structs.
pub mod config;

/// Record and schema model.
mod record;

/// Record to wire format rendering.
mod serializer;

/// Row accumulation and batch sealing.
mod buffer;

/// Flush policy.
mod trigger;

/// Stream load HTTP submission.
mod loader;

/// Bounded retry around a loader.
mod retry;

/// Sink coordinator.
mod sinker;
