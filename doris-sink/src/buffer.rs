//! Accumulates serialized rows into labelled batches.
//!
//! The byte limit is enforced before admission: a row that would push a non-empty buffer past
//! `batch_bytes` first seals the current generation and then opens the next one. A single row
//! larger than the limit therefore ends up alone in its own batch, which is the only way a batch
//! can exceed the limit.

use std::mem;

use tokio::time::Instant;
use uuid::Uuid;

use crate::config::LoadOptions;
use crate::serializer::SerializedRow;

/// Hands out unique stream load labels: `<prefix>_<generation>_<uuid v7>`.
#[derive(Debug, Clone)]
pub(crate) struct LabelGenerator {
    prefix: String,
}

impl LabelGenerator {
    pub(crate) fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub(crate) fn next(&self, generation: u64) -> String {
        format!("{}_{}_{}", self.prefix, generation, Uuid::now_v7().simple())
    }
}

/// An immutable, labelled group of rows submitted as one stream load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    label: String,
    generation: u64,
    rows: Vec<SerializedRow>,
    bytes: usize,
}

impl Batch {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn rows(&self) -> &[SerializedRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Accumulated size of the rows, delimiters included.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Outcome of [BatchBuffer::append].
#[derive(Debug)]
pub enum AppendResult {
    Appended,
    /// The row did not fit. The previous contents were sealed into the returned batch and the
    /// row opened the next generation.
    Rolled(Batch),
}

/// Rows awaiting a flush. Owned by a single task, so no locking is needed.
#[derive(Debug)]
pub struct BatchBuffer {
    rows: Vec<SerializedRow>,
    bytes: usize,
    started_at: Option<Instant>,
    generation: u64,
    max_rows: usize,
    max_bytes: usize,
    labels: LabelGenerator,
}

impl BatchBuffer {
    pub fn new(options: &LoadOptions) -> Self {
        Self {
            rows: Vec::new(),
            bytes: 0,
            started_at: None,
            generation: 1,
            max_rows: options.batch_rows(),
            max_bytes: options.batch_bytes(),
            labels: LabelGenerator::new(options.label_prefix()),
        }
    }

    pub fn append(&mut self, row: SerializedRow) -> AppendResult {
        let full = self.rows.len() >= self.max_rows
            || self.bytes.saturating_add(row.len()) > self.max_bytes;
        let sealed = if full { self.snapshot_and_reset() } else { None };
        let result = sealed.map_or(AppendResult::Appended, AppendResult::Rolled);

        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
        self.bytes += row.len();
        self.rows.push(row);
        result
    }

    /// Seals the current rows into a batch and starts the next generation. `None` when empty.
    pub fn snapshot_and_reset(&mut self) -> Option<Batch> {
        if self.rows.is_empty() {
            return None;
        }
        let batch = Batch {
            label: self.labels.next(self.generation),
            generation: self.generation,
            rows: mem::take(&mut self.rows),
            bytes: mem::take(&mut self.bytes),
        };
        self.started_at = None;
        self.generation += 1;
        Some(batch)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// When the first row of the current generation arrived.
    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    /// Generation the next sealed batch will carry.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}
