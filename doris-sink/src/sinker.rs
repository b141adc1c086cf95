//! The sink coordinator bound into the runtime's record lifecycle.
//!
//! The [SinkWriter] is a cheap handle that the runtime calls `invoke` on for every record. It
//! uses an actor-based pattern where:
//!   - [SinkActor] owns the batch buffer and the flush trigger, and runs at most one submission
//!     (retry controller around the stream loader) at a time
//!   - [SinkWriter] sends records, flush and close requests to the actor and waits for the answer
//!
//! State machine, published through [SinkWriter::subscribe]:
//! ```text
//! Open --flush due--> Flushing --load ok--> Open
//!   |                    |
//!   +-----close()--------+--> Closed
//!   |                    |
//!   +---fatal error------+--> Failed
//! ```
//! A fatal error (serialization, non-retryable load failure, exhausted retries, shutdown timeout)
//! is terminal: the cancellation token of the runtime is cancelled so upstream stops emitting, and
//! every later call returns the error.
//!
//! [SinkActor]: actor::SinkActor

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::SinkConfig;
use crate::error::{Error, Result};
use crate::record::Record;
use crate::sinker::actor::SinkActorMessage;

mod actor;

mod builder;
pub use builder::SinkWriterBuilder;

/// Lifecycle state of a sink.
#[derive(Debug, Clone)]
pub enum SinkState {
    /// Accepting records, nothing in flight.
    Open,
    /// A batch is being loaded, records keep buffering into the next generation.
    Flushing,
    Closed,
    Failed(Error),
}

impl SinkState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SinkState::Closed | SinkState::Failed(_))
    }
}

/// Handle to a running sink. Clones share the same sink.
#[derive(Clone)]
pub struct SinkWriter {
    sender: mpsc::Sender<SinkActorMessage>,
    state: watch::Receiver<SinkState>,
}

/// Validates the configuration and starts a sink loading over HTTP. `cln_token` is cancelled when
/// the sink fails.
pub fn open(config: SinkConfig, cln_token: CancellationToken) -> Result<SinkWriter> {
    let (connection, load, schema) = config.into_options()?;
    let mut builder = SinkWriterBuilder::new(connection, load).cancellation_token(cln_token);
    if let Some(schema) = schema {
        builder = builder.schema(schema);
    }
    builder.build()
}

impl SinkWriter {
    fn new(sender: mpsc::Sender<SinkActorMessage>, state: watch::Receiver<SinkState>) -> Self {
        Self { sender, state }
    }

    /// Buffers one record. Returns once the record is accepted, which may wait for a previous
    /// batch to finish loading.
    pub async fn invoke(&self, record: impl Into<Record>) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.call(
            SinkActorMessage::Write {
                record: record.into(),
                respond_to,
            },
            rx,
        )
        .await
    }

    /// Loads everything buffered so far and waits for it to be committed.
    pub async fn flush(&self) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.call(SinkActorMessage::Flush { respond_to }, rx).await
    }

    /// Waits for the in-flight load (bounded by the shutdown grace period), loads the remaining
    /// rows and stops the sink. Closing a closed sink is a no-op.
    pub async fn close(&self) -> Result<()> {
        if matches!(*self.state.borrow(), SinkState::Closed) {
            return Ok(());
        }
        let (respond_to, rx) = oneshot::channel();
        self.call(SinkActorMessage::Close { respond_to }, rx).await
    }

    pub fn state(&self) -> SinkState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<SinkState> {
        self.state.clone()
    }

    async fn call(
        &self,
        message: SinkActorMessage,
        rx: oneshot::Receiver<Result<()>>,
    ) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| self.stopped_error())?;
        rx.await.map_err(|_| self.stopped_error())?
    }

    /// Error for a request the actor will never answer.
    fn stopped_error(&self) -> Error {
        match &*self.state.borrow() {
            SinkState::Failed(error) => error.clone(),
            SinkState::Closed => Error::Closed,
            SinkState::Open | SinkState::Flushing => {
                Error::ActorPatternRecv("sink actor stopped unexpectedly".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::buffer::Batch;
    use crate::config::{ConnectionOptions, LoadOptions, RetryBackoff};
    use crate::error::FatalKind;
    use crate::loader::{LoadOutcome, LoadResponse, Loader};
    use crate::record::{Row, Schema};

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Reject,
        Hang,
        Slow(Duration),
    }

    /// Test loader keeping every batch it was handed.
    #[derive(Clone)]
    struct RecordingLoader {
        batches: Arc<Mutex<Vec<Batch>>>,
        behavior: Behavior,
    }

    impl RecordingLoader {
        fn new(behavior: Behavior) -> Self {
            Self {
                batches: Arc::new(Mutex::new(Vec::new())),
                behavior,
            }
        }

        fn batches(&self) -> Vec<Batch> {
            self.batches.lock().clone()
        }

        fn payload(&self) -> String {
            self.batches()
                .iter()
                .flat_map(|batch| batch.rows().to_vec())
                .map(|row| String::from_utf8(row.as_bytes().to_vec()).unwrap())
                .collect()
        }
    }

    impl Loader for RecordingLoader {
        async fn load(&self, batch: &Batch, _attempt: usize) -> crate::Result<LoadOutcome> {
            self.batches.lock().push(batch.clone());
            match self.behavior {
                Behavior::Succeed => {}
                Behavior::Reject => {
                    return Err(Error::fatal(
                        FatalKind::SchemaMismatch,
                        "[ANALYSIS_ERROR]unknown column",
                    ));
                }
                Behavior::Hang => std::future::pending::<()>().await,
                Behavior::Slow(delay) => tokio::time::sleep(delay).await,
            }
            Ok(LoadOutcome::Loaded(LoadResponse {
                status: "Success".to_string(),
                label: Some(batch.label().to_string()),
                number_loaded_rows: batch.len() as u64,
                ..Default::default()
            }))
        }
    }

    fn builder(rows: usize, interval_ms: u64) -> SinkWriterBuilder {
        let connection = ConnectionOptions::builder()
            .fenode_list("fe:8030")
            .table_identifier("db.tbl")
            .build()
            .unwrap();
        let load = LoadOptions::builder()
            .batch_rows(rows)
            .batch_interval_ms(interval_ms)
            .max_retries(1)
            .retry_backoff(RetryBackoff::Fixed(Duration::from_millis(1)))
            .shutdown_grace(Duration::from_secs(1))
            .build()
            .unwrap();
        SinkWriterBuilder::new(connection, load)
    }

    #[tokio::test]
    async fn three_rows_flush_once() {
        let loader = RecordingLoader::new(Behavior::Succeed);
        let writer = builder(3, 0).build_with_loader(loader.clone()).unwrap();

        for i in 0..3 {
            writer.invoke(format!("row{i}")).await.unwrap();
        }
        writer.flush().await.unwrap();
        let batches = loader.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[0].generation(), 1);

        // the fourth record opens the next generation
        writer.invoke("row3").await.unwrap();
        assert_eq!(loader.batches().len(), 1);
        writer.close().await.unwrap();

        let batches = loader.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(batches[1].generation(), 2);
        assert_ne!(batches[0].label(), batches[1].label());
        assert!(matches!(writer.state(), SinkState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_flushes_below_thresholds() {
        let loader = RecordingLoader::new(Behavior::Succeed);
        let writer = builder(10, 1_000).build_with_loader(loader.clone()).unwrap();

        writer.invoke("a").await.unwrap();
        writer.invoke("b").await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(loader.batches().is_empty());
        assert!(matches!(writer.state(), SinkState::Open));

        writer.close().await.unwrap();
        assert_eq!(loader.payload(), "a\nb\n");
    }

    #[tokio::test(start_paused = true)]
    async fn interval_flush_without_new_records() {
        let loader = RecordingLoader::new(Behavior::Succeed);
        let writer = builder(10, 100).build_with_loader(loader.clone()).unwrap();

        writer.invoke("a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(loader.batches().len(), 1);

        // the buffer is empty again, no further interval flushes
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(loader.batches().len(), 1);
        writer.close().await.unwrap();
        assert_eq!(loader.batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn every_record_is_loaded_once_and_in_order() {
        let loader = RecordingLoader::new(Behavior::Slow(Duration::from_millis(20)));
        let writer = builder(3, 0).build_with_loader(loader.clone()).unwrap();

        let mut expected = String::new();
        for i in 0..10 {
            writer.invoke(i.to_string()).await.unwrap();
            expected.push_str(&format!("{i}\n"));
        }
        writer.close().await.unwrap();

        let batches = loader.batches();
        assert_eq!(
            batches.iter().map(Batch::len).collect::<Vec<_>>(),
            vec![3, 3, 3, 1]
        );
        assert!(
            batches
                .windows(2)
                .all(|pair| pair[0].generation() < pair[1].generation())
        );
        assert_eq!(loader.payload(), expected);
    }

    #[tokio::test]
    async fn fatal_load_error_fails_the_sink() {
        let cln_token = CancellationToken::new();
        let loader = RecordingLoader::new(Behavior::Reject);
        let writer = builder(1, 0)
            .cancellation_token(cln_token.clone())
            .build_with_loader(loader.clone())
            .unwrap();
        let mut state = writer.subscribe();

        writer.invoke("a").await.unwrap();
        let err = writer.flush().await.unwrap_err();
        assert!(matches!(
            err,
            Error::FatalLoad {
                kind: FatalKind::SchemaMismatch,
                ..
            }
        ));
        // not retried
        assert_eq!(loader.batches().len(), 1);

        state
            .wait_for(|state| matches!(state, SinkState::Failed(_)))
            .await
            .unwrap();
        assert!(cln_token.is_cancelled());
        assert!(matches!(
            writer.invoke("b").await,
            Err(Error::FatalLoad { .. })
        ));
        assert!(matches!(writer.close().await, Err(Error::FatalLoad { .. })));
    }

    #[tokio::test]
    async fn serialization_error_fails_the_sink() {
        let cln_token = CancellationToken::new();
        let writer = builder(10, 0)
            .cancellation_token(cln_token.clone())
            .build_with_loader(RecordingLoader::new(Behavior::Succeed))
            .unwrap();

        // structured rows need a schema
        let err = writer
            .invoke(Row::new(vec!["a".into()]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(cln_token.is_cancelled());
        assert!(matches!(writer.state(), SinkState::Failed(_)));
    }

    #[tokio::test]
    async fn structured_rows_against_schema() {
        let loader = RecordingLoader::new(Behavior::Succeed);
        let schema = Schema::from_names_and_types(
            &["grid_no", "longitude", "latitude"],
            &["VARCHAR", "DOUBLE", "DOUBLE"],
        )
        .unwrap();
        let writer = builder(10, 0)
            .schema(schema)
            .build_with_loader(loader.clone())
            .unwrap();

        writer
            .invoke(Row::new(vec![
                "北京".into(),
                116.405419.into(),
                39.916927.into(),
            ]))
            .await
            .unwrap();
        writer.close().await.unwrap();
        assert_eq!(loader.payload(), "北京\t116.405419\t39.916927\n");
    }

    #[tokio::test(start_paused = true)]
    async fn close_abandons_a_stuck_load_after_the_grace_period() {
        let loader = RecordingLoader::new(Behavior::Hang);
        let writer = builder(1, 0).build_with_loader(loader.clone()).unwrap();

        writer.invoke("a").await.unwrap();
        let err = writer.close().await.unwrap_err();
        assert!(matches!(err, Error::ShutdownTimeout(_)));
        assert!(matches!(writer.state(), SinkState::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn close_loads_the_remainder_after_abandoning_a_stuck_load() {
        let loader = RecordingLoader::new(Behavior::Hang);
        let writer = builder(2, 0).build_with_loader(loader.clone()).unwrap();

        writer.invoke("a").await.unwrap();
        writer.invoke("b").await.unwrap();
        writer.invoke("c").await.unwrap();
        let err = writer.close().await.unwrap_err();

        let batches = loader.batches();
        let Error::ShutdownTimeout(label) = err else {
            panic!("expected a shutdown timeout, got {err:?}");
        };
        assert_eq!(label, batches[0].label());
        assert_eq!(
            batches.iter().map(Batch::len).collect::<Vec<_>>(),
            vec![2, 1]
        );
        assert_eq!(loader.payload(), "a\nb\nc\n");
        assert!(matches!(
            writer.state(),
            SinkState::Failed(Error::ShutdownTimeout(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_stays_terminal_when_the_in_flight_load_succeeds() {
        let loader = RecordingLoader::new(Behavior::Slow(Duration::from_millis(50)));
        let writer = builder(1, 0).build_with_loader(loader.clone()).unwrap();

        writer.invoke("a").await.unwrap();
        assert!(matches!(writer.state(), SinkState::Flushing));
        // structured rows need a schema
        let err = writer.invoke(Row::new(vec!["b".into()])).await.unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));

        // let the in-flight load of "a" finish
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(loader.batches().len(), 1);
        assert!(matches!(
            writer.state(),
            SinkState::Failed(Error::Serialization(_))
        ));

        assert!(matches!(
            writer.close().await,
            Err(Error::Serialization(_))
        ));
        assert!(matches!(
            writer.invoke("c").await,
            Err(Error::Serialization(_))
        ));
        assert!(matches!(writer.state(), SinkState::Failed(_)));
    }

    #[tokio::test]
    async fn byte_limit_rolls_the_buffer() {
        let loader = RecordingLoader::new(Behavior::Succeed);
        let connection = ConnectionOptions::builder()
            .fenode_list("fe:8030")
            .table_identifier("db.tbl")
            .build()
            .unwrap();
        let load = LoadOptions::builder()
            .batch_bytes(12)
            .batch_interval_ms(0)
            .build()
            .unwrap();
        let writer = SinkWriterBuilder::new(connection, load)
            .build_with_loader(loader.clone())
            .unwrap();

        // 5 bytes per row: two fit, the third rolls the buffer
        let mut expected = String::new();
        for i in 0..6 {
            writer.invoke(format!("row{i}")).await.unwrap();
            expected.push_str(&format!("row{i}\n"));
        }
        // larger than the limit on its own
        let oversized = "x".repeat(20);
        writer.invoke(oversized.as_str()).await.unwrap();
        expected.push_str(&format!("{oversized}\n"));
        writer.close().await.unwrap();

        let batches = loader.batches();
        assert_eq!(
            batches.iter().map(Batch::len).collect::<Vec<_>>(),
            vec![2, 2, 2, 1]
        );
        assert!(batches.iter().take(3).all(|batch| batch.bytes() <= 12));
        assert_eq!(batches[3].bytes(), 21);
        assert_eq!(loader.payload(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn records_buffer_while_a_batch_is_in_flight() {
        let loader = RecordingLoader::new(Behavior::Slow(Duration::from_millis(100)));
        let writer = builder(2, 0).build_with_loader(loader.clone()).unwrap();
        let mut state = writer.subscribe();

        writer.invoke("a").await.unwrap();
        writer.invoke("b").await.unwrap();
        state
            .wait_for(|state| matches!(state, SinkState::Flushing))
            .await
            .unwrap();

        // accepted into the next generation without waiting for the load
        writer.invoke("c").await.unwrap();
        assert!(matches!(writer.state(), SinkState::Flushing));
        assert_eq!(loader.batches().len(), 1);

        state
            .wait_for(|state| matches!(state, SinkState::Open))
            .await
            .unwrap();
        writer.close().await.unwrap();
        assert_eq!(
            loader
                .batches()
                .iter()
                .map(Batch::len)
                .collect::<Vec<_>>(),
            vec![2, 1]
        );
        assert_eq!(loader.payload(), "a\nb\nc\n");
    }

    #[tokio::test]
    async fn closed_sink_rejects_records() {
        let writer = builder(10, 0)
            .build_with_loader(RecordingLoader::new(Behavior::Succeed))
            .unwrap();
        writer.close().await.unwrap();
        writer.close().await.unwrap();
        assert!(matches!(writer.invoke("late").await, Err(Error::Closed)));
        assert!(writer.state().is_terminal());
    }

    #[tokio::test]
    async fn delete_needs_a_schema() {
        let connection = ConnectionOptions::builder()
            .fenode_list("fe:8030")
            .table_identifier("db.tbl")
            .build()
            .unwrap();
        let load = LoadOptions::builder().enable_delete(true).build().unwrap();
        let result = SinkWriterBuilder::new(connection, load)
            .build_with_loader(RecordingLoader::new(Behavior::Succeed));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
