use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{AppendResult, Batch, BatchBuffer};
use crate::config::LoadOptions;
use crate::error::{Error, Result};
use crate::loader::{LoadOutcome, Loader};
use crate::record::Record;
use crate::retry::RetryController;
use crate::serializer::RowSerializer;
use crate::sinker::SinkState;
use crate::trigger::{FlushReason, FlushTrigger};

/// SinkActorMessage is a message that is sent to the SinkActor.
pub(super) enum SinkActorMessage {
    Write {
        record: Record,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Flush {
        respond_to: oneshot::Sender<Result<()>>,
    },
    Close {
        respond_to: oneshot::Sender<Result<()>>,
    },
}

/// The single submission allowed to run concurrently with buffering.
struct InFlight {
    label: String,
    rows: usize,
    handle: JoinHandle<Result<LoadOutcome>>,
}

enum Event {
    Message(Option<SinkActorMessage>),
    Submitted(std::result::Result<Result<LoadOutcome>, JoinError>),
    Tick,
}

/// SinkActor owns the batch buffer. Writes, explicit flushes, the interval deadline and the
/// completion of the in-flight submission are all handled on this one task, so appends and
/// snapshots can never interleave.
pub(super) struct SinkActor<L> {
    actor_messages: mpsc::Receiver<SinkActorMessage>,
    serializer: RowSerializer,
    buffer: BatchBuffer,
    trigger: FlushTrigger,
    retry: RetryController<L>,
    in_flight: Option<InFlight>,
    shutdown_grace: Duration,
    state: watch::Sender<SinkState>,
    failure: Option<Error>,
    cln_token: CancellationToken,
}

impl<L> SinkActor<L>
where
    L: Loader + Sync + 'static,
{
    pub(super) fn new(
        actor_messages: mpsc::Receiver<SinkActorMessage>,
        serializer: RowSerializer,
        options: &LoadOptions,
        retry: RetryController<L>,
        state: watch::Sender<SinkState>,
        cln_token: CancellationToken,
    ) -> Self {
        Self {
            actor_messages,
            serializer,
            buffer: BatchBuffer::new(options),
            trigger: FlushTrigger::new(options),
            retry,
            in_flight: None,
            shutdown_grace: options.shutdown_grace(),
            state,
            failure: None,
            cln_token,
        }
    }

    pub(super) async fn run(mut self) {
        loop {
            let deadline = if self.failure.is_none() {
                self.trigger.deadline(&self.buffer)
            } else {
                None
            };

            let event = tokio::select! {
                msg = self.actor_messages.recv() => Event::Message(msg),
                joined = join(&mut self.in_flight), if self.in_flight.is_some() => {
                    Event::Submitted(joined)
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    Event::Tick
                }
            };

            match event {
                Event::Message(Some(SinkActorMessage::Write { record, respond_to })) => {
                    let _ = respond_to.send(self.write(record).await);
                }
                Event::Message(Some(SinkActorMessage::Flush { respond_to })) => {
                    let _ = respond_to.send(self.flush().await);
                }
                Event::Message(Some(SinkActorMessage::Close { respond_to })) => {
                    let _ = respond_to.send(self.close().await);
                    break;
                }
                Event::Message(None) => {
                    // every handle is gone without an explicit close
                    if let Err(e) = self.close().await {
                        error!(?e, "Closing the sink after all writers were dropped");
                    }
                    break;
                }
                Event::Submitted(joined) => {
                    if let Some(in_flight) = self.in_flight.take() {
                        self.complete(&in_flight.label, in_flight.rows, joined);
                    }
                }
                Event::Tick => {
                    if let Err(e) = self.maybe_flush().await {
                        warn!(?e, "Interval flush failed");
                    }
                }
            }
        }
        debug!("Sink actor stopped");
    }

    fn healthy(&self) -> Result<()> {
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Moves to the terminal failed state and asks the owning runtime to stop the pipeline.
    fn fail(&mut self, error: Error) {
        error!(%error, "Sink failed, stopping the pipeline");
        self.failure = Some(error.clone());
        self.state.send_replace(SinkState::Failed(error));
        self.cln_token.cancel();
    }

    async fn write(&mut self, record: Record) -> Result<()> {
        self.healthy()?;
        let row = match self.serializer.serialize(&record) {
            Ok(row) => row,
            Err(e) => {
                self.fail(e.clone());
                return Err(e);
            }
        };
        if let AppendResult::Rolled(sealed) = self.buffer.append(row) {
            self.submit(sealed, FlushReason::Bytes).await?;
        }
        self.maybe_flush().await
    }

    async fn maybe_flush(&mut self) -> Result<()> {
        let Some(reason) = self.trigger.evaluate(&self.buffer, Instant::now()) else {
            return Ok(());
        };
        match self.buffer.snapshot_and_reset() {
            Some(batch) => self.submit(batch, reason).await,
            None => Ok(()),
        }
    }

    /// Seals whatever is buffered and waits until every submission is done.
    async fn flush(&mut self) -> Result<()> {
        self.healthy()?;
        if let Some(batch) = self.buffer.snapshot_and_reset() {
            self.submit(batch, FlushReason::Requested).await?;
        }
        self.await_in_flight().await
    }

    /// Hands the batch to a submission task. A previous submission still running is awaited
    /// first, which blocks the writers and keeps batches in order.
    async fn submit(&mut self, batch: Batch, reason: FlushReason) -> Result<()> {
        self.await_in_flight().await?;

        let label = batch.label().to_string();
        let rows = batch.len();
        info!(%label, rows, bytes = batch.bytes(), %reason, "Flushing batch");

        let retry = self.retry.clone();
        let handle = tokio::spawn(async move { retry.submit_with_retry(Arc::new(batch)).await });
        self.in_flight = Some(InFlight {
            label,
            rows,
            handle,
        });
        self.state.send_replace(SinkState::Flushing);
        Ok(())
    }

    async fn await_in_flight(&mut self) -> Result<()> {
        if let Some(in_flight) = self.in_flight.take() {
            let joined = in_flight.handle.await;
            self.complete(&in_flight.label, in_flight.rows, joined);
        }
        self.healthy()
    }

    fn complete(
        &mut self,
        label: &str,
        rows: usize,
        joined: std::result::Result<Result<LoadOutcome>, JoinError>,
    ) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => Err(Error::LoadTask(format!("load task for {label} failed: {e}"))),
        };
        match outcome {
            Ok(_) => {
                debug!(label, rows, "Batch committed");
                // Failed is terminal, a late success must not reopen the sink
                if self.failure.is_none() {
                    self.state.send_replace(SinkState::Open);
                }
            }
            Err(e) => self.fail(e),
        }
    }

    /// Waits for the in-flight submission within the grace period and abandons it after. The
    /// buffered remainder is then loaded once, bounded by the grace period as well. An abandoned
    /// submission is reported as [Error::ShutdownTimeout] even when the remainder loads.
    async fn close(&mut self) -> Result<()> {
        let abandoned = match self.in_flight.take() {
            Some(mut in_flight) => {
                match time::timeout(self.shutdown_grace, &mut in_flight.handle).await {
                    Ok(joined) => {
                        self.complete(&in_flight.label, in_flight.rows, joined);
                        None
                    }
                    Err(_) => {
                        in_flight.handle.abort();
                        warn!(
                            label = %in_flight.label,
                            grace = ?self.shutdown_grace,
                            "Abandoning in-flight load"
                        );
                        Some(Error::ShutdownTimeout(in_flight.label))
                    }
                }
            }
            None => None,
        };
        self.healthy()?;

        let flushed = self.flush_remaining().await;
        if let Some(timeout) = abandoned {
            if let Err(e) = flushed {
                error!(%e, "Final flush after abandoning the in-flight load failed");
            }
            self.fail(timeout.clone());
            return Err(timeout);
        }
        if let Err(e) = flushed {
            self.fail(e.clone());
            return Err(e);
        }

        self.state.send_replace(SinkState::Closed);
        info!("Sink closed");
        Ok(())
    }

    async fn flush_remaining(&mut self) -> Result<()> {
        let Some(batch) = self.buffer.snapshot_and_reset() else {
            return Ok(());
        };
        let label = batch.label().to_string();
        info!(
            %label,
            rows = batch.len(),
            "Flushing remaining rows before close"
        );
        self.state.send_replace(SinkState::Flushing);
        match time::timeout(
            self.shutdown_grace,
            self.retry.submit_with_retry(Arc::new(batch)),
        )
        .await
        {
            Ok(outcome) => outcome.map(|_| ()),
            Err(_) => Err(Error::ShutdownTimeout(label)),
        }
    }
}

/// Resolves when the in-flight submission finishes, never when there is none.
async fn join(
    in_flight: &mut Option<InFlight>,
) -> std::result::Result<Result<LoadOutcome>, JoinError> {
    match in_flight {
        Some(in_flight) => (&mut in_flight.handle).await,
        None => std::future::pending().await,
    }
}
