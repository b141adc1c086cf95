use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{ConnectionOptions, LoadOptions};
use crate::error::{Error, Result};
use crate::loader::{Loader, StreamLoader};
use crate::record::Schema;
use crate::retry::RetryController;
use crate::serializer::RowSerializer;
use crate::sinker::actor::SinkActor;
use crate::sinker::{SinkState, SinkWriter};

const DEFAULT_CHANNEL_CAPACITY: usize = 500;

/// SinkWriterBuilder wires the serializer, loader and retry controller together and starts the
/// actor. Must be built from within a tokio runtime.
pub struct SinkWriterBuilder {
    connection: ConnectionOptions,
    load: LoadOptions,
    schema: Option<Schema>,
    cln_token: CancellationToken,
    channel_capacity: usize,
}

impl SinkWriterBuilder {
    pub fn new(connection: ConnectionOptions, load: LoadOptions) -> Self {
        Self {
            connection,
            load,
            schema: None,
            cln_token: CancellationToken::new(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Enables structured mode.
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Token of the owning runtime, cancelled when the sink fails.
    pub fn cancellation_token(mut self, cln_token: CancellationToken) -> Self {
        self.cln_token = cln_token;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Builds a writer loading over HTTP.
    pub fn build(self) -> Result<SinkWriter> {
        let serializer = self.serializer()?;
        let loader = StreamLoader::new(
            Arc::new(self.connection.clone()),
            &self.load,
            serializer.columns(),
        )?;
        Ok(self.spawn(serializer, loader))
    }

    /// Builds a writer on top of a custom [Loader].
    pub fn build_with_loader<L>(self, loader: L) -> Result<SinkWriter>
    where
        L: Loader + Sync + 'static,
    {
        let serializer = self.serializer()?;
        Ok(self.spawn(serializer, loader))
    }

    fn serializer(&self) -> Result<RowSerializer> {
        if self.load.enable_delete() && self.schema.is_none() {
            return Err(Error::Config(
                "enableDelete needs fieldNames and fieldTypes".to_string(),
            ));
        }
        Ok(RowSerializer::new(
            self.load.properties().format().clone(),
            self.schema.clone(),
            self.load.enable_delete(),
        ))
    }

    fn spawn<L>(self, serializer: RowSerializer, loader: L) -> SinkWriter
    where
        L: Loader + Sync + 'static,
    {
        let (sender, receiver) = mpsc::channel(self.channel_capacity);
        let (state_tx, state_rx) = watch::channel(SinkState::Open);
        let retry = RetryController::new(loader, &self.load);
        let actor = SinkActor::new(
            receiver,
            serializer,
            &self.load,
            retry,
            state_tx,
            self.cln_token,
        );
        tokio::spawn(actor.run());

        info!(
            database = self.connection.database(),
            table = self.connection.table(),
            batch_rows = self.load.batch_rows(),
            batch_bytes = self.load.batch_bytes(),
            batch_interval = ?self.load.batch_interval(),
            max_retries = self.load.max_retries(),
            "Doris sink opened"
        );
        SinkWriter::new(sender, state_rx)
    }
}
