use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::{
    channel::ChannelConnector,
    config::{StreamConfiguration, TableProperties},
    error::{IngestError, IngestResult},
    headers::{HeadersProvider, StaticHeadersProvider},
    recovery::{establish, RecoveryController},
    stream::{Control, IngestStream, StreamCore},
};

/// Collects everything fixed at stream creation. Obtain one from [`IngestStream::builder`].
pub struct IngestStreamBuilder {
    connector: Arc<dyn ChannelConnector>,
    endpoint: String,
    table: Option<TableProperties>,
    headers: Arc<dyn HeadersProvider>,
    config: StreamConfiguration,
}

impl IngestStreamBuilder {
    pub(crate) fn new(connector: Arc<dyn ChannelConnector>) -> Self {
        Self {
            connector,
            endpoint: String::new(),
            table: None,
            headers: Arc::new(StaticHeadersProvider::default()),
            config: StreamConfiguration::default(),
        }
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn table(mut self, table: TableProperties) -> Self {
        self.table = Some(table);
        self
    }

    pub fn headers_provider(mut self, provider: impl HeadersProvider) -> Self {
        self.headers = Arc::new(provider);
        self
    }

    pub fn config(mut self, config: StreamConfiguration) -> Self {
        self.config = config;
        self
    }

    /// Validates the settings, opens the first session, and starts supervising it.
    ///
    /// Retryable connect failures are retried with the recovery policy when recovery is
    /// enabled. Must be called from within a Tokio runtime.
    pub async fn create(self) -> IngestResult<IngestStream> {
        self.config
            .validate()
            .map_err(|err| IngestError::InvalidConfig(err.to_string()))?;
        let table = self.table.ok_or(IngestError::EmptyTableName)?;
        table.validate(self.config.record_encoding)?;

        let attempts = self.config.creation_attempts();
        let core = Arc::new(StreamCore::new(
            self.config,
            self.endpoint,
            table,
            self.connector,
            self.headers,
        ));
        let session = establish(&core, attempts, 1).await?;
        info!(
            table = %core.table.table_name,
            encoding = %core.config.record_encoding,
            max_inflight = core.config.max_inflight_records,
            "stream created"
        );

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = watch::channel(Control::Run);
        let controller = RecoveryController::new(core.clone(), queue_rx, control_rx, 1);
        let supervisor = tokio::spawn(controller.run(session));

        Ok(IngestStream::start(core, queue_tx, control_tx, supervisor))
    }
}

/// Creates a stream in one call; equivalent to configuring an [`IngestStreamBuilder`].
pub async fn create_stream(
    connector: impl ChannelConnector,
    endpoint: impl Into<String>,
    table: TableProperties,
    headers: impl HeadersProvider,
    config: StreamConfiguration,
) -> IngestResult<IngestStream> {
    IngestStream::builder(connector)
        .endpoint(endpoint)
        .table(table)
        .headers_provider(headers)
        .config(config)
        .create()
        .await
}
