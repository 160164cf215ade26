use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, OnceLock,
};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time,
};
use tracing::{debug, error, info, warn};

use crate::{
    ack::{AckHandle, AckId, AckOutcome, AckTable},
    builder::IngestStreamBuilder,
    channel::ChannelConnector,
    config::{StreamConfiguration, TableProperties},
    error::{IngestError, IngestResult, TimeoutKind},
    headers::HeadersProvider,
    limiter::InflightLimiter,
    lock,
    record::{Record, RecordEncoder},
    session::{SessionState, Submission},
};

/// Lifecycle of the stream as a whole, across session incarnations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Recovering,
    Draining,
    Closed,
    /// Terminal: recovery was disabled, exhausted, or hit a non-retryable error.
    Failed,
}

impl StreamState {
    fn is_terminal(self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Failed)
    }
}

/// Instruction from the handle to the supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Control {
    Run,
    Drain,
    Shutdown,
}

/// State shared by the handle, the supervisor, and the active session.
pub(crate) struct StreamCore {
    pub(crate) config: StreamConfiguration,
    pub(crate) endpoint: String,
    pub(crate) table: TableProperties,
    pub(crate) connector: Arc<dyn ChannelConnector>,
    pub(crate) headers: Arc<dyn HeadersProvider>,
    pub(crate) acks: AckTable,
    pub(crate) limiter: InflightLimiter,
    state: watch::Sender<StreamState>,
    session_state: watch::Sender<SessionState>,
    stream_id: Mutex<Option<String>>,
    terminal: OnceLock<IngestError>,
}

impl StreamCore {
    pub(crate) fn new(
        config: StreamConfiguration,
        endpoint: String,
        table: TableProperties,
        connector: Arc<dyn ChannelConnector>,
        headers: Arc<dyn HeadersProvider>,
    ) -> Self {
        let limiter = InflightLimiter::new(config.max_inflight_records);
        Self {
            config,
            endpoint,
            table,
            connector,
            headers,
            acks: AckTable::new(),
            limiter,
            state: watch::channel(StreamState::Open).0,
            session_state: watch::channel(SessionState::Connecting).0,
            stream_id: Mutex::new(None),
            terminal: OnceLock::new(),
        }
    }

    /// Settles one record and returns its permit. Late or duplicate settlements are ignored.
    pub(crate) fn settle(&self, ack_id: AckId, outcome: AckOutcome) -> bool {
        let settled = self.acks.complete(ack_id, outcome);
        if settled {
            self.limiter.release();
        }
        settled
    }

    pub(crate) fn fail_all_pending(&self, error: IngestError) -> usize {
        let failed = self.acks.fail_all_pending(error);
        self.limiter.release_many(failed);
        failed
    }

    /// Moves the stream to its terminal failed state: admission stops, every pending record
    /// fails, and blocked callers are released.
    pub(crate) fn terminate(&self, cause: IngestError) {
        let error = IngestError::PermanentlyFailed {
            cause: Box::new(cause),
        };
        if self.terminal.set(error.clone()).is_err() {
            return;
        }
        self.acks.seal(error.clone());
        self.state.send_replace(StreamState::Failed);
        let failed = self.fail_all_pending(error.clone());
        self.limiter.close();
        error!(failed, error = %error, "stream permanently failed");
    }

    pub(crate) fn failure(&self) -> Option<IngestError> {
        self.terminal.get().cloned()
    }

    pub(crate) fn set_state(&self, next: StreamState) {
        self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            debug!(from = ?*current, to = ?next, "stream state");
            *current = next;
            true
        });
    }

    /// Returns to `Open` after recovery unless a close began meanwhile.
    pub(crate) fn reopened(&self) {
        self.state.send_if_modified(|current| {
            if *current != StreamState::Recovering {
                return false;
            }
            *current = StreamState::Open;
            true
        });
    }

    pub(crate) fn report_session(&self, incarnation: u64, next: SessionState) {
        debug!(incarnation, state = ?next, "session state");
        self.session_state.send_replace(next);
    }

    pub(crate) fn set_stream_id(&self, stream_id: &str) {
        *lock(&self.stream_id) = Some(stream_id.to_string());
    }
}

/// Handle to a live ingestion stream.
///
/// `ingest` may be called concurrently from many tasks; it only suspends while the in-flight
/// limit is reached. Call [`IngestStream::close`] when done. Dropping an open stream fails
/// every pending record with [`IngestError::StreamClosed`], but gives no flush guarantee.
pub struct IngestStream {
    core: Arc<StreamCore>,
    encoder: RecordEncoder,
    queue: mpsc::UnboundedSender<Submission>,
    control: watch::Sender<Control>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl IngestStream {
    pub fn builder(connector: impl ChannelConnector) -> IngestStreamBuilder {
        IngestStreamBuilder::new(Arc::new(connector))
    }

    pub(crate) fn start(
        core: Arc<StreamCore>,
        queue: mpsc::UnboundedSender<Submission>,
        control: watch::Sender<Control>,
        supervisor: JoinHandle<()>,
    ) -> Self {
        let encoder = RecordEncoder::new(core.config.record_encoding);
        Self {
            core,
            encoder,
            queue,
            control,
            supervisor: Mutex::new(Some(supervisor)),
            closed: AtomicBool::new(false),
        }
    }

    /// Validates and admits one record, waiting for an in-flight permit if the limit is reached.
    ///
    /// Returns as soon as the record is queued for the active session; the acknowledgment is
    /// observed through the returned handle. Fails immediately, without network activity, once
    /// the stream is closed or permanently failed.
    pub async fn ingest(&self, record: impl Into<Record>) -> IngestResult<AckHandle> {
        if let Some(err) = self.core.acks.sealed() {
            return Err(err);
        }
        let payload = self.encoder.encode(record.into())?;

        let permit = match self.core.limiter.acquire().await {
            Ok(permit) => permit,
            Err(err) => return Err(self.core.acks.sealed().unwrap_or(err)),
        };
        let queue = &self.queue;
        let handle = self.core.acks.admit(move |ack_id| {
            queue
                .send(Submission { ack_id, payload })
                .map_err(|_| IngestError::StreamClosed)
        })?;
        permit.commit();

        debug!(ack_id = handle.id(), "record admitted");
        Ok(handle)
    }

    /// Waits until every record pending at call time has settled.
    ///
    /// Individual failures surface on their handles. Times out with
    /// [`IngestError::Timeout`] after the configured flush timeout.
    pub async fn flush(&self) -> IngestResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IngestError::StreamClosed);
        }
        self.drain().await
    }

    /// Stops admission, flushes, then tears down the session. Records still pending after the
    /// flush fail with [`IngestError::StreamClosed`]. A second call returns `Ok(())`.
    pub async fn close(&self) -> IngestResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.core.acks.seal(IngestError::StreamClosed);
        self.core.set_state(StreamState::Draining);
        self.control.send_replace(Control::Drain);
        let flushed = self.drain().await;

        self.control.send_replace(Control::Shutdown);
        let supervisor = lock(&self.supervisor).take();
        if let Some(supervisor) = supervisor {
            if let Err(err) = supervisor.await {
                warn!(error = %err, "stream supervisor ended abnormally");
            }
        }

        let abandoned = self.core.fail_all_pending(IngestError::StreamClosed);
        self.core.limiter.close();
        self.core.set_state(StreamState::Closed);
        info!(abandoned, "stream closed");
        flushed
    }

    async fn drain(&self) -> IngestResult<()> {
        let pending = self.core.acks.pending_handles();
        let flush_timeout = self.core.config.flush_timeout();
        debug!(pending = pending.len(), "flushing stream");

        let settled = async {
            for handle in &pending {
                let _ = handle.wait().await;
            }
        };
        if time::timeout(flush_timeout, settled).await.is_err() {
            warn!(pending = self.core.acks.pending_count(), "flush timed out");
            return Err(IngestError::Timeout {
                operation: TimeoutKind::Flush,
                after: flush_timeout,
            });
        }

        match self.core.failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Waits on a pending acknowledgment by id.
    pub async fn wait_for_ack(&self, ack_id: AckId) -> AckOutcome {
        self.core.acks.wait(ack_id).await
    }

    /// Polls a pending acknowledgment by id; `None` while it is pending.
    pub fn try_get_ack(&self, ack_id: AckId) -> Option<AckOutcome> {
        self.core.acks.try_get(ack_id)
    }

    pub fn state(&self) -> StreamState {
        *self.core.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<StreamState> {
        self.core.state.subscribe()
    }

    pub fn session_state(&self) -> SessionState {
        *self.core.session_state.borrow()
    }

    /// Service-assigned id of the current session.
    pub fn stream_id(&self) -> Option<String> {
        lock(&self.core.stream_id).clone()
    }

    /// The error that terminated the stream, if it permanently failed.
    pub fn failure(&self) -> Option<IngestError> {
        self.core.failure()
    }

    pub fn pending_count(&self) -> usize {
        self.core.acks.pending_count()
    }

    pub fn permits_in_use(&self) -> usize {
        self.core.limiter.in_use()
    }

    pub fn config(&self) -> &StreamConfiguration {
        &self.core.config
    }

    pub fn table(&self) -> &TableProperties {
        &self.core.table
    }
}

impl Drop for IngestStream {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(
            pending = self.core.acks.pending_count(),
            "stream dropped without close; failing pending records"
        );
        self.control.send_replace(Control::Shutdown);
        self.core.acks.seal(IngestError::StreamClosed);
        self.core.fail_all_pending(IngestError::StreamClosed);
        self.core.limiter.close();
        self.core.set_state(StreamState::Closed);
    }
}
