use std::{
    collections::VecDeque,
    sync::{Mutex, OnceLock},
    time::Duration,
};

use tokio::{
    sync::{mpsc, watch},
    time::{self, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    ack::{AckId, AckOutcome},
    channel::{ChannelSink, ChannelSource, InboundMessage, OpenRequest, OutboundFrame, ResumePoint},
    config::{RecordEncoding, ReplayPolicy},
    defaults::TABLE_NAME_HEADER,
    error::{ChannelError, ChannelErrorKind, IngestError, IngestResult, TimeoutKind},
    lock,
    record::EncodedPayload,
    stream::{Control, StreamCore},
};

/// Lifecycle of one physical connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Draining,
    Closed,
    Failed,
}

/// An admitted record waiting for the send path.
#[derive(Debug)]
pub(crate) struct Submission {
    pub(crate) ack_id: AckId,
    pub(crate) payload: EncodedPayload,
}

/// A record written to the channel and not yet answered. The payload is only retained when
/// the stream re-sends in-flight records after a reconnect.
#[derive(Debug)]
pub(crate) struct InFlight {
    pub(crate) ack_id: AckId,
    pub(crate) payload: Option<EncodedPayload>,
}

#[derive(Debug)]
struct InflightQueue {
    entries: VecDeque<InFlight>,
    last_progress: Instant,
}

impl InflightQueue {
    fn push(&mut self, entry: InFlight) {
        if self.entries.is_empty() {
            self.last_progress = Instant::now();
        }
        self.entries.push_back(entry);
    }

    fn deadline(&self, ack_timeout: Duration) -> Instant {
        if self.entries.is_empty() {
            Instant::now() + ack_timeout
        } else {
            self.last_progress + ack_timeout
        }
    }

    fn stalled(&self, ack_timeout: Duration) -> bool {
        !self.entries.is_empty() && self.last_progress.elapsed() >= ack_timeout
    }
}

pub(crate) enum SessionExit {
    Closed,
    Failed(IngestError),
}

/// One incarnation of the duplex channel.
///
/// The send path drains the shared submission queue into the sink; the receive loop correlates
/// responses with the oldest in-flight records, in order. Whichever fails first ends the session.
pub(crate) struct StreamSession {
    incarnation: u64,
    stream_id: String,
    sink: Box<dyn ChannelSink>,
    source: Box<dyn ChannelSource>,
    inflight: Mutex<InflightQueue>,
    /// Records carried over for re-sending. Each leaves this queue only when it is written.
    replay: VecDeque<Submission>,
    resume_point: Option<ResumePoint>,
    failure: OnceLock<IngestError>,
}

impl StreamSession {
    pub(crate) async fn connect(core: &StreamCore, incarnation: u64) -> IngestResult<Self> {
        core.report_session(incarnation, SessionState::Connecting);

        let mut headers = core.headers.get_headers().await?;
        headers
            .entry(TABLE_NAME_HEADER.to_string())
            .or_insert_with(|| core.table.table_name.clone());

        let encoding = core.config.record_encoding;
        let request = OpenRequest {
            endpoint: core.endpoint.clone(),
            table_name: core.table.table_name.clone(),
            descriptor: match encoding {
                RecordEncoding::Binary => core.table.descriptor.clone(),
                RecordEncoding::Json => None,
            },
            encoding,
            headers,
        };
        let opened = core.connector.open(request).await?;

        info!(
            incarnation,
            stream_id = %opened.stream_id,
            table = %core.table.table_name,
            "session opened"
        );
        core.set_stream_id(&opened.stream_id);
        core.report_session(incarnation, SessionState::Open);

        Ok(Self {
            incarnation,
            stream_id: opened.stream_id,
            sink: opened.sink,
            source: opened.source,
            inflight: Mutex::new(InflightQueue {
                entries: VecDeque::new(),
                last_progress: Instant::now(),
            }),
            replay: VecDeque::new(),
            resume_point: opened.resume_point,
            failure: OnceLock::new(),
        })
    }

    pub(crate) fn incarnation(&self) -> u64 {
        self.incarnation
    }

    pub(crate) fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Settles or schedules records carried over from a failed session.
    pub(crate) fn adopt(&mut self, core: &StreamCore, carried: Vec<InFlight>, cause: &IngestError) {
        if carried.is_empty() {
            return;
        }
        match core.config.replay_policy {
            ReplayPolicy::ResendInFlight => {
                debug!(
                    incarnation = self.incarnation,
                    records = carried.len(),
                    "re-sending in-flight records"
                );
                let mut unsendable = Vec::new();
                for entry in carried {
                    match entry.payload {
                        Some(payload) => self.replay.push_back(Submission {
                            ack_id: entry.ack_id,
                            payload,
                        }),
                        None => unsendable.push(entry),
                    }
                }
                fail_in_flight(core, unsendable, cause);
            }
            ReplayPolicy::ResumeFromCheckpoint => {
                reconcile_with_resume_point(core, carried, self.resume_point, cause);
            }
            ReplayPolicy::FailInFlight => fail_in_flight(core, carried, cause),
        }
    }

    pub(crate) async fn run(
        &mut self,
        core: &StreamCore,
        queue: &mut mpsc::UnboundedReceiver<Submission>,
        control: &mut watch::Receiver<Control>,
    ) -> SessionExit {
        let incarnation = self.incarnation;
        let ack_timeout = core.config.server_ack_timeout();
        let retain = core.config.replay_policy == ReplayPolicy::ResendInFlight;
        let replay = &mut self.replay;
        let inflight = &self.inflight;
        let sink = &mut self.sink;
        let source = &mut self.source;

        let watch_control = async {
            loop {
                let current = *control.borrow_and_update();
                match current {
                    Control::Run => {}
                    Control::Drain => core.report_session(incarnation, SessionState::Draining),
                    Control::Shutdown => return,
                }
                if control.changed().await.is_err() {
                    return;
                }
            }
        };

        let send_path = async {
            while let Some(entry) = replay.pop_front() {
                if let Err(err) = write(sink, inflight, entry.ack_id, entry.payload, true).await {
                    return err;
                }
            }
            loop {
                let Some(submission) = queue.recv().await else {
                    return std::future::pending::<IngestError>().await;
                };
                if let Err(err) =
                    write(sink, inflight, submission.ack_id, submission.payload, retain).await
                {
                    return err;
                }
            }
        };

        let receive_loop = async {
            loop {
                let deadline = lock(inflight).deadline(ack_timeout);
                let received = match time::timeout_at(deadline, source.receive()).await {
                    Ok(received) => received,
                    Err(_) => {
                        if lock(inflight).stalled(ack_timeout) {
                            return IngestError::Timeout {
                                operation: TimeoutKind::ServerAck,
                                after: ack_timeout,
                            };
                        }
                        continue;
                    }
                };

                let outcome = match received {
                    None => {
                        return IngestError::Channel(ChannelError::new(
                            ChannelErrorKind::ConnectionReset,
                            "channel closed by the service",
                        ))
                    }
                    Some(Err(err)) => return IngestError::Channel(err),
                    Some(Ok(InboundMessage::Ack { ack_id, offset })) => {
                        correlate(core, inflight, incarnation, ack_id, Ok(offset))
                    }
                    Some(Ok(InboundMessage::Rejected { ack_id, error })) => {
                        warn!(incarnation, ack_id, error = %error, "record rejected");
                        correlate(
                            core,
                            inflight,
                            incarnation,
                            ack_id,
                            Err(IngestError::Channel(error)),
                        )
                    }
                    Some(Ok(InboundMessage::CloseSignal { reason })) => {
                        if core.config.recovery {
                            return IngestError::ServerClosing { reason };
                        }
                        warn!(
                            incarnation,
                            reason = reason.as_deref().unwrap_or_default(),
                            "service signalled close; recovery disabled, keeping session"
                        );
                        Ok(())
                    }
                };
                if let Err(err) = outcome {
                    return err;
                }
            }
        };

        tokio::select! {
            biased;
            _ = watch_control => SessionExit::Closed,
            err = send_path => SessionExit::Failed(err),
            err = receive_loop => SessionExit::Failed(err),
        }
    }

    /// Marks the session failed. Returns `false` if a failure was already reported.
    pub(crate) fn fail(&self, core: &StreamCore, cause: &IngestError) -> bool {
        if self.failure.set(cause.clone()).is_err() {
            return false;
        }
        warn!(
            incarnation = self.incarnation,
            stream_id = %self.stream_id,
            pending = lock(&self.inflight).entries.len(),
            error = %cause,
            "session failed"
        );
        core.report_session(self.incarnation, SessionState::Failed);
        true
    }

    /// Removes every record still waiting for a response, oldest first. Replayed records that
    /// were never written come last.
    pub(crate) fn take_inflight(&mut self) -> Vec<InFlight> {
        let mut carried: Vec<InFlight> = lock(&self.inflight).entries.drain(..).collect();
        carried.extend(self.replay.drain(..).map(|entry| InFlight {
            ack_id: entry.ack_id,
            payload: Some(entry.payload),
        }));
        carried
    }

    /// Closes the sink. A failed session keeps its `Failed` state.
    pub(crate) async fn close(mut self, core: &StreamCore) {
        self.sink.close().await;
        if self.failure.get().is_none() {
            core.report_session(self.incarnation, SessionState::Closed);
            debug!(incarnation = self.incarnation, "session closed");
        }
    }
}

async fn write(
    sink: &mut Box<dyn ChannelSink>,
    inflight: &Mutex<InflightQueue>,
    ack_id: AckId,
    payload: EncodedPayload,
    retain: bool,
) -> Result<(), IngestError> {
    lock(inflight).push(InFlight {
        ack_id,
        payload: retain.then(|| payload.clone()),
    });
    debug!(ack_id, bytes = payload.len(), "writing record");
    sink.send(OutboundFrame { ack_id, payload })
        .await
        .map_err(IngestError::Channel)
}

fn correlate(
    core: &StreamCore,
    inflight: &Mutex<InflightQueue>,
    incarnation: u64,
    ack_id: AckId,
    outcome: AckOutcome,
) -> Result<(), IngestError> {
    {
        let mut queue = lock(inflight);
        match queue.entries.iter().position(|entry| entry.ack_id == ack_id) {
            Some(0) => {
                queue.entries.pop_front();
                queue.last_progress = Instant::now();
            }
            Some(ahead) => {
                return Err(IngestError::Protocol(format!(
                    "response for record {ack_id} arrived ahead of {ahead} earlier records"
                )));
            }
            None => {
                warn!(incarnation, ack_id, "ignoring response for a record not in flight");
                return Ok(());
            }
        }
    }
    debug!(incarnation, ack_id, ok = outcome.is_ok(), "record settled");
    core.settle(ack_id, outcome);
    Ok(())
}

pub(crate) fn fail_in_flight(core: &StreamCore, carried: Vec<InFlight>, cause: &IngestError) {
    for entry in carried {
        core.settle(
            entry.ack_id,
            Err(IngestError::InFlightLost {
                ack_id: entry.ack_id,
                cause: Box::new(cause.clone()),
            }),
        );
    }
}

/// Records up to the resume point are durable; the service assigns consecutive offsets to
/// consecutive records, so earlier ones sit just below the reported offset.
fn reconcile_with_resume_point(
    core: &StreamCore,
    carried: Vec<InFlight>,
    resume_point: Option<ResumePoint>,
    cause: &IngestError,
) {
    let Some(point) = resume_point else {
        fail_in_flight(core, carried, cause);
        return;
    };

    let durable = carried
        .iter()
        .filter(|entry| entry.ack_id <= point.ack_id)
        .count();
    let mut resolved = 0;
    let mut lost = Vec::new();
    for entry in carried {
        if entry.ack_id <= point.ack_id {
            let distance = (durable - 1 - resolved) as i64;
            core.settle(entry.ack_id, Ok(point.offset - distance));
            resolved += 1;
        } else {
            lost.push(entry);
        }
    }
    info!(
        resume_ack_id = point.ack_id,
        resolved,
        lost = lost.len(),
        "reconciled in-flight records with resume point"
    );
    fail_in_flight(core, lost, cause);
}
