//! In-process channel whose service end is driven by the caller.
//!
//! [`loopback`] returns a connector for the stream and a [`LoopbackService`] that accepts each
//! session as a [`LoopbackConnection`]. The connection reads frames the stream wrote and answers
//! with acks, rejections, close signals, transport errors, or a hang-up. Upcoming opens can be
//! scripted to fail, hang, or report a resume point.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::debug;

use super::{
    BoxFuture, ChannelConnector, ChannelSink, ChannelSource, InboundMessage, OpenRequest,
    OpenedChannel, OutboundFrame, ResumePoint,
};
use crate::{
    ack::{AckId, Offset},
    error::{ChannelError, ChannelErrorKind},
    lock,
};

type Response = Result<InboundMessage, ChannelError>;

enum OpenStep {
    Fail(ChannelError),
    Hang,
}

#[derive(Default)]
struct OpenScript {
    steps: VecDeque<OpenStep>,
    resume_point: Option<ResumePoint>,
}

struct LoopbackShared {
    accept: mpsc::UnboundedSender<LoopbackConnection>,
    script: Mutex<OpenScript>,
    open_attempts: AtomicUsize,
    next_stream: AtomicU64,
}

pub fn loopback() -> (LoopbackConnector, LoopbackService) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(LoopbackShared {
        accept: accept_tx,
        script: Mutex::new(OpenScript::default()),
        open_attempts: AtomicUsize::new(0),
        next_stream: AtomicU64::new(1),
    });
    (
        LoopbackConnector {
            shared: shared.clone(),
        },
        LoopbackService {
            shared,
            accept: accept_rx,
        },
    )
}

#[derive(Clone)]
pub struct LoopbackConnector {
    shared: Arc<LoopbackShared>,
}

impl ChannelConnector for LoopbackConnector {
    fn open(&self, request: OpenRequest) -> BoxFuture<'_, Result<OpenedChannel, ChannelError>> {
        Box::pin(async move {
            self.shared.open_attempts.fetch_add(1, Ordering::SeqCst);
            let step = lock(&self.shared.script).steps.pop_front();
            match step {
                Some(OpenStep::Fail(err)) => return Err(err),
                Some(OpenStep::Hang) => std::future::pending::<()>().await,
                None => {}
            }
            let resume_point = lock(&self.shared.script).resume_point.take();

            let stream_id = format!(
                "loopback-{}",
                self.shared.next_stream.fetch_add(1, Ordering::SeqCst)
            );
            let (frames_tx, frames_rx) = mpsc::unbounded_channel();
            let (responses_tx, responses_rx) = mpsc::unbounded_channel();
            let connection = LoopbackConnection {
                stream_id: stream_id.clone(),
                request,
                frames: frames_rx,
                responses: responses_tx,
                next_offset: 0,
            };
            self.shared.accept.send(connection).map_err(|_| {
                ChannelError::new(
                    ChannelErrorKind::Unavailable,
                    "loopback service is not accepting connections",
                )
            })?;
            debug!(stream_id = %stream_id, "loopback channel opened");

            Ok(OpenedChannel {
                stream_id,
                resume_point,
                sink: Box::new(LoopbackSink {
                    frames: Some(frames_tx),
                }),
                source: Box::new(LoopbackSource {
                    responses: responses_rx,
                }),
            })
        })
    }
}

/// Service end: accepts sessions and scripts upcoming opens.
pub struct LoopbackService {
    shared: Arc<LoopbackShared>,
    accept: mpsc::UnboundedReceiver<LoopbackConnection>,
}

impl LoopbackService {
    pub async fn accept(&mut self) -> Option<LoopbackConnection> {
        self.accept.recv().await
    }

    pub fn fail_next_open(&self, error: ChannelError) {
        lock(&self.shared.script)
            .steps
            .push_back(OpenStep::Fail(error));
    }

    /// The next open never completes; the caller's own timeout has to give up on it.
    pub fn hang_next_open(&self) {
        lock(&self.shared.script).steps.push_back(OpenStep::Hang);
    }

    /// The next successful open reports `point` as the last durable record.
    pub fn resume_next_open(&self, point: ResumePoint) {
        lock(&self.shared.script).resume_point = Some(point);
    }

    /// Every open call so far, including scripted failures.
    pub fn open_attempts(&self) -> usize {
        self.shared.open_attempts.load(Ordering::SeqCst)
    }
}

/// Service end of one session.
pub struct LoopbackConnection {
    stream_id: String,
    request: OpenRequest,
    frames: mpsc::UnboundedReceiver<OutboundFrame>,
    responses: mpsc::UnboundedSender<Response>,
    next_offset: Offset,
}

impl LoopbackConnection {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn request(&self) -> &OpenRequest {
        &self.request
    }

    /// Next frame written by the stream; `None` once the stream closed its sink.
    pub async fn next_frame(&mut self) -> Option<OutboundFrame> {
        self.frames.recv().await
    }

    /// Reads the next frame and acknowledges it at the next sequential offset.
    pub async fn ack_next(&mut self) -> Option<(OutboundFrame, Offset)> {
        let frame = self.next_frame().await?;
        let offset = self.next_offset;
        self.next_offset += 1;
        self.ack(frame.ack_id, offset);
        Some((frame, offset))
    }

    pub fn ack(&self, ack_id: AckId, offset: Offset) -> bool {
        self.respond(Ok(InboundMessage::Ack { ack_id, offset }))
    }

    pub fn reject(&self, ack_id: AckId, error: ChannelError) -> bool {
        self.respond(Ok(InboundMessage::Rejected { ack_id, error }))
    }

    pub fn signal_close(&self, reason: Option<String>) -> bool {
        self.respond(Ok(InboundMessage::CloseSignal { reason }))
    }

    /// Delivers a transport error to the stream's receive loop.
    pub fn fail(&self, error: ChannelError) -> bool {
        self.respond(Err(error))
    }

    /// Drops the service end; the stream observes an unexpected close.
    pub fn hang_up(self) {}

    /// Acknowledges every frame until the stream closes its sink; yields the number acked.
    pub fn spawn_auto_ack(mut self) -> JoinHandle<usize> {
        tokio::spawn(async move {
            let mut acked = 0;
            while self.ack_next().await.is_some() {
                acked += 1;
            }
            acked
        })
    }

    fn respond(&self, response: Response) -> bool {
        self.responses.send(response).is_ok()
    }
}

struct LoopbackSink {
    frames: Option<mpsc::UnboundedSender<OutboundFrame>>,
}

impl ChannelSink for LoopbackSink {
    fn send(&mut self, frame: OutboundFrame) -> BoxFuture<'_, Result<(), ChannelError>> {
        let sent = match &self.frames {
            Some(frames) => frames.send(frame).map_err(|_| {
                ChannelError::new(ChannelErrorKind::ConnectionReset, "loopback peer hung up")
            }),
            None => Err(ChannelError::new(
                ChannelErrorKind::Aborted,
                "loopback channel already closed",
            )),
        };
        Box::pin(async move { sent })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        self.frames = None;
        Box::pin(async {})
    }
}

struct LoopbackSource {
    responses: mpsc::UnboundedReceiver<Response>,
}

impl ChannelSource for LoopbackSource {
    fn receive(&mut self) -> BoxFuture<'_, Option<Result<InboundMessage, ChannelError>>> {
        Box::pin(self.responses.recv())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{config::RecordEncoding, record::EncodedPayload};

    fn request() -> OpenRequest {
        OpenRequest {
            endpoint: "loopback://local".into(),
            table_name: "main.default.events".into(),
            descriptor: None,
            encoding: RecordEncoding::Json,
            headers: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn frames_and_responses_cross_the_loopback() {
        let (connector, mut service) = loopback();
        let mut opened = connector.open(request()).await.expect("open");
        let mut connection = service.accept().await.expect("accept");
        assert_eq!(connection.stream_id(), opened.stream_id);
        assert_eq!(connection.request().table_name, "main.default.events");

        opened
            .sink
            .send(OutboundFrame {
                ack_id: 9,
                payload: EncodedPayload::Json("{}".into()),
            })
            .await
            .expect("send");
        let (frame, offset) = connection.ack_next().await.expect("frame");
        assert_eq!(frame.ack_id, 9);
        assert_eq!(offset, 0);

        assert_eq!(
            opened.source.receive().await,
            Some(Ok(InboundMessage::Ack {
                ack_id: 9,
                offset: 0
            }))
        );

        connection.hang_up();
        assert_eq!(opened.source.receive().await, None);
    }

    #[tokio::test]
    async fn scripted_failures_apply_in_order() {
        let (connector, mut service) = loopback();
        service.fail_next_open(ChannelError::new(ChannelErrorKind::Unavailable, "down"));
        service.resume_next_open(ResumePoint {
            ack_id: 3,
            offset: 30,
        });

        let first = connector.open(request()).await;
        assert!(matches!(first, Err(ref err) if err.kind == ChannelErrorKind::Unavailable));

        let second = connector.open(request()).await.expect("second open");
        assert_eq!(
            second.resume_point,
            Some(ResumePoint {
                ack_id: 3,
                offset: 30
            })
        );
        assert!(service.accept().await.is_some());
        assert_eq!(service.open_attempts(), 2);
    }

    #[tokio::test]
    async fn closed_sink_refuses_frames() {
        let (connector, _service) = loopback();
        let mut opened = connector.open(request()).await.expect("open");
        opened.sink.close().await;
        let err = opened
            .sink
            .send(OutboundFrame {
                ack_id: 1,
                payload: EncodedPayload::Binary(vec![1]),
            })
            .await
            .expect_err("closed sink");
        assert_eq!(err.kind, ChannelErrorKind::Aborted);
    }
}
