use std::sync::Arc;

use tokio::{
    sync::{mpsc, watch},
    time,
};
use tracing::{debug, info, warn};

use crate::{
    config::ReplayPolicy,
    error::{IngestError, IngestResult, TimeoutKind},
    session::{fail_in_flight, InFlight, SessionExit, StreamSession, Submission},
    stream::{Control, StreamCore, StreamState},
};

/// Opens a session, retrying retryable failures up to `attempts` times.
///
/// Each attempt is bounded by the recovery timeout and preceded by the configured backoff.
/// Non-retryable failures (authentication, schema) end the loop immediately.
pub(crate) async fn establish(
    core: &StreamCore,
    attempts: u32,
    incarnation: u64,
) -> IngestResult<StreamSession> {
    let attempt_timeout = core.config.recovery_timeout();
    let mut last_error = None;

    for attempt in 1..=attempts.max(1) {
        let delay = core.config.backoff_before(attempt);
        if !delay.is_zero() {
            debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off before connect");
            time::sleep(delay).await;
        }

        let error = match time::timeout(attempt_timeout, StreamSession::connect(core, incarnation))
            .await
        {
            Ok(Ok(session)) => return Ok(session),
            Ok(Err(err)) => err,
            Err(_) => IngestError::Timeout {
                operation: TimeoutKind::RecoveryAttempt,
                after: attempt_timeout,
            },
        };

        if !error.is_retryable() {
            warn!(attempt, error = %error, "connect failed with a non-retryable error");
            return Err(error);
        }
        warn!(attempt, attempts, error = %error, "connect attempt failed");
        last_error = Some(error);
    }

    Err(last_error.unwrap_or(IngestError::StreamClosed))
}

/// Supervises the active session: runs it, and on failure either rebuilds it from the same
/// ack table or moves the stream to its terminal failed state.
pub(crate) struct RecoveryController {
    core: Arc<StreamCore>,
    queue: mpsc::UnboundedReceiver<Submission>,
    control: watch::Receiver<Control>,
    incarnation: u64,
}

impl RecoveryController {
    pub(crate) fn new(
        core: Arc<StreamCore>,
        queue: mpsc::UnboundedReceiver<Submission>,
        control: watch::Receiver<Control>,
        incarnation: u64,
    ) -> Self {
        Self {
            core,
            queue,
            control,
            incarnation,
        }
    }

    pub(crate) async fn run(mut self, mut session: StreamSession) {
        loop {
            let exit = session
                .run(&self.core, &mut self.queue, &mut self.control)
                .await;
            let carried = session.take_inflight();

            match exit {
                SessionExit::Closed => {
                    debug!(
                        incarnation = session.incarnation(),
                        unanswered = carried.len(),
                        "session shutting down"
                    );
                    session.close(&self.core).await;
                    break;
                }
                SessionExit::Failed(cause) => {
                    session.fail(&self.core, &cause);
                    session.close(&self.core).await;
                    match self.recover(cause, carried).await {
                        Some(next) => session = next,
                        None => break,
                    }
                }
            }
        }

        self.queue.close();
        while self.queue.try_recv().is_ok() {}
    }

    async fn recover(
        &mut self,
        cause: IngestError,
        carried: Vec<InFlight>,
    ) -> Option<StreamSession> {
        let config = &self.core.config;
        if !config.recovery || !cause.is_retryable() {
            self.core.terminate(cause);
            return None;
        }

        self.core.set_state(StreamState::Recovering);
        warn!(
            incarnation = self.incarnation,
            in_flight = carried.len(),
            error = %cause,
            "recovering stream"
        );

        let carried = if config.replay_policy == ReplayPolicy::FailInFlight {
            fail_in_flight(&self.core, carried, &cause);
            Vec::new()
        } else {
            carried
        };

        let next_incarnation = self.incarnation + 1;
        let attempts = config.recovery_retries;
        let established = tokio::select! {
            biased;
            _ = shutdown_requested(&mut self.control) => {
                debug!("shutdown requested during recovery");
                return None;
            }
            established = establish(&self.core, attempts, next_incarnation) => established,
        };

        match established {
            Ok(mut session) => {
                self.incarnation = next_incarnation;
                session.adopt(&self.core, carried, &cause);
                self.core.reopened();
                info!(
                    incarnation = self.incarnation,
                    stream_id = %session.stream_id(),
                    "stream recovered"
                );
                Some(session)
            }
            Err(err) => {
                self.core.terminate(err);
                None
            }
        }
    }
}

async fn shutdown_requested(control: &mut watch::Receiver<Control>) {
    let _ = control.wait_for(|state| *state == Control::Shutdown).await;
}
