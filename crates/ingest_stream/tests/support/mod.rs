#![allow(dead_code)]

use std::{future::Future, time::Duration};

use ingest_stream::{
    channel::loopback::{loopback, LoopbackConnection, LoopbackService},
    IngestStream, RecordEncoding, StaticHeadersProvider, StreamConfiguration, StreamState,
    TableProperties,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("operation finished in time")
}

/// JSON stream with fast timers and recovery disabled unless a test opts in.
pub fn json_config() -> StreamConfiguration {
    StreamConfiguration {
        max_inflight_records: 100,
        recovery: false,
        recovery_timeout_ms: 1_000,
        recovery_backoff_ms: 10,
        recovery_retries: 2,
        server_ack_timeout_ms: 10_000,
        flush_timeout_ms: 2_000,
        record_encoding: RecordEncoding::Json,
        ..StreamConfiguration::default()
    }
}

pub fn record(n: usize) -> String {
    format!(r#"{{"seq":{n},"device":"sensor-1"}}"#)
}

pub async fn open_stream(
    config: StreamConfiguration,
) -> (IngestStream, LoopbackService, LoopbackConnection) {
    let (connector, mut service) = loopback();
    let stream = IngestStream::builder(connector)
        .endpoint("loopback://ingest")
        .table(TableProperties::new("main.default.events"))
        .headers_provider(StaticHeadersProvider::bearer("test-token"))
        .config(config)
        .create()
        .await
        .expect("create stream");
    let connection = within(service.accept()).await.expect("first session");
    (stream, service, connection)
}

pub async fn wait_for_state(stream: &IngestStream, expected: StreamState) {
    let mut states = stream.state_changes();
    within(states.wait_for(|state| *state == expected))
        .await
        .expect("state sender alive");
}
