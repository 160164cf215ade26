mod support;

use std::time::Duration;

use ingest_stream::{
    channel::loopback::loopback, ChannelError, ChannelErrorKind, EncodedPayload, ErrorCategory,
    IngestError, IngestStream, Record, RecordEncoding, SessionState, StaticHeadersProvider,
    StreamConfiguration, StreamState, TableProperties, TimeoutKind, TABLE_NAME_HEADER,
};
use serde_json::json;
use support::*;

#[tokio::test]
async fn acknowledgments_resolve_in_submission_order() {
    let (stream, _service, mut connection) = open_stream(json_config()).await;

    let mut handles = Vec::new();
    for n in 0..10 {
        handles.push(stream.ingest(record(n)).await.expect("ingest"));
    }
    for pair in handles.windows(2) {
        assert!(pair[0].id() < pair[1].id());
    }
    assert!(handles.iter().all(|handle| handle.try_get().is_none()));

    for (k, handle) in handles.iter().enumerate() {
        let (frame, offset) = within(connection.ack_next()).await.expect("frame");
        assert_eq!(frame.ack_id, handle.id());
        assert_eq!(within(handle.wait()).await.expect("resolved"), offset);
        if let Some(next) = handles.get(k + 1) {
            assert!(next.try_get().is_none(), "record {} resolved early", k + 1);
        }
    }
    assert_eq!(stream.pending_count(), 0);
    assert_eq!(stream.permits_in_use(), 0);
}

#[tokio::test]
async fn awaiting_twice_returns_the_cached_outcome() {
    let (stream, _service, mut connection) = open_stream(json_config()).await;

    let handle = stream.ingest(record(1)).await.expect("ingest");
    assert!(handle.try_get().is_none());

    within(connection.ack_next()).await.expect("frame");
    let first = within(handle.wait()).await.expect("first wait");
    let second = within(handle.wait()).await.expect("second wait");
    assert_eq!(first, second);
    assert!(first >= 0);
    assert_eq!(handle.try_get().expect("ready").expect("resolved"), first);
    let awaited = handle.clone();
    assert_eq!(within(async move { awaited.await }).await.expect("await handle"), first);
}

#[tokio::test]
async fn pending_record_is_addressable_by_id() {
    let (stream, _service, mut connection) = open_stream(json_config()).await;

    let handle = stream.ingest(record(1)).await.expect("ingest");
    assert!(stream.try_get_ack(handle.id()).is_none());

    let (outcome, acked) = within(async {
        tokio::join!(stream.wait_for_ack(handle.id()), connection.ack_next())
    })
    .await;
    let (_, offset) = acked.expect("frame");
    assert_eq!(outcome.expect("resolved by id"), offset);

    assert!(matches!(
        stream.try_get_ack(handle.id()),
        Some(Err(IngestError::UnknownAck(id))) if id == handle.id()
    ));
    assert!(matches!(
        stream.wait_for_ack(handle.id() + 100).await,
        Err(IngestError::UnknownAck(_))
    ));
}

#[tokio::test]
async fn rejected_record_carries_channel_error_and_retryability() {
    let (stream, _service, mut connection) = open_stream(json_config()).await;

    let refused = stream.ingest(record(1)).await.expect("ingest");
    let accepted = stream.ingest(record(2)).await.expect("ingest");

    let frame = within(connection.next_frame()).await.expect("frame");
    connection.reject(
        frame.ack_id,
        ChannelError::new(ChannelErrorKind::InvalidArgument, "column `temp` missing"),
    );
    let err = within(refused.wait()).await.expect_err("rejected");
    assert!(!err.is_retryable());
    assert_eq!(err.category(), ErrorCategory::Schema);
    assert!(matches!(
        err,
        IngestError::Channel(ChannelError {
            kind: ChannelErrorKind::InvalidArgument,
            ..
        })
    ));

    let frame = within(connection.next_frame()).await.expect("frame");
    connection.reject(
        frame.ack_id,
        ChannelError::new(ChannelErrorKind::Overloaded, "slow down"),
    );
    let err = within(accepted.wait()).await.expect_err("rejected");
    assert!(err.is_retryable());

    assert_eq!(stream.state(), StreamState::Open);
    assert_eq!(stream.permits_in_use(), 0);
}

#[tokio::test]
async fn validation_errors_surface_synchronously() {
    let (stream, _service, _connection) = open_stream(json_config()).await;

    let err = stream.ingest(r#"{"seq": "#).await.expect_err("malformed");
    assert!(matches!(err, IngestError::MalformedJson(_)));
    assert_eq!(err.category(), ErrorCategory::Validation);

    let err = stream
        .ingest(Record::Binary(vec![10, 2, 8, 1]))
        .await
        .expect_err("wrong kind");
    assert!(matches!(
        err,
        IngestError::EncodingMismatch {
            expected: RecordEncoding::Json,
            actual: RecordEncoding::Binary
        }
    ));

    let err = stream.ingest("").await.expect_err("empty");
    assert!(matches!(err, IngestError::EmptyRecord));

    assert_eq!(stream.pending_count(), 0);
    assert_eq!(stream.permits_in_use(), 0);
}

#[tokio::test]
async fn handshake_carries_table_descriptor_and_headers() {
    let (connector, mut service) = loopback();
    let stream = IngestStream::builder(connector)
        .endpoint("loopback://ingest")
        .table(TableProperties::new("main.default.readings").descriptor(vec![0x0a, 0x03]))
        .headers_provider(StaticHeadersProvider::bearer("secret"))
        .config(StreamConfiguration {
            record_encoding: RecordEncoding::Binary,
            ..json_config()
        })
        .create()
        .await
        .expect("create");
    let mut connection = within(service.accept()).await.expect("session");

    let request = connection.request();
    assert_eq!(request.endpoint, "loopback://ingest");
    assert_eq!(request.table_name, "main.default.readings");
    assert_eq!(request.descriptor.as_deref(), Some(&[0x0a, 0x03][..]));
    assert_eq!(request.encoding, RecordEncoding::Binary);
    assert_eq!(
        request.headers.get("authorization").map(String::as_str),
        Some("Bearer secret")
    );
    assert_eq!(
        request.headers.get(TABLE_NAME_HEADER).map(String::as_str),
        Some("main.default.readings")
    );
    assert_eq!(stream.stream_id().as_deref(), Some(connection.stream_id()));
    assert_eq!(stream.session_state(), SessionState::Open);

    let handle = stream.ingest(vec![8u8, 1]).await.expect("ingest binary");
    let (frame, _) = within(connection.ack_next()).await.expect("frame");
    assert_eq!(frame.payload, EncodedPayload::Binary(vec![8, 1]));
    within(handle.wait()).await.expect("resolved");
}

#[tokio::test]
async fn json_streams_omit_the_descriptor() {
    let (connector, mut service) = loopback();
    let _stream = IngestStream::builder(connector)
        .table(TableProperties::new("main.default.events").descriptor(vec![1, 2]))
        .config(json_config())
        .create()
        .await
        .expect("create");
    let connection = within(service.accept()).await.expect("session");
    assert!(connection.request().descriptor.is_none());
}

#[tokio::test]
async fn creation_rejects_invalid_settings_before_connecting() {
    let (connector, service) = loopback();
    let err = IngestStream::builder(connector.clone())
        .table(TableProperties::new("main.default.events"))
        .config(StreamConfiguration {
            record_encoding: RecordEncoding::Binary,
            ..json_config()
        })
        .create()
        .await
        .err()
        .expect("missing descriptor");
    assert!(matches!(err, IngestError::MissingDescriptor));

    let err = IngestStream::builder(connector.clone())
        .config(json_config())
        .create()
        .await
        .err()
        .expect("missing table");
    assert!(matches!(err, IngestError::EmptyTableName));

    let err = IngestStream::builder(connector)
        .table(TableProperties::new("main.default.events"))
        .config(StreamConfiguration {
            max_inflight_records: 0,
            ..json_config()
        })
        .create()
        .await
        .err()
        .expect("zero inflight");
    assert!(matches!(err, IngestError::InvalidConfig(_)));

    assert_eq!(service.open_attempts(), 0);
}

#[tokio::test]
async fn close_waits_for_pending_records_and_is_idempotent() {
    let (stream, _service, mut connection) = open_stream(json_config()).await;
    let stream = std::sync::Arc::new(stream);

    let mut handles = Vec::new();
    for n in 0..5 {
        handles.push(stream.ingest(record(n)).await.expect("ingest"));
    }

    let closing = {
        let stream = stream.clone();
        tokio::spawn(async move { stream.close().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!closing.is_finished(), "close must wait for pending acks");
    assert_eq!(stream.state(), StreamState::Draining);
    assert_eq!(stream.session_state(), SessionState::Draining);

    let err = stream.ingest(record(99)).await.expect_err("draining");
    assert!(matches!(err, IngestError::StreamClosed));

    for _ in 0..5 {
        within(connection.ack_next()).await.expect("frame");
    }
    within(closing)
        .await
        .expect("join")
        .expect("close succeeds");

    for handle in &handles {
        assert!(handle.try_get().expect("settled").is_ok());
    }
    assert_eq!(stream.state(), StreamState::Closed);
    assert_eq!(stream.session_state(), SessionState::Closed);
    assert!(within(connection.next_frame()).await.is_none());

    stream.close().await.expect("second close is a no-op");
    assert!(matches!(
        stream.flush().await,
        Err(IngestError::StreamClosed)
    ));
}

#[tokio::test]
async fn flush_reports_timeout_and_close_fails_leftovers() {
    let config = StreamConfiguration {
        flush_timeout_ms: 100,
        ..json_config()
    };
    let (stream, _service, mut connection) = open_stream(config).await;

    let handle = stream.ingest(record(1)).await.expect("ingest");
    within(connection.next_frame()).await.expect("frame");

    let err = stream.flush().await.expect_err("no ack arrives");
    assert!(matches!(
        err,
        IngestError::Timeout {
            operation: TimeoutKind::Flush,
            ..
        }
    ));
    assert!(err.is_retryable());
    assert!(handle.try_get().is_none(), "flush timeout must not fail records");

    let err = stream.close().await.expect_err("close reports flush timeout");
    assert!(err.is_timeout());
    assert!(matches!(
        within(handle.wait()).await,
        Err(IngestError::StreamClosed)
    ));
    assert_eq!(stream.permits_in_use(), 0);
}

#[tokio::test]
async fn flush_only_waits_for_records_pending_at_call_time() {
    let (stream, _service, mut connection) = open_stream(json_config()).await;
    let stream = std::sync::Arc::new(stream);

    let first = stream.ingest(record(1)).await.expect("ingest");
    let flushing = {
        let stream = stream.clone();
        tokio::spawn(async move { stream.flush().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let late = stream.ingest(record(2)).await.expect("ingest late");
    within(connection.ack_next()).await.expect("first frame");
    within(flushing)
        .await
        .expect("join")
        .expect("flush completes");
    assert!(first.is_ready());
    assert!(!late.is_ready());

    within(connection.ack_next()).await.expect("late frame");
    within(late.wait()).await.expect("late resolved");
}

#[tokio::test]
async fn dropping_without_close_fails_pending_records() {
    let (stream, _service, mut connection) = open_stream(json_config()).await;
    let handle = stream.ingest(record(1)).await.expect("ingest");
    within(connection.next_frame()).await.expect("frame");

    drop(stream);
    assert!(matches!(
        within(handle.wait()).await,
        Err(IngestError::StreamClosed)
    ));
    assert!(within(connection.next_frame()).await.is_none());
}

#[tokio::test]
async fn json_values_are_accepted_as_records() {
    let (stream, _service, mut connection) = open_stream(json_config()).await;
    let handle = stream
        .ingest(json!({"seq": 7, "tags": ["a", "b"]}))
        .await
        .expect("ingest value");
    let (frame, _) = within(connection.ack_next()).await.expect("frame");
    match frame.payload {
        EncodedPayload::Json(text) => {
            let parsed: serde_json::Value = serde_json::from_str(&text).expect("json payload");
            assert_eq!(parsed["seq"], 7);
        }
        other => panic!("expected json payload, got {other:?}"),
    }
    within(handle.wait()).await.expect("resolved");
}
