#![forbid(unsafe_code)]
//! Async client core for bidirectional streaming ingestion.
//!
//! Records go in through [`IngestStream::ingest`], are validated against the stream's fixed
//! [`RecordEncoding`], admitted under an in-flight limit, and written to a duplex channel opened
//! by a caller-supplied [`channel::ChannelConnector`]. Acknowledgments come back on the same
//! channel and resolve the [`AckHandle`] returned at submission. Transport failures are recovered
//! by reconnecting with bounded retries and backoff while ack ids keep increasing across
//! sessions.
//!
//! ```rust,no_run
//! use ingest_stream::{
//!     channel::loopback, IngestStream, RecordEncoding, StaticHeadersProvider,
//!     StreamConfiguration, TableProperties,
//! };
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (connector, _service) = loopback::loopback();
//! let stream = IngestStream::builder(connector)
//!     .endpoint("https://ingest.example.com")
//!     .table(TableProperties::new("main.default.events"))
//!     .headers_provider(StaticHeadersProvider::bearer("token"))
//!     .config(StreamConfiguration {
//!         record_encoding: RecordEncoding::Json,
//!         ..StreamConfiguration::default()
//!     })
//!     .create()
//!     .await?;
//!
//! let ack = stream.ingest(r#"{"device":"sensor-1","temp":21}"#).await?;
//! let offset = ack.await?;
//! println!("durable at offset {offset}");
//! stream.close().await?;
//! # Ok(()) }
//! ```
//!
//! Surfaces:
//! - [`IngestStream::ingest`] suspends only while `max_inflight_records` records are
//!   unacknowledged; it never waits for the network round trip.
//! - [`AckHandle::wait`] / `handle.await` and [`AckHandle::try_get`] observe the same cached
//!   outcome. [`IngestStream::wait_for_ack`] / [`IngestStream::try_get_ack`] address pending
//!   records by id.
//! - [`IngestStream::flush`] waits for everything pending at call time;
//!   [`IngestStream::close`] stops admission, flushes, and tears the session down.
//!
//! ## Recovery
//! - Retryable failures (resets, timeouts, overload, a service close signal) trigger up to
//!   `recovery_retries` reconnect attempts, each bounded by `recovery_timeout_ms`, with fixed or
//!   exponential backoff. Authentication and schema errors are never retried.
//! - [`ReplayPolicy`] decides what happens to records written to the failed session but never
//!   acknowledged: fail them with a retryable [`IngestError::InFlightLost`] (default), re-send
//!   them under their original ids, or reconcile them with the service's resume point.
//! - When recovery is disabled or exhausted the stream fails permanently: pending records fail
//!   and every later `ingest` returns [`IngestError::PermanentlyFailed`] without network activity.
//!
//! ## Binding layers
//! [`HandleRegistry`] maps opaque tokens to live streams or handles for FFI callers that cannot
//! hold Rust references. Dropping a stream without `close()` fails its pending records as a
//! backstop; explicit close is the supported contract.

mod ack;
mod builder;
pub mod channel;
mod config;
mod defaults;
mod error;
mod headers;
mod limiter;
mod record;
mod recovery;
mod registry;
mod session;
mod stream;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use ack::{AckHandle, AckId, AckOutcome, AckTable, Offset};
pub use builder::{create_stream, IngestStreamBuilder};
pub use config::{
    BackoffStrategy, RecordEncoding, ReplayPolicy, StreamConfiguration, TableProperties,
};
pub use defaults::TABLE_NAME_HEADER;
pub use error::{
    ChannelError, ChannelErrorKind, ConfigError, ErrorCategory, HeadersError, IngestError,
    IngestResult, TimeoutKind,
};
pub use headers::{FnHeadersProvider, Headers, HeadersProvider, StaticHeadersProvider};
pub use limiter::{InflightLimiter, InflightPermit};
pub use record::{EncodedPayload, Record, RecordEncoder};
pub use registry::{HandleRegistry, HandleToken};
pub use session::SessionState;
pub use stream::{IngestStream, StreamState};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
