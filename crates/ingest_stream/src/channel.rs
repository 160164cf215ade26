//! Boundary to the duplex transport carrying records to the ingestion service.
//!
//! The core never encodes the protocol envelope itself. A [`ChannelConnector`] opens one channel
//! per session and splits it into a [`ChannelSink`] (driven by the session's send path) and a
//! [`ChannelSource`] (driven by its receive loop). [`loopback`] provides an in-process
//! implementation whose service end is scripted by the caller.

use std::{collections::BTreeMap, future::Future, pin::Pin};

use crate::{
    ack::{AckId, Offset},
    config::RecordEncoding,
    error::ChannelError,
    record::EncodedPayload,
};

pub mod loopback;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handshake parameters for one session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenRequest {
    pub endpoint: String,
    pub table_name: String,
    /// Present for binary streams only.
    pub descriptor: Option<Vec<u8>>,
    pub encoding: RecordEncoding,
    pub headers: BTreeMap<String, String>,
}

/// Last record the service reports as durable when a session opens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResumePoint {
    pub ack_id: AckId,
    pub offset: Offset,
}

/// One record on the wire, tagged with the id its response will carry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundFrame {
    pub ack_id: AckId,
    pub payload: EncodedPayload,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundMessage {
    /// The record was durably accepted at `offset`.
    Ack { ack_id: AckId, offset: Offset },
    /// The record was refused; the session itself stays usable.
    Rejected { ack_id: AckId, error: ChannelError },
    /// The service is about to close the stream.
    CloseSignal { reason: Option<String> },
}

pub struct OpenedChannel {
    pub stream_id: String,
    pub resume_point: Option<ResumePoint>,
    pub sink: Box<dyn ChannelSink>,
    pub source: Box<dyn ChannelSource>,
}

pub trait ChannelConnector: Send + Sync + 'static {
    fn open(&self, request: OpenRequest) -> BoxFuture<'_, Result<OpenedChannel, ChannelError>>;
}

pub trait ChannelSink: Send {
    fn send(&mut self, frame: OutboundFrame) -> BoxFuture<'_, Result<(), ChannelError>>;

    fn close(&mut self) -> BoxFuture<'_, ()>;
}

pub trait ChannelSource: Send {
    /// Next inbound message; `None` once the service closed the channel.
    ///
    /// Must be cancel-safe: the receive loop drops pending calls when its ack timer fires.
    fn receive(&mut self) -> BoxFuture<'_, Option<Result<InboundMessage, ChannelError>>>;
}
