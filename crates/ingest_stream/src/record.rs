use serde::{de::IgnoredAny, Serialize};

use crate::{
    config::RecordEncoding,
    error::{IngestError, IngestResult},
};

/// One application record submitted for ingestion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    /// Bytes already encoded against the table's registered schema.
    Binary(Vec<u8>),
    /// JSON text; the service decodes it into a row.
    Json(String),
}

impl Record {
    /// Serializes `value` into a JSON record.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_string(value).map(Record::Json)
    }

    pub fn encoding(&self) -> RecordEncoding {
        match self {
            Record::Binary(_) => RecordEncoding::Binary,
            Record::Json(_) => RecordEncoding::Json,
        }
    }
}

impl From<Vec<u8>> for Record {
    fn from(bytes: Vec<u8>) -> Self {
        Record::Binary(bytes)
    }
}

impl From<&[u8]> for Record {
    fn from(bytes: &[u8]) -> Self {
        Record::Binary(bytes.to_vec())
    }
}

impl From<String> for Record {
    fn from(text: String) -> Self {
        Record::Json(text)
    }
}

impl From<&str> for Record {
    fn from(text: &str) -> Self {
        Record::Json(text.to_string())
    }
}

impl From<serde_json::Value> for Record {
    fn from(value: serde_json::Value) -> Self {
        Record::Json(value.to_string())
    }
}

/// Wire variant handed to the channel. The variant tells the service which decoder to apply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EncodedPayload {
    Binary(Vec<u8>),
    Json(String),
}

impl EncodedPayload {
    pub fn len(&self) -> usize {
        match self {
            EncodedPayload::Binary(bytes) => bytes.len(),
            EncodedPayload::Json(text) => text.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Validates records against the stream's fixed encoding before they are admitted.
#[derive(Clone, Copy, Debug)]
pub struct RecordEncoder {
    mode: RecordEncoding,
}

impl RecordEncoder {
    pub fn new(mode: RecordEncoding) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> RecordEncoding {
        self.mode
    }

    pub fn encode(&self, record: Record) -> IngestResult<EncodedPayload> {
        let actual = record.encoding();
        if actual != self.mode {
            return Err(IngestError::EncodingMismatch {
                expected: self.mode,
                actual,
            });
        }

        match record {
            Record::Binary(bytes) => {
                if bytes.is_empty() {
                    return Err(IngestError::EmptyRecord);
                }
                Ok(EncodedPayload::Binary(bytes))
            }
            Record::Json(text) => {
                if text.trim().is_empty() {
                    return Err(IngestError::EmptyRecord);
                }
                serde_json::from_str::<IgnoredAny>(&text)
                    .map_err(|err| IngestError::MalformedJson(err.to_string()))?;
                Ok(EncodedPayload::Json(text))
            }
        }
    }
}
