use std::{fmt, fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::{
    defaults::{
        DEFAULT_FLUSH_TIMEOUT_MS, DEFAULT_MAX_INFLIGHT_RECORDS, DEFAULT_RECOVERY,
        DEFAULT_RECOVERY_BACKOFF_MS, DEFAULT_RECOVERY_RETRIES, DEFAULT_RECOVERY_TIMEOUT_MS,
        DEFAULT_SERVER_ACK_TIMEOUT_MS,
    },
    error::{ConfigError, IngestError, IngestResult},
};

/// How records on a stream are encoded. Fixed for the lifetime of the stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordEncoding {
    /// Records are pre-serialized against the table's schema descriptor.
    #[default]
    Binary,
    /// Records are JSON text decoded into rows by the service.
    Json,
}

impl fmt::Display for RecordEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordEncoding::Binary => "binary",
            RecordEncoding::Json => "json",
        })
    }
}

/// What happens to records that were written to a session which then failed before
/// acknowledging them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPolicy {
    /// Fail them with a retryable [`IngestError::InFlightLost`] and let the caller resubmit.
    #[default]
    FailInFlight,
    /// Re-send them on the next session under their original ack ids (at-least-once).
    ResendInFlight,
    /// Resolve the ones covered by the next session's resume point; fail the rest.
    ResumeFromCheckpoint,
}

/// Delay between consecutive reconnect attempts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Fixed,
    Exponential { max_backoff_ms: u64 },
}

/// Immutable settings fixed at stream creation.
///
/// Deserializes from TOML with every field optional:
///
/// ```toml
/// max_inflight_records = 10000
/// recovery_retries = 6
/// record_encoding = "json"
/// replay_policy = "resend_in_flight"
/// backoff = { kind = "exponential", max_backoff_ms = 30000 }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfiguration {
    pub max_inflight_records: usize,
    pub recovery: bool,
    pub recovery_timeout_ms: u64,
    pub recovery_backoff_ms: u64,
    pub recovery_retries: u32,
    pub server_ack_timeout_ms: u64,
    pub flush_timeout_ms: u64,
    pub record_encoding: RecordEncoding,
    pub replay_policy: ReplayPolicy,
    pub backoff: BackoffStrategy,
}

impl Default for StreamConfiguration {
    fn default() -> Self {
        Self {
            max_inflight_records: DEFAULT_MAX_INFLIGHT_RECORDS,
            recovery: DEFAULT_RECOVERY,
            recovery_timeout_ms: DEFAULT_RECOVERY_TIMEOUT_MS,
            recovery_backoff_ms: DEFAULT_RECOVERY_BACKOFF_MS,
            recovery_retries: DEFAULT_RECOVERY_RETRIES,
            server_ack_timeout_ms: DEFAULT_SERVER_ACK_TIMEOUT_MS,
            flush_timeout_ms: DEFAULT_FLUSH_TIMEOUT_MS,
            record_encoding: RecordEncoding::default(),
            replay_policy: ReplayPolicy::default(),
            backoff: BackoffStrategy::default(),
        }
    }
}

impl StreamConfiguration {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(ConfigError::Decode)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_inflight_records == 0 {
            return Err(ConfigError::Invalid {
                field: "max_inflight_records",
                reason: "must be at least 1".into(),
            });
        }
        if self.max_inflight_records > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid {
                field: "max_inflight_records",
                reason: format!("must not exceed {}", Semaphore::MAX_PERMITS),
            });
        }
        if self.flush_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "flush_timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.server_ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "server_ack_timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.recovery_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "recovery_timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.recovery && self.recovery_retries == 0 {
            return Err(ConfigError::Invalid {
                field: "recovery_retries",
                reason: "must be at least 1 when recovery is enabled".into(),
            });
        }
        Ok(())
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn server_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.server_ack_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Delay before the given 1-based connect attempt. The first attempt never waits.
    pub fn backoff_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let millis = match self.backoff {
            BackoffStrategy::Fixed => self.recovery_backoff_ms,
            BackoffStrategy::Exponential { max_backoff_ms } => {
                let factor = 1u64.checked_shl(attempt - 2).unwrap_or(u64::MAX);
                self.recovery_backoff_ms
                    .saturating_mul(factor)
                    .min(max_backoff_ms.max(self.recovery_backoff_ms))
            }
        };
        Duration::from_millis(millis)
    }

    /// Connect attempts allowed when the stream is first created.
    pub(crate) fn creation_attempts(&self) -> u32 {
        if self.recovery {
            self.recovery_retries.saturating_add(1)
        } else {
            1
        }
    }
}

/// Target table identity plus the schema descriptor binary records were encoded against.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProperties {
    pub table_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<Vec<u8>>,
}

impl TableProperties {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            descriptor: None,
        }
    }

    pub fn descriptor(mut self, descriptor: impl Into<Vec<u8>>) -> Self {
        self.descriptor = Some(descriptor.into());
        self
    }

    pub(crate) fn validate(&self, encoding: RecordEncoding) -> IngestResult<()> {
        if self.table_name.trim().is_empty() {
            return Err(IngestError::EmptyTableName);
        }
        if encoding == RecordEncoding::Binary && self.descriptor.is_none() {
            return Err(IngestError::MissingDescriptor);
        }
        Ok(())
    }
}
