pub(crate) const DEFAULT_MAX_INFLIGHT_RECORDS: usize = 1_000_000;
pub(crate) const DEFAULT_RECOVERY: bool = true;
pub(crate) const DEFAULT_RECOVERY_TIMEOUT_MS: u64 = 15_000;
pub(crate) const DEFAULT_RECOVERY_BACKOFF_MS: u64 = 2_000;
pub(crate) const DEFAULT_RECOVERY_RETRIES: u32 = 4;
pub(crate) const DEFAULT_SERVER_ACK_TIMEOUT_MS: u64 = 60_000;
pub(crate) const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 300_000;

/// Header carrying the target table, added to the handshake when the provider omits it.
pub const TABLE_NAME_HEADER: &str = "x-ingest-table-name";
