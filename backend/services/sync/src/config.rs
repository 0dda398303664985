use std::time::Duration;

use shopmirror_common::error::{MirrorError, MirrorResult};
use shopmirror_config::env::parse_var_or;

use crate::retry::RetryPolicy;

/// Largest page the Admin API will return.
pub const MAX_PAGE_SIZE: u32 = 250;
pub const DEFAULT_PAGE_DELAY_MS: u64 = 333;
pub const DEFAULT_LIVENESS_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CANCEL_TIMEOUT_MS: u64 = 7_800;

/// Engine tunables. The timeouts bound coordination latency only and do not
/// scale with the amount of data being synced.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub page_size: u32,
    /// Pause between pages to stay under the upstream rate limit.
    pub page_delay: Duration,
    /// How long to wait for a pong before presuming a running run dead.
    pub liveness_timeout: Duration,
    /// How long to wait for a cancelled run to end.
    pub cancel_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            page_delay: Duration::from_millis(DEFAULT_PAGE_DELAY_MS),
            liveness_timeout: Duration::from_millis(DEFAULT_LIVENESS_TIMEOUT_MS),
            cancel_timeout: Duration::from_millis(DEFAULT_CANCEL_TIMEOUT_MS),
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncSettings {
    /// Read `SYNC_*` overrides from the environment on top of the defaults.
    pub fn from_env() -> MirrorResult<Self> {
        let defaults = Self::default();

        let page_size = parse_var_or("SYNC_PAGE_SIZE", defaults.page_size)?;
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(MirrorError::Config(format!(
                "SYNC_PAGE_SIZE must be between 1 and {MAX_PAGE_SIZE}, got {page_size}"
            )));
        }

        let mut retry = defaults.retry;
        retry.max_retries = parse_var_or("SYNC_MAX_RETRIES", retry.max_retries)?;

        Ok(Self {
            page_size,
            page_delay: Duration::from_millis(parse_var_or(
                "SYNC_PAGE_DELAY_MS",
                DEFAULT_PAGE_DELAY_MS,
            )?),
            liveness_timeout: Duration::from_millis(parse_var_or(
                "SYNC_LIVENESS_TIMEOUT_MS",
                DEFAULT_LIVENESS_TIMEOUT_MS,
            )?),
            cancel_timeout: Duration::from_millis(parse_var_or(
                "SYNC_CANCEL_TIMEOUT_MS",
                DEFAULT_CANCEL_TIMEOUT_MS,
            )?),
            retry,
        })
    }
}
