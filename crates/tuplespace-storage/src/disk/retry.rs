//! Bounded retry of operations refused by lock contention

use super::{Disk, DiskResult, DiskTxn, TxnMode};
use std::time::Duration;
use tracing::{debug, warn};
use tuplespace_common::config::StorageConfig;

/// How contention is retried
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&StorageConfig::default())
    }
}

impl From<&StorageConfig> for RetryPolicy {
    fn from(config: &StorageConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given (zero based) retry
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails with something other than contention,
/// or the policy runs out of attempts
pub fn retry_on_contention<T>(
    policy: &RetryPolicy,
    what: &str,
    mut op: impl FnMut() -> DiskResult<T>,
) -> DiskResult<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(e) if e.is_contention() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay(attempt);
                debug!("{} hit {}, retrying in {:?}", what, e, delay);
                attempt += 1;
                std::thread::sleep(delay);
            }
            Err(e) if e.is_contention() => {
                warn!("{} still contended after {} attempts", what, attempt + 1);
                return Err(e);
            }
            other => return other,
        }
    }
}

/// Run `f` inside a fresh write transaction and commit it, retrying the whole
/// transaction on contention. A failed attempt's transaction is aborted.
pub fn retrying_update<T>(
    disk: &dyn Disk,
    policy: &RetryPolicy,
    what: &str,
    mut f: impl FnMut(&mut dyn DiskTxn) -> DiskResult<T>,
) -> DiskResult<T> {
    retry_on_contention(policy, what, || {
        let mut txn = disk.begin(TxnMode::Write)?;
        match f(txn.as_mut()) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = txn.abort() {
                    debug!("abort after {} failed: {}", what, abort_err);
                }
                Err(e)
            }
        }
    })
}
