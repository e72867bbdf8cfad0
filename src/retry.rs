//! Bounded retry around session-opening transport calls.

use std::thread;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::tpm::TransportError;

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// attempt budget of `policy` is spent. Only "resources unavailable" replies
/// are retried; every other error is returned as is on first sight.
pub fn call_with_retry<R, F>(
    policy: &RetryPolicy,
    what: &'static str,
    mut op: F,
) -> Result<R, TransportError>
where
    F: FnMut() -> Result<R, TransportError>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => {
                if attempt > 1 {
                    debug!(call = what, attempt, "transport call succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt < max_attempts => {
                debug!(
                    call = what,
                    attempt,
                    max_attempts,
                    delay_ms = policy.delay.as_millis() as u64,
                    "TPM resources unavailable, retrying"
                );
                thread::sleep(policy.delay);
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    warn!(call = what, attempts = attempt, "giving up, TPM resources still unavailable");
                }
                return Err(e);
            }
        }
    }
}
