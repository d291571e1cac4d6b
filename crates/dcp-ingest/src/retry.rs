//! Backoff for transient database aborts
//!
//! Deadlock and serialization failures are retried without bound; the sleep
//! between attempts is randomized and grows exponentially to a cap so that
//! competing writers de-synchronize instead of starving each other.

use rand::Rng;
use std::time::Duration;

const BASE_MS: u64 = 50;
const MAX_SHIFT: u32 = 5;

/// Sleep before retry number `attempt` (0-based) of a transient failure.
pub(crate) async fn transient_backoff(attempt: u32) {
    let ceiling = BASE_MS << attempt.min(MAX_SHIFT);
    let jitter = rand::rng().random_range(0..ceiling);
    tokio::time::sleep(Duration::from_millis(ceiling + jitter)).await;
}
