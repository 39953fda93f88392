//! Long-lived websocket consumers for market quotes and account trade
//! updates. Both reconnect forever with full-jitter exponential backoff
//! and re-run their subscription handshake after every reconnect.

pub mod quotes;
pub mod trade_updates;

use rand::Rng;
use tokio::time::Duration;

const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_CAP_MS: u64 = 30_000;

/// Reads idle longer than this force a reconnect.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Full-jitter backoff: uniform in [0, min(cap, base * 2^attempt)].
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(16));
    let ceiling = exp.min(BACKOFF_CAP_MS);
    let ms = rand::thread_rng().gen_range(0..=ceiling);
    Duration::from_millis(ms)
}
