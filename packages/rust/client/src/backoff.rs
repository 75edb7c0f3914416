//! Jittered linear backoff between attempts of a single request.

use std::time::Duration;

use rand::Rng;

/// Delay before retrying after failed attempt number `attempt` (1-based).
///
/// Attempt 1 waits a random duration in `[0, interval)`, attempt 2 in
/// `[interval, 2 * interval)` and so on. A zero interval disables waiting.
pub fn retry_delay(interval: Duration, attempt: u32) -> Duration {
    let interval_ms = interval.as_millis() as u64;
    if interval_ms == 0 {
        return Duration::ZERO;
    }

    let attempt = u64::from(attempt.max(1));
    let low = interval_ms.saturating_mul(attempt - 1);
    let high = interval_ms.saturating_mul(attempt);
    if low >= high {
        // Both bounds saturated.
        return Duration::from_millis(low);
    }

    Duration::from_millis(rand::thread_rng().gen_range(low..high))
}
