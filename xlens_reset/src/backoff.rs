//! Delays between retention lease checks

use std::time::Duration;

/// Accelerating delay steps in seconds; the last one repeats once the table runs out
const STEPS_SECS: [u64; 11] = [10, 15, 30, 45, 60, 90, 135, 200, 300, 450, 720];

/// Longest wait for one table's retention leases; larger budgets are clamped to it
pub const MAX_WAIT_LIMIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Delays to sleep between lease checks, for a total wait of at most `max_wait`
///
/// The sequence is non-decreasing and starts at 10s. A remainder shorter than the previous step
/// is dropped rather than appended. A `max_wait` under 10s yields that single delay.
pub fn backoff_delays(max_wait: Duration) -> Vec<Duration> {
    let max_wait = max_wait.min(MAX_WAIT_LIMIT).as_secs();
    if max_wait < STEPS_SECS[0] {
        return vec![Duration::from_secs(max_wait)];
    }

    let last_step = STEPS_SECS[STEPS_SECS.len() - 1];
    let mut steps = STEPS_SECS
        .iter()
        .copied()
        .chain(std::iter::repeat(last_step));

    let mut delays = vec![];
    let mut total = 0;
    let mut previous = STEPS_SECS[0];
    loop {
        let step = steps.next().unwrap_or(last_step);
        if total + step > max_wait {
            let remainder = max_wait - total;
            if remainder >= previous {
                delays.push(remainder);
            }
            break;
        }
        delays.push(step);
        total += step;
        previous = step;
    }

    delays.into_iter().map(Duration::from_secs).collect()
}
