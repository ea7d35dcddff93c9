//! Cooldown and batch arithmetic
//!
//! Pure functions, tested without a store.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Time left before another sync is allowed
///
/// `None` when the cooldown has elapsed or the user never synced.
pub fn cooldown_remaining(
    last_sync_at: Option<DateTime<Utc>>,
    cooldown_secs: u64,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let last = last_sync_at?;
    let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
    let cooldown = Duration::from_secs(cooldown_secs);
    if elapsed >= cooldown {
        None
    } else {
        Some(cooldown - elapsed)
    }
}

/// Number of detail batches needed for `total` stubs
pub fn batches_for(total: u64, batch_size: usize) -> u64 {
    let batch_size = batch_size.max(1) as u64;
    total.div_ceil(batch_size)
}
