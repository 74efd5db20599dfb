pub mod artifacts;
pub mod domain;
pub mod estimate;
pub mod janitor;
pub mod media;
pub mod progress;
pub mod queue;
pub mod session;
pub mod settings;
pub mod speech;
pub mod store;
pub mod upload;
pub mod worker;

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch. Heartbeats, processing markers and progress
/// math all use this clock.
pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
