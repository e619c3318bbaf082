use chrono::Utc;
use tokio::time::Instant;

use charforge_core::types::Timestamp;

/// Wall-clock timestamps that advance with the tokio timer.
///
/// Anchored to the wall clock once at creation; later readings add the
/// monotonic time elapsed since. Persisted retry times and the tokio
/// sleeps that wait for them therefore agree, including under a paused
/// test runtime.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    wall: Timestamp,
    mono: Instant,
}

impl Clock {
    pub fn start() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    pub fn now(&self) -> Timestamp {
        let elapsed = chrono::Duration::from_std(self.mono.elapsed()).unwrap_or_default();
        self.wall + elapsed
    }
}
