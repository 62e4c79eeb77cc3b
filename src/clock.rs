//! Monotonic time source for the control loop

use chrono::{DateTime, Utc};
use std::time::Instant;

/// Monotonic millisecond clock anchored at construction time.
///
/// All control-loop timing (tick deadlines, feedback arrival timestamps,
/// jog and trajectory start times) is expressed in milliseconds since this
/// clock's origin, so comparisons never go backwards with wall-clock jumps.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Milliseconds elapsed since this clock was created.
    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Current UTC wall-clock time, used only in telemetry headers.
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}
