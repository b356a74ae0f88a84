//! Per-run transmission statistics.

use std::time::Instant;

/// Counters and timing for one session run.
///
/// The transmit task owns every field except `stopped_by_goose` and
/// `goose_stop_reason`, which the listener sets just before clearing the
/// running flag.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub packets_sent: u64,
    pub packets_failed: u64,
    pub start_time: Option<Instant>,
    pub end_time: Option<Instant>,
    pub stopped_by_goose: bool,
    pub goose_stop_reason: String,
}

impl SessionStats {
    /// Seconds between start and end, or start and now while running.
    pub fn elapsed_seconds(&self) -> f64 {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => end.duration_since(start).as_secs_f64(),
            (Some(start), None) => start.elapsed().as_secs_f64(),
            _ => 0.0,
        }
    }

    pub fn average_rate(&self) -> f64 {
        let elapsed = self.elapsed_seconds();
        if elapsed > 0.0 {
            self.packets_sent as f64 / elapsed
        } else {
            0.0
        }
    }
}
