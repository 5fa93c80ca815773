//! Throttled forwarding of byte-level progress to the notification subsystem.
//!
//! A sample is forwarded only when its percentage moved past the last
//! forwarded one *and* at least `min_interval` passed since the last forward.

use std::time::{Duration, Instant};

use upsync_contract::{Notification, ProgressSample, UploadRecord};

use crate::events::EventSink;

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(750);

/// Throttle state for one orchestrator instance. Never shared between batches.
#[derive(Debug)]
pub struct ProgressReporter {
    min_interval: Duration,
    last_percent: Option<u8>,
    last_forwarded_at: Option<Instant>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_INTERVAL)
    }
}

impl ProgressReporter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_percent: None,
            last_forwarded_at: None,
        }
    }

    /// Starts a new percentage ladder; the interval clock keeps running.
    pub fn begin_attempt(&mut self) {
        self.last_percent = None;
    }

    /// Returns the percentage to forward, if this sample passes the throttle.
    pub fn observe(&mut self, sample: &ProgressSample) -> Option<u8> {
        let percent = sample.percent();
        let advanced = self.last_percent.map_or(true, |last| percent > last);
        let due = self.last_forwarded_at.map_or(true, |at| {
            sample.at.saturating_duration_since(at) >= self.min_interval
        });
        if !(advanced && due) {
            return None;
        }

        self.last_percent = Some(percent);
        self.last_forwarded_at = Some(sample.at);
        Some(percent)
    }

    pub fn forward(
        &mut self,
        record: &UploadRecord,
        sample: &ProgressSample,
        events: &dyn EventSink,
    ) -> bool {
        match self.observe(sample) {
            Some(percent) => {
                events.notify(Notification::Progress {
                    record_id: record.id,
                    file_name: sample.file_name.clone(),
                    percent,
                });
                true
            }
            None => false,
        }
    }
}
