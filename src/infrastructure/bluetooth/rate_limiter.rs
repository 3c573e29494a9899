//! Write admission for the control characteristic.

use crate::domain::models::CommandPayload;
use std::time::Duration;
use tokio::time::Instant;

/// 10 Hz ceiling for repeats of an unchanged payload.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Admits a payload immediately when it differs from the last admitted one,
/// otherwise only once `min_interval` has passed since that admission.
///
/// Not synchronized; the session task is its only caller.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last: Option<(CommandPayload, Instant)>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL)
    }
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    pub fn should_send(&mut self, payload: &CommandPayload) -> bool {
        self.should_send_at(payload, Instant::now())
    }

    pub fn should_send_at(&mut self, payload: &CommandPayload, now: Instant) -> bool {
        let admit = match &self.last {
            None => true,
            Some((last_payload, last_time)) => {
                last_payload != payload
                    || now.saturating_duration_since(*last_time) >= self.min_interval
            }
        };
        if admit {
            self.last = Some((*payload, now));
        }
        admit
    }
}
