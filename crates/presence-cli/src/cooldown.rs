use std::time::{Duration, Instant};

/// Debounce for attendance marks from one capture loop.
///
/// A subject standing in front of the camera is recognised on every frame;
/// without this the second recognition would immediately punch them out.
/// The ledger itself never debounces.
pub struct MarkCooldown {
    window: Duration,
    last_mark: Option<Instant>,
}

impl MarkCooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_mark: None,
        }
    }

    /// Return `Ok(())` if a mark is allowed at `now`, otherwise the time
    /// left until it is.
    pub fn check(&self, now: Instant) -> Result<(), Duration> {
        match self.last_mark {
            Some(last) => {
                let elapsed = now.saturating_duration_since(last);
                if elapsed > self.window {
                    Ok(())
                } else {
                    Err(self.window - elapsed)
                }
            }
            None => Ok(()),
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.last_mark = Some(now);
    }
}
