//! Deadline timer for connection event loops.
//!
//! A disarmed timer is a sleep parked far in the future; the `armed` flag is
//! the select! guard so a parked timer never fires.  Connection drivers keep
//! one [`ConnTimer`] per deadline and call [`ConnTimer::sync`] after each
//! state-machine step so the timer mirrors the machine's `Option<Instant>`.
//!
//! ```text
//!   sync(Some(t)) ──▶ armed, fires at t
//!   sync(None)    ──▶ parked far in the future, guard false
//! ```

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep};

const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 3600);

/// One re-armable deadline, pollable from a `select!` arm.
pub struct ConnTimer {
    sleep: Pin<Box<Sleep>>,
    deadline: Option<Instant>,
}

impl Default for ConnTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnTimer {
    pub fn new() -> Self {
        Self {
            sleep: Box::pin(tokio::time::sleep(FAR_FUTURE)),
            deadline: None,
        }
    }

    pub fn arm(&mut self, after: Duration) {
        self.arm_at(Instant::now() + after);
    }

    pub fn arm_at(&mut self, deadline: Instant) {
        self.sleep.as_mut().reset(deadline);
        self.deadline = Some(deadline);
    }

    /// Disarm; the sleep is parked rather than dropped.
    pub fn cancel(&mut self) {
        if self.deadline.take().is_some() {
            self.sleep.as_mut().reset(Instant::now() + FAR_FUTURE);
        }
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Follow `deadline`, resetting the sleep only when it changed.
    pub fn sync(&mut self, deadline: Option<Instant>) {
        match deadline {
            Some(d) if self.deadline != Some(d) => self.arm_at(d),
            Some(_) => {}
            None => self.cancel(),
        }
    }

    /// Resolves at the deadline and disarms.  Use behind an `is_armed()`
    /// select! guard.
    pub async fn expired(&mut self) {
        self.sleep.as_mut().await;
        self.deadline = None;
        self.sleep.as_mut().reset(Instant::now() + FAR_FUTURE);
    }
}
