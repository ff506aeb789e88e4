//! One-shot deadline timers for the replication machine.
//!
//! Each machine timer is a deadline slot with its period fixed at
//! construction: arming stores `now + period`, disarming clears it, and
//! the firing future sleeps until the stored deadline, pending forever
//! while disarmed. "No active timer" is simply the absent deadline;
//! re-arming an armed timer replaces its deadline. There is no background
//! task: the firing future is rebuilt by every `tokio::select!` loop
//! iteration, so a handler that fires must immediately re-arm (periodic
//! use) or disarm (window/cap use) before the loop polls again.

use tokio::time::{self, Duration, Instant};

/// A deadline-slot timer with a fixed period.
#[derive(Debug)]
pub struct Timer {
    /// Period added onto the current instant by every `arm()`.
    period: Duration,

    /// Active deadline; `None` while the timer is disarmed.
    deadline: Option<Instant>,
}

impl Timer {
    /// Creates a disarmed timer that fires one `period` after every
    /// arming. The period must be positive; the machine validates its
    /// configured intervals before constructing timers.
    pub fn new(period: Duration) -> Self {
        debug_assert!(!period.is_zero());
        Timer {
            period,
            deadline: None,
        }
    }

    /// Arms (or re-arms) the timer one period from now. Re-arming
    /// replaces the active deadline, so a periodic handler simply arms
    /// again after firing and a refreshed window starts over.
    pub fn arm(&mut self) {
        self.deadline = Some(Instant::now() + self.period);
    }

    /// Clears the deadline; a disarmed timer never fires. Disarming an
    /// idle or already disarmed timer is a no-op, which makes shutdown
    /// teardown idempotent.
    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    /// True while a deadline is pending.
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Completes once the active deadline has passed; pends forever while
    /// disarmed. Intended as a `tokio::select!` branch; it keeps
    /// completing until the owner re-arms or disarms, the loop rebuilds
    /// it each iteration.
    pub async fn fired(&self) {
        match self.deadline {
            Some(deadline) => time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}
