use std::cell::Cell;
use std::thread;
use std::time::Duration;

const STEP_LIMIT: u32 = 6;

/// Exponential backoff between retries of a remote call.
///
/// Each `snooze` sleeps twice as long as the previous one, up to 64
/// times the base delay.
pub(crate) struct Backoff {
    base: Duration,
    step: Cell<u32>,
}

impl Backoff {
    pub(crate) const fn new(base: Duration) -> Self {
        Backoff { base, step: Cell::new(0) }
    }

    pub(crate) fn delay(&self) -> Duration {
        self.base * (1 << self.step.get().min(STEP_LIMIT))
    }

    pub(crate) fn snooze(&self) {
        let delay = self.delay();
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        if self.step.get() <= STEP_LIMIT {
            self.step.set(self.step.get() + 1);
        }
    }
}
