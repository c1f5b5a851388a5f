use std::sync::Mutex;
use std::time::Instant;

/// Tracks the last time the client side of a bridge sent anything,
/// consulted by the inactivity watchdog.
pub struct ActivityClock {
    last: Mutex<Instant>,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last.lock().expect("activity clock lock poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last.lock().expect("activity clock lock poisoned").elapsed()
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}
