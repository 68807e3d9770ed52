//! Shared exit trigger and OS signal wiring.
//!
//! The launcher, every child supervisor, and the sentinel all block on a
//! single one-shot [`ExitEvent`]. Firing it begins shutdown; it never
//! resets.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::debug;

/// One-shot, multi-consumer trigger.
///
/// All timed waits in the launcher (start delays, restart backoffs, the
/// sentinel's poll interval) are waits on this event, so setting it wakes
/// every suspended supervisor promptly.
#[derive(Default)]
pub struct ExitEvent {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl ExitEvent {
    pub fn new() -> Self {
        ExitEvent::default()
    }

    /// Fire the trigger. Idempotent.
    pub fn set(&self) {
        let mut fired = self.fired.lock().expect("exit event lock poisoned");
        if !*fired {
            *fired = true;
            debug!("exit trigger fired");
        }
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.fired.lock().expect("exit event lock poisoned")
    }

    /// Block until the trigger fires.
    pub fn wait(&self) {
        let mut fired = self.fired.lock().expect("exit event lock poisoned");
        while !*fired {
            fired = self.cond.wait(fired).expect("exit event lock poisoned");
        }
    }

    /// Wait up to `timeout` for the trigger. Returns true if it fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut fired = self.fired.lock().expect("exit event lock poisoned");
        while !*fired {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(fired, deadline - now)
                .expect("exit event lock poisoned");
            fired = guard;
        }
        true
    }
}

/// Install the OS exit-signal source: SIGINT/SIGTERM on POSIX, the console
/// control handler (Ctrl-C, console close) on Windows. The handler's only
/// job is to fire the event; everything else happens on the main thread.
pub fn install_exit_handler(event: Arc<ExitEvent>) -> Result<()> {
    ctrlc::set_handler(move || event.set()).context("install exit signal handler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unset() {
        let e = ExitEvent::new();
        assert!(!e.is_set());
        assert!(!e.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn set_is_sticky_and_idempotent() {
        let e = ExitEvent::new();
        e.set();
        e.set();
        assert!(e.is_set());
        assert!(e.wait_timeout(Duration::from_millis(1)));
        e.wait(); // must not block once fired
    }

    #[test]
    fn timed_wait_wakes_on_set_from_other_thread() {
        let e = Arc::new(ExitEvent::new());
        let e2 = Arc::clone(&e);
        let start = Instant::now();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            e2.set();
        });
        assert!(e.wait_timeout(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        t.join().unwrap();
    }
}
