//! A single-assignment, close-once signal.
//!
//! `tokio::sync::Notify::notify_waiters()` only wakes tasks already parked
//! on `notified()` -- it has no stored permit, so a naive `AtomicBool` +
//! `Notify` latch misses any waiter that starts waiting after the fire.
//! [`OnceLatch`] closes that race with a check-register-recheck sequence,
//! giving `wait()` the property this crate needs everywhere it models a
//! one-shot lifecycle event (`listen_started`, `done`): it returns
//! immediately whether called before or after `fire()`.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

pub(crate) struct OnceLatch {
    fired: AtomicBool,
    notify: Notify,
}

impl OnceLatch {
    pub(crate) fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub(crate) fn fire(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub(crate) async fn wait(&self) {
        if self.is_fired() {
            return;
        }
        let notified = self.notify.notified();
        tokio::pin!(notified);
        if self.is_fired() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn wait_after_fire_returns_immediately() {
        let latch = Arc::new(OnceLatch::new());
        latch.fire();
        tokio::time::timeout(std::time::Duration::from_millis(100), latch.wait())
            .await
            .expect("wait() must not block once already fired");
    }

    #[tokio::test]
    async fn wait_before_fire_wakes_on_fire() {
        let latch = Arc::new(OnceLatch::new());
        let waiter = latch.clone();
        let task = tokio::spawn(async move { waiter.wait().await });
        tokio::task::yield_now().await;
        latch.fire();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn fire_is_idempotent() {
        let latch = OnceLatch::new();
        latch.fire();
        latch.fire();
        assert!(latch.is_fired());
    }
}
