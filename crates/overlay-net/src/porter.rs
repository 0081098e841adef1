//! Overlay port allocation.
//!
//! Tracks which overlay ports are currently in use on a visor and hands out
//! fresh ephemeral ports on request. Every successful reservation returns a
//! [`PortLease`] RAII guard rather than a bare release closure, so a caller
//! that forgets to release still frees the port once the lease drops.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Ports below this threshold must be explicitly requested via `reserve`;
/// `reserve_ephemeral` only ever hands out ports at or above it.
pub const MIN_EPHEMERAL: u16 = 49152;

/// Tracks in-use overlay ports for one visor.
#[derive(Debug, Default)]
pub struct Porter {
    inner: Arc<Mutex<PorterState>>,
}

#[derive(Debug, Default)]
struct PorterState {
    in_use: HashSet<u16>,
    next_ephemeral: u16,
}

impl Porter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PorterState {
                in_use: HashSet::new(),
                next_ephemeral: MIN_EPHEMERAL,
            })),
        }
    }

    /// Reserve a specific port. Returns `None` if already taken.
    pub fn reserve(&self, port: u16) -> Option<PortLease> {
        let mut state = self.inner.lock().unwrap();
        if !state.in_use.insert(port) {
            return None;
        }
        Some(PortLease::new(port, self.inner.clone()))
    }

    /// Reserve the lowest free port at or above [`MIN_EPHEMERAL`].
    ///
    /// Wraps around `u16::MAX` back to `MIN_EPHEMERAL` if the upper range is
    /// exhausted, so long-running processes that dial and close many
    /// short-lived connections don't run out of ports even though the
    /// search cursor only moves forward.
    pub fn reserve_ephemeral(&self) -> (u16, PortLease) {
        let mut state = self.inner.lock().unwrap();
        let start = state.next_ephemeral;
        let mut candidate = start;
        loop {
            if !state.in_use.contains(&candidate) {
                state.in_use.insert(candidate);
                state.next_ephemeral = candidate.checked_add(1).unwrap_or(MIN_EPHEMERAL);
                let lease = PortLease::new(candidate, self.inner.clone());
                return (candidate, lease);
            }
            candidate = match candidate.checked_add(1) {
                Some(next) => next,
                None => MIN_EPHEMERAL,
            };
            if candidate == start {
                // Every port in the ephemeral range is in use. This can't
                // happen in practice (u16 range, one visor process) but
                // avoids spinning forever if it somehow does.
                state.in_use.insert(candidate);
                let lease = PortLease::new(candidate, self.inner.clone());
                return (candidate, lease);
            }
        }
    }

    /// Number of ports currently reserved. Exposed for tests.
    pub fn in_use_count(&self) -> usize {
        self.inner.lock().unwrap().in_use.len()
    }
}

impl Clone for Porter {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// RAII release guard for a reserved overlay port. Releases on drop; an
/// explicit call to [`PortLease::release`] is equivalent and makes the
/// later `Drop` a no-op, guarded by an `AtomicBool` so double-release never
/// double-frees another caller's subsequent reservation of the same port.
pub struct PortLease {
    port: u16,
    state: Arc<Mutex<PorterState>>,
    released: Arc<AtomicBool>,
}

impl PortLease {
    fn new(port: u16, state: Arc<Mutex<PorterState>>) -> Self {
        Self {
            port,
            state,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Release the port now. Safe to call any number of times; only the
    /// first call has effect.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.lock().unwrap().in_use.remove(&self.port);
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for PortLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortLease").field("port", &self.port).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_rejects_duplicate() {
        let porter = Porter::new();
        let lease = porter.reserve(42).unwrap();
        assert!(porter.reserve(42).is_none());
        drop(lease);
        assert!(porter.reserve(42).is_some());
    }

    #[test]
    fn ephemeral_ports_start_above_threshold_and_dont_collide() {
        let porter = Porter::new();
        let (p1, _l1) = porter.reserve_ephemeral();
        let (p2, _l2) = porter.reserve_ephemeral();
        assert!(p1 >= MIN_EPHEMERAL);
        assert!(p2 >= MIN_EPHEMERAL);
        assert_ne!(p1, p2);
    }

    #[test]
    fn release_is_idempotent() {
        let porter = Porter::new();
        let lease = porter.reserve(7).unwrap();
        lease.release();
        lease.release();
        assert_eq!(porter.in_use_count(), 0);
        assert!(porter.reserve(7).is_some());
    }

    #[test]
    fn many_dials_dont_leak_ports() {
        let porter = Porter::new();
        for _ in 0..500 {
            let (_port, lease) = porter.reserve_ephemeral();
            drop(lease);
        }
        assert_eq!(porter.in_use_count(), 0);
    }
}
