//! Path-keyed reader/writer lock table.
//!
//! Anti-tampering serializes hash maintenance against data I/O per *path*,
//! not per descriptor: a verification triggered by one open must not race a
//! close re-hashing the same file through a different descriptor. The table
//! maps path strings to reference-counted reader/writer locks; entries are
//! created lazily on first acquisition and removed when the last holder
//! releases.
//!
//! The table's own mutex is held only across O(1) bookkeeping. Blocking on
//! the per-path lock always happens with the table mutex released, so a
//! stalled writer on one path never wedges acquisitions on another.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

struct Slot {
    lock: Arc<RwLock<()>>,
    refs: usize,
}

/// Reference-counted reader/writer locks keyed by path string.
///
/// Acquire and release are paired structurally: callers pass the critical
/// section as a closure, so an unbalanced release cannot be expressed.
#[derive(Default)]
pub struct PathLocks {
    slots: Mutex<HashMap<String, Slot>>,
}

impl PathLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding the read side of `path`'s lock.
    ///
    /// Concurrent readers on the same path proceed together; a writer on the
    /// path blocks them and vice versa.
    pub fn with_read<T>(&self, path: &str, f: impl FnOnce() -> T) -> T {
        let lock = self.grab(path);
        let result = {
            let _guard = lock.read();
            f()
        };
        self.release(path);
        result
    }

    /// Runs `f` while exclusively holding `path`'s lock.
    pub fn with_write<T>(&self, path: &str, f: impl FnOnce() -> T) -> T {
        let lock = self.grab(path);
        let result = {
            let _guard = lock.write();
            f()
        };
        self.release(path);
        result
    }

    /// Number of paths with live lock entries. Exposed for tests.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.slots.lock().len()
    }

    fn grab(&self, path: &str) -> Arc<RwLock<()>> {
        let mut slots = self.slots.lock();
        let slot = slots
            .entry_ref(path)
            .or_insert_with(|| Slot { lock: Arc::new(RwLock::new(())), refs: 0 });
        slot.refs += 1;
        Arc::clone(&slot.lock)
    }

    fn release(&self, path: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(path) {
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_writers_are_exclusive_per_path() {
        let locks = Arc::new(PathLocks::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (locks, active, peak) = (locks.clone(), active.clone(), peak.clone());
                thread::spawn(move || {
                    locks.with_write("/same/path", || {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(2));
                        active.fetch_sub(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(locks.entry_count(), 0);
    }

    #[test]
    fn test_readers_share_the_lock() {
        let locks = Arc::new(PathLocks::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (locks, active, peak) = (locks.clone(), active.clone(), peak.clone());
                thread::spawn(move || {
                    locks.with_read("/same/path", || {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(10));
                        active.fetch_sub(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // With a 10ms hold, at least two of the eight readers must overlap.
        assert!(peak.load(Ordering::SeqCst) > 1);
        assert_eq!(locks.entry_count(), 0);
    }

    #[test]
    fn test_distinct_paths_do_not_contend() {
        let locks = PathLocks::new();
        locks.with_write("/a", || {
            // A writer on /a must not block a writer on /b.
            locks.with_write("/b", || {});
        });
        assert_eq!(locks.entry_count(), 0);
    }

    #[test]
    fn test_writer_observes_reader_result() {
        let locks = PathLocks::new();
        let value = locks.with_write("/p", || 7);
        assert_eq!(value, 7);
        assert_eq!(locks.with_read("/p", || "ok"), "ok");
    }
}
