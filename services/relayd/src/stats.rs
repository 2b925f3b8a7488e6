//! Process-wide counters.
//!
//! The only cross-task shared state besides the reader sets.  Plain relaxed
//! atomics; read by the log line emitted on shutdown and by tests.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    pub sessions_opened: AtomicU64,
    pub paths_created: AtomicU64,
    pub frames_forwarded: AtomicU64,
    pub readers_dropped_slow: AtomicU64,
}

impl Stats {
    pub fn global() -> &'static Stats {
        static STATS: Stats = Stats {
            sessions_opened: AtomicU64::new(0),
            paths_created: AtomicU64::new(0),
            frames_forwarded: AtomicU64::new(0),
            readers_dropped_slow: AtomicU64::new(0),
        };
        &STATS
    }
}

pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}
