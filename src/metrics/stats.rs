use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters updated by table operations and sweeps.
pub struct StatsCounter {
    inserted: AtomicU64,
    duplicates: AtomicU64,
    collisions: AtomicU64,
    created: AtomicU64,
    removed: AtomicU64,
    stale_removals: AtomicU64,
    expired: AtomicU64,
    sweeps: AtomicU64,
    listener_panics: AtomicU64,
}

impl StatsCounter {
    pub fn new() -> Self {
        StatsCounter {
            inserted: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            collisions: AtomicU64::new(0),
            created: AtomicU64::new(0),
            removed: AtomicU64::new(0),
            stale_removals: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            sweeps: AtomicU64::new(0),
            listener_panics: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_insert(&self) {
        self.inserted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_collision(&self) {
        self.collisions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_create(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_remove(&self) {
        self.removed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stale_removal(&self) {
        self.stale_removals.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_expired(&self, count: u64) {
        self.expired.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sweep(&self) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_listener_panic(&self) {
        self.listener_panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot of the statistics.
    pub fn snapshot(&self) -> TableStats {
        TableStats {
            inserted: self.inserted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            collisions: self.collisions.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            stale_removals: self.stale_removals.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
            listener_panics: self.listener_panics.load(Ordering::Relaxed),
        }
    }
}

impl Default for StatsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time snapshot of table statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableStats {
    /// Records admitted by `update`.
    pub inserted: u64,
    /// Records dropped by `update` because the key was already resident.
    pub duplicates: u64,
    /// Resident entries whose identity disagreed with their key.
    pub collisions: u64,
    /// Empty records created by `get_or_create`.
    pub created: u64,
    /// Explicit removals that found their key.
    pub removed: u64,
    /// Removals of keys that were not resident.
    pub stale_removals: u64,
    /// Flows evicted by sweeps.
    pub expired: u64,
    /// Completed sweeps.
    pub sweeps: u64,
    /// Eviction listener invocations that panicked.
    pub listener_panics: u64,
}

impl TableStats {
    /// Every record that ever entered the table.
    pub fn admitted(&self) -> u64 {
        self.inserted + self.created
    }
}
