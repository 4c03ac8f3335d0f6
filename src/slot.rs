//! Storage slots: the canonical in-memory cell for one key.
//!
//! Each slot carries a version word read and written atomically:
//!
//! ```text
//! +--------------------------------------+------+
//! | sequence (63 bits)                   | lock |
//! +--------------------------------------+------+
//! ```
//!
//! Readers use the optimistic protocol: load the version, copy the value,
//! load the version again, and retry unless both loads match with the lock
//! bit clear. Writers take the lock bit with a CAS during commit, publish the
//! new value and epoch, and release the lock with the sequence incremented.
//! A reader therefore never pairs a value with a version from a different
//! commit.
//!
//! Every install also carries a commit stamp: the engine's commit counter
//! value taken by the installing transaction. Aborted handles use it to tell
//! whether a value predates their snapshot.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

const LOCK_BIT: u64 = 1;

/// Spins before a waiting reader starts yielding its time slice.
const SPINS_BEFORE_YIELD: u32 = 64;

/// A decoded version word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version(u64);

impl Version {
    pub fn sequence(self) -> u64 {
        self.0 >> 1
    }

    pub fn is_locked(self) -> bool {
        self.0 & LOCK_BIT != 0
    }

    fn locked(self) -> Self {
        Version(self.0 | LOCK_BIT)
    }

    fn unlocked(self) -> Self {
        Version(self.0 & !LOCK_BIT)
    }

    fn bumped(self) -> Self {
        Version(((self.sequence() + 1) << 1) & !LOCK_BIT)
    }
}

/// A coherent copy of a slot: the value and the version it was published with.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub version: Version,
    pub value: Arc<[u8]>,
    /// Commit stamp of the installing transaction (0 for recovered values).
    pub stamp: u64,
}

impl Snapshot {
    /// The value, or `None` when the slot holds the empty (absent) value.
    pub fn present(&self) -> Option<Arc<[u8]>> {
        present(&self.value)
    }
}

pub(crate) fn present(value: &Arc<[u8]>) -> Option<Arc<[u8]>> {
    if value.is_empty() {
        None
    } else {
        Some(value.clone())
    }
}

pub struct Slot {
    id: u64,
    version: AtomicU64,
    epoch: AtomicU64,
    stamp: AtomicU64,
    value: RwLock<Arc<[u8]>>,
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("version", &self.version())
            .field("epoch", &self.committed_epoch())
            .finish()
    }
}

impl Slot {
    /// Creates an empty slot at sequence zero.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            version: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            stamp: AtomicU64::new(0),
            value: RwLock::new(Arc::from(Vec::new())),
        }
    }

    /// Stable identity used as the canonical lock order.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn version(&self) -> Version {
        Version(self.version.load(Ordering::Acquire))
    }

    /// Epoch of the last committed write (0 if never written).
    pub fn committed_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Optimistic read of the current committed value.
    pub fn read(&self) -> Snapshot {
        let mut spins = 0u32;
        loop {
            let before = self.version();
            if before.is_locked() {
                backoff(&mut spins);
                continue;
            }

            let value = self
                .value
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            let stamp = self.stamp.load(Ordering::Acquire);

            if self.version() == before {
                return Snapshot {
                    version: before,
                    value,
                    stamp,
                };
            }
            backoff(&mut spins);
        }
    }

    /// Single attempt at the write lock.
    pub fn try_lock(&self) -> bool {
        let current = self.version();
        if current.is_locked() {
            return false;
        }
        self.version
            .compare_exchange(
                current.0,
                current.locked().0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Spins up to `retry_limit` times for the write lock.
    pub fn lock(&self, retry_limit: u32) -> bool {
        for attempt in 0..=retry_limit {
            if self.try_lock() {
                return true;
            }
            if attempt % SPINS_BEFORE_YIELD == SPINS_BEFORE_YIELD - 1 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
        false
    }

    /// Publishes a committed value. The caller must hold the write lock.
    pub fn install(&self, value: Arc<[u8]>, epoch: u64, stamp: u64) {
        debug_assert!(self.version().is_locked(), "install without write lock");
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = value;
        self.epoch.store(epoch, Ordering::Release);
        self.stamp.store(stamp, Ordering::Release);
    }

    /// Releases the write lock, advancing the sequence if a value was installed.
    pub fn unlock(&self, installed: bool) {
        let current = self.version();
        debug_assert!(current.is_locked(), "unlock without write lock");
        let next = if installed {
            current.bumped()
        } else {
            current.unlocked()
        };
        self.version.store(next.0, Ordering::Release);
    }

    /// Applies a replayed log record. Used while no transactions run.
    pub fn restore(&self, value: Arc<[u8]>, epoch: u64) {
        while !self.try_lock() {
            std::hint::spin_loop();
        }
        self.install(value, epoch, 0);
        self.unlock(true);
    }
}

fn backoff(spins: &mut u32) {
    *spins += 1;
    if *spins % SPINS_BEFORE_YIELD == 0 {
        std::thread::yield_now();
    } else {
        std::hint::spin_loop();
    }
}
