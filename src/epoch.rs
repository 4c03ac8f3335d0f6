//! Epoch framework: the global logical clock used as the group-commit barrier.
//!
//! The engine keeps one monotone counter `E`. Every worker that runs a
//! transaction publishes the epoch it entered in its own participant slot,
//! so the minimum over all slots tells the logger which epochs can no longer
//! receive commits:
//!
//! ```text
//!   global E = 7
//!   slots    = [7, -, 6, 7]      (- = quiescent)
//!   global_min() = 6  =>  epochs <= 5 are closed
//! ```
//!
//! Advancement is cooperative and best-effort. A background task calls
//! [`EpochFramework::try_advance`] every tick; the call refuses to move `E`
//! while some participant still runs in an older epoch, or while too many
//! epochs are waiting to become durable.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Slot value of a participant that is not inside an epoch.
const QUIESCENT: u64 = u64::MAX;

/// How far `E` may run ahead of the last persisted epoch.
pub const MAX_UNPERSISTED_EPOCHS: u64 = 3;

pub struct EpochFramework {
    global: AtomicU64,
    slots: Box<[AtomicU64]>,
    next_slot: AtomicUsize,
}

impl EpochFramework {
    pub fn new(initial: u64, participants: usize) -> Self {
        let slots = (0..participants.max(1))
            .map(|_| AtomicU64::new(QUIESCENT))
            .collect();

        Self {
            global: AtomicU64::new(initial),
            slots,
            next_slot: AtomicUsize::new(0),
        }
    }

    /// Current global epoch.
    pub fn current(&self) -> u64 {
        self.global.load(Ordering::SeqCst)
    }

    /// Registers the caller as active and returns a guard holding the epoch
    /// it entered. Dropping the guard leaves the epoch.
    pub fn enter(&self) -> EpochGuard<'_> {
        let mut epoch = self.current();
        let slot = self.claim_slot(epoch);

        // Republish until the global counter is stable so that an advancer
        // reading the slots after bumping `E` cannot miss this participant.
        loop {
            let now = self.current();
            if now == epoch {
                break;
            }
            epoch = now;
            self.slots[slot].store(epoch, Ordering::SeqCst);
        }

        EpochGuard {
            framework: self,
            slot,
            epoch,
        }
    }

    fn claim_slot(&self, epoch: u64) -> usize {
        let start = self.next_slot.fetch_add(1, Ordering::Relaxed);
        let len = self.slots.len();
        let mut attempts = 0usize;
        loop {
            let idx = (start + attempts) % len;
            if self.slots[idx]
                .compare_exchange(QUIESCENT, epoch, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return idx;
            }
            attempts += 1;
            if attempts % len == 0 {
                std::thread::yield_now();
            }
        }
    }

    /// Smallest epoch any active participant is in, or `E` when all are
    /// quiescent. Epochs strictly below this value accept no more commits.
    pub fn global_min(&self) -> u64 {
        let current = self.current();
        self.min_active().map_or(current, |min| min.min(current))
    }

    fn min_active(&self) -> Option<u64> {
        self.slots
            .iter()
            .map(|slot| slot.load(Ordering::SeqCst))
            .filter(|&epoch| epoch != QUIESCENT)
            .min()
    }

    /// Number of participants currently inside an epoch.
    pub fn active(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.load(Ordering::SeqCst) != QUIESCENT)
            .count()
    }

    /// Attempts to move `E` forward by one.
    ///
    /// `persisted` is the last durable epoch when recovery logging is on.
    /// Returns the new epoch, or `None` when advancement is held back.
    pub fn try_advance(&self, persisted: Option<u64>) -> Option<u64> {
        let current = self.current();

        if let Some(persisted) = persisted {
            if current.saturating_sub(persisted) >= MAX_UNPERSISTED_EPOCHS {
                tracing::trace!(current, persisted, "Epoch advance throttled by durability");
                return None;
            }
        }

        if let Some(min) = self.min_active() {
            if min < current {
                tracing::trace!(current, straggler = min, "Epoch advance held by straggler");
                return None;
            }
        }

        self.global
            .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| current + 1)
    }
}

/// RAII registration of a participant inside one epoch.
pub struct EpochGuard<'a> {
    framework: &'a EpochFramework,
    slot: usize,
    epoch: u64,
}

impl EpochGuard<'_> {
    /// The epoch this participant entered.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn leave(self) {}
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.framework.slots[self.slot].store(QUIESCENT, Ordering::SeqCst);
    }
}
