//! Commit-time validation for [`Transaction`].
//!
//! `prepare` runs the first half of the protocol:
//!
//! 1. lock every written slot in ascending slot id order, spinning a bounded
//!    number of times per slot before giving up (the canonical order rules
//!    out deadlock between committers),
//! 2. read the commit epoch; this is the serialization point,
//! 3. check that every read slot still carries the recorded sequence and is
//!    not locked by another committer.
//!
//! The returned [`PreparedCommit`] owns the locks. Installing publishes the
//! staged values; dropping it releases the locks, bumping the sequence of
//! every slot that received a value.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{AbortReason, Transaction};
use crate::encoding::format::Raw;
use crate::epoch::EpochFramework;
use crate::slot::Slot;

/// Committed writes handed to the recovery logger, in lock order.
pub type WriteBatch = Vec<(Vec<u8>, Arc<[u8]>)>;

pub struct PreparedCommit<'a> {
    commits: &'a AtomicU64,
    locked: Vec<Arc<Slot>>,
    writes: Vec<(Vec<u8>, Arc<Slot>, Arc<[u8]>)>,
    epoch: u64,
    installed: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn prepare(
        mut self,
        epochs: &EpochFramework,
        lock_retry_limit: u32,
    ) -> Result<PreparedCommit<'a>, AbortReason> {
        if let Some(reason) = self.abort_reason {
            return Err(reason);
        }

        let mut writes: Vec<_> = self
            .write_set
            .drain()
            .map(|(key, entry)| (key, entry.slot, entry.value))
            .collect();
        writes.sort_by_key(|(_, slot, _)| slot.id());

        let mut prepared = PreparedCommit {
            commits: self.commits,
            locked: Vec::with_capacity(writes.len()),
            writes: Vec::new(),
            epoch: 0,
            installed: false,
        };

        for (key, slot, _) in &writes {
            if !slot.lock(lock_retry_limit) {
                tracing::debug!(key = %Raw::bytes(key), "Write lock contended, aborting");
                return Err(AbortReason::Conflict);
            }
            prepared.locked.push(slot.clone());
        }

        prepared.epoch = epochs.current();

        let owned: HashSet<u64> = prepared.locked.iter().map(|slot| slot.id()).collect();
        if !self.read_set_valid(|id| owned.contains(&id)) {
            tracing::trace!(epoch = prepared.epoch, "Read set validation failed");
            return Err(AbortReason::Conflict);
        }

        prepared.writes = writes;
        Ok(prepared)
    }
}

impl PreparedCommit<'_> {
    /// Epoch the transaction commits in.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_read_only(&self) -> bool {
        self.locked.is_empty()
    }

    /// Publishes every staged value under the held locks and returns the
    /// batch for the recovery log.
    pub fn install(&mut self) -> WriteBatch {
        if self.writes.is_empty() {
            self.installed = true;
            return Vec::new();
        }

        // Bumped before publishing so readers that observe a new value
        // also observe the counter change and re-validate.
        let stamp = self.commits.fetch_add(1, Ordering::SeqCst) + 1;

        let writes = std::mem::take(&mut self.writes);
        let mut batch = Vec::with_capacity(writes.len());
        for (key, slot, value) in writes {
            slot.install(value.clone(), self.epoch, stamp);
            batch.push((key, value));
        }
        self.installed = true;
        batch
    }
}

impl Drop for PreparedCommit<'_> {
    fn drop(&mut self) {
        for slot in &self.locked {
            slot.unlock(self.installed);
        }
    }
}
