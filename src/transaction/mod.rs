//! The transaction handle presented to transaction bodies.
//!
//! A transaction buffers its writes locally and remembers the version of
//! every slot it read. Nothing touches shared slots until commit, where
//! [`commit`] locks the write set, validates the read set and installs.
//!
//! Reads resolve in this order:
//! 1. the transaction's own staged writes (read-your-own-writes),
//! 2. values it already read (repeatable reads),
//! 3. the committed slot, via the optimistic snapshot protocol.
//!
//! Each new slot read re-validates the read set when any transaction has
//! committed since the last check, so a running body is aborted as soon as
//! its snapshot can no longer be serialized.
//!
//! An aborted handle keeps its read set and keeps answering from the last
//! snapshot that validated: values committed after that point are never
//! handed to the body, so it cannot observe a state mixing the two.

pub mod commit;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::encoding::{bincode, format::Raw};
use crate::error::Result;
use crate::index::Index;
use crate::slot::{present, Slot, Snapshot, Version};

/// Outcome of a transaction as reported to its completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxStatus {
    Running,
    Committed,
    Aborted,
}

/// Why a transaction ended up aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    /// The body called [`Transaction::abort`].
    User,
    /// Validation found a concurrent writer, or a write lock stayed contended.
    Conflict,
    /// The body panicked.
    Panic,
    /// The recovery log failed; the engine accepts no more commits.
    EngineFailed,
}

struct ReadEntry {
    slot: Arc<Slot>,
    version: Version,
    value: Arc<[u8]>,
}

struct WriteEntry {
    slot: Arc<Slot>,
    value: Arc<[u8]>,
}

pub struct Transaction<'a> {
    index: &'a Index,
    commits: &'a AtomicU64,
    epoch: u64,
    status: TxStatus,
    abort_reason: Option<AbortReason>,
    read_set: HashMap<Vec<u8>, ReadEntry>,
    write_set: HashMap<Vec<u8>, WriteEntry>,
    validated_at: u64,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(index: &'a Index, commits: &'a AtomicU64, epoch: u64) -> Self {
        Self {
            index,
            commits,
            epoch,
            status: TxStatus::Running,
            abort_reason: None,
            read_set: HashMap::new(),
            write_set: HashMap::new(),
            validated_at: commits.load(Ordering::SeqCst),
        }
    }

    /// Reads `key`. `None` means the key is absent (never written, or
    /// deleted with an empty value).
    ///
    /// Reading a key without a slot creates an empty one, so a concurrent
    /// insert fails validation. Slots are never reclaimed: bodies reading
    /// many distinct missing keys grow the index for the life of the
    /// database.
    ///
    /// After an abort, keys already read keep their values and other keys
    /// are served only if unchanged since the last validated snapshot. A key
    /// overwritten after that point reads as absent.
    pub fn read(&mut self, key: impl AsRef<[u8]>) -> Option<Arc<[u8]>> {
        let key = key.as_ref();

        if let Some(staged) = self.write_set.get(key) {
            return present(&staged.value);
        }
        if let Some(seen) = self.read_set.get(key) {
            return present(&seen.value);
        }

        if self.is_aborted() {
            let slot = self.index.find(key)?;
            let snapshot = slot.read();
            return self.record(key, slot, snapshot);
        }

        let slot = self.index.get_or_insert(key);
        let snapshot = slot.read();
        // Validate before handing out the value: a stale read set must not be
        // paired with a newer value.
        self.revalidate();
        self.record(key, slot, snapshot)
    }

    /// Stages `value` for `key`, replacing any earlier stage. Ignored once
    /// the transaction is aborted.
    pub fn write(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        let key = key.as_ref();
        if self.is_aborted() {
            tracing::trace!(key = %Raw::bytes(key), "Write after abort ignored");
            return;
        }
        let slot = self.index.get_or_insert(key);
        self.write_set.insert(
            key.to_vec(),
            WriteEntry {
                slot,
                value: Arc::from(value.as_ref()),
            },
        );
    }

    /// Stages a deletion, committed as the empty value.
    pub fn delete(&mut self, key: impl AsRef<[u8]>) {
        self.write(key, b"");
    }

    /// Reads `key` and decodes it with bincode.
    pub fn read_value<T: DeserializeOwned>(&mut self, key: impl AsRef<[u8]>) -> Result<Option<T>> {
        self.read(key)
            .map(|bytes| bincode::deserialize(&bytes))
            .transpose()
    }

    /// Encodes `value` with bincode and stages it.
    pub fn write_value<T: Serialize + ?Sized>(
        &mut self,
        key: impl AsRef<[u8]>,
        value: &T,
    ) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.write(key, bytes);
        Ok(())
    }

    /// Aborts the transaction. Staged writes are discarded; reads keep
    /// answering from the transaction's snapshot until the body returns.
    pub fn abort(&mut self) {
        self.mark_aborted(AbortReason::User);
    }

    pub fn status(&self) -> TxStatus {
        self.status
    }

    pub fn is_aborted(&self) -> bool {
        self.status == TxStatus::Aborted
    }

    /// Epoch the transaction began in.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn abort_reason(&self) -> Option<AbortReason> {
        self.abort_reason
    }

    pub(crate) fn mark_aborted(&mut self, reason: AbortReason) {
        if self.status != TxStatus::Running {
            return;
        }
        self.status = TxStatus::Aborted;
        self.abort_reason = Some(reason);
        self.write_set.clear();
    }

    /// Adds a slot read to the read set and returns its value. Once aborted,
    /// values committed after the last validation are recorded as absent.
    fn record(&mut self, key: &[u8], slot: Arc<Slot>, snapshot: Snapshot) -> Option<Arc<[u8]>> {
        let value: Arc<[u8]> = if self.is_aborted() && snapshot.stamp > self.validated_at {
            tracing::trace!(key = %Raw::bytes(key), "Value newer than aborted snapshot hidden");
            Arc::from(Vec::new())
        } else {
            snapshot.value
        };
        let result = present(&value);
        self.read_set.insert(
            key.to_vec(),
            ReadEntry {
                slot,
                version: snapshot.version,
                value,
            },
        );
        result
    }

    fn revalidate(&mut self) {
        let now = self.commits.load(Ordering::SeqCst);
        if now == self.validated_at {
            return;
        }
        if self.read_set_valid(|_| false) {
            self.validated_at = now;
        } else {
            tracing::trace!(epoch = self.epoch, "Read set invalidated during execution");
            self.mark_aborted(AbortReason::Conflict);
        }
    }

    /// Every recorded read still matches its slot and no foreign writer holds
    /// the slot. `owned` reports slots whose lock belongs to this transaction.
    fn read_set_valid(&self, owned: impl Fn(u64) -> bool) -> bool {
        self.read_set.values().all(|entry| {
            let current = entry.slot.version();
            current.sequence() == entry.version.sequence()
                && (!current.is_locked() || owned(entry.slot.id()))
        })
    }
}
