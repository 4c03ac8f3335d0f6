use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::segment::{self, Segment};
use crate::encoding::format::Raw;
use crate::error::Result;
use crate::index::Index;

/// Summary of a replay pass over the log directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub segments_replayed: usize,
    pub segments_discarded: usize,
    pub records_applied: u64,
    /// Highest durable epoch found, 0 for an empty directory.
    pub max_epoch: u64,
}

impl RecoveryReport {
    /// Epoch the engine resumes in.
    pub fn next_epoch(&self) -> u64 {
        self.max_epoch + 1
    }
}

/// Replays every valid segment in `dir` into `index` in ascending epoch
/// order. Segments that fail validation were never durable; they are
/// deleted and skipped.
pub fn replay(dir: &Path, index: &Index) -> Result<RecoveryReport> {
    let mut segments: Vec<(u64, PathBuf)> = fs::read_dir(dir)?
        .filter_map(|entry| {
            let path = entry.ok()?.path();
            let epoch = segment::parse_file_name(&path)?;
            Some((epoch, path))
        })
        .collect();
    segments.sort_by_key(|(epoch, _)| *epoch);

    let mut report = RecoveryReport::default();
    for (epoch, path) in segments {
        let bytes = fs::read(&path)?;
        let segment = match Segment::decode(&bytes) {
            Ok(segment) if segment.epoch == epoch => segment,
            Ok(segment) => {
                tracing::warn!(
                    path = %path.display(),
                    header_epoch = segment.epoch,
                    "Discarding log segment stored under the wrong epoch"
                );
                discard(&path, &mut report)?;
                continue;
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Discarding incomplete log segment"
                );
                discard(&path, &mut report)?;
                continue;
            }
        };

        for (key, value) in segment.records {
            tracing::trace!(epoch, record = %Raw::key_value(&key, &value), "Replaying");
            index.get_or_insert(&key).restore(Arc::from(value), epoch);
            report.records_applied += 1;
        }
        report.segments_replayed += 1;
        report.max_epoch = epoch;
        tracing::debug!(epoch, "Replayed log segment");
    }

    Ok(report)
}

fn discard(path: &Path, report: &mut RecoveryReport) -> Result<()> {
    fs::remove_file(path)?;
    report.segments_discarded += 1;
    Ok(())
}
