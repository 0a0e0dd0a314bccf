use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::delta::AppliedOp;
use crate::errors::StoreError;

/// One applied delta as recorded in the audit log: who, when, what was
/// applied, and the collection aggregates it left behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    /// Collection version this delta produced.
    pub version: u64,
    pub ops: Vec<AppliedOp>,
    /// Active record count after the delta landed.
    pub active_count: usize,
    /// Mean score over active records after the delta landed.
    pub mean_score: f64,
}

/// Append-only JSONL log of applied deltas.
///
/// Entries are written once, fsynced, and never edited.  There is no
/// deletion API; pruning old history is someone else's problem.
#[derive(Debug, Clone)]
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: &HistoryEntry) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let line = serde_json::to_string(entry)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        // Flush userspace buffers and fsync to disk so the entry survives a
        // process crash immediately after append.
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Read the whole log.  Unparseable lines are skipped with a warning and
    /// preserved in a `.corrupt` sidecar for forensics.
    pub fn load(&self) -> Result<Vec<HistoryEntry>, StoreError> {
        use std::fs::OpenOptions;
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new().read(true).open(&self.path)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut corrupt_count = 0usize;

        for (line_idx, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<HistoryEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    corrupt_count += 1;
                    tracing::warn!(
                        line = line_idx + 1,
                        error = %err,
                        path = %self.path.display(),
                        "corrupt history line — skipping (original preserved in .corrupt file)"
                    );
                    let corrupt_path = self.path.with_extension("jsonl.corrupt");
                    if let Ok(mut bad) = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&corrupt_path)
                    {
                        use std::io::Write as _;
                        let _ = writeln!(bad, "{line}");
                    }
                }
            }
        }

        if corrupt_count > 0 {
            tracing::warn!(
                corrupt_lines = corrupt_count,
                path = %self.path.display(),
                "history loaded with skipped corrupt lines — inspect .corrupt sidecar"
            );
        }

        Ok(entries)
    }

    /// Lazily iterate entries with `version >= version`, in append order.
    ///
    /// Each call opens the file afresh, so the sequence is restartable.  A
    /// missing log yields an empty sequence.
    pub fn list_since(&self, version: u64) -> Result<HistoryIter, StoreError> {
        let lines = if self.path.exists() {
            let file = std::fs::OpenOptions::new().read(true).open(&self.path)?;
            Some(BufReader::new(file).lines())
        } else {
            None
        };

        Ok(HistoryIter {
            lines,
            min_version: version,
            path: self.path.clone(),
        })
    }
}

/// Lazy cursor over the history log, produced by [`HistoryLog::list_since`].
///
/// Unparseable lines are skipped with a warning; an io failure ends the
/// sequence after yielding the error.
pub struct HistoryIter {
    lines: Option<Lines<BufReader<std::fs::File>>>,
    min_version: u64,
    path: PathBuf,
}

impl Iterator for HistoryIter {
    type Item = Result<HistoryEntry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.as_mut()?.next() {
                None => {
                    self.lines = None;
                    return None;
                }
                Some(Ok(line)) => line,
                Some(Err(err)) => {
                    self.lines = None;
                    return Some(Err(err.into()));
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<HistoryEntry>(&line) {
                Ok(entry) if entry.version >= self.min_version => return Some(Ok(entry)),
                Ok(_) => continue,
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        path = %self.path.display(),
                        "corrupt history line — skipping"
                    );
                    continue;
                }
            }
        }
    }
}
