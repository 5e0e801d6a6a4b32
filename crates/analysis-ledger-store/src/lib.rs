#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::fs;
use std::path::{Path, PathBuf};

use analysis_ledger_core::{
    compute_root, hash_batch, now_utc, CycleInput, CycleSummary, LedgerError, LedgerState,
    LogRecord, MerkleSnapshot, GENESIS_ROOT, MERKLE_SNAPSHOT_KIND,
};
use analysis_ledger_journal::{AppendOptions, JsonlWriter, WriterOptions};
use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

pub const RECORDS_FILE: &str = "records.jsonl";
pub const CYCLES_FILE: &str = "cycles.jsonl";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerOptions {
    pub writer: WriterOptions,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct VerificationIssue {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct VerificationReport {
    pub valid: bool,
    pub deep: bool,
    pub records_checked: usize,
    pub snapshots_checked: usize,
    pub cycles_checked: usize,
    pub issues: Vec<VerificationIssue>,
}

impl VerificationReport {
    /// Issue messages joined for operator display.
    #[must_use]
    pub fn summary(&self) -> String {
        self.issues
            .iter()
            .map(|issue| format!("{}:{}", issue.code, issue.message))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn push(&mut self, code: &str, message: String) {
        self.issues.push(VerificationIssue {
            code: code.to_string(),
            message,
        });
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct RepairReport {
    pub kept_cycles: usize,
    pub dropped_cycles: usize,
    pub archived_to: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct LedgerStatus {
    pub state: LedgerState,
    pub record_count: usize,
    pub cycle_count: usize,
    pub last_cycle_id: Option<u64>,
    pub last_merkle_root: Option<String>,
    pub records_path: String,
    pub cycles_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CycleAnchor {
    cycle_id: u64,
    root: String,
}

/// Last-cycle cache, loaded from the cycle log on first use after open.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CycleCache {
    Unloaded,
    Loaded(Option<CycleAnchor>),
}

/// Append-only store of analysis records and chained cycle summaries.
///
/// A ledger starts `Uninitialized`; [`Ledger::bootstrap`] runs the deep
/// chain check and moves it to `Active` or `SafeMode`. Safe mode rejects
/// every [`Ledger::append_cycle`] until an operator repairs the cycle log and
/// the process opens the ledger again.
#[derive(Debug)]
pub struct Ledger {
    dir: PathBuf,
    records: JsonlWriter,
    cycles: JsonlWriter,
    state: LedgerState,
    head: Option<LogRecord>,
    last_cycle: CycleCache,
}

impl Ledger {
    pub fn open(dir: &Path, options: LedgerOptions) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create ledger directory {}", dir.display()))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            records: JsonlWriter::new(dir.join(RECORDS_FILE), options.writer),
            cycles: JsonlWriter::new(dir.join(CYCLES_FILE), options.writer),
            state: LedgerState::Uninitialized,
            head: None,
            last_cycle: CycleCache::Unloaded,
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn state(&self) -> &LedgerState {
        &self.state
    }

    #[must_use]
    pub fn is_safe_mode(&self) -> bool {
        self.state.is_safe_mode()
    }

    /// Startup contract: deep chain verification before any cycle write.
    pub fn bootstrap(&mut self) -> Result<VerificationReport> {
        let report = self.verify_chain(true)?;
        if report.valid && self.state == LedgerState::Uninitialized {
            self.state = LedgerState::Active;
            info!(
                dir = %self.dir.display(),
                records = report.records_checked,
                cycles = report.cycles_checked,
                "ledger verified and active"
            );
        }
        Ok(report)
    }

    /// Engages safe mode. There is no way back within this instance.
    pub fn engage_safe_mode(&mut self, reason: &str) {
        if self.state.is_safe_mode() {
            return;
        }
        error!(dir = %self.dir.display(), reason, "ledger entering safe mode");
        self.state = LedgerState::SafeMode(reason.to_string());
    }

    pub fn append(&mut self, kind: &str, data: Value) -> Result<Ulid> {
        let record = LogRecord::new(kind, data, now_utc())?;
        self.records
            .append(&record, AppendOptions::BUFFERED)
            .with_context(|| format!("failed to append {kind} record"))?;
        let id = record.id;
        debug!(%id, kind, hash = %record.hash, "appended ledger record");
        self.head = Some(record);
        Ok(id)
    }

    pub fn head(&self) -> Result<Option<LogRecord>> {
        if let Some(record) = &self.head {
            return Ok(Some(record.clone()));
        }
        Ok(self.records()?.pop())
    }

    pub fn records(&self) -> Result<Vec<LogRecord>> {
        self.records.read_all()
    }

    pub fn cycles(&self) -> Result<Vec<CycleSummary>> {
        self.cycles.read_all()
    }

    pub fn hash_batch(items: &[Value]) -> Result<String> {
        Ok(hash_batch(items)?)
    }

    #[must_use]
    pub fn compute_root(hashes: &[String]) -> String {
        compute_root(hashes)
    }

    /// Persists a Merkle snapshot over every record in the current log file.
    pub fn snapshot(&mut self) -> Result<MerkleSnapshot> {
        // Rotate first so the snapshot line lands in the file it covers.
        self.records.flush(false)?;
        self.records.rotate_if_needed()?;
        let hashes = self
            .records()?
            .into_iter()
            .map(|record| record.hash)
            .collect::<Vec<_>>();
        let snapshot = MerkleSnapshot::over(&hashes, now_utc());
        let record = LogRecord::new(MERKLE_SNAPSHOT_KIND, snapshot.to_value()?, now_utc())?;
        self.records
            .append(&record, AppendOptions::DURABLE)
            .context("failed to persist merkle snapshot")?;
        self.head = Some(record);
        info!(root = %snapshot.root, count = snapshot.count, "recorded merkle snapshot");
        Ok(snapshot)
    }

    /// Appends a chained cycle summary with an fsync.
    pub fn append_cycle(&mut self, input: &CycleInput) -> Result<CycleSummary> {
        match &self.state {
            LedgerState::SafeMode(reason) => {
                return Err(LedgerError::SafeMode(reason.clone()).into());
            }
            LedgerState::Uninitialized => return Err(LedgerError::NotInitialized.into()),
            LedgerState::Active => {}
        }

        // The root covers phase hashes only, never the summary that carries it.
        let merkle_root = compute_root(&input.phases.hashes());
        let previous = self.last_cycle_anchor()?;
        let (cycle_id, prev_merkle_root) = match previous {
            Some(anchor) => (successor(anchor.cycle_id)?, anchor.root),
            None => (1, GENESIS_ROOT.to_string()),
        };

        let summary = CycleSummary {
            cycle_id,
            timestamp: now_utc(),
            phases: input.phases.clone(),
            merkle_root,
            prev_merkle_root,
        };
        self.cycles
            .append(&summary, AppendOptions::DURABLE)
            .with_context(|| format!("failed to persist cycle {cycle_id}"))?;

        self.last_cycle = CycleCache::Loaded(Some(CycleAnchor {
            cycle_id,
            root: summary.merkle_root.clone(),
        }));
        info!(
            cycle_id,
            merkle_root = %summary.merkle_root,
            phases = summary.phases.len(),
            "appended cycle summary"
        );
        Ok(summary)
    }

    /// Id the next successful `append_cycle` will assign.
    pub fn next_cycle_id(&mut self) -> Result<u64> {
        match self.last_cycle_anchor()? {
            Some(anchor) => Ok(successor(anchor.cycle_id)?),
            None => Ok(1),
        }
    }

    /// Forgets the cached last cycle root; the next `append_cycle` reloads it.
    pub fn reset_cycle_cache(&mut self) {
        self.last_cycle = CycleCache::Unloaded;
    }

    /// Recomputes every record hash and every recorded Merkle snapshot.
    pub fn verify(&self) -> Result<VerificationReport> {
        let records = self.records()?;
        let mut report = VerificationReport {
            valid: true,
            deep: false,
            records_checked: records.len(),
            snapshots_checked: 0,
            cycles_checked: 0,
            issues: Vec::new(),
        };

        for (position, record) in records.iter().enumerate() {
            if !record.hash_matches()? {
                report.push(
                    "record.hash_mismatch",
                    format!("record {} at position {position} was altered", record.id),
                );
            }

            if !record.is_snapshot() {
                continue;
            }
            report.snapshots_checked += 1;
            let snapshot = match MerkleSnapshot::from_record(record) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    report.push("snapshot.malformed", format!("record {}: {err}", record.id));
                    continue;
                }
            };
            if snapshot.count > position {
                report.push(
                    "snapshot.count_out_of_range",
                    format!(
                        "snapshot {} covers {} records but only {position} precede it",
                        record.id, snapshot.count
                    ),
                );
                continue;
            }
            let hashes = records[..snapshot.count]
                .iter()
                .map(|covered| covered.hash.clone())
                .collect::<Vec<_>>();
            if compute_root(&hashes) != snapshot.root {
                report.push(
                    "snapshot.root_mismatch",
                    format!(
                        "snapshot {} no longer matches its first {} records",
                        record.id, snapshot.count
                    ),
                );
            }
        }

        report.valid = report.issues.is_empty();
        Ok(report)
    }

    /// Runs [`Ledger::verify`] and checks every cycle root; `deep` also checks
    /// prev-root links and cycle id continuity. A failed deep check engages
    /// safe mode.
    pub fn verify_chain(&mut self, deep: bool) -> Result<VerificationReport> {
        let mut report = self.verify()?;
        report.deep = deep;

        let cycles = self.cycles()?;
        let archived = self.archived_tail()?;
        report.cycles_checked = cycles.len();

        for (position, cycle) in cycles.iter().enumerate() {
            let recomputed = cycle.recompute_root();
            if recomputed != cycle.merkle_root {
                report.push(
                    "cycle.root_mismatch",
                    format!(
                        "cycle {} stores root {} but its phases fold to {}",
                        cycle.cycle_id, cycle.merkle_root, recomputed
                    ),
                );
            }

            if !deep {
                continue;
            }
            let previous = match position.checked_sub(1) {
                Some(index) => Some(&cycles[index]),
                None => archived.as_ref(),
            };
            if let Some(issue) = link_issue(previous, cycle) {
                report.push(issue.0, issue.1);
            }
        }

        report.valid = report.issues.is_empty();
        if deep && !report.valid {
            self.engage_safe_mode(&report.summary());
        }
        Ok(report)
    }

    /// Durable flush of the record and cycle logs.
    pub fn flush(&mut self) -> Result<()> {
        self.records.flush(true)?;
        self.cycles.flush(true)?;
        Ok(())
    }

    pub fn status(&self) -> Result<LedgerStatus> {
        let records = self.records()?;
        let cycles = self.cycles()?;
        let last = cycles.last();
        Ok(LedgerStatus {
            state: self.state.clone(),
            record_count: records.len(),
            cycle_count: cycles.len(),
            last_cycle_id: last.map(|cycle| cycle.cycle_id),
            last_merkle_root: last.map(|cycle| cycle.merkle_root.clone()),
            records_path: self.records.path().display().to_string(),
            cycles_path: self.cycles.path().display().to_string(),
        })
    }

    /// Corruption recovery: truncates the cycle log to its longest valid
    /// prefix and keeps the original file as `cycles.corrupt-<millis>.jsonl`.
    ///
    /// Safe mode stays engaged; reopening the ledger re-verifies the result.
    pub fn repair_chain(&mut self) -> Result<RepairReport> {
        let cycles = self.cycles()?;
        let archived = self.archived_tail()?;

        let mut kept = 0;
        for (position, cycle) in cycles.iter().enumerate() {
            let previous = match position.checked_sub(1) {
                Some(index) => Some(&cycles[index]),
                None => archived.as_ref(),
            };
            if cycle.recompute_root() != cycle.merkle_root
                || link_issue(previous, cycle).is_some()
            {
                break;
            }
            kept = position + 1;
        }

        let dropped = cycles.len() - kept;
        let raw_lines = self.cycles.read_all::<Value>()?.len();
        if dropped == 0 && raw_lines == cycles.len() {
            info!("cycle log already valid; nothing to repair");
            return Ok(RepairReport {
                kept_cycles: kept,
                dropped_cycles: 0,
                archived_to: None,
            });
        }

        let archived = self.cycles.copy_current("corrupt")?;
        let lines = cycles[..kept]
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
            .context("failed to re-encode retained cycles")?;
        self.cycles.replace_contents(&lines)?;
        self.reset_cycle_cache();

        warn!(
            kept,
            dropped,
            archived_to = ?archived,
            "truncated cycle log to last valid cycle"
        );
        Ok(RepairReport {
            kept_cycles: kept,
            dropped_cycles: dropped,
            archived_to: archived.map(|path| path.display().to_string()),
        })
    }

    fn last_cycle_anchor(&mut self) -> Result<Option<CycleAnchor>> {
        if let CycleCache::Loaded(anchor) = &self.last_cycle {
            return Ok(anchor.clone());
        }

        let last = match self.cycles()?.pop() {
            Some(cycle) => Some(cycle),
            None => self.archived_tail()?,
        };
        let anchor = last.map(|cycle| CycleAnchor {
            cycle_id: cycle.cycle_id,
            root: cycle.merkle_root,
        });
        debug!(loaded = ?anchor, "loaded last cycle root from disk");
        self.last_cycle = CycleCache::Loaded(anchor.clone());
        Ok(anchor)
    }

    /// Last readable cycle of the newest rotated archive that holds one.
    fn archived_tail(&self) -> Result<Option<CycleSummary>> {
        for archive in self.cycles.archives()?.into_iter().rev() {
            let reader = JsonlWriter::new(archive, WriterOptions::default());
            if let Some(cycle) = reader.read_all::<CycleSummary>()?.pop() {
                return Ok(Some(cycle));
            }
        }
        Ok(None)
    }
}

fn successor(cycle_id: u64) -> Result<u64, LedgerError> {
    cycle_id
        .checked_add(1)
        .ok_or_else(|| LedgerError::Validation(format!("cycle id {cycle_id} has no successor")))
}

/// Checks one cycle's link to its predecessor.
///
/// For the first cycle of the current file the predecessor is the last cycle
/// of the newest rotated archive; with no history at all it must be cycle 1
/// on the genesis root.
fn link_issue(
    previous: Option<&CycleSummary>,
    cycle: &CycleSummary,
) -> Option<(&'static str, String)> {
    match previous {
        Some(previous) => {
            if previous.cycle_id.checked_add(1) != Some(cycle.cycle_id) {
                return Some((
                    "cycle.sequence_gap",
                    format!(
                        "cycle {} follows cycle {}",
                        cycle.cycle_id, previous.cycle_id
                    ),
                ));
            }
            if cycle.prev_merkle_root != previous.merkle_root {
                return Some((
                    "cycle.link_broken",
                    format!(
                        "cycle {} links to {} but cycle {} has root {}",
                        cycle.cycle_id,
                        cycle.prev_merkle_root,
                        previous.cycle_id,
                        previous.merkle_root
                    ),
                ));
            }
            None
        }
        None if cycle.cycle_id == 1 => (cycle.prev_merkle_root != GENESIS_ROOT).then(|| {
            (
                "cycle.link_broken",
                format!(
                    "cycle 1 links to {} instead of the genesis root",
                    cycle.prev_merkle_root
                ),
            )
        }),
        None => Some((
            "cycle.sequence_gap",
            format!(
                "cycle log starts at cycle {} with no earlier history",
                cycle.cycle_id
            ),
        )),
    }
}
