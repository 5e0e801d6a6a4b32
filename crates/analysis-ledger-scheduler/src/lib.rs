//! Periodic analysis cycles over an append-only ledger.
//!
//! A [`CycleScheduler`] runs the registered phases in order, skips the work
//! when its input fingerprint is unchanged, and appends one chained cycle
//! summary per run. Timer ticks and manual triggers share one try-lock, so at
//! most one cycle executes at a time and a trigger that arrives mid-cycle is
//! dropped rather than queued.

#![allow(clippy::missing_errors_doc)]

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use analysis_ledger_core::{
    empty_batch_hash, hash_batch, now_utc, CycleInput, LedgerError, LedgerState, LogRecord,
    PhaseDigest, PhaseDigests, PhaseResult, PHASE_KIND_PREFIX,
};
use analysis_ledger_journal::{
    AppendOptions, JsonlWriter, WriterOptions, DEFAULT_BULK_FLUSH_LINES,
    DEFAULT_EAGER_FLUSH_LINES, DEFAULT_MAX_BYTES,
};
use analysis_ledger_store::{Ledger, LedgerOptions, VerificationReport};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

pub const TRACES_FILE: &str = "traces.jsonl";
pub const DEFAULT_INTERVAL_SECS: u64 = 6 * 60 * 60;
pub const MIN_PRODUCTION_INTERVAL_SECS: u64 = 60;

pub const STANDARD_PHASES: [&str; 4] = [
    "pattern_detection",
    "correlation",
    "forecasting",
    "decision_synthesis",
];

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
    /// Allows sub-minute intervals. Never set in production.
    pub test_mode: bool,
    pub rotation_max_bytes: u64,
    pub eager_flush_lines: usize,
    pub bulk_flush_lines: usize,
    pub log_level: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL_SECS,
            test_mode: false,
            rotation_max_bytes: DEFAULT_MAX_BYTES,
            eager_flush_lines: DEFAULT_EAGER_FLUSH_LINES,
            bulk_flush_lines: DEFAULT_BULK_FLUSH_LINES,
            log_level: "info".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when a field is out of range.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.interval_secs == 0 {
            return Err(LedgerError::Configuration(
                "interval_secs MUST be > 0".to_string(),
            ));
        }
        if self.interval_secs < MIN_PRODUCTION_INTERVAL_SECS && !self.test_mode {
            return Err(LedgerError::Configuration(format!(
                "interval_secs={} is below {MIN_PRODUCTION_INTERVAL_SECS}; set test_mode to allow it",
                self.interval_secs
            )));
        }
        if self.rotation_max_bytes == 0 {
            return Err(LedgerError::Configuration(
                "rotation_max_bytes MUST be > 0".to_string(),
            ));
        }
        if self.eager_flush_lines == 0 || self.bulk_flush_lines == 0 {
            return Err(LedgerError::Configuration(
                "flush thresholds MUST be >= 1".to_string(),
            ));
        }
        if self.eager_flush_lines > self.bulk_flush_lines {
            return Err(LedgerError::Configuration(format!(
                "eager_flush_lines={} MUST NOT exceed bulk_flush_lines={}",
                self.eager_flush_lines, self.bulk_flush_lines
            )));
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(LedgerError::Configuration(format!(
                "unsupported log_level: {}",
                self.log_level
            )));
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`LedgerError::Configuration`] for malformed or invalid input.
    pub fn from_json(value: &Value) -> Result<Self, LedgerError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            LedgerError::Configuration(format!("invalid scheduler config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let value: Value = serde_json::from_str(&body)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(Self::from_json(&value)?)
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    #[must_use]
    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            max_bytes: self.rotation_max_bytes,
            eager_flush_lines: self.eager_flush_lines,
            bulk_flush_lines: self.bulk_flush_lines,
        }
    }

    #[must_use]
    pub fn ledger_options(&self) -> LedgerOptions {
        LedgerOptions {
            writer: self.writer_options(),
        }
    }
}

/// Inputs visible to one phase execution.
#[derive(Debug, Clone, Copy)]
pub struct PhaseContext<'a> {
    /// Id the cycle will carry if its summary is appended.
    pub cycle_id: u64,
    pub history: &'a [LogRecord],
    pub events: &'a [Value],
    /// Outputs of the phases that already succeeded in this cycle, in order.
    pub prior: &'a [(String, PhaseOutput)],
}

impl PhaseContext<'_> {
    #[must_use]
    pub fn prior_output(&self, name: &str) -> Option<&PhaseOutput> {
        self.prior
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, output)| output)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseOutput {
    pub result_hash: String,
    pub items: Vec<Value>,
}

impl PhaseOutput {
    /// Builds an output whose hash is the batch hash of `items`.
    pub fn from_items(items: Vec<Value>) -> Result<Self> {
        let result_hash = hash_batch(&items)?;
        Ok(Self { result_hash, items })
    }

    #[must_use]
    pub fn item_count(&self) -> u64 {
        u64::try_from(self.items.len()).unwrap_or(u64::MAX)
    }
}

/// One stage of the analysis pipeline.
pub trait Phase: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput>;
}

/// Reference executor that emits one item fingerprinting everything it read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestPhase {
    name: String,
}

impl DigestPhase {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl Phase for DigestPhase {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput> {
        let history = ctx
            .history
            .iter()
            .map(|record| Value::String(record.hash.clone()))
            .collect::<Vec<_>>();
        let upstream = ctx
            .prior
            .iter()
            .map(|(name, output)| json!({"phase": name, "resultHash": output.result_hash}))
            .collect::<Vec<_>>();

        PhaseOutput::from_items(vec![json!({
            "phase": self.name,
            "cycleId": ctx.cycle_id,
            "historyCount": ctx.history.len(),
            "historyHash": hash_batch(&history)?,
            "eventsHash": hash_batch(ctx.events)?,
            "upstream": upstream,
        })])
    }
}

/// Ordered phase pipeline, fixed at startup.
#[derive(Default)]
pub struct PhaseRegistry {
    phases: Vec<Box<dyn Phase>>,
}

impl std::fmt::Debug for PhaseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl PhaseRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The default four-stage pipeline backed by [`DigestPhase`].
    #[must_use]
    pub fn standard() -> Self {
        Self {
            phases: STANDARD_PHASES
                .iter()
                .map(|name| Box::new(DigestPhase::new(name)) as Box<dyn Phase>)
                .collect(),
        }
    }

    /// # Errors
    /// Returns [`LedgerError::Configuration`] for empty or duplicate names.
    pub fn register(&mut self, phase: Box<dyn Phase>) -> Result<(), LedgerError> {
        let name = phase.name();
        if name.trim().is_empty() {
            return Err(LedgerError::Configuration(
                "phase name MUST be non-empty".to_string(),
            ));
        }
        if self.phases.iter().any(|existing| existing.name() == name) {
            return Err(LedgerError::Configuration(format!(
                "phase already registered: {name}"
            )));
        }
        self.phases.push(phase);
        Ok(())
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.phases
            .iter()
            .map(|phase| phase.name().to_string())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Phase> {
        self.phases.iter().map(AsRef::as_ref)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

/// Supplier of recent external events folded into the input fingerprint.
pub trait EventSource: Send + Sync {
    fn recent_events(&self) -> Result<Vec<Value>>;
}

impl<T: EventSource + ?Sized> EventSource for Arc<T> {
    fn recent_events(&self) -> Result<Vec<Value>> {
        (**self).recent_events()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoEvents;

impl EventSource for NoEvents {
    fn recent_events(&self) -> Result<Vec<Value>> {
        Ok(Vec::new())
    }
}

/// In-memory event list; hosts push events between cycles.
#[derive(Debug, Default)]
pub struct StaticEvents {
    events: Mutex<Vec<Value>>,
}

impl StaticEvents {
    #[must_use]
    pub fn new(events: Vec<Value>) -> Self {
        Self {
            events: Mutex::new(events),
        }
    }

    pub fn push(&self, event: Value) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl EventSource for StaticEvents {
    fn recent_events(&self) -> Result<Vec<Value>> {
        Ok(self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// Hash over everything the phases of a cycle read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFingerprint(String);

impl InputFingerprint {
    /// `history` must already exclude records written by the pipeline itself;
    /// see [`analysis_inputs`].
    pub fn compute(history: &[LogRecord], events: &[Value]) -> Result<Self> {
        let hashes = history
            .iter()
            .map(|record| Value::String(record.hash.clone()))
            .collect::<Vec<_>>();
        Ok(Self(hash_batch(&[
            Value::Array(hashes),
            Value::Array(events.to_vec()),
        ])?))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InputFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Drops phase outputs and Merkle snapshots; a cycle's own writes must not
/// change the next cycle's fingerprint.
#[must_use]
pub fn analysis_inputs(records: Vec<LogRecord>) -> Vec<LogRecord> {
    records
        .into_iter()
        .filter(|record| !record.is_phase_output() && !record.is_snapshot())
        .collect()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyRunning,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CycleOutcome {
    Skipped {
        reason: SkipReason,
    },
    Noop {
        cycle_id: u64,
        merkle_root: String,
    },
    Completed {
        cycle_id: u64,
        merkle_root: String,
        phase_failures: usize,
    },
    Failed {
        reason: String,
    },
}

impl CycleOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped { .. } => "skipped",
            Self::Noop { .. } => "noop",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }

    #[must_use]
    pub fn cycle_id(&self) -> Option<u64> {
        match self {
            Self::Noop { cycle_id, .. } | Self::Completed { cycle_id, .. } => Some(*cycle_id),
            Self::Skipped { .. } | Self::Failed { .. } => None,
        }
    }
}

/// One line of `traces.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CycleTrace {
    pub cycle_id: Option<u64>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub fingerprint: Option<String>,
    pub outcome: String,
    pub duration_ms: u64,
    pub phases: Vec<PhaseResult>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct CycleTimer {
    started: Instant,
}

impl CycleTimer {
    #[must_use]
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
pub struct HealthMonitor {
    cycles_total: AtomicU64,
    cycles_completed: AtomicU64,
    cycles_noop: AtomicU64,
    cycles_failed: AtomicU64,
    cycles_skipped: AtomicU64,
    phase_failures_total: AtomicU64,
    consecutive_failures: AtomicU64,
    last_duration_ms: AtomicU64,
    last_cycle_id: AtomicU64,
    safe_mode: AtomicBool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub status: String,
    pub safe_mode: bool,
    pub cycles_total: u64,
    pub cycles_completed: u64,
    pub cycles_noop: u64,
    pub cycles_failed: u64,
    pub cycles_skipped: u64,
    pub phase_failures_total: u64,
    pub consecutive_failures: u64,
    pub last_duration_ms: u64,
    pub last_cycle_id: Option<u64>,
}

impl HealthMonitor {
    /// Rebuilds counters from persisted traces, oldest first.
    #[must_use]
    pub fn from_traces(traces: &[CycleTrace]) -> Self {
        let monitor = Self::default();
        for trace in traces {
            monitor.record_trace(trace);
        }
        monitor
    }

    pub fn record_trace(&self, trace: &CycleTrace) {
        self.cycles_total.fetch_add(1, Ordering::Relaxed);
        match trace.outcome.as_str() {
            "completed" => {
                self.cycles_completed.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            "noop" => {
                self.cycles_noop.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            _ => {
                self.cycles_failed.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        let phase_failures = trace.phases.iter().filter(|phase| !phase.success).count();
        self.phase_failures_total.fetch_add(
            u64::try_from(phase_failures).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        self.last_duration_ms
            .store(trace.duration_ms, Ordering::Relaxed);
        if let Some(cycle_id) = trace.cycle_id {
            self.last_cycle_id.store(cycle_id, Ordering::Relaxed);
        }
    }

    pub fn record_skip(&self) {
        self.cycles_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_safe_mode(&self, engaged: bool) {
        self.safe_mode.store(engaged, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> HealthSnapshot {
        let safe_mode = self.safe_mode.load(Ordering::Relaxed);
        let consecutive_failures = self.consecutive_failures.load(Ordering::Relaxed);
        let status = if safe_mode {
            "safe_mode"
        } else if consecutive_failures > 0 {
            "degraded"
        } else {
            "healthy"
        };
        let last_cycle_id = self.last_cycle_id.load(Ordering::Relaxed);

        HealthSnapshot {
            status: status.to_string(),
            safe_mode,
            cycles_total: self.cycles_total.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_noop: self.cycles_noop.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            phase_failures_total: self.phase_failures_total.load(Ordering::Relaxed),
            consecutive_failures,
            last_duration_ms: self.last_duration_ms.load(Ordering::Relaxed),
            last_cycle_id: (last_cycle_id > 0).then_some(last_cycle_id),
        }
    }
}

struct SchedulerState {
    ledger: Ledger,
    traces: JsonlWriter,
    last_fingerprint: Option<InputFingerprint>,
}

#[derive(Default)]
struct CycleRun {
    fingerprint: Option<String>,
    phases: Vec<PhaseResult>,
}

pub struct CycleScheduler {
    state: Mutex<SchedulerState>,
    registry: PhaseRegistry,
    events: Box<dyn EventSource>,
    health: Arc<HealthMonitor>,
}

impl CycleScheduler {
    /// Wraps an already-bootstrapped ledger. Traces go to `traces.jsonl` in
    /// the ledger directory.
    #[must_use]
    pub fn new(
        ledger: Ledger,
        registry: PhaseRegistry,
        events: Box<dyn EventSource>,
        writer: WriterOptions,
    ) -> Self {
        let traces = JsonlWriter::new(ledger.dir().join(TRACES_FILE), writer);
        let health = Arc::new(HealthMonitor::default());
        health.set_safe_mode(ledger.is_safe_mode());
        Self {
            state: Mutex::new(SchedulerState {
                ledger,
                traces,
                last_fingerprint: None,
            }),
            registry,
            events,
            health,
        }
    }

    /// Opens the ledger under `dir`, runs the startup verification, and
    /// returns the scheduler with the verification report.
    pub fn open(
        dir: &Path,
        config: &SchedulerConfig,
        registry: PhaseRegistry,
        events: Box<dyn EventSource>,
    ) -> Result<(Self, VerificationReport)> {
        let mut ledger = Ledger::open(dir, config.ledger_options())?;
        let report = ledger.bootstrap()?;
        if !report.valid {
            error!(
                dir = %dir.display(),
                reason = %report.summary(),
                "startup verification failed; cycles are disabled"
            );
        }
        let scheduler = Self::new(ledger, registry, events, config.writer_options());
        Ok((scheduler, report))
    }

    #[must_use]
    pub fn health(&self) -> Arc<HealthMonitor> {
        Arc::clone(&self.health)
    }

    #[must_use]
    pub fn registry(&self) -> &PhaseRegistry {
        &self.registry
    }

    /// Runs `f` against the ledger, waiting for any running cycle to finish.
    pub fn with_ledger<R>(&self, f: impl FnOnce(&mut Ledger) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state.ledger)
    }

    /// Timer entry point. Returns immediately with `Skipped` when a cycle is
    /// already running.
    pub fn trigger(&self) -> CycleOutcome {
        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::WouldBlock) => {
                info!("cycle already running; trigger dropped");
                self.health.record_skip();
                return CycleOutcome::Skipped {
                    reason: SkipReason::AlreadyRunning,
                };
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                warn!("previous cycle panicked; recovering scheduler state");
                poisoned.into_inner()
            }
        };
        self.run_locked(&mut state)
    }

    /// Manual trigger; shares the reentrancy guard with the timer.
    pub fn run_cycle(&self) -> CycleOutcome {
        self.trigger()
    }

    fn run_locked(&self, state: &mut SchedulerState) -> CycleOutcome {
        let timer = CycleTimer::start();
        let mut run = CycleRun::default();

        let outcome = match self.execute(state, &mut run) {
            Ok(outcome) => outcome,
            Err(err) => {
                let reason = format!("{err:#}");
                error!(error = %reason, "cycle failed");
                CycleOutcome::Failed { reason }
            }
        };

        let trace = CycleTrace {
            cycle_id: outcome.cycle_id(),
            timestamp: now_utc(),
            fingerprint: run.fingerprint,
            outcome: outcome.as_str().to_string(),
            duration_ms: timer.elapsed_ms(),
            phases: run.phases,
            error: match &outcome {
                CycleOutcome::Failed { reason } => Some(reason.clone()),
                _ => None,
            },
        };
        let trace_opts = AppendOptions {
            flush: true,
            fsync: false,
        };
        if let Err(err) = state.traces.append(&trace, trace_opts) {
            warn!(error = %err, "failed to write cycle trace");
        }

        self.health.set_safe_mode(state.ledger.is_safe_mode());
        self.health.record_trace(&trace);
        info!(
            outcome = outcome.as_str(),
            cycle_id = ?trace.cycle_id,
            duration_ms = trace.duration_ms,
            "cycle finished"
        );
        outcome
    }

    fn execute(&self, state: &mut SchedulerState, run: &mut CycleRun) -> Result<CycleOutcome> {
        match state.ledger.state() {
            LedgerState::Active => {}
            LedgerState::SafeMode(reason) => {
                return Err(LedgerError::SafeMode(reason.clone()).into());
            }
            LedgerState::Uninitialized => return Err(LedgerError::NotInitialized.into()),
        }

        let events = self.events.recent_events().unwrap_or_else(|err| {
            warn!(error = %err, "event source unavailable; continuing without events");
            Vec::new()
        });
        let history = match state.ledger.records() {
            Ok(records) => analysis_inputs(records),
            Err(err) => {
                warn!(error = %err, "failed to read ledger history; continuing without it");
                Vec::new()
            }
        };

        let fingerprint = InputFingerprint::compute(&history, &events)?;
        run.fingerprint = Some(fingerprint.to_string());

        if state.last_fingerprint.as_ref() == Some(&fingerprint) {
            debug!(%fingerprint, "inputs unchanged; recording no-op cycle");
            let summary = state.ledger.append_cycle(&self.noop_input()?)?;
            return Ok(CycleOutcome::Noop {
                cycle_id: summary.cycle_id,
                merkle_root: summary.merkle_root,
            });
        }

        let cycle_id = state.ledger.next_cycle_id()?;
        let input = self.run_phases(&mut state.ledger, run, cycle_id, &history, &events)?;
        // Phase outputs must be on disk before the summary that commits them.
        state.ledger.flush()?;
        let summary = state.ledger.append_cycle(&input)?;
        state.last_fingerprint = Some(fingerprint);

        Ok(CycleOutcome::Completed {
            cycle_id: summary.cycle_id,
            merkle_root: summary.merkle_root,
            phase_failures: run.phases.iter().filter(|phase| !phase.success).count(),
        })
    }

    fn run_phases(
        &self,
        ledger: &mut Ledger,
        run: &mut CycleRun,
        cycle_id: u64,
        history: &[LogRecord],
        events: &[Value],
    ) -> Result<CycleInput> {
        let mut digests = PhaseDigests::new();
        let mut outputs: Vec<(String, PhaseOutput)> = Vec::with_capacity(self.registry.len());

        for phase in self.registry.iter() {
            let name = phase.name();
            let timer = CycleTimer::start();
            let ctx = PhaseContext {
                cycle_id,
                history,
                events,
                prior: &outputs,
            };
            let executed = phase.execute(&ctx).and_then(|output| {
                persist_output(ledger, cycle_id, name, &output)?;
                Ok(output)
            });
            let duration_ms = timer.elapsed_ms();

            match executed {
                Ok(output) => {
                    let count = output.item_count();
                    debug!(cycle_id, phase = name, duration_ms, items = count, "phase succeeded");
                    digests.push(
                        name,
                        PhaseDigest {
                            hash: output.result_hash.clone(),
                            count,
                        },
                    )?;
                    run.phases
                        .push(PhaseResult::succeeded(name, duration_ms, count));
                    outputs.push((name.to_string(), output));
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(
                        cycle_id,
                        phase = name,
                        error = %message,
                        "phase failed; contributing empty result"
                    );
                    digests.push(
                        name,
                        PhaseDigest {
                            hash: empty_batch_hash(),
                            count: 0,
                        },
                    )?;
                    run.phases
                        .push(PhaseResult::failed(name, duration_ms, message));
                }
            }
        }

        Ok(CycleInput { phases: digests })
    }

    fn noop_input(&self) -> Result<CycleInput> {
        let mut phases = PhaseDigests::new();
        for phase in self.registry.iter() {
            phases.push(
                phase.name(),
                PhaseDigest {
                    hash: empty_batch_hash(),
                    count: 0,
                },
            )?;
        }
        Ok(CycleInput { phases })
    }
}

fn persist_output(
    ledger: &mut Ledger,
    cycle_id: u64,
    name: &str,
    output: &PhaseOutput,
) -> Result<()> {
    let kind = format!("{PHASE_KIND_PREFIX}{name}");
    ledger
        .append(
            &kind,
            json!({
                "cycleId": cycle_id,
                "resultHash": output.result_hash,
                "items": output.items,
            }),
        )
        .with_context(|| format!("failed to persist {kind} output"))?;
    Ok(())
}

/// Handle to the background timer thread started by [`spawn_timer`].
///
/// Dropping the handle stops the timer and waits for an in-flight cycle.
#[derive(Debug)]
pub struct TimerHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<u64>>,
}

impl TimerHandle {
    /// Stops the timer and returns the number of ticks it fired.
    pub fn stop(mut self) -> Result<u64> {
        self.stop.take();
        self.join_thread()
    }

    /// Waits for a timer started with `max_ticks` to fire all its ticks.
    pub fn join(mut self) -> Result<u64> {
        self.join_thread()
    }

    fn join_thread(&mut self) -> Result<u64> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| anyhow!("cycle timer thread panicked")),
            None => Ok(0),
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.stop.take();
        if let Err(err) = self.join_thread() {
            warn!(error = %err, "cycle timer did not shut down cleanly");
        }
    }
}

/// Calls [`CycleScheduler::trigger`] every `interval` until stopped, or until
/// `max_ticks` ticks have fired.
pub fn spawn_timer(
    scheduler: Arc<CycleScheduler>,
    interval: Duration,
    max_ticks: Option<u64>,
) -> Result<TimerHandle> {
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let thread = thread::Builder::new()
        .name("cycle-timer".to_string())
        .spawn(move || {
            let mut ticks = 0_u64;
            while !max_ticks.is_some_and(|max| ticks >= max) {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let outcome = scheduler.trigger();
                        ticks += 1;
                        debug!(ticks, outcome = outcome.as_str(), "timer tick");
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            ticks
        })
        .context("failed to spawn cycle timer thread")?;

    info!(?interval, ?max_ticks, "cycle timer started");
    Ok(TimerHandle {
        stop: Some(stop_tx),
        thread: Some(thread),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use analysis_ledger_core::CycleSummary;
    use analysis_ledger_store::RECORDS_FILE;
    use std::path::PathBuf;
    use std::sync::mpsc::Receiver;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn temp_dir(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("scheduler-{label}-{}", Ulid::new()))
    }

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            interval_secs: 1,
            test_mode: true,
            ..SchedulerConfig::default()
        }
    }

    fn scheduler_in(
        dir: &Path,
        registry: PhaseRegistry,
        events: Box<dyn EventSource>,
    ) -> CycleScheduler {
        let (scheduler, report) = must(CycleScheduler::open(dir, &test_config(), registry, events));
        assert!(report.valid, "fixture ledger must verify: {}", report.summary());
        scheduler
    }

    fn cycles(scheduler: &CycleScheduler) -> Vec<CycleSummary> {
        must(scheduler.with_ledger(|ledger| ledger.cycles()))
    }

    fn traces(dir: &Path) -> Vec<CycleTrace> {
        let writer = JsonlWriter::new(dir.join(TRACES_FILE), WriterOptions::default());
        must(writer.read_all())
    }

    struct FailingPhase;

    impl Phase for FailingPhase {
        fn name(&self) -> &str {
            "correlation"
        }

        fn execute(&self, _ctx: &PhaseContext<'_>) -> Result<PhaseOutput> {
            Err(anyhow!("upstream model unavailable"))
        }
    }

    struct UpstreamCountPhase;

    impl Phase for UpstreamCountPhase {
        fn name(&self) -> &str {
            "forecasting"
        }

        fn execute(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput> {
            PhaseOutput::from_items(
                ctx.prior
                    .iter()
                    .map(|(name, _)| json!({"upstream": name}))
                    .collect(),
            )
        }
    }

    struct BlockingPhase {
        started: Mutex<Sender<()>>,
        release: Mutex<Receiver<()>>,
    }

    impl Phase for BlockingPhase {
        fn name(&self) -> &str {
            "blocking"
        }

        fn execute(&self, _ctx: &PhaseContext<'_>) -> Result<PhaseOutput> {
            let _ = self
                .started
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .send(());
            let _ = self
                .release
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .recv_timeout(Duration::from_secs(10));
            PhaseOutput::from_items(Vec::new())
        }
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config = must_ok(SchedulerConfig::from_json(&json!({"interval_secs": 3600})));
        assert_eq!(config.interval(), Duration::from_secs(3600));
        assert_eq!(config.rotation_max_bytes, DEFAULT_MAX_BYTES);
        assert_eq!(config.eager_flush_lines, 10);
        assert_eq!(config.bulk_flush_lines, 1_000);
        assert_eq!(config.log_level, "info");
        assert_eq!(
            must_ok(SchedulerConfig::from_json(&json!({}))).interval_secs,
            DEFAULT_INTERVAL_SECS
        );
    }

    #[test]
    fn config_rejects_sub_minute_interval_without_test_mode() {
        let rejected = SchedulerConfig::from_json(&json!({"interval_secs": 5}));
        assert!(matches!(rejected, Err(LedgerError::Configuration(_))));

        let allowed = must_ok(SchedulerConfig::from_json(
            &json!({"interval_secs": 5, "test_mode": true}),
        ));
        assert!(allowed.test_mode);
    }

    #[test]
    fn config_rejects_bad_thresholds_levels_and_unknown_fields() {
        for payload in [
            json!({"interval_secs": 0, "test_mode": true}),
            json!({"eager_flush_lines": 0}),
            json!({"eager_flush_lines": 50, "bulk_flush_lines": 10}),
            json!({"rotation_max_bytes": 0}),
            json!({"log_level": "loud"}),
            json!({"interval": 60}),
        ] {
            assert!(
                SchedulerConfig::from_json(&payload).is_err(),
                "payload should be rejected: {payload}"
            );
        }
    }

    #[test]
    fn config_load_reads_file() {
        let dir = temp_dir("config");
        must_ok(fs::create_dir_all(&dir));
        let path = dir.join("scheduler.json");
        must_ok(fs::write(
            &path,
            r#"{"interval_secs": 120, "log_level": "debug", "rotation_max_bytes": 1024}"#,
        ));

        let config = must(SchedulerConfig::load(&path));
        assert_eq!(config.interval_secs, 120);
        assert_eq!(config.writer_options().max_bytes, 1024);
        assert!(SchedulerConfig::load(&dir.join("missing.json")).is_err());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn registry_rejects_duplicate_phase_names() {
        let mut registry = PhaseRegistry::standard();
        assert_eq!(registry.names(), STANDARD_PHASES.map(str::to_string).to_vec());
        assert!(registry
            .register(Box::new(DigestPhase::new("forecasting")))
            .is_err());
        assert!(registry.register(Box::new(DigestPhase::new(" "))).is_err());
        must_ok(registry.register(Box::new(DigestPhase::new("audit"))));
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn unchanged_inputs_record_a_noop_cycle() {
        let dir = temp_dir("idempotent");
        let scheduler = scheduler_in(&dir, PhaseRegistry::standard(), Box::new(NoEvents));
        let _ = must(scheduler.with_ledger(|ledger| ledger.append("pattern", json!({"a": 1}))));

        let first = scheduler.trigger();
        let second = scheduler.run_cycle();
        assert!(matches!(first, CycleOutcome::Completed { cycle_id: 1, phase_failures: 0, .. }));
        assert!(matches!(second, CycleOutcome::Noop { cycle_id: 2, .. }));

        let stored = cycles(&scheduler);
        assert_eq!(stored.len(), 2);
        assert!(stored[0]
            .phases
            .iter()
            .all(|(_, digest)| digest.count == 1 && digest.hash != empty_batch_hash()));
        assert_eq!(stored[1].phases.len(), STANDARD_PHASES.len());
        assert!(stored[1]
            .phases
            .iter()
            .all(|(_, digest)| digest.count == 0 && digest.hash == empty_batch_hash()));
        assert_eq!(stored[1].prev_merkle_root, stored[0].merkle_root);

        let records = must(scheduler.with_ledger(|ledger| ledger.records()));
        let phase_records = records
            .iter()
            .filter(|record| record.is_phase_output())
            .count();
        assert_eq!(phase_records, STANDARD_PHASES.len());

        let lines = traces(&dir);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].outcome, "completed");
        assert_eq!(lines[1].outcome, "noop");
        assert_eq!(lines[0].fingerprint, lines[1].fingerprint);
        assert!(lines[1].phases.is_empty());

        drop(scheduler);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn phase_outputs_are_on_disk_when_the_cycle_commits() {
        let dir = temp_dir("durable-phases");
        let scheduler = scheduler_in(&dir, PhaseRegistry::standard(), Box::new(NoEvents));
        let _ = must(scheduler.with_ledger(|ledger| ledger.append("pattern", json!({"a": 1}))));

        assert!(matches!(scheduler.trigger(), CycleOutcome::Completed { cycle_id: 1, .. }));

        // A fresh reader sees only what reached the file, not the writer's buffer.
        let on_disk = JsonlWriter::new(dir.join(RECORDS_FILE), WriterOptions::default());
        let records: Vec<LogRecord> = must(on_disk.read_all());
        assert_eq!(records.len(), 1 + STANDARD_PHASES.len());
        let phase_cycles = records
            .iter()
            .filter(|record| record.is_phase_output())
            .map(|record| record.data["cycleId"].as_u64())
            .collect::<Vec<_>>();
        assert_eq!(phase_cycles, vec![Some(1); STANDARD_PHASES.len()]);

        drop(scheduler);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn new_history_or_events_rerun_the_phases() {
        let dir = temp_dir("fingerprint");
        let events = Arc::new(StaticEvents::default());
        let scheduler = scheduler_in(
            &dir,
            PhaseRegistry::standard(),
            Box::new(Arc::clone(&events)),
        );

        assert!(matches!(scheduler.trigger(), CycleOutcome::Completed { .. }));
        assert!(matches!(scheduler.trigger(), CycleOutcome::Noop { .. }));

        let _ = must(scheduler.with_ledger(|ledger| ledger.append("note", json!({"n": 1}))));
        assert!(matches!(scheduler.trigger(), CycleOutcome::Completed { .. }));

        // Snapshots are bookkeeping, not inputs.
        let _ = must(scheduler.with_ledger(Ledger::snapshot));
        assert!(matches!(scheduler.trigger(), CycleOutcome::Noop { .. }));

        events.push(json!({"kind": "file_changed", "path": "notes.md"}));
        assert!(matches!(scheduler.trigger(), CycleOutcome::Completed { .. }));

        drop(scheduler);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn failing_phase_contributes_empty_result_and_pipeline_continues() {
        let dir = temp_dir("phase-failure");
        let mut registry = PhaseRegistry::new();
        must_ok(registry.register(Box::new(DigestPhase::new("pattern_detection"))));
        must_ok(registry.register(Box::new(FailingPhase)));
        must_ok(registry.register(Box::new(UpstreamCountPhase)));
        let scheduler = scheduler_in(&dir, registry, Box::new(NoEvents));

        let outcome = scheduler.trigger();
        assert!(matches!(
            outcome,
            CycleOutcome::Completed {
                cycle_id: 1,
                phase_failures: 1,
                ..
            }
        ));

        let stored = cycles(&scheduler);
        let correlation = match stored[0].phases.get("correlation") {
            Some(digest) => digest.clone(),
            None => panic!("expected correlation digest"),
        };
        assert_eq!(correlation.hash, empty_batch_hash());
        assert_eq!(correlation.count, 0);
        // Only the successful upstream phase is visible downstream.
        assert_eq!(
            stored[0].phases.get("forecasting").map(|digest| digest.count),
            Some(1)
        );

        let lines = traces(&dir);
        let failed = &lines[0].phases[1];
        assert!(!failed.success);
        assert_eq!(failed.item_count, 0);
        assert!(failed
            .error
            .as_deref()
            .is_some_and(|message| message.contains("upstream model unavailable")));
        assert!(lines[0].phases[2].success);

        let health = scheduler.health().snapshot();
        assert_eq!(health.phase_failures_total, 1);
        assert_eq!(health.status, "healthy");

        drop(scheduler);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn trigger_during_running_cycle_is_dropped() {
        let dir = temp_dir("reentrancy");
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let mut registry = PhaseRegistry::new();
        must_ok(registry.register(Box::new(BlockingPhase {
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
        })));
        let scheduler = Arc::new(scheduler_in(&dir, registry, Box::new(NoEvents)));

        let worker = {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || scheduler.trigger())
        };
        must_ok(started_rx.recv_timeout(Duration::from_secs(10)));

        assert_eq!(
            scheduler.trigger(),
            CycleOutcome::Skipped {
                reason: SkipReason::AlreadyRunning
            }
        );
        must_ok(release_tx.send(()));

        let first = match worker.join() {
            Ok(outcome) => outcome,
            Err(_) => panic!("worker thread panicked"),
        };
        assert!(matches!(first, CycleOutcome::Completed { cycle_id: 1, .. }));
        assert_eq!(cycles(&scheduler).len(), 1);

        let health = scheduler.health().snapshot();
        assert_eq!(health.cycles_total, 1);
        assert_eq!(health.cycles_skipped, 1);

        drop(scheduler);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn safe_mode_fails_cycles_without_touching_the_chain() {
        let dir = temp_dir("safe-mode");
        let scheduler = scheduler_in(&dir, PhaseRegistry::standard(), Box::new(NoEvents));
        assert!(matches!(scheduler.trigger(), CycleOutcome::Completed { .. }));

        scheduler.with_ledger(|ledger| ledger.engage_safe_mode("integrity drill"));
        for _ in 0..2 {
            match scheduler.trigger() {
                CycleOutcome::Failed { reason } => assert!(reason.contains("safe mode")),
                other => panic!("expected failed cycle, got {other:?}"),
            }
        }
        assert_eq!(cycles(&scheduler).len(), 1);

        let health = scheduler.health().snapshot();
        assert!(health.safe_mode);
        assert_eq!(health.status, "safe_mode");
        assert_eq!(health.cycles_failed, 2);
        assert_eq!(health.consecutive_failures, 2);
        assert_eq!(health.last_cycle_id, Some(1));

        let lines = traces(&dir);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2].outcome, "failed");
        assert!(lines[2].cycle_id.is_none());
        assert!(lines[2].error.is_some());

        drop(scheduler);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn health_can_be_rebuilt_from_traces() {
        let dir = temp_dir("health-replay");
        let scheduler = scheduler_in(&dir, PhaseRegistry::standard(), Box::new(NoEvents));
        let _ = scheduler.trigger();
        let _ = scheduler.trigger();
        let live = scheduler.health().snapshot();

        let replayed = HealthMonitor::from_traces(&traces(&dir)).snapshot();
        assert_eq!(replayed.cycles_total, live.cycles_total);
        assert_eq!(replayed.cycles_completed, 1);
        assert_eq!(replayed.cycles_noop, 1);
        assert_eq!(replayed.last_cycle_id, Some(2));

        drop(scheduler);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn timer_fires_until_max_ticks() {
        let dir = temp_dir("timer");
        let scheduler = Arc::new(scheduler_in(
            &dir,
            PhaseRegistry::standard(),
            Box::new(NoEvents),
        ));

        let handle = must(spawn_timer(
            Arc::clone(&scheduler),
            Duration::from_millis(10),
            Some(3),
        ));
        assert_eq!(must(handle.join()), 3);

        let stored = cycles(&scheduler);
        assert_eq!(stored.len(), 3);
        assert_eq!(scheduler.health().snapshot().cycles_noop, 2);

        drop(scheduler);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn stopped_timer_fires_no_more_ticks() {
        let dir = temp_dir("timer-stop");
        let scheduler = Arc::new(scheduler_in(
            &dir,
            PhaseRegistry::standard(),
            Box::new(NoEvents),
        ));

        let handle = must(spawn_timer(
            Arc::clone(&scheduler),
            Duration::from_secs(3600),
            None,
        ));
        assert_eq!(must(handle.stop()), 0);
        assert!(cycles(&scheduler).is_empty());

        drop(scheduler);
        let _ = fs::remove_dir_all(&dir);
    }
}
