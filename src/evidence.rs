//! Evidence log access.
//!
//! The controller reads three append-only JSONL streams produced by the
//! surrounding pipeline (executed trades, strategy signal outcomes, blocked
//! opportunities) and writes three of its own (decision log, knowledge
//! graph, incidents). One JSON record per line.
//!
//! Missing or unreadable input files are transient faults: they read as
//! empty evidence with a warning, and the cycle proceeds on fail-closed
//! defaults. Individual unparseable lines are skipped, counted, and
//! surfaced so the reconciler can raise a schema incident.

use crate::types::{
    AllocationDecision, BlockedOpportunity, ExecutionRecord, GateVerdict, Incident,
    SignalOutcomeRecord, Stage,
};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

/// Minimum spacing between repeated stream warnings. A bad input file is
/// re-read every cycle; without this the daemon warns on every tick.
const WARN_THROTTLE_SECS: u64 = 300;

pub const EXECUTED_TRADES_FILE: &str = "executed_trades.jsonl";
pub const STRATEGY_SIGNALS_FILE: &str = "strategy_signals.jsonl";
pub const BLOCKED_OPPORTUNITIES_FILE: &str = "blocked_opportunities.jsonl";
pub const LEARNING_UPDATES_FILE: &str = "learning_updates.jsonl";
pub const KNOWLEDGE_GRAPH_FILE: &str = "knowledge_graph.jsonl";
pub const INCIDENTS_FILE: &str = "incidents.jsonl";

/// Errors from appending to output streams.
#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("IO error on '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A batch of parsed records plus the count of lines that failed to parse.
#[derive(Debug)]
pub struct EvidenceBatch<T> {
    pub records: Vec<T>,
    /// Lines skipped because they did not match the record schema.
    pub malformed_lines: usize,
}

impl<T> EvidenceBatch<T> {
    fn empty() -> Self {
        Self {
            records: Vec::new(),
            malformed_lines: 0,
        }
    }
}

/// Rate limiter for warnings that would otherwise repeat every cycle,
/// counting what it suppresses.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last_emitted: Option<Instant>,
    suppressed: u64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emitted: None,
            suppressed: 0,
        }
    }

    /// Whether a message may be emitted now. A denied message is counted
    /// as suppressed.
    pub fn permit(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emitted {
            Some(last) if now.duration_since(last) < self.interval => {
                self.suppressed += 1;
                false
            }
            _ => {
                self.last_emitted = Some(now);
                true
            }
        }
    }

    /// Messages swallowed since the last emitted one, resetting the count.
    pub fn take_suppressed(&mut self) -> u64 {
        std::mem::take(&mut self.suppressed)
    }
}

/// Read-only access to the pipeline's evidence streams.
pub struct EvidenceReader {
    data_dir: PathBuf,
    warn_throttle: Mutex<LogThrottle>,
}

impl EvidenceReader {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            warn_throttle: Mutex::new(LogThrottle::new(Duration::from_secs(WARN_THROTTLE_SECS))),
        }
    }

    /// Executed trades with `timestamp >= since` (all records when `None`).
    pub fn executions(&self, since: Option<DateTime<Utc>>) -> EvidenceBatch<ExecutionRecord> {
        let mut batch = self.read_stream::<ExecutionRecord>(EXECUTED_TRADES_FILE);
        if let Some(since) = since {
            batch.records.retain(|r| r.timestamp >= since);
        }
        batch
    }

    /// Signal component outcomes with `timestamp >= since`.
    pub fn signal_outcomes(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> EvidenceBatch<SignalOutcomeRecord> {
        let mut batch = self.read_stream::<SignalOutcomeRecord>(STRATEGY_SIGNALS_FILE);
        if let Some(since) = since {
            batch.records.retain(|r| r.timestamp >= since);
        }
        batch
    }

    /// Blocked opportunities with `timestamp >= since`.
    pub fn blocked_opportunities(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> EvidenceBatch<BlockedOpportunity> {
        let mut batch = self.read_stream::<BlockedOpportunity>(BLOCKED_OPPORTUNITIES_FILE);
        if let Some(since) = since {
            batch.records.retain(|r| r.timestamp >= since);
        }
        batch
    }

    /// Timestamp of the newest executed trade, `None` when no evidence.
    pub fn latest_execution_at(&self) -> Option<DateTime<Utc>> {
        self.executions(None)
            .records
            .iter()
            .map(|r| r.timestamp)
            .max()
    }

    /// Timestamp of the newest signal outcome, `None` when no evidence.
    pub fn latest_signal_at(&self) -> Option<DateTime<Utc>> {
        self.signal_outcomes(None)
            .records
            .iter()
            .map(|r| r.timestamp)
            .max()
    }

    /// Recent incidents recorded by this controller, newest last.
    pub fn incidents(&self, limit: usize) -> Vec<Incident> {
        let batch = self.read_stream::<Incident>(INCIDENTS_FILE);
        let len = batch.records.len();
        batch.records.into_iter().skip(len.saturating_sub(limit)).collect()
    }

    fn throttled_warn(&self, emit: impl FnOnce(u64)) {
        if let Ok(mut throttle) = self.warn_throttle.lock() {
            if throttle.permit() {
                emit(throttle.take_suppressed());
            }
        }
    }

    fn read_stream<T: DeserializeOwned>(&self, file: &str) -> EvidenceBatch<T> {
        let path = self.data_dir.join(file);
        let handle = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return EvidenceBatch::empty();
            }
            Err(e) => {
                self.throttled_warn(|suppressed| {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        suppressed_warnings = suppressed,
                        "Evidence stream unreadable, treating as empty"
                    );
                });
                return EvidenceBatch::empty();
            }
        };

        let mut records = Vec::new();
        let mut malformed_lines = 0;
        for line in BufReader::new(handle).lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed reading evidence line, stopping");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(&line) {
                Ok(record) => records.push(record),
                Err(_) => malformed_lines += 1,
            }
        }

        if malformed_lines > 0 {
            self.throttled_warn(|suppressed| {
                warn!(
                    path = %path.display(),
                    skipped = malformed_lines,
                    suppressed_warnings = suppressed,
                    "Skipped malformed evidence lines"
                );
            });
        }

        EvidenceBatch {
            records,
            malformed_lines,
        }
    }
}

/// Causal audit triple written to the knowledge graph for every state
/// transition, incident, and revert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeTriple {
    pub timestamp: DateTime<Utc>,
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

impl KnowledgeTriple {
    pub fn new(
        timestamp: DateTime<Utc>,
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
        }
    }
}

/// One applied control-loop decision, written to `learning_updates.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub stage: Stage,
    pub throttle: f64,
    pub allowed_symbols: Vec<String>,
    pub gate_verdict: GateVerdict,
    pub allocations: Vec<AllocationDecision>,
    pub quarantined_now: Vec<String>,
    pub restored_now: Vec<String>,
}

/// Append-only JSONL writer for one controller output stream.
pub struct JsonlAppender {
    path: PathBuf,
}

impl JsonlAppender {
    pub fn new(data_dir: &Path, file: &str) -> Self {
        Self {
            path: data_dir.join(file),
        }
    }

    /// Append one record as a single JSON line, synced to disk.
    pub fn append<T: Serialize>(&self, record: &T) -> Result<(), EvidenceError> {
        let json = serde_json::to_string(record)?;
        let io_err = |source| EvidenceError::Io {
            path: self.path.display().to_string(),
            source,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        writeln!(file, "{json}").map_err(io_err)?;
        file.sync_data().map_err(io_err)?;
        Ok(())
    }
}
