//! Per-stage artifact files and the per-run API call audit log.
//!
//! Layout inside a run directory:
//!
//! ```text
//! stage_b_generation/
//!     trial_007.raw.1.txt      exact provider output, attempt 1
//!     trial_007.raw.2.txt      attempt 2 (escalated budget)
//!     trial_007.json           LayerArtifact, written after parsing
//! stage_c_evaluation/
//!     trial_007__vendor_judge.raw.1.txt
//!     trial_007__vendor_judge.json
//! api_calls.jsonl
//! ```
//!
//! Raw files are synced to disk before the call site parses them, and
//! [`ArtifactWriter::write_parsed`] refuses to run if the raw file it refers
//! to is absent. Raw sequence numbers continue across executions of a trial
//! (a requeued trial's first call lands in `.raw.3.txt` after two earlier
//! attempts) and a raw file is never opened over an existing one.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::ProviderErrorKind;
use crate::types::{ParseStatus, Stage};

/// File name of the audit log inside a run directory.
pub const AUDIT_LOG_FILENAME: &str = "api_calls.jsonl";

/// Raw text recorded when a stage was satisfied without a provider call.
pub const BYPASS_SENTINEL: &str = "<bypassed: facts supplied by configuration>";

/// Errors that can occur during artifact storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A parsed artifact was about to be written before its raw artifact.
    #[error("Raw artifact {path:?} missing; refusing to write parsed result")]
    RawArtifactMissing { path: PathBuf },
}

/// Identifies one call site: a (trial, stage) pair, plus the evaluator for
/// the evaluation stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub stage: Stage,
    pub trial_id: String,
    pub evaluator: Option<String>,
}

impl ArtifactKey {
    pub fn new(stage: Stage, trial_id: impl Into<String>) -> Self {
        Self {
            stage,
            trial_id: trial_id.into(),
            evaluator: None,
        }
    }

    pub fn evaluation(trial_id: impl Into<String>, evaluator: impl Into<String>) -> Self {
        Self {
            stage: Stage::Evaluation,
            trial_id: trial_id.into(),
            evaluator: Some(evaluator.into()),
        }
    }

    /// File stem: `<trial_id>` or `<trial_id>__<evaluator>`.
    pub fn stem(&self) -> String {
        match &self.evaluator {
            Some(e) => format!("{}__{}", self.trial_id, sanitize_component(e)),
            None => self.trial_id.clone(),
        }
    }

    /// Key under which the registry records this site's summary.
    pub fn layer_name(&self) -> String {
        match &self.evaluator {
            Some(e) => format!("{}:{}", self.stage, e),
            None => self.stage.to_string(),
        }
    }
}

/// Model ids contain `/` and `:`; keep file names flat.
pub(crate) fn sanitize_component(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '.') { c } else { '_' })
        .collect()
}

/// The parsed record of one call site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerArtifact {
    pub trial_id: String,
    pub stage: Stage,
    /// Model that produced the response.
    pub model: String,
    /// Exact provider output of the final attempt, or [`BYPASS_SENTINEL`].
    pub raw_response: String,
    pub parsed_result: Option<serde_json::Value>,
    pub parse_status: ParseStatus,
    /// Budget in effect for the final attempt.
    pub tokens_budget_used: u32,
    /// Provider calls made, escalations included.
    pub attempts: u32,
    /// Raw file of every attempt of this execution, relative to the stage
    /// directory. The last entry belongs to the final attempt.
    pub raw_files: Vec<String>,
    #[serde(default)]
    pub bypassed: bool,
    /// Set when the truncation budget ran out and the last response was kept.
    #[serde(default)]
    pub budget_exhausted: bool,
    pub written_at: DateTime<Utc>,
}

/// Writes raw and parsed artifacts under one run directory.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    run_dir: PathBuf,
}

impl ArtifactWriter {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.run_dir.join(stage.dir_name())
    }

    pub fn raw_file_name(key: &ArtifactKey, sequence: u32) -> String {
        format!("{}.raw.{}.txt", key.stem(), sequence)
    }

    pub fn raw_path(&self, key: &ArtifactKey, sequence: u32) -> PathBuf {
        self.stage_dir(key.stage).join(Self::raw_file_name(key, sequence))
    }

    /// First unused raw sequence number for `key` (1 when none exist).
    pub async fn next_raw_sequence(&self, key: &ArtifactKey) -> Result<u32, StorageError> {
        let mut entries = match fs::read_dir(self.stage_dir(key.stage)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(1),
            Err(e) => return Err(e.into()),
        };
        let prefix = format!("{}.raw.", key.stem());
        let mut next = 1;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let sequence = name
                .to_str()
                .and_then(|n| n.strip_prefix(prefix.as_str()))
                .and_then(|rest| rest.strip_suffix(".txt"))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(sequence) = sequence {
                next = next.max(sequence.saturating_add(1));
            }
        }
        Ok(next)
    }

    pub fn parsed_path(&self, key: &ArtifactKey) -> PathBuf {
        self.stage_dir(key.stage).join(format!("{}.json", key.stem()))
    }

    /// Writes and syncs the raw text of one attempt. Fails if a raw file with
    /// this sequence number already exists.
    pub async fn write_raw(
        &self,
        key: &ArtifactKey,
        sequence: u32,
        raw: &str,
    ) -> Result<PathBuf, StorageError> {
        let path = self.raw_path(key, sequence);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        file.write_all(raw.as_bytes()).await?;
        file.sync_all().await?;
        Ok(path)
    }

    /// Writes the parsed artifact after checking that the raw file of its
    /// final attempt exists.
    pub async fn write_parsed(
        &self,
        key: &ArtifactKey,
        artifact: &LayerArtifact,
    ) -> Result<PathBuf, StorageError> {
        let stage_dir = self.stage_dir(key.stage);
        let raw = match artifact.raw_files.last() {
            Some(name) => stage_dir.join(name),
            None => stage_dir.join(Self::raw_file_name(key, 1)),
        };
        if !fs::try_exists(&raw).await.unwrap_or(false) {
            return Err(StorageError::RawArtifactMissing { path: raw });
        }

        let path = self.parsed_path(key);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(artifact)?;
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;
        Ok(path)
    }

    pub async fn read_parsed(&self, key: &ArtifactKey) -> Result<Option<LayerArtifact>, StorageError> {
        let path = self.parsed_path(key);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        let bytes = fs::read(&path).await?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

/// One line of the audit log: a single provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub at: DateTime<Utc>,
    pub trial_id: String,
    pub stage: Stage,
    pub model: String,
    pub budget: u32,
    /// Truncation escalation step (0 for the first budget).
    pub escalation: u32,
    /// Transport attempt within this escalation step (1-based).
    pub transport_attempt: u32,
    pub latency_ms: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ProviderErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,
}

/// Append-only JSON Lines log of every provider call in a run.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(run_dir: &Path) -> Self {
        Self {
            path: run_dir.join(AUDIT_LOG_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record as a single write.
    pub async fn append(&self, record: &AuditRecord) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// Every record so far. A missing log reads as empty.
    pub async fn read_all(&self) -> Result<Vec<AuditRecord>, StorageError> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&self.path).await?;
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(StorageError::from))
            .collect()
    }
}
