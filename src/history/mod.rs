pub mod selector;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

/// Terminal disposition of one generation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    ValidationRejected,
    ExecutionFailed,
}

/// One natural-language -> SQL attempt, as persisted to the learning corpus.
/// Entries are append-only; nothing in the core ever mutates or deletes one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub question: String,
    pub sql: String,
    pub outcome: Outcome,
    pub error: Option<String>,
    pub row_count: Option<usize>,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn success(question: &str, sql: &str, row_count: usize) -> Self {
        Self {
            question: question.to_string(),
            sql: sql.to_string(),
            outcome: Outcome::Succeeded,
            error: None,
            row_count: Some(row_count),
            timestamp: Utc::now(),
        }
    }

    pub fn failure(question: &str, sql: &str, outcome: Outcome, error: &str) -> Self {
        Self {
            question: question.to_string(),
            sql: sql.to_string(),
            outcome,
            error: Some(error.to_string()),
            row_count: None,
            timestamp: Utc::now(),
        }
    }

    pub fn is_positive(&self) -> bool {
        matches!(self.outcome, Outcome::Succeeded)
    }
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("history serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("history task error: {0}")]
    Task(String),
}

/// Append-only learning corpus, partitioned into successful generations and
/// rejected/failed ones. Injected everywhere it is needed; there is no
/// ambient global instance.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, entry: HistoryEntry) -> Result<(), HistoryError>;
    async fn positive(&self) -> Vec<HistoryEntry>;
    async fn negative(&self) -> Vec<HistoryEntry>;
}

#[derive(Default)]
struct Corpus {
    positive: Vec<HistoryEntry>,
    negative: Vec<HistoryEntry>,
}

/// Durable history store: two JSONL files, one record per line. Appends are
/// serialized under a lock so concurrent writers never interleave a record.
/// Reads are served from an in-memory mirror and may trail in-flight appends.
pub struct JsonlHistoryStore {
    positive_path: PathBuf,
    negative_path: PathBuf,
    corpus: RwLock<Corpus>,
    append_lock: Mutex<()>,
}

impl JsonlHistoryStore {
    pub fn open(dir: &Path) -> Result<Self, HistoryError> {
        std::fs::create_dir_all(dir)?;
        let positive_path = dir.join("positive.jsonl");
        let negative_path = dir.join("negative.jsonl");

        let corpus = Corpus {
            positive: load_log(&positive_path)?,
            negative: load_log(&negative_path)?,
        };

        Ok(Self {
            positive_path,
            negative_path,
            corpus: RwLock::new(corpus),
            append_lock: Mutex::new(()),
        })
    }
}

fn load_log(path: &Path) -> Result<Vec<HistoryEntry>, HistoryError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)?;
    let mut entries = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HistoryEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!("Skipping malformed history record in {:?}: {}", path, e),
        }
    }
    Ok(entries)
}

#[async_trait]
impl HistoryStore for JsonlHistoryStore {
    async fn append(&self, entry: HistoryEntry) -> Result<(), HistoryError> {
        let path = if entry.is_positive() {
            self.positive_path.clone()
        } else {
            self.negative_path.clone()
        };
        let line = serde_json::to_string(&entry)?;

        // One writer at a time keeps each record a single atomic unit.
        let _guard = self.append_lock.lock().await;
        tokio::task::spawn_blocking(move || -> Result<(), HistoryError> {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            writeln!(file, "{}", line)?;
            file.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| HistoryError::Task(e.to_string()))??;

        let mut corpus = self.corpus.write().await;
        if entry.is_positive() {
            corpus.positive.push(entry);
        } else {
            corpus.negative.push(entry);
        }
        Ok(())
    }

    async fn positive(&self) -> Vec<HistoryEntry> {
        self.corpus.read().await.positive.clone()
    }

    async fn negative(&self) -> Vec<HistoryEntry> {
        self.corpus.read().await.negative.clone()
    }
}

/// In-memory store with the same contract, for deterministic tests.
#[derive(Default)]
pub struct MemoryHistoryStore {
    corpus: RwLock<Corpus>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, entry: HistoryEntry) -> Result<(), HistoryError> {
        let mut corpus = self.corpus.write().await;
        if entry.is_positive() {
            corpus.positive.push(entry);
        } else {
            corpus.negative.push(entry);
        }
        Ok(())
    }

    async fn positive(&self) -> Vec<HistoryEntry> {
        self.corpus.read().await.positive.clone()
    }

    async fn negative(&self) -> Vec<HistoryEntry> {
        self.corpus.read().await.negative.clone()
    }
}
