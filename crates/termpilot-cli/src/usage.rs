//! Per-provider token usage, persisted across sessions

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use termpilot_ai::TokensSummary;

/// Serializes read-modify-write cycles across every session in the process
static STORE_LOCK: Mutex<()> = Mutex::new(());

/// Accumulated usage for one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub tokens: TokensSummary,
    pub runs: u64,
    pub updated_at: DateTime<Utc>,
}

/// JSON file of usage records keyed by provider id
#[derive(Debug, Clone)]
pub struct UsageStore {
    path: PathBuf,
}

impl UsageStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `usage.json` under the local data directory
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("termpilot")
            .join("usage.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records. A missing file is an empty store.
    pub fn load(&self) -> anyhow::Result<BTreeMap<String, UsageRecord>> {
        let _lock = STORE_LOCK.lock();
        self.read_unlocked()
    }

    /// Add one run's usage to the provider's record. The record is rebuilt
    /// and replaced whole.
    pub fn record(&self, provider: &str, usage: &TokensSummary) -> anyhow::Result<UsageRecord> {
        let _lock = STORE_LOCK.lock();
        let mut records = self.read_unlocked()?;

        let (mut tokens, runs) = match records.get(provider) {
            Some(previous) => (previous.tokens, previous.runs),
            None => (TokensSummary::default(), 0),
        };
        tokens.add(usage);
        let record = UsageRecord {
            tokens,
            runs: runs + 1,
            updated_at: Utc::now(),
        };
        records.insert(provider.to_string(), record.clone());

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let content = serde_json::to_string_pretty(&records)?;
        fs::write(&self.path, content)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(record)
    }

    fn read_unlocked(&self) -> anyhow::Result<BTreeMap<String, UsageRecord>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).with_context(|| format!("parsing {}", self.path.display()))
    }
}

/// One-line summary printed after a run
pub fn format_summary(run: &TokensSummary, session: &TokensSummary) -> String {
    let mut line = format!(
        "tokens: {} in / {} out",
        run.prompt_tokens, run.completion_tokens
    );
    if run.cached_tokens > 0 {
        line.push_str(&format!(" ({} cached)", run.cached_tokens));
    }
    line.push_str(&format!(" · session total {}", session.total_tokens));
    line
}
