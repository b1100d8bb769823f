//! Append-only journal of call records: one JSON object per line in
//! `calls.jsonl`, last line per call id wins on replay.

use super::record::{CallRecord, CallState, EndReason};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

const JOURNAL_FILE: &str = "calls.jsonl";

/// Non-terminal records older than this on startup are assumed crashed
/// and rewritten as errors.
pub const STALE_AFTER_MS: u64 = 5 * 60 * 1000;

pub struct CallStore {
    path: PathBuf,
}

/// What startup replay found: records to resume and records that were
/// rewritten as stale.
#[derive(Debug, Default)]
pub struct RecoveredCalls {
    pub active: Vec<CallRecord>,
    pub stale: Vec<CallRecord>,
}

impl CallStore {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating call store directory {}", dir.display()))?;
        Ok(Self {
            path: dir.join(JOURNAL_FILE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record mutation to the journal.
    pub async fn append(&self, record: &CallRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening journal {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read the whole journal, keeping the last record per call id in
    /// first-seen order. Unparseable lines are skipped, not fatal.
    pub async fn load_all(&self) -> Result<Vec<CallRecord>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("reading call journal"),
        };

        let mut order: Vec<String> = Vec::new();
        let mut latest: std::collections::HashMap<String, CallRecord> =
            std::collections::HashMap::new();
        for (number, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CallRecord>(line) {
                Ok(record) => {
                    if !latest.contains_key(&record.call_id) {
                        order.push(record.call_id.clone());
                    }
                    latest.insert(record.call_id.clone(), record);
                }
                Err(e) => warn!("skipping journal line {}: {}", number + 1, e),
            }
        }
        Ok(order
            .into_iter()
            .filter_map(|id| latest.remove(&id))
            .collect())
    }

    /// Find a call anywhere in the journal, terminal or not.
    pub async fn find(&self, call_id: &str) -> Result<Option<CallRecord>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .find(|r| r.call_id == call_id))
    }

    /// Startup replay: terminal records stay in the journal untouched;
    /// non-terminal ones either resume as active or, past the stale
    /// window, get rewritten as `error`.
    pub async fn recover(&self, now_ms: u64) -> Result<RecoveredCalls> {
        let mut recovered = RecoveredCalls::default();
        for mut record in self.load_all().await? {
            if record.state.is_terminal() {
                continue;
            }
            if now_ms.saturating_sub(record.started_at) > STALE_AFTER_MS {
                record.state = CallState::Error;
                record.end_reason = Some(EndReason::Error);
                record.ended_at = Some(now_ms);
                self.append(&record).await?;
                warn!(call_id = record.call_id, "stale call rewritten as error");
                recovered.stale.push(record);
            } else {
                info!(call_id = record.call_id, "resuming in-flight call");
                recovered.active.push(record);
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::record::Speaker;
    use crate::call::record::TranscriptEntry;
    use tempfile::TempDir;

    fn record(call_id: &str) -> CallRecord {
        CallRecord::new(
            call_id.to_string(),
            "+15550001111".into(),
            "+15550002222".into(),
            "sess".into(),
        )
    }

    #[tokio::test]
    async fn test_append_and_load_last_wins() {
        let dir = TempDir::new().unwrap();
        let store = CallStore::new(dir.path()).unwrap();

        let mut rec = record("c1");
        store.append(&rec).await.unwrap();
        rec.state = CallState::Ringing;
        store.append(&rec).await.unwrap();
        rec.state = CallState::Answered;
        rec.transcript.push(TranscriptEntry {
            timestamp: 1,
            speaker: Speaker::User,
            text: "hello".into(),
            is_final: true,
        });
        store.append(&rec).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].state, CallState::Answered);
        assert_eq!(loaded[0].transcript.len(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_journal_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = CallStore::new(dir.path()).unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_lines_skipped() {
        let dir = TempDir::new().unwrap();
        let store = CallStore::new(dir.path()).unwrap();
        store.append(&record("c1")).await.unwrap();
        tokio::fs::write(
            store.path(),
            format!(
                "{}\nnot json at all\n",
                serde_json::to_string(&record("c2")).unwrap()
            ),
        )
        .await
        .unwrap();
        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].call_id, "c2");
    }

    #[tokio::test]
    async fn test_recover_rewrites_stale_as_error() {
        let dir = TempDir::new().unwrap();
        let store = CallStore::new(dir.path()).unwrap();
        let now = crate::get_timestamp();

        let mut stale = record("stale");
        stale.state = CallState::Answered;
        stale.started_at = now - 10 * 60 * 1000;
        store.append(&stale).await.unwrap();

        let mut fresh = record("fresh");
        fresh.state = CallState::Ringing;
        fresh.started_at = now - 60 * 1000;
        store.append(&fresh).await.unwrap();

        let mut done = record("done");
        done.state = CallState::Completed;
        done.started_at = now - 60 * 60 * 1000;
        store.append(&done).await.unwrap();

        let recovered = store.recover(now).await.unwrap();
        assert_eq!(recovered.active.len(), 1);
        assert_eq!(recovered.active[0].call_id, "fresh");
        assert_eq!(recovered.stale.len(), 1);
        assert_eq!(recovered.stale[0].state, CallState::Error);
        assert_eq!(recovered.stale[0].end_reason, Some(EndReason::Error));

        // The rewrite is durable: the journal's last line for the stale
        // call now reads error
        let reloaded = store.load_all().await.unwrap();
        let stale_after = reloaded.iter().find(|r| r.call_id == "stale").unwrap();
        assert_eq!(stale_after.state, CallState::Error);
        assert!(stale_after.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_find_scans_terminal_records() {
        let dir = TempDir::new().unwrap();
        let store = CallStore::new(dir.path()).unwrap();
        let mut rec = record("c9");
        rec.state = CallState::Completed;
        store.append(&rec).await.unwrap();
        assert!(store.find("c9").await.unwrap().is_some());
        assert!(store.find("missing").await.unwrap().is_none());
    }
}
