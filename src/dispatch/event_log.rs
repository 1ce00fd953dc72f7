//! Append-only message event log.
//!
//! Every successfully validated message that passes through the
//! dispatcher is appended as one JSON line to a date-rotated file
//! (`events-YYYY-MM-DD.jsonl`). The log is a side channel for replay and
//! audit tooling; append failures are logged and never gate delivery.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};

use crate::protocol::AgentMsg;

/// Date-rotated JSONL sink for dispatched messages.
#[derive(Debug, Clone)]
pub struct EventLog {
    dir: PathBuf,
}

impl EventLog {
    /// Create a log writing under `dir`. The directory is created lazily
    /// on first append.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the log file for a given UTC day.
    pub fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("events-{}.jsonl", date.format("%Y-%m-%d")))
    }

    /// Append one message. Best-effort: failures are logged, never
    /// propagated.
    pub fn append(&self, msg: &AgentMsg) {
        if let Err(e) = self.try_append(msg) {
            log::warn!("event log append failed for message {}: {}", msg.id, e);
        }
    }

    fn try_append(&self, msg: &AgentMsg) -> anyhow::Result<()> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir)?;
        }
        let path = self.file_for(Utc::now().date_naive());
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let line = msg.to_json()?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Read back every message logged for a given day, skipping lines
    /// that no longer decode. Used by replay tooling and tests.
    pub fn replay(&self, date: NaiveDate) -> Vec<AgentMsg> {
        let path = self.file_for(date);
        if !Path::new(&path).exists() {
            return Vec::new();
        }
        match std::fs::read_to_string(&path) {
            Ok(content) => content
                .lines()
                .filter(|line| !line.trim().is_empty())
                .filter_map(|line| match AgentMsg::from_json(line) {
                    Ok(msg) => Some(msg),
                    Err(e) => {
                        log::warn!("skipping undecodable event log line: {}", e);
                        None
                    }
                })
                .collect(),
            Err(e) => {
                log::warn!("event log read failed: {}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MsgType;

    #[test]
    fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let event_log = EventLog::new(dir.path());

        let first = AgentMsg::new(MsgType::Task, "architect", "coder-001");
        let second = AgentMsg::new(MsgType::Spec, "architect", "coder-001");
        event_log.append(&first);
        event_log.append(&second);

        let replayed = event_log.replay(Utc::now().date_naive());
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].id, first.id);
        assert_eq!(replayed[1].id, second.id);
    }

    #[test]
    fn test_replay_missing_day_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let event_log = EventLog::new(dir.path());
        let some_day = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        assert!(event_log.replay(some_day).is_empty());
    }

    #[test]
    fn test_file_name_carries_date() {
        let event_log = EventLog::new("/tmp/foreman-events");
        let date = NaiveDate::from_ymd_opt(2026, 8, 8).unwrap();
        assert!(event_log
            .file_for(date)
            .to_string_lossy()
            .ends_with("events-2026-08-08.jsonl"));
    }
}
