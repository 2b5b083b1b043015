//! Append-only JSON-lines record sink
//!
//! Pool-manager and session events are written one JSON object per line.
//! Writes are fail-open: a broken log directory never stalls the pool or a
//! validation session.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::fail_open::fail_open;
use crate::Result;

/// Destination for structured records
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordSink {
    /// Append to a JSONL file
    AppendFile(PathBuf),
    /// Only mirror to tracing
    TracingOnly,
}

impl RecordSink {
    pub fn append_file(path: impl Into<PathBuf>) -> Self {
        Self::AppendFile(path.into())
    }

    /// Sink for the pool manager, `<dir>/circus.log`
    pub fn for_circus(log_dir: &Path) -> Self {
        Self::append_file(log_dir.join("circus.log"))
    }

    /// Sink for one validation worker process, `<dir>/app-<pid>.log`
    pub fn for_worker(log_dir: &Path) -> Self {
        Self::append_file(log_dir.join(format!("app-{}.log", std::process::id())))
    }

    /// Emit one record
    pub async fn emit<T: Serialize>(&self, record: &T) {
        fail_open("record_sink::emit", || self.try_emit(record)).await;
    }

    async fn try_emit<T: Serialize>(&self, record: &T) -> Result<()> {
        let line = serde_json::to_string(record)?;
        debug!(record = %line, "record");

        let path = match self {
            Self::AppendFile(path) => path,
            Self::TracingOnly => return Ok(()),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        let mut buf = line.into_bytes();
        buf.push(b'\n');
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_lines() {
        let temp_dir = TempDir::new().unwrap();
        let sink = RecordSink::for_circus(&temp_dir.path().join("logs"));

        sink.emit(&json!({"active": 3, "expired": 1, "to_build": 2}))
            .await;
        sink.emit(&json!({"closed": 1})).await;

        let content = fs::read_to_string(temp_dir.path().join("logs/circus.log"))
            .await
            .unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["to_build"], 2);
    }

    #[tokio::test]
    async fn test_unwritable_sink_is_silent() {
        let temp_dir = TempDir::new().unwrap();
        // A directory where the log file should be
        let blocked = temp_dir.path().join("circus.log");
        std::fs::create_dir_all(&blocked).unwrap();

        let sink = RecordSink::append_file(&blocked);
        sink.emit(&json!({"closed": 0})).await;
    }
}
