//! Append-only JSON Lines log of proxy exchanges.
//!
//! One file per calendar day (`YYYY-MM-DD.log`) under the configured log
//! directory, one JSON object per line. All writes funnel through a single
//! writer task so concurrent request handlers can never interleave bytes
//! within a line. Logging failures degrade to a console warning — they must
//! never block or fail proxying.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

/// Which side of an exchange a record captures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Inbound,
    Outbound,
}

/// One logged proxy transaction. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRecord {
    /// RFC 3339 timestamp of the write request.
    pub ts: String,
    pub phase: Phase,
    /// Opaque payload: messages plus metadata, or a response chunk.
    pub data: Value,
}

enum LogCommand {
    Record(ExchangeRecord),
    Flush(oneshot::Sender<()>),
}

/// Handle to the exchange log writer task. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ExchangeLogger {
    tx: mpsc::UnboundedSender<LogCommand>,
}

impl ExchangeLogger {
    /// Spawn the writer task appending to `<dir>/YYYY-MM-DD.log`.
    pub fn new(dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    LogCommand::Record(record) => {
                        if let Err(e) = write_record(&dir, &record).await {
                            tracing::warn!("Exchange log write failed: {}", e);
                        }
                    }
                    LogCommand::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });
        Self { tx }
    }

    /// Default log directory: `~/.prism/logs`.
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".prism")
            .join("logs")
    }

    /// Queue one record. Never blocks; a closed writer only warns.
    pub fn record(&self, phase: Phase, data: Value) {
        let record = ExchangeRecord {
            ts: chrono::Utc::now().to_rfc3339(),
            phase,
            data,
        };
        if self.tx.send(LogCommand::Record(record)).is_err() {
            tracing::warn!("Exchange log writer is gone, dropping record");
        }
    }

    /// Wait until everything queued so far has been written.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(LogCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// Current day's log file name.
fn log_file_name() -> String {
    format!("{}.log", chrono::Local::now().format("%Y-%m-%d"))
}

async fn write_record(dir: &PathBuf, record: &ExchangeRecord) -> anyhow::Result<()> {
    // Re-verify the directory on every write; it may have been removed
    // between requests.
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(log_file_name());
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    file.write_all(&line).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_record_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let logger = ExchangeLogger::new(tmp.path().to_path_buf());

        logger.record(Phase::Inbound, json!({"messages": [{"role": "user"}]}));
        logger.record(Phase::Outbound, json!({"chunk": 1}));
        logger.flush().await;

        let path = tmp.path().join(log_file_name());
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: ExchangeRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.phase, Phase::Inbound);
        assert_eq!(first.data["messages"][0]["role"], "user");
        // ts only needs to parse as a valid timestamp.
        assert!(chrono::DateTime::parse_from_rfc3339(&first.ts).is_ok());

        let second: ExchangeRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.phase, Phase::Outbound);
    }

    #[tokio::test]
    async fn test_write_order_is_send_order() {
        let tmp = tempfile::tempdir().unwrap();
        let logger = ExchangeLogger::new(tmp.path().to_path_buf());

        for i in 0..20 {
            logger.record(Phase::Outbound, json!({ "seq": i }));
        }
        logger.flush().await;

        let content = std::fs::read_to_string(tmp.path().join(log_file_name())).unwrap();
        let seqs: Vec<i64> = content
            .lines()
            .map(|l| serde_json::from_str::<ExchangeRecord>(l).unwrap().data["seq"]
                .as_i64()
                .unwrap())
            .collect();
        assert_eq!(seqs, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_unwritable_dir_does_not_panic() {
        // A path that cannot be created: a file stands where the directory
        // should be.
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let logger = ExchangeLogger::new(blocker.join("logs"));
        logger.record(Phase::Inbound, json!({"ok": true}));
        // Degrades to a warning; the handle stays usable.
        logger.flush().await;
    }
}
