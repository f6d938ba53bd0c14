//! Local log-file tailer
//!
//! Optional ingest path for agents that only write a JSONL log. The tailer
//! polls the file, reads complete lines past its saved offset, and feeds
//! them through the log-line normalizer. Truncation (rotation) resets the
//! offset to the start of the new file.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;

use crate::core::constants::LOGTAIL_POLL_SECS;
use crate::domain::normalize::normalize_log_line;
use crate::store::MetricStore;

pub struct LogTailer {
    path: PathBuf,
    store: Arc<MetricStore>,
    offset: u64,
    // Carries a trailing partial line between polls
    remainder: String,
}

impl LogTailer {
    pub fn new(path: PathBuf, store: Arc<MetricStore>) -> Self {
        Self {
            path,
            store,
            offset: 0,
            remainder: String::new(),
        }
    }

    /// Read and ingest everything new since the last poll. Returns how many
    /// records were stored. A missing file is not an error, the agent may
    /// not have started yet.
    pub async fn poll_once(&mut self) -> anyhow::Result<usize> {
        let mut file = match File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        if len < self.offset {
            tracing::info!(path = %self.path.display(), "Log file truncated, restarting from the top");
            self.offset = 0;
            self.remainder.clear();
        }
        if len == self.offset {
            return Ok(0);
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = String::new();
        file.read_to_string(&mut buf).await?;
        self.offset = len;

        let mut text = std::mem::take(&mut self.remainder);
        text.push_str(&buf);

        // Only lines terminated by a newline are complete
        let complete_end = match text.rfind('\n') {
            Some(idx) => idx + 1,
            None => {
                self.remainder = text;
                return Ok(0);
            }
        };
        self.remainder = text[complete_end..].to_string();

        let mut stored = 0;
        for line in text[..complete_end].lines() {
            if line.trim().is_empty() {
                continue;
            }
            match normalize_log_line(line) {
                Ok(records) => {
                    for record in records {
                        match self.store.append(record) {
                            Ok(()) => stored += 1,
                            Err(e) => tracing::warn!(error = %e, "Tailed record rejected"),
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Unparseable log line skipped"),
            }
        }
        Ok(stored)
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(path = %self.path.display(), "Log tailer started");
        let mut ticker = tokio::time::interval(Duration::from_secs(LOGTAIL_POLL_SECS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::warn!(error = %e, "Log poll failed");
                    }
                }
            }
        }
        tracing::debug!("Log tailer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::LiveHub;
    use std::io::Write;

    fn setup() -> (tempfile::TempDir, PathBuf, Arc<MetricStore>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.jsonl");
        let store = Arc::new(MetricStore::new(100, 14, Arc::new(LiveHub::new(16))));
        (dir, path, store)
    }

    #[tokio::test]
    async fn test_tail_picks_up_appended_lines() {
        let (_dir, path, store) = setup();
        let mut tailer = LogTailer::new(path.clone(), store.clone());

        assert_eq!(tailer.poll_once().await.unwrap(), 0);

        std::fs::write(&path, "{\"tokens\": 100}\n{\"cost_usd\": 0.5}\n").unwrap();
        assert_eq!(tailer.poll_once().await.unwrap(), 2);

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{\"tokens\": 50}}").unwrap();
        assert_eq!(tailer.poll_once().await.unwrap(), 1);
        // Nothing new
        assert_eq!(tailer.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_partial_line_held_until_complete() {
        let (_dir, path, store) = setup();
        let mut tailer = LogTailer::new(path.clone(), store);

        std::fs::write(&path, "{\"tokens\":").unwrap();
        assert_eq!(tailer.poll_once().await.unwrap(), 0);

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, " 100}}\n").unwrap();
        assert_eq!(tailer.poll_once().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rotation_resets_offset() {
        let (_dir, path, store) = setup();
        let mut tailer = LogTailer::new(path.clone(), store);

        std::fs::write(&path, "{\"tokens\": 100}\n{\"tokens\": 200}\n").unwrap();
        assert_eq!(tailer.poll_once().await.unwrap(), 2);

        // Shorter replacement file simulates rotation
        std::fs::write(&path, "{\"tokens\": 1}\n").unwrap();
        assert_eq!(tailer.poll_once().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bad_lines_skipped() {
        let (_dir, path, store) = setup();
        let mut tailer = LogTailer::new(path.clone(), store);

        std::fs::write(&path, "not json\n{\"cost_usd\": 0.25}\n").unwrap();
        assert_eq!(tailer.poll_once().await.unwrap(), 1);
    }
}
