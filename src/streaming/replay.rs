use anyhow::{Context, Result};
use chrono::Utc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::strategy::MarketSnapshot;
use crate::trading::EngineHandle;

/// Replays JSON-lines market snapshots into the engine.
pub struct ReplayFeed {
    path: String,
    interval: Duration,
}

impl ReplayFeed {
    pub fn new(path: impl Into<String>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
        }
    }

    /// Parses the file. Malformed lines are logged and skipped.
    pub async fn load(&self) -> Result<Vec<MarketSnapshot>> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("opening replay file {}", self.path))?;
        let mut lines = BufReader::new(file).lines();

        let mut snapshots = Vec::new();
        let mut line_no = 0usize;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<MarketSnapshot>(line) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => tracing::warn!("⚠️  {}:{} skipped: {}", self.path, line_no, e),
            }
        }

        tracing::info!("📂 Loaded {} snapshots from {}", snapshots.len(), self.path);
        Ok(snapshots)
    }

    /// Sends every snapshot, re-stamped to the time of dispatch so the
    /// staleness check sees a live feed.
    pub async fn run(&self, handle: &EngineHandle) -> Result<usize> {
        let mut sent = 0;
        for mut snapshot in self.load().await? {
            snapshot.timestamp = Utc::now();
            if handle.dispatch(snapshot).await {
                sent += 1;
            }
            if !self.interval.is_zero() {
                tokio::time::sleep(self.interval).await;
            }
        }
        Ok(sent)
    }
}
