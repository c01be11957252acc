//! File-backed event journal: one newline-delimited JSON file per workflow
//! at `<root>/<workflow_id>/events.log`.
//!
//! This is the default event log. Directory creation is idempotent, appends
//! go through a single mutex so concurrent task events from one process
//! never interleave partial lines.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{EventLog, EventRecord};

/// Default journal root, relative to the process working directory.
pub const DEFAULT_ROOT: &str = "./var/run";

/// Newline-delimited JSON event journal.
pub struct FileEventLog {
    root: PathBuf,
    // Serializes appends across tasks of the same process.
    write_lock: Mutex<()>,
}

impl FileEventLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// The journal rooted at [`DEFAULT_ROOT`].
    pub fn default_root() -> Self {
        Self::new(DEFAULT_ROOT)
    }

    fn log_path(&self, workflow_id: &str) -> PathBuf {
        self.root.join(workflow_id).join("events.log")
    }
}

#[async_trait]
impl EventLog for FileEventLog {
    async fn append(&self, record: EventRecord) -> Result<()> {
        let path = self.log_path(&record.workflow_id);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        let mut line = serde_json::to_string(&record).context("failed to serialize event")?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create journal dir {}", dir.display()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open journal {}", path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to append to journal {}", path.display()))?;
        file.flush().await.context("failed to flush journal")?;

        Ok(())
    }

    async fn read(
        &self,
        workflow_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<EventRecord>> {
        let path = self.log_path(workflow_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read journal {}", path.display()));
            }
        };

        let mut records = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: EventRecord = serde_json::from_str(line).with_context(|| {
                format!("corrupt journal line {} in {}", lineno + 1, path.display())
            })?;
            let visible = match tenant_id {
                None => true,
                Some(tenant) => record.tenant_id.as_deref() == Some(tenant),
            };
            if visible {
                records.push(record);
            }
        }

        Ok(records)
    }
}
