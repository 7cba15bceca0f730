//! Result files and the shared error log
//!
//! Output files are keyed by the record's original line index so names are
//! deterministic regardless of which worker finishes first. The error log is
//! the only shared mutable resource in a run; appends go through one mutex.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::info;

pub const ERROR_LOG_NAME: &str = "errors.ndjson";

/// One failed record: its input line index and why it failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub line_index: usize,
    pub reason: String,
}

/// Keep only filename-safe characters, matching how regions are slugged
/// into output names.
pub fn slug(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}

/// Writes one result file per successful record.
pub struct OutputWriter {
    dir: PathBuf,
}

impl OutputWriter {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// `<index>_<region>_<MM-YYYY>.json`, derived from the input record so
    /// reruns produce the same name.
    pub fn file_name(line_index: usize, record: &Value) -> String {
        let region = record
            .get("region_config")
            .and_then(|rc| rc.get("ccaa"))
            .and_then(Value::as_str)
            .map(slug)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "CCAA".to_string());
        let month = record
            .get("period")
            .and_then(|p| p.get("month"))
            .and_then(Value::as_u64)
            .map(|m| format!("{m:02}"))
            .unwrap_or_else(|| "MM".to_string());
        let year = record
            .get("period")
            .and_then(|p| p.get("year"))
            .and_then(Value::as_u64)
            .map(|y| y.to_string())
            .unwrap_or_else(|| "YYYY".to_string());
        format!("{line_index}_{region}_{month}-{year}.json")
    }

    pub fn write_result(&self, line_index: usize, record: &Value, result: &Value) -> Result<PathBuf> {
        let name = Self::file_name(line_index, record);
        let path = self.dir.join(&name);
        // Stage in the same directory and rename into place; a write that
        // dies halfway never leaves a truncated file under the final name.
        let staging = self.dir.join(format!("{name}.tmp"));
        let mut file = File::create(&staging)?;
        file.write_all(serde_json::to_string_pretty(result)?.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        std::fs::rename(&staging, &path)?;
        info!(path = %path.display(), "wrote result");
        Ok(path)
    }
}

/// Append-only NDJSON error log shared by all workers.
pub struct ErrorLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl ErrorLog {
    /// Create (truncating) the log for a fresh run, so the log reflects only
    /// this batch.
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(ERROR_LOG_NAME);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry. The mutex makes each line atomic with respect to
    /// other workers.
    pub async fn append(&self, line_index: usize, reason: &str) -> Result<()> {
        let entry = ErrorRecord {
            line_index,
            reason: reason.to_string(),
        };
        let line = serde_json::to_string(&entry)?;
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }
}
