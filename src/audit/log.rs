use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only, newline-delimited UTF-8 log file.
///
/// Appends return only after the bytes are on disk, so a concurrent tailer
/// never observes a write that could later be reordered.
#[derive(Debug, Clone)]
pub struct AppendLog {
    path: PathBuf,
}

impl AppendLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the file with `header`. No-op when it already exists and is non-empty.
    pub fn init(&self, header: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        if fs::metadata(&self.path).map(|m| m.len() > 0).unwrap_or(false) {
            return Ok(());
        }
        self.write_durable(header)
    }

    /// Append one line; a trailing newline is added when missing.
    pub fn append(&self, line: &str) -> Result<()> {
        self.write_durable(line)
    }

    fn write_durable(&self, text: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;

        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", self.path.display()))?;

        let result = (|| -> Result<()> {
            file.write_all(text.as_bytes())?;
            if !text.ends_with('\n') {
                file.write_all(b"\n")?;
            }
            file.sync_data()?;
            Ok(())
        })();

        FileExt::unlock(&file).ok();
        result.with_context(|| format!("Failed to append to {}", self.path.display()))
    }
}
