//! Append-only, human-readable training log.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::warn;

use crate::error::Result;

/// One timestamped line per event, flushed as it is written.
pub struct TrainingLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl TrainingLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(TrainingLog {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `message`. Logging must never stop training, so write
    /// failures are reported through `tracing` only.
    pub fn log(&self, message: &str) {
        let line = format!("[{}] {}\n", Utc::now().to_rfc3339(), message);
        let mut file = self.file.lock();
        if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| file.flush()) {
            warn!(path = %self.path.display(), error = %e, "failed to append to training log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_appends_timestamped_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("training.log");
        {
            let log = TrainingLog::open(&path).unwrap();
            log.log("epoch 1 loss 2.5");
        }
        let log = TrainingLog::open(&path).unwrap();
        log.log("epoch 2 loss 2.1");

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('[') && lines[0].ends_with("epoch 1 loss 2.5"));
        assert!(lines[1].ends_with("epoch 2 loss 2.1"));
    }
}
