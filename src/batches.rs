//! Disk-backed list of training batches.
//!
//! Each batch (a list of token sequences) is serialised with `bincode` to
//! `<work_dir>/Batches/<session_id>/batch_<n>.bin`, so only the batch being
//! trained on is resident.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, TensorError};
use crate::memory::BATCH_DIR;

pub type Sequence = Vec<usize>;

pub struct BatchIndex {
    dir: PathBuf,
    count: usize,
    sequences: usize,
}

impl BatchIndex {
    /// Groups `sequences` into batches of `batch_size` (the last may be
    /// shorter) and writes them out.
    pub fn from_sequences<P: AsRef<Path>>(
        work_dir: P,
        session_id: &str,
        sequences: &[Sequence],
        batch_size: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TensorError::InvalidState("batch_size must be positive".into()));
        }
        let dir = work_dir.as_ref().join(BATCH_DIR).join(session_id);
        fs::create_dir_all(&dir)?;

        let mut count = 0;
        for batch in sequences.chunks(batch_size) {
            let file = File::create(dir.join(batch_file(count)))?;
            bincode::serialize_into(BufWriter::new(file), batch)?;
            count += 1;
        }
        debug!(dir = %dir.display(), batches = count, "batch index written");
        Ok(BatchIndex {
            dir,
            count,
            sequences: sequences.len(),
        })
    }

    /// Splits a token stream into windows of `sequence_length` tokens that
    /// overlap by one, so every token but the first is a prediction target
    /// exactly once. A trailing window shorter than two tokens is dropped.
    pub fn split_tokens(tokens: &[usize], sequence_length: usize) -> Vec<Sequence> {
        let length = sequence_length.max(2);
        let mut sequences = Vec::new();
        let mut start = 0;
        while start + 1 < tokens.len() {
            let end = (start + length).min(tokens.len());
            sequences.push(tokens[start..end].to_vec());
            start = end - 1;
        }
        sequences
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn sequence_count(&self) -> usize {
        self.sequences
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load(&self, n: usize) -> Result<Vec<Sequence>> {
        if n >= self.count {
            return Err(TensorError::NotFound(format!("batch {} of {}", n, self.count)));
        }
        let file = File::open(self.dir.join(batch_file(n)))?;
        Ok(bincode::deserialize_from(BufReader::new(file))?)
    }

    /// Deletes the batch files.
    pub fn dispose(self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "failed to remove batch directory");
        }
    }
}

fn batch_file(n: usize) -> String {
    format!("batch_{}.bin", n)
}
