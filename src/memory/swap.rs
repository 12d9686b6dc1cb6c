use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::format::{load_tensor, save_tensor};
use super::{sanitize_label, SWAP_DIR};
use crate::config::MemoryConfig;
use crate::engine::{Location, MathEngine, Tensor};
use crate::error::{Result, TensorError};

/// Tier a swapped tensor currently lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapTier {
    Ram,
    Disk,
}

enum SwapEntry {
    Ram { master: Tensor, bytes: usize },
    Disk { path: PathBuf },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SwapStats {
    pub ram_entries: usize,
    pub disk_entries: usize,
    pub ram_bytes: usize,
}

/// Hybrid RAM/disk holding area for tensors displaced from active memory.
///
/// Each id lives in exactly one tier. A tensor goes to RAM while the running
/// RAM estimate plus its size stays under the limit; otherwise it is written
/// to `<work_dir>/Swap/<session_id>/<id>.bin`. The whole session directory is
/// removed when the store is disposed or dropped.
pub struct SwapStore {
    engine: Arc<dyn MathEngine>,
    dir: PathBuf,
    ram_limit: usize,
    ram_bytes: Mutex<usize>,
    entries: DashMap<String, SwapEntry>,
    counter: AtomicU64,
    disposed: AtomicBool,
}

impl SwapStore {
    pub fn new<P: AsRef<Path>>(
        engine: Arc<dyn MathEngine>,
        work_dir: P,
        session_id: &str,
        ram_limit: usize,
    ) -> Result<Self> {
        let dir = work_dir.as_ref().join(SWAP_DIR).join(session_id);
        fs::create_dir_all(&dir)?;
        Ok(SwapStore {
            engine,
            dir,
            ram_limit,
            ram_bytes: Mutex::new(0),
            entries: DashMap::new(),
            counter: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        })
    }

    /// A store under `<work_dir>/Swap/<session_id>` with the configured RAM budget.
    pub fn from_config<P: AsRef<Path>>(
        engine: Arc<dyn MathEngine>,
        work_dir: P,
        session_id: &str,
        config: &MemoryConfig,
    ) -> Result<Self> {
        SwapStore::new(engine, work_dir, session_id, config.swap_ram_limit_bytes)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ensure_open(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(TensorError::InvalidState("swap store has been disposed".into()));
        }
        Ok(())
    }

    fn next_id(&self, label: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}_{:06}_{:08x}", sanitize_label(label), n, rand::random::<u32>())
    }

    /// Moves a copy of `tensor` out of active memory and returns its swap id.
    /// The caller keeps ownership of `tensor`.
    pub fn swap_out(&self, tensor: &Tensor, label: &str) -> Result<String> {
        self.ensure_open()?;
        let id = self.next_id(label);
        let bytes = tensor.byte_size();

        let mut ram_bytes = self.ram_bytes.lock();
        if *ram_bytes + bytes < self.ram_limit {
            let master = self.engine.clone_tensor(tensor, Location::Host)?;
            *ram_bytes += bytes;
            self.entries.insert(id.clone(), SwapEntry::Ram { master, bytes });
            debug!(id = %id, bytes, tier = "ram", "tensor swapped out");
        } else {
            drop(ram_bytes);
            let path = self.dir.join(format!("{}.bin", id));
            save_tensor(self.engine.as_ref(), tensor, &path)?;
            self.entries.insert(id.clone(), SwapEntry::Disk { path });
            debug!(id = %id, bytes, tier = "disk", "tensor swapped out");
        }
        Ok(id)
    }

    /// Returns a fresh device copy; the swap entry stays in place.
    pub fn load_from_swap(&self, id: &str) -> Result<Tensor> {
        self.ensure_open()?;
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| TensorError::NotFound(format!("swap id {}", id)))?;
        match entry.value() {
            SwapEntry::Ram { master, .. } => self.engine.clone_tensor(master, Location::Device),
            SwapEntry::Disk { path } => load_tensor(self.engine.as_ref(), path, Location::Device),
        }
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let (_, entry) = self
            .entries
            .remove(id)
            .ok_or_else(|| TensorError::NotFound(format!("swap id {}", id)))?;
        self.discard(id, entry);
        Ok(())
    }

    fn discard(&self, id: &str, entry: SwapEntry) {
        match entry {
            SwapEntry::Ram { master, bytes } => {
                let mut ram_bytes = self.ram_bytes.lock();
                *ram_bytes = ram_bytes.saturating_sub(bytes);
                if let Err(e) = self.engine.dispose(&master) {
                    warn!(id = %id, error = %e, "failed to dispose swapped tensor");
                }
            }
            SwapEntry::Disk { path } => {
                if let Err(e) = fs::remove_file(&path) {
                    debug!(id = %id, error = %e, "failed to remove swap file");
                }
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn tier(&self, id: &str) -> Option<SwapTier> {
        self.entries.get(id).map(|entry| match entry.value() {
            SwapEntry::Ram { .. } => SwapTier::Ram,
            SwapEntry::Disk { .. } => SwapTier::Disk,
        })
    }

    pub fn stats(&self) -> SwapStats {
        let mut stats = SwapStats {
            ram_bytes: *self.ram_bytes.lock(),
            ..SwapStats::default()
        };
        for entry in self.entries.iter() {
            match entry.value() {
                SwapEntry::Ram { .. } => stats.ram_entries += 1,
                SwapEntry::Disk { .. } => stats.disk_entries += 1,
            }
        }
        stats
    }

    /// Releases every RAM entry and deletes the session directory. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                self.discard(&id, entry);
            }
        }
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            debug!(dir = %self.dir.display(), error = %e, "failed to remove swap directory");
        }
    }
}

impl Drop for SwapStore {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CpuEngine;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    fn file_count(dir: &Path) -> usize {
        fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[test]
    fn test_small_tensor_stays_in_ram() {
        let dir = tempdir().unwrap();
        let engine: Arc<dyn MathEngine> = Arc::new(CpuEngine::new());
        let swap = SwapStore::new(Arc::clone(&engine), dir.path(), "s1", 1024).unwrap();

        let t = engine.from_slice(&[1.0, 2.0, 3.0], &[3], Location::Device).unwrap();
        let id = swap.swap_out(&t, "h state").unwrap();
        assert_eq!(swap.tier(&id), Some(SwapTier::Ram));
        assert_eq!(file_count(swap.dir()), 0);
        assert_eq!(swap.stats().ram_bytes, 12);

        // Peek semantics: repeated loads keep the entry.
        for _ in 0..2 {
            let loaded = swap.load_from_swap(&id).unwrap();
            assert_eq!(engine.read(&loaded).unwrap(), vec![1.0, 2.0, 3.0]);
            engine.dispose(&loaded).unwrap();
        }
        assert!(swap.contains(&id));
    }

    #[test]
    fn test_large_tensor_goes_to_disk() {
        let dir = tempdir().unwrap();
        let engine: Arc<dyn MathEngine> = Arc::new(CpuEngine::new());
        let swap = SwapStore::new(Arc::clone(&engine), dir.path(), "s2", 16).unwrap();

        let t = engine.from_slice(&[0.5; 8], &[2, 4], Location::Device).unwrap();
        let id = swap.swap_out(&t, "big").unwrap();
        assert_eq!(swap.tier(&id), Some(SwapTier::Disk));
        assert_eq!(file_count(swap.dir()), 1);
        assert_eq!(swap.stats().ram_entries, 0);

        let loaded = swap.load_from_swap(&id).unwrap();
        assert_eq!(loaded.shape(), &[2, 4]);
        assert_eq!(engine.read(&loaded).unwrap(), vec![0.5; 8]);

        swap.delete(&id).unwrap();
        assert_eq!(file_count(swap.dir()), 0);
        assert!(swap.load_from_swap(&id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_delete_ram_entry_releases_estimate() {
        let dir = tempdir().unwrap();
        let engine: Arc<dyn MathEngine> = Arc::new(CpuEngine::new());
        let swap = SwapStore::new(Arc::clone(&engine), dir.path(), "s3", 1024).unwrap();

        let t = engine.create(&[4], Location::Device).unwrap();
        let id = swap.swap_out(&t, "x").unwrap();
        let live = engine.stats().live_tensors;
        swap.delete(&id).unwrap();
        assert_eq!(swap.stats().ram_bytes, 0);
        assert_eq!(engine.stats().live_tensors, live - 1);
        assert!(swap.delete(&id).is_err());
    }

    fn random_bits(rng: &mut StdRng, len: usize) -> Vec<f32> {
        (0..len).map(|_| f32::from_bits(rng.gen::<u32>() & 0xff7f_ffff)).collect()
    }

    #[test]
    fn test_random_content_is_bit_identical_in_both_tiers() {
        let dir = tempdir().unwrap();
        let engine: Arc<dyn MathEngine> = Arc::new(CpuEngine::new());
        let mut rng = StdRng::seed_from_u64(17);
        let shapes: [&[usize]; 4] = [&[1], &[7], &[3, 5], &[2, 3, 4]];

        for (ram_limit, tier) in [(1 << 20, SwapTier::Ram), (0, SwapTier::Disk)] {
            let config = MemoryConfig {
                swap_ram_limit_bytes: ram_limit,
                ..MemoryConfig::default()
            };
            let swap = SwapStore::from_config(Arc::clone(&engine), dir.path(), "random", &config).unwrap();
            for shape in shapes {
                let data = random_bits(&mut rng, shape.iter().product());
                let t = engine.from_slice(&data, shape, Location::Device).unwrap();
                let id = swap.swap_out(&t, "random").unwrap();
                assert_eq!(swap.tier(&id), Some(tier));
                engine.fill(&t, 0.0).unwrap();

                let loaded = swap.load_from_swap(&id).unwrap();
                assert_eq!(loaded.shape(), shape);
                let bits: Vec<u32> = engine.read(&loaded).unwrap().iter().map(|x| x.to_bits()).collect();
                let expected: Vec<u32> = data.iter().map(|x| x.to_bits()).collect();
                assert_eq!(bits, expected);
            }
        }
    }

    #[test]
    fn test_dispose_purges_session() {
        let dir = tempdir().unwrap();
        let engine: Arc<dyn MathEngine> = Arc::new(CpuEngine::new());
        let swap = SwapStore::new(Arc::clone(&engine), dir.path(), "s4", 8).unwrap();
        let t = engine.create(&[16], Location::Device).unwrap();
        let id = swap.swap_out(&t, "x").unwrap();
        let session_dir = swap.dir().to_path_buf();
        assert!(session_dir.exists());

        swap.dispose();
        assert!(!session_dir.exists());
        assert!(matches!(swap.load_from_swap(&id), Err(TensorError::InvalidState(_))));
        swap.dispose();
    }
}
