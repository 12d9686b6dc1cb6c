use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::format::{load_tensor, read_tensor_shape, save_tensor};
use super::{sanitize_label, TENSOR_CACHE_DIR};
use crate::engine::{Location, MathEngine, Tensor};
use crate::error::{Result, TensorError};

/// Durable named tensors with a write-through host cache.
///
/// Every id maps to exactly one file under
/// `<work_dir>/TensorCache/<session_id>/<id>.bin` and at most one cached
/// host-resident master. Readers always receive their own device copy and
/// must release it; the master never leaves the store.
pub struct PersistentStore {
    engine: Arc<dyn MathEngine>,
    dir: PathBuf,
    session_id: String,
    index: DashMap<String, Vec<usize>>,
    cache: DashMap<String, Tensor>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    counter: AtomicU64,
    disposed: AtomicBool,
}

impl PersistentStore {
    /// Opens (or creates) the session directory and indexes any tensor
    /// files already in it, so a resumed session sees its earlier weights.
    pub fn open<P: AsRef<Path>>(engine: Arc<dyn MathEngine>, work_dir: P, session_id: &str) -> Result<Self> {
        let dir = work_dir.as_ref().join(TENSOR_CACHE_DIR).join(session_id);
        fs::create_dir_all(&dir)?;

        let index = DashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_owned) else {
                continue;
            };
            match read_tensor_shape(&path) {
                Ok(shape) => {
                    index.insert(id, shape);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable tensor file"),
            }
        }
        if !index.is_empty() {
            info!(session = session_id, tensors = index.len(), "resumed tensor store");
        }

        Ok(PersistentStore {
            engine,
            dir,
            session_id: session_id.to_string(),
            counter: AtomicU64::new(index.len() as u64),
            index,
            cache: DashMap::new(),
            locks: DashMap::new(),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn engine(&self) -> &Arc<dyn MathEngine> {
        &self.engine
    }

    fn ensure_open(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(TensorError::InvalidState("tensor store has been disposed".into()));
        }
        Ok(())
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.bin", id))
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(id.to_string()).or_default().value())
    }

    /// Persists `tensor` under a new globally unique id. The host cache is
    /// left untouched.
    pub fn store(&self, tensor: &Tensor, name: &str) -> Result<String> {
        self.ensure_open()?;
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let id = format!("{:06}_{}_{:08x}", n, sanitize_label(name), rand::random::<u32>());
        save_tensor(self.engine.as_ref(), tensor, self.path_for(&id))?;
        self.index.insert(id.clone(), tensor.shape().to_vec());
        debug!(id = %id, shape = ?tensor.shape(), "tensor stored");
        Ok(id)
    }

    /// Returns a device copy of the tensor named `id`.
    pub fn load(&self, id: &str) -> Result<Tensor> {
        self.ensure_open()?;
        if let Some(master) = self.cache.get(id) {
            return self.engine.clone_tensor(master.value(), Location::Device);
        }
        let lock = self.lock_for(id);
        let _guard = lock.lock();
        self.load_locked(id)
    }

    fn load_locked(&self, id: &str) -> Result<Tensor> {
        if let Some(master) = self.cache.get(id) {
            return self.engine.clone_tensor(master.value(), Location::Device);
        }
        if !self.index.contains_key(id) {
            return Err(TensorError::NotFound(format!("weight id {}", id)));
        }
        let master = load_tensor(self.engine.as_ref(), self.path_for(id), Location::Host)?;
        let copy = self.engine.clone_tensor(&master, Location::Device)?;
        if let Some(old) = self.cache.insert(id.to_string(), master) {
            self.release_master(id, &old);
        }
        Ok(copy)
    }

    /// Rewrites the file and replaces the cached master with a copy of
    /// `tensor`. Creates the entry if `id` is not indexed yet.
    pub fn overwrite(&self, id: &str, tensor: &Tensor) -> Result<()> {
        self.ensure_open()?;
        let lock = self.lock_for(id);
        let _guard = lock.lock();
        self.overwrite_locked(id, tensor)
    }

    fn overwrite_locked(&self, id: &str, tensor: &Tensor) -> Result<()> {
        save_tensor(self.engine.as_ref(), tensor, self.path_for(id))?;
        self.index.insert(id.to_string(), tensor.shape().to_vec());
        let fresh = self.engine.clone_tensor(tensor, Location::Host)?;
        if let Some(old) = self.cache.insert(id.to_string(), fresh) {
            self.release_master(id, &old);
        }
        Ok(())
    }

    /// Loads `id`, applies `f` to the copy in place, and writes it back,
    /// all under the id's lock.
    pub fn update_tensor<F>(&self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&dyn MathEngine, &Tensor) -> Result<()>,
    {
        self.ensure_open()?;
        let lock = self.lock_for(id);
        let _guard = lock.lock();
        let working = self.load_locked(id)?;
        let result = f(self.engine.as_ref(), &working).and_then(|_| self.overwrite_locked(id, &working));
        if let Err(e) = self.engine.dispose(&working) {
            warn!(id = %id, error = %e, "failed to release working copy");
        }
        result
    }

    pub fn get_shape(&self, id: &str) -> Result<Vec<usize>> {
        self.index
            .get(id)
            .map(|shape| shape.value().clone())
            .ok_or_else(|| TensorError::NotFound(format!("weight id {}", id)))
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.ensure_open()?;
        let lock = self.lock_for(id);
        {
            let _guard = lock.lock();
            if self.index.remove(id).is_none() {
                return Err(TensorError::NotFound(format!("weight id {}", id)));
            }
            if let Some((_, master)) = self.cache.remove(id) {
                self.release_master(id, &master);
            }
            if let Err(e) = fs::remove_file(self.path_for(id)) {
                warn!(id = %id, error = %e, "failed to remove tensor file");
            }
        }
        // Only the map and `lock` still reference the mutex, so no writer can be waiting on it.
        self.locks.remove_if(id, |_, entry| Arc::ptr_eq(entry, &lock) && Arc::strong_count(entry) == 2);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.index.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_cached(&self, id: &str) -> bool {
        self.cache.contains_key(id)
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    /// Drops every cached master; files are unaffected.
    pub fn clear_cache(&self) {
        let ids: Vec<String> = self.cache.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, master)) = self.cache.remove(&id) {
                self.release_master(&id, &master);
            }
        }
    }

    /// Releases the cache and deletes the session directory. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.clear_cache();
        self.index.clear();
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "failed to remove tensor store directory");
        }
    }

    fn release_master(&self, id: &str, master: &Tensor) {
        if let Err(e) = self.engine.dispose(master) {
            warn!(id = %id, error = %e, "failed to release cached master");
        }
    }
}

impl Drop for PersistentStore {
    fn drop(&mut self) {
        // Files outlive the process so checkpoints can be resumed.
        self.clear_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CpuEngine;
    use crate::memory::format::read_tensor_file;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    fn setup(dir: &Path) -> (Arc<dyn MathEngine>, PersistentStore) {
        let engine: Arc<dyn MathEngine> = Arc::new(CpuEngine::new());
        let store = PersistentStore::open(Arc::clone(&engine), dir, "session").unwrap();
        (engine, store)
    }

    #[test]
    fn test_store_does_not_populate_cache() {
        let dir = tempdir().unwrap();
        let (engine, store) = setup(dir.path());
        let t = engine.from_slice(&[1.0, 2.0], &[1, 2], Location::Device).unwrap();
        let id = store.store(&t, "W_forget").unwrap();

        assert!(id.contains("W_forget"));
        assert!(!store.is_cached(&id));
        assert_eq!(store.get_shape(&id).unwrap(), vec![1, 2]);
        assert!(store.dir().join(format!("{}.bin", id)).exists());
    }

    #[test]
    fn test_load_returns_independent_copies() {
        let dir = tempdir().unwrap();
        let (engine, store) = setup(dir.path());
        let t = engine.from_slice(&[1.0, 2.0, 3.0], &[3], Location::Device).unwrap();
        let id = store.store(&t, "bias").unwrap();

        let a = store.load(&id).unwrap();
        assert!(store.is_cached(&id));
        let b = store.load(&id).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(a.is_device());

        engine.fill(&a, 9.0).unwrap();
        engine.dispose(&a).unwrap();
        assert_eq!(engine.read(&b).unwrap(), vec![1.0, 2.0, 3.0]);
        let c = store.load(&id).unwrap();
        assert_eq!(engine.read(&c).unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_overwrite_keeps_file_and_cache_consistent() {
        let dir = tempdir().unwrap();
        let (engine, store) = setup(dir.path());
        let t = engine.from_slice(&[1.0, 1.0], &[2], Location::Device).unwrap();
        let id = store.store(&t, "w").unwrap();
        let _warm = store.load(&id).unwrap();

        let replacement = engine.from_slice(&[4.0, 5.0, 6.0], &[3], Location::Device).unwrap();
        store.overwrite(&id, &replacement).unwrap();
        assert_eq!(store.get_shape(&id).unwrap(), vec![3]);

        let cached = store.load(&id).unwrap();
        assert_eq!(engine.read(&cached).unwrap(), vec![4.0, 5.0, 6.0]);

        store.clear_cache();
        let from_disk = store.load(&id).unwrap();
        assert_eq!(engine.read(&from_disk).unwrap(), vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_update_tensor_applies_in_place() {
        let dir = tempdir().unwrap();
        let (engine, store) = setup(dir.path());
        let t = engine.from_slice(&[1.0, 2.0], &[2], Location::Device).unwrap();
        let id = store.store(&t, "w").unwrap();

        store.update_tensor(&id, |e, w| e.scale_assign(w, 3.0)).unwrap();
        let loaded = store.load(&id).unwrap();
        assert_eq!(engine.read(&loaded).unwrap(), vec![3.0, 6.0]);
    }

    #[test]
    fn test_missing_and_deleted_ids_are_not_found() {
        let dir = tempdir().unwrap();
        let (engine, store) = setup(dir.path());
        assert!(store.load("nope").unwrap_err().is_not_found());

        let t = engine.create(&[2], Location::Device).unwrap();
        let id = store.store(&t, "w").unwrap();
        store.delete(&id).unwrap();
        assert!(store.load(&id).unwrap_err().is_not_found());
        assert!(store.delete(&id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_delete_keeps_lock_held_by_another_writer() {
        let dir = tempdir().unwrap();
        let (engine, store) = setup(dir.path());
        let t = engine.create(&[2], Location::Device).unwrap();
        let id = store.store(&t, "w").unwrap();

        let held = store.lock_for(&id);
        store.delete(&id).unwrap();
        assert!(Arc::ptr_eq(&held, &store.lock_for(&id)));

        drop(held);
        let other = store.store(&t, "v").unwrap();
        let _ = store.lock_for(&other);
        store.delete(&other).unwrap();
        assert!(!store.locks.contains_key(&other));
    }

    #[test]
    fn test_random_content_round_trips_bit_identically() {
        let dir = tempdir().unwrap();
        let (engine, store) = setup(dir.path());
        let mut rng = StdRng::seed_from_u64(23);
        let shapes: [&[usize]; 4] = [&[1], &[9], &[4, 6], &[2, 5, 3]];

        for shape in shapes {
            let data: Vec<f32> = (0..shape.iter().product::<usize>())
                .map(|_| f32::from_bits(rng.gen::<u32>() & 0xff7f_ffff))
                .collect();
            let expected: Vec<u32> = data.iter().map(|x| x.to_bits()).collect();
            let t = engine.from_slice(&data, shape, Location::Device).unwrap();
            let id = store.store(&t, "random").unwrap();
            engine.fill(&t, 0.0).unwrap();

            // First load misses the cache and reads the file; the second hits it.
            for cached in [false, true] {
                assert_eq!(store.is_cached(&id), cached);
                let loaded = store.load(&id).unwrap();
                assert_eq!(loaded.shape(), shape);
                let bits: Vec<u32> = engine.read(&loaded).unwrap().iter().map(|x| x.to_bits()).collect();
                assert_eq!(bits, expected);
                engine.dispose(&loaded).unwrap();
            }
        }
    }

    #[test]
    fn test_file_stays_readable_during_overwrites() {
        let dir = tempdir().unwrap();
        let (engine, store) = setup(dir.path());
        let shape = [200, 250];
        let ones = engine.from_slice(&vec![1.0; 50_000], &shape, Location::Host).unwrap();
        let twos = engine.from_slice(&vec![2.0; 50_000], &shape, Location::Host).unwrap();
        let id = store.store(&ones, "w").unwrap();
        let path = store.dir().join(format!("{}.bin", id));
        let done = AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..100 {
                    let next = if i % 2 == 0 { &twos } else { &ones };
                    store.overwrite(&id, next).unwrap();
                }
                done.store(true, Ordering::Release);
            });

            let mut reads = 0;
            while !done.load(Ordering::Acquire) || reads == 0 {
                let file = read_tensor_file(&path).unwrap();
                assert_eq!(file.shape, shape.to_vec());
                assert!(file.data.iter().all(|&x| x == file.data[0]));
                reads += 1;
            }
        });

        let reopened = PersistentStore::open(Arc::clone(&engine), dir.path(), "session").unwrap();
        assert_eq!(reopened.get_shape(&id).unwrap(), shape.to_vec());
    }

    #[test]
    fn test_reopen_rebuilds_index() {
        let dir = tempdir().unwrap();
        let engine: Arc<dyn MathEngine> = Arc::new(CpuEngine::new());
        let id = {
            let store = PersistentStore::open(Arc::clone(&engine), dir.path(), "resume").unwrap();
            let t = engine.from_slice(&[7.0; 6], &[2, 3], Location::Device).unwrap();
            store.store(&t, "embedding").unwrap()
        };

        let store = PersistentStore::open(Arc::clone(&engine), dir.path(), "resume").unwrap();
        assert_eq!(store.get_shape(&id).unwrap(), vec![2, 3]);
        let loaded = store.load(&id).unwrap();
        assert_eq!(engine.read(&loaded).unwrap(), vec![7.0; 6]);
    }

    #[test]
    fn test_dispose_removes_session_directory() {
        let dir = tempdir().unwrap();
        let (engine, store) = setup(dir.path());
        let t = engine.create(&[2], Location::Device).unwrap();
        let id = store.store(&t, "w").unwrap();
        let _ = store.load(&id).unwrap();

        let session_dir = store.dir().to_path_buf();
        store.dispose();
        assert!(!session_dir.exists());
        assert_eq!(store.cached_count(), 0);
        assert!(matches!(store.load(&id), Err(TensorError::InvalidState(_))));
    }
}
