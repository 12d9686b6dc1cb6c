use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{trace, warn};

use super::pool::TensorPool;
use super::store::PersistentStore;
use crate::engine::{Location, MathEngine, Tensor};
use crate::error::{Result, TensorError};

type Cleanup = Box<dyn FnOnce() -> Result<()> + Send>;

/// A lexically bounded unit of tensor ownership.
///
/// Tensors created, loaded, or tracked through a scope are released when it
/// is disposed (explicitly or on drop): cleanup callbacks first, in reverse
/// registration order, then tensors in reverse order. Device tensors go back
/// to the pool when one is attached; everything else is destroyed. Each
/// release runs in its own failure boundary, so one failure never prevents
/// the rest.
pub struct Scope {
    name: String,
    engine: Arc<dyn MathEngine>,
    pool: Option<Arc<TensorPool>>,
    store: Option<Arc<PersistentStore>>,
    tensors: Vec<Tensor>,
    cleanups: Vec<Cleanup>,
    disposed: bool,
}

impl Scope {
    pub fn new(name: impl Into<String>, engine: Arc<dyn MathEngine>) -> Self {
        Scope {
            name: name.into(),
            engine,
            pool: None,
            store: None,
            tensors: Vec::new(),
            cleanups: Vec::new(),
            disposed: false,
        }
    }

    pub fn with_pool(mut self, pool: Arc<TensorPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_store(mut self, store: Arc<PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self) -> &dyn MathEngine {
        self.engine.as_ref()
    }

    pub fn pool(&self) -> Option<&Arc<TensorPool>> {
        self.pool.as_ref()
    }

    pub fn store(&self) -> Option<&Arc<PersistentStore>> {
        self.store.as_ref()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn tracked_count(&self) -> usize {
        self.tensors.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.disposed {
            return Err(TensorError::InvalidState(format!("scope '{}' has been disposed", self.name)));
        }
        Ok(())
    }

    /// Allocates a zeroed device tensor, from the pool when one is attached.
    pub fn create_tensor(&mut self, shape: &[usize]) -> Result<Tensor> {
        self.ensure_open()?;
        let tensor = match &self.pool {
            Some(pool) => {
                let tensor = pool.rent(shape)?;
                self.engine.fill(&tensor, 0.0)?;
                tensor
            }
            None => self.engine.create(shape, Location::Device)?,
        };
        Ok(self.track(tensor))
    }

    pub fn create_tensor_from(&mut self, data: &[f32], shape: &[usize]) -> Result<Tensor> {
        self.ensure_open()?;
        let tensor = match &self.pool {
            Some(pool) => {
                let tensor = pool.rent(shape)?;
                if let Err(e) = self.engine.write(&tensor, data) {
                    pool.release_or_destroy(&tensor)?;
                    return Err(e);
                }
                tensor
            }
            None => self.engine.from_slice(data, shape, Location::Device)?,
        };
        Ok(self.track(tensor))
    }

    /// Loads a copy of a persisted tensor and tracks it.
    pub fn load_tensor(&mut self, id: &str) -> Result<Tensor> {
        self.ensure_open()?;
        let store = self.store.as_ref().ok_or_else(|| {
            TensorError::InvalidState(format!("scope '{}' has no tensor store", self.name))
        })?;
        let tensor = store.load(id)?;
        Ok(self.track(tensor))
    }

    /// Takes ownership of `tensor`; the returned handle is the same buffer.
    pub fn track(&mut self, tensor: Tensor) -> Tensor {
        self.tensors.push(tensor.clone());
        tensor
    }

    /// Tracks the result of an engine call.
    pub fn hold(&mut self, result: Result<Tensor>) -> Result<Tensor> {
        result.map(|tensor| self.track(tensor))
    }

    /// Stops tracking `tensor`; the caller becomes responsible for it.
    pub fn untrack(&mut self, tensor: &Tensor) -> bool {
        match self.tensors.iter().rposition(|t| t.id() == tensor.id()) {
            Some(pos) => {
                self.tensors.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Registers a callback to run at disposal, before tensors are released.
    pub fn on_dispose<F>(&mut self, cleanup: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.cleanups.push(Box::new(cleanup));
    }

    /// A child scope sharing this scope's engine, pool and store.
    pub fn create_sub_scope(&self, name: &str) -> Scope {
        Scope {
            name: format!("{}/{}", self.name, name),
            engine: Arc::clone(&self.engine),
            pool: self.pool.clone(),
            store: self.store.clone(),
            tensors: Vec::new(),
            cleanups: Vec::new(),
            disposed: false,
        }
    }

    /// Releases everything the scope owns. Returns the number of individual
    /// releases that failed; calling it again does nothing.
    pub fn dispose(&mut self) -> usize {
        if self.disposed {
            return 0;
        }
        self.disposed = true;
        let mut failures = 0;

        while let Some(cleanup) = self.cleanups.pop() {
            match catch_unwind(AssertUnwindSafe(cleanup)) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(scope = %self.name, error = %e, "cleanup callback failed");
                }
                Err(_) => {
                    failures += 1;
                    warn!(scope = %self.name, "cleanup callback panicked");
                }
            }
        }

        if !self.tensors.is_empty() && self.engine.is_gpu() {
            if let Err(e) = self.engine.synchronize() {
                warn!(scope = %self.name, error = %e, "device synchronization failed before release");
            }
        }

        let released = self.tensors.len();
        while let Some(tensor) = self.tensors.pop() {
            let engine = &self.engine;
            let pool = self.pool.as_ref().filter(|_| tensor.is_device());
            let outcome = catch_unwind(AssertUnwindSafe(|| match pool {
                Some(pool) => pool.release_or_destroy(&tensor),
                None => engine.dispose(&tensor),
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(scope = %self.name, tensor = tensor.id(), error = %e, "tensor release failed");
                }
                Err(_) => {
                    failures += 1;
                    warn!(scope = %self.name, tensor = tensor.id(), "tensor release panicked");
                }
            }
        }
        trace!(scope = %self.name, released, failures, "scope disposed");
        failures
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::engine::CpuEngine;
    use parking_lot::Mutex;

    fn engine() -> Arc<dyn MathEngine> {
        Arc::new(CpuEngine::new())
    }

    #[test]
    fn test_dispose_releases_all_tracked() {
        let engine = engine();
        let mut scope = Scope::new("test", Arc::clone(&engine));
        let a = scope.create_tensor(&[2, 2]).unwrap();
        let b = scope.create_tensor_from(&[1.0, 2.0], &[2]).unwrap();
        let c = scope.hold(engine.add(&b, &b)).unwrap();
        assert_eq!(engine.stats().live_tensors, 3);

        assert_eq!(scope.dispose(), 0);
        assert_eq!(engine.stats().live_tensors, 0);
        for t in [&a, &b, &c] {
            assert!(matches!(engine.read(t), Err(TensorError::Released(_))));
        }
        assert_eq!(scope.dispose(), 0);
    }

    #[test]
    fn test_pooled_tensors_return_to_pool() {
        let engine = engine();
        let pool = Arc::new(TensorPool::new(Arc::clone(&engine), &MemoryConfig::default()));
        let t = {
            let mut scope = Scope::new("pooled", Arc::clone(&engine)).with_pool(Arc::clone(&pool));
            let t = scope.create_tensor(&[3, 3]).unwrap();
            engine.fill(&t, 7.0).unwrap();
            t
        };
        assert_eq!(pool.free_count(&[3, 3]), 1);
        assert!(engine.read(&t).is_err());

        // Recycled buffers come back zeroed through create_tensor.
        let mut scope = Scope::new("again", Arc::clone(&engine)).with_pool(Arc::clone(&pool));
        let reused = scope.create_tensor(&[3, 3]).unwrap();
        assert_eq!(pool.stats().hits, 1);
        assert_eq!(engine.read(&reused).unwrap(), vec![0.0; 9]);
    }

    #[test]
    fn test_cleanups_run_in_reverse_and_failures_are_isolated() {
        let engine = engine();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut scope = Scope::new("cleanups", Arc::clone(&engine));
        let _t = scope.create_tensor(&[1]).unwrap();

        for i in 0..3 {
            let order = Arc::clone(&order);
            scope.on_dispose(move || {
                order.lock().push(i);
                Ok(())
            });
        }
        scope.on_dispose(|| Err(TensorError::InvalidState("boom".into())));
        scope.on_dispose(|| panic!("cleanup panic"));

        let failures = scope.dispose();
        assert_eq!(failures, 2);
        assert_eq!(*order.lock(), vec![2, 1, 0]);
        assert_eq!(engine.stats().live_tensors, 0);
    }

    #[test]
    fn test_already_released_tensor_does_not_block_others() {
        let engine = engine();
        let mut scope = Scope::new("partial", Arc::clone(&engine));
        let a = scope.create_tensor(&[1]).unwrap();
        let _b = scope.create_tensor(&[1]).unwrap();
        engine.dispose(&a).unwrap();

        assert_eq!(scope.dispose(), 1);
        assert_eq!(engine.stats().live_tensors, 0);
    }

    #[test]
    fn test_untrack_transfers_ownership() {
        let engine = engine();
        let kept = {
            let mut scope = Scope::new("outer", Arc::clone(&engine));
            let t = scope.create_tensor(&[2]).unwrap();
            assert!(scope.untrack(&t));
            t
        };
        assert!(engine.is_live(&kept));
    }

    #[test]
    fn test_sub_scope_shares_pool_and_releases_independently() {
        let engine = engine();
        let pool = Arc::new(TensorPool::new(Arc::clone(&engine), &MemoryConfig::default()));
        let mut parent = Scope::new("epoch", Arc::clone(&engine)).with_pool(Arc::clone(&pool));
        let outer = parent.create_tensor(&[4]).unwrap();
        {
            let mut child = parent.create_sub_scope("batch");
            assert_eq!(child.name(), "epoch/batch");
            child.create_tensor(&[4]).unwrap();
        }
        assert_eq!(pool.free_count(&[4]), 1);
        assert!(engine.is_live(&outer));
    }

    #[test]
    fn test_gpu_engine_synchronizes_before_release() {
        let engine: Arc<dyn MathEngine> = Arc::new(CpuEngine::simulating_gpu());
        let mut scope = Scope::new("gpu", Arc::clone(&engine));
        scope.create_tensor(&[2]).unwrap();
        scope.dispose();
        assert_eq!(engine.stats().synchronizations, 1);
    }

    #[test]
    fn test_disposed_scope_rejects_new_work() {
        let engine = engine();
        let mut scope = Scope::new("closed", engine);
        scope.dispose();
        assert!(matches!(scope.create_tensor(&[1]), Err(TensorError::InvalidState(_))));
        assert!(scope.load_tensor("x").is_err());
    }
}
