use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::MemoryConfig;
use crate::engine::{shape_key, Location, MathEngine, Tensor};
use crate::error::Result;

/// Outcome of handing a tensor back to the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    /// Pushed onto its shape's free list.
    Pooled,
    /// The free list was full, so the buffer was destroyed.
    Destroyed,
    /// The handle names a buffer that is already on a free list.
    Ignored,
    /// The pool never issued this buffer; the caller still owns it.
    Foreign,
}

/// Counters describing pool behaviour.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub returns: u64,
    pub destroyed: u64,
    pub trims: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct PoolState {
    free: HashMap<String, Vec<Tensor>>,
    in_use: HashSet<u64>,
    /// Every live buffer the pool issued, with its byte size.
    issued: HashMap<u64, usize>,
    tracked_bytes: usize,
    operations: u64,
    stats: PoolStats,
}

/// Recycles same-shape device buffers.
///
/// A returned buffer is moved to a fresh engine handle before it goes on the
/// free list, so the handle the caller released can no longer reach it.
///
/// Free lists are keyed by the canonical shape string and capped per shape.
/// Every `trim_interval` operations, or as soon as tracked memory exceeds
/// `max_bytes`, the pool evicts free buffers (largest pools first) down to
/// half of `max_bytes` and asks the engine to collect.
pub struct TensorPool {
    engine: Arc<dyn MathEngine>,
    state: Mutex<PoolState>,
    max_per_shape: usize,
    max_bytes: usize,
    trim_interval: u64,
}

impl TensorPool {
    pub fn new(engine: Arc<dyn MathEngine>, config: &MemoryConfig) -> Self {
        TensorPool {
            engine,
            state: Mutex::new(PoolState::default()),
            max_per_shape: config.pool_max_per_shape,
            max_bytes: config.pool_max_bytes,
            trim_interval: config.pool_trim_interval.max(1),
        }
    }

    pub fn engine(&self) -> &Arc<dyn MathEngine> {
        &self.engine
    }

    /// Hands out a device buffer of `shape`. Contents are unspecified when
    /// the buffer is recycled.
    pub fn rent(&self, shape: &[usize]) -> Result<Tensor> {
        let key = shape_key(shape);
        let mut state = self.state.lock();
        state.operations += 1;

        let recycled = state.free.get_mut(&key).and_then(|list| list.pop());
        let tensor = match recycled {
            Some(tensor) => {
                state.stats.hits += 1;
                tensor
            }
            None => {
                state.stats.misses += 1;
                let tensor = self.engine.create(shape, Location::Device)?;
                state.issued.insert(tensor.id(), tensor.byte_size());
                state.tracked_bytes += tensor.byte_size();
                tensor
            }
        };
        state.in_use.insert(tensor.id());
        self.maybe_trim(&mut state);
        Ok(tensor)
    }

    /// Rents a buffer wrapped so that dropping it returns it to this pool.
    pub fn lease(self: &Arc<Self>, shape: &[usize]) -> Result<PooledTensor> {
        let tensor = self.rent(shape)?;
        Ok(PooledTensor {
            pool: Arc::clone(self),
            tensor,
            armed: true,
        })
    }

    pub fn release(&self, tensor: &Tensor) -> Result<Release> {
        let mut state = self.state.lock();
        if !state.issued.contains_key(&tensor.id()) {
            return Ok(Release::Foreign);
        }
        if !state.in_use.remove(&tensor.id()) {
            return Ok(Release::Ignored);
        }
        state.operations += 1;
        state.stats.returns += 1;

        let key = shape_key(tensor.shape());
        let full = state
            .free
            .get(&key)
            .map_or(false, |list| list.len() >= self.max_per_shape);
        let outcome = if full {
            self.destroy(&mut state, tensor)?;
            state.stats.destroyed += 1;
            Release::Destroyed
        } else {
            // The caller's handle dies here; the buffer lives on under a new one.
            let bytes = state.issued.remove(&tensor.id()).unwrap_or(0);
            match self.engine.rehandle(tensor) {
                Ok(fresh) => {
                    state.issued.insert(fresh.id(), bytes);
                    state.free.entry(key).or_default().push(fresh);
                }
                Err(e) => {
                    // The engine no longer holds the buffer, so stop accounting for it.
                    state.tracked_bytes -= bytes;
                    return Err(e);
                }
            }
            Release::Pooled
        };
        self.maybe_trim(&mut state);
        Ok(outcome)
    }

    /// Returns `tensor` to the pool, destroying it directly if the pool
    /// never issued it.
    pub fn release_or_destroy(&self, tensor: &Tensor) -> Result<()> {
        if self.release(tensor)? == Release::Foreign {
            self.engine.dispose(tensor)?;
        }
        Ok(())
    }

    /// Evicts free buffers down to half of the memory cap, then collects.
    pub fn trim(&self) {
        let mut state = self.state.lock();
        self.trim_locked(&mut state);
    }

    /// Destroys every free buffer.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let lists: Vec<Vec<Tensor>> = state.free.drain().map(|(_, list)| list).collect();
        for tensor in lists.into_iter().flatten() {
            if let Err(e) = self.destroy(&mut state, &tensor) {
                warn!(tensor = tensor.id(), error = %e, "failed to destroy pooled tensor");
            }
        }
    }

    pub fn free_count(&self, shape: &[usize]) -> usize {
        let state = self.state.lock();
        state.free.get(&shape_key(shape)).map_or(0, Vec::len)
    }

    pub fn in_use_count(&self) -> usize {
        self.state.lock().in_use.len()
    }

    pub fn tracked_bytes(&self) -> usize {
        self.state.lock().tracked_bytes
    }

    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats
    }

    fn destroy(&self, state: &mut PoolState, tensor: &Tensor) -> Result<()> {
        if let Some(bytes) = state.issued.remove(&tensor.id()) {
            state.tracked_bytes -= bytes;
        }
        self.engine.dispose(tensor)
    }

    fn maybe_trim(&self, state: &mut PoolState) {
        if state.operations % self.trim_interval == 0 || state.tracked_bytes > self.max_bytes {
            self.trim_locked(state);
        }
    }

    fn trim_locked(&self, state: &mut PoolState) {
        let target = self.max_bytes / 2;
        let mut evicted = 0u64;

        if state.tracked_bytes > target {
            let mut by_size: Vec<(String, usize)> = state
                .free
                .iter()
                .map(|(key, list)| (key.clone(), list.iter().map(Tensor::byte_size).sum()))
                .collect();
            by_size.sort_by(|a, b| b.1.cmp(&a.1));

            'outer: for (key, _) in by_size {
                while state.tracked_bytes > target {
                    let Some(tensor) = state.free.get_mut(&key).and_then(|list| list.pop()) else {
                        continue 'outer;
                    };
                    match self.destroy(state, &tensor) {
                        Ok(()) => evicted += 1,
                        Err(e) => warn!(tensor = tensor.id(), error = %e, "failed to evict pooled tensor"),
                    }
                }
                break;
            }
            state.free.retain(|_, list| !list.is_empty());
        }

        self.engine.collect_garbage();
        state.stats.trims += 1;
        state.stats.evictions += evicted;
        debug!(evicted, tracked_bytes = state.tracked_bytes, "tensor pool trimmed");
    }
}

impl Drop for TensorPool {
    fn drop(&mut self) {
        self.clear();
    }
}

/// A rented buffer whose release goes back to the pool instead of
/// destroying it.
pub struct PooledTensor {
    pool: Arc<TensorPool>,
    tensor: Tensor,
    armed: bool,
}

impl PooledTensor {
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn release(mut self) -> Result<Release> {
        self.armed = false;
        self.pool.release(&self.tensor)
    }

    /// Detaches the handle; the caller becomes responsible for returning it.
    pub fn into_inner(mut self) -> Tensor {
        self.armed = false;
        self.tensor.clone()
    }
}

impl Deref for PooledTensor {
    type Target = Tensor;

    fn deref(&self) -> &Tensor {
        &self.tensor
    }
}

impl Drop for PooledTensor {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.pool.release(&self.tensor) {
                warn!(tensor = self.tensor.id(), error = %e, "failed to return leased tensor");
            }
        }
    }
}
