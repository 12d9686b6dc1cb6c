use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::TrainingConfig;
use crate::engine::{AdamStep, Location, MathEngine, Tensor};
use crate::error::Result;
use crate::memory::PersistentStore;

/// Optimizer trait for parameter updates during training
pub trait Optimizer {
    /// Updates `param` in place from `gradient`. `param_id` keys any
    /// per-parameter state.
    fn update(&mut self, param_id: &str, param: &Tensor, gradient: &Tensor) -> Result<()>;
    fn reset(&mut self);
    fn set_learning_rate(&mut self, learning_rate: f32);
    fn learning_rate(&self) -> f32;

    /// Persists resumable state. Stateless optimizers have nothing to save.
    fn checkpoint(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Stochastic Gradient Descent: θ = θ - η∇θ
pub struct Sgd {
    engine: Arc<dyn MathEngine>,
    learning_rate: f32,
}

impl Sgd {
    pub fn new(engine: Arc<dyn MathEngine>, learning_rate: f32) -> Self {
        Sgd { engine, learning_rate }
    }
}

impl Optimizer for Sgd {
    fn update(&mut self, _param_id: &str, param: &Tensor, gradient: &Tensor) -> Result<()> {
        let step = self.engine.scale(gradient, -self.learning_rate)?;
        let result = self.engine.add_assign(param, &step);
        self.engine.dispose(&step)?;
        result
    }

    fn reset(&mut self) {
        // SGD has no state to reset
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

struct Moments {
    m: Tensor,
    v: Tensor,
    t: u64,
}

/// Adam optimizer with adaptive learning rates
///
/// Implements: m_t = β₁m_{t-1} + (1-β₁)g_t
///             v_t = β₂v_{t-1} + (1-β₂)g_t²
///             θ_t = θ_{t-1} - η * m̂_t / (√v̂_t + ε)
/// where m̂_t and v̂_t are bias-corrected estimates
///
/// Each parameter keeps its own timestep. When a store is attached, moments
/// saved by [`Adam::save_state_to_disk`] are picked up on the first update of
/// a parameter, so a restarted run continues where the checkpoint left off.
pub struct Adam {
    engine: Arc<dyn MathEngine>,
    store: Option<Arc<PersistentStore>>,
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    state: HashMap<String, Moments>,
}

impl Adam {
    pub fn new(engine: Arc<dyn MathEngine>, learning_rate: f32) -> Self {
        Adam::with_params(engine, learning_rate, 0.9, 0.999, 1e-8)
    }

    pub fn with_params(engine: Arc<dyn MathEngine>, learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Adam {
            engine,
            store: None,
            learning_rate,
            beta1,
            beta2,
            epsilon,
            state: HashMap::new(),
        }
    }

    pub fn from_config(engine: Arc<dyn MathEngine>, config: &TrainingConfig) -> Self {
        Adam::with_params(engine, config.learning_rate, config.beta1, config.beta2, config.epsilon)
    }

    /// Resumes from and checkpoints to `store`.
    pub fn with_store(mut self, store: Arc<PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn state_ids(param_id: &str) -> [String; 3] {
        [
            format!("adam_m_{}", param_id),
            format!("adam_v_{}", param_id),
            format!("adam_t_{}", param_id),
        ]
    }

    /// Steps taken so far for `param_id`, if it has state.
    pub fn step_count(&self, param_id: &str) -> Option<u64> {
        self.state.get(param_id).map(|s| s.t)
    }

    pub fn state_count(&self) -> usize {
        self.state.len()
    }

    /// Loads persisted moments for `param_id`. `None` when there are none or
    /// they no longer match the parameter's shape.
    fn restore(&self, store: &PersistentStore, param_id: &str, param: &Tensor) -> Result<Option<Moments>> {
        let [m_id, v_id, t_id] = Self::state_ids(param_id);
        if !store.contains(&m_id) || !store.contains(&v_id) {
            return Ok(None);
        }
        if store.get_shape(&m_id)? != param.shape() || store.get_shape(&v_id)? != param.shape() {
            warn!(param = %param_id, "stored Adam moments have a stale shape, starting fresh");
            return Ok(None);
        }
        let t = if store.contains(&t_id) {
            let t_tensor = store.load(&t_id)?;
            let value = self.engine.read_scalar(&t_tensor);
            self.engine.dispose(&t_tensor)?;
            value?.max(0.0) as u64
        } else {
            0
        };
        let m = store.load(&m_id)?;
        let v = match store.load(&v_id) {
            Ok(v) => v,
            Err(e) => {
                self.engine.dispose(&m)?;
                return Err(e);
            }
        };
        debug!(param = %param_id, t, "resumed Adam moments");
        Ok(Some(Moments { m, v, t }))
    }

    fn fresh(&self, param: &Tensor) -> Result<Moments> {
        let m = self.engine.zeros_like(param)?;
        let v = match self.engine.zeros_like(param) {
            Ok(v) => v,
            Err(e) => {
                self.engine.dispose(&m)?;
                return Err(e);
            }
        };
        Ok(Moments { m, v, t: 0 })
    }

    fn init_state(&self, param_id: &str, param: &Tensor) -> Result<Moments> {
        if let Some(store) = &self.store {
            match self.restore(store, param_id, param) {
                Ok(Some(moments)) => return Ok(moments),
                Ok(None) => {}
                Err(e) => warn!(param = %param_id, error = %e, "could not resume Adam moments"),
            }
        }
        self.fresh(param)
    }

    /// Writes every moment pair and timestep to the store under ids derived
    /// from the parameter id.
    pub fn save_state_to_disk(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        for (param_id, moments) in &self.state {
            let [m_id, v_id, t_id] = Self::state_ids(param_id);
            store.overwrite(&m_id, &moments.m)?;
            store.overwrite(&v_id, &moments.v)?;
            let t = self.engine.from_slice(&[moments.t as f32], &[1], Location::Host)?;
            let saved = store.overwrite(&t_id, &t);
            self.engine.dispose(&t)?;
            saved?;
        }
        debug!(params = self.state.len(), "saved Adam state");
        Ok(())
    }
}

impl Optimizer for Adam {
    fn update(&mut self, param_id: &str, param: &Tensor, gradient: &Tensor) -> Result<()> {
        if !self.state.contains_key(param_id) {
            let moments = self.init_state(param_id, param)?;
            self.state.insert(param_id.to_string(), moments);
        }
        let Some(moments) = self.state.get_mut(param_id) else {
            return Ok(());
        };
        moments.t += 1;
        let step = AdamStep {
            learning_rate: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            epsilon: self.epsilon,
            t: moments.t,
        };
        self.engine.adam_step(param, gradient, &moments.m, &moments.v, &step)
    }

    fn reset(&mut self) {
        for (param_id, moments) in self.state.drain() {
            for tensor in [&moments.m, &moments.v] {
                if let Err(e) = self.engine.dispose(tensor) {
                    warn!(param = %param_id, error = %e, "failed to release Adam moment");
                }
            }
        }
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn checkpoint(&mut self) -> Result<()> {
        self.save_state_to_disk()
    }
}

impl Drop for Adam {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CpuEngine;
    use tempfile::tempdir;

    fn engine() -> Arc<dyn MathEngine> {
        Arc::new(CpuEngine::new())
    }

    #[test]
    fn test_sgd_optimizer() {
        let engine = engine();
        let mut optimizer = Sgd::new(Arc::clone(&engine), 0.1);
        let param = engine.from_slice(&[1.0, 2.0, 3.0, 4.0], &[2, 2], Location::Device).unwrap();
        let gradient = engine.from_slice(&[0.1, 0.2, 0.3, 0.4], &[2, 2], Location::Device).unwrap();

        optimizer.update("test_param", &param, &gradient).unwrap();
        let updated = engine.read(&param).unwrap();
        for (got, want) in updated.iter().zip([0.99, 1.98, 2.97, 3.96]) {
            assert!((got - want).abs() < 1e-6);
        }
    }

    #[test]
    fn test_adam_single_step_closed_form() {
        let engine = engine();
        let (lr, b1, b2, eps) = (0.01f32, 0.8f32, 0.95f32, 1e-6f32);
        let mut optimizer = Adam::with_params(Arc::clone(&engine), lr, b1, b2, eps);
        let start = [1.0f32, -2.0, 0.5];
        let g = [0.3f32, -0.1, 2.0];
        let param = engine.from_slice(&start, &[1, 3], Location::Device).unwrap();
        let gradient = engine.from_slice(&g, &[1, 3], Location::Device).unwrap();

        optimizer.update("w", &param, &gradient).unwrap();

        let updated = engine.read(&param).unwrap();
        for k in 0..3 {
            let m = (1.0 - b1 as f64) * g[k] as f64;
            let v = (1.0 - b2 as f64) * (g[k] as f64).powi(2);
            let m_hat = m / (1.0 - b1 as f64);
            let v_hat = v / (1.0 - b2 as f64);
            let expected = start[k] as f64 - lr as f64 * m_hat / (v_hat.sqrt() + eps as f64);
            assert!((updated[k] as f64 - expected).abs() < 1e-5, "element {}", k);
        }
        assert_eq!(optimizer.step_count("w"), Some(1));
    }

    #[test]
    fn test_adam_keeps_independent_timesteps() {
        let engine = engine();
        let mut optimizer = Adam::new(Arc::clone(&engine), 0.001);
        let a = engine.from_slice(&[1.0], &[1, 1], Location::Device).unwrap();
        let b = engine.from_slice(&[1.0, 1.0], &[1, 2], Location::Device).unwrap();
        let ga = engine.from_slice(&[0.5], &[1, 1], Location::Device).unwrap();
        let gb = engine.from_slice(&[0.5, 0.5], &[1, 2], Location::Device).unwrap();

        optimizer.update("a", &a, &ga).unwrap();
        optimizer.update("a", &a, &ga).unwrap();
        optimizer.update("b", &b, &gb).unwrap();
        assert_eq!(optimizer.step_count("a"), Some(2));
        assert_eq!(optimizer.step_count("b"), Some(1));

        let live = engine.stats().live_tensors;
        optimizer.reset();
        assert_eq!(optimizer.state_count(), 0);
        assert_eq!(engine.stats().live_tensors, live - 4);
    }

    #[test]
    fn test_adam_resumes_from_store() {
        let dir = tempdir().unwrap();
        let engine = engine();
        let store = Arc::new(PersistentStore::open(Arc::clone(&engine), dir.path(), "adam").unwrap());
        let param = engine.from_slice(&[1.0, 1.0], &[1, 2], Location::Device).unwrap();
        let gradient = engine.from_slice(&[0.2, -0.2], &[1, 2], Location::Device).unwrap();

        let mut first = Adam::new(Arc::clone(&engine), 0.01).with_store(Arc::clone(&store));
        first.update("w", &param, &gradient).unwrap();
        first.update("w", &param, &gradient).unwrap();
        first.checkpoint().unwrap();
        drop(first);
        assert!(store.contains("adam_m_w"));

        let mut resumed = Adam::new(Arc::clone(&engine), 0.01).with_store(Arc::clone(&store));
        resumed.update("w", &param, &gradient).unwrap();
        assert_eq!(resumed.step_count("w"), Some(3));

        let mut fresh = Adam::new(Arc::clone(&engine), 0.01);
        fresh.update("w", &param, &gradient).unwrap();
        assert_eq!(fresh.step_count("w"), Some(1));
    }

    #[test]
    fn test_adam_ignores_moments_of_another_shape() {
        let dir = tempdir().unwrap();
        let engine = engine();
        let store = Arc::new(PersistentStore::open(Arc::clone(&engine), dir.path(), "adam").unwrap());
        let stale = engine.from_slice(&[1.0, 2.0, 3.0], &[1, 3], Location::Host).unwrap();
        store.overwrite("adam_m_w", &stale).unwrap();
        store.overwrite("adam_v_w", &stale).unwrap();

        let mut optimizer = Adam::new(Arc::clone(&engine), 0.01).with_store(store);
        let param = engine.from_slice(&[1.0, 1.0], &[1, 2], Location::Device).unwrap();
        let gradient = engine.from_slice(&[0.1, 0.1], &[1, 2], Location::Device).unwrap();
        optimizer.update("w", &param, &gradient).unwrap();
        assert_eq!(optimizer.step_count("w"), Some(1));
    }
}
