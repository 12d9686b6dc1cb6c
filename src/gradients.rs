use tracing::debug;

use crate::config::ModelConfig;
use crate::engine::{MathEngine, Tensor};
use crate::error::Result;
use crate::memory::Scope;
use crate::params::{ParamId, ParamTable};

/// Added to the norm before dividing so a zero norm never divides by zero.
pub const CLIP_EPSILON: f64 = 1e-6;

/// One zero-initialised gradient tensor per trainable parameter.
///
/// The tensors are owned by the scope the map was created in; the map only
/// holds handles and must not outlive that scope.
pub struct GradientMap {
    grads: ParamTable<Tensor>,
}

impl GradientMap {
    pub fn zeros(scope: &mut Scope, config: &ModelConfig) -> Result<Self> {
        let grads = ParamTable::try_build(&ParamId::TRAINABLE, |param| scope.create_tensor(&param.shape(config)))?;
        Ok(GradientMap { grads })
    }

    pub fn get(&self, param: ParamId) -> Option<&Tensor> {
        self.grads.get(param)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &Tensor)> {
        self.grads.iter()
    }

    /// `self += other`, parameter by parameter.
    pub fn accumulate(&self, engine: &dyn MathEngine, other: &GradientMap) -> Result<()> {
        for (param, grad) in self.grads.iter() {
            if let Some(src) = other.get(param) {
                engine.add_assign(grad, src)?;
            }
        }
        Ok(())
    }

    pub fn scale(&self, engine: &dyn MathEngine, factor: f32) -> Result<()> {
        for (_, grad) in self.grads.iter() {
            engine.scale_assign(grad, factor)?;
        }
        Ok(())
    }

    /// Zeroes NaN/Inf entries and clamps the rest to `[-max_abs, max_abs]`.
    /// Returns the number of non-finite values replaced.
    pub fn sanitize(&self, engine: &dyn MathEngine, max_abs: f32) -> Result<usize> {
        let mut replaced = 0;
        for (param, grad) in self.grads.iter() {
            let n = engine.sanitize(grad, max_abs)?;
            if n > 0 {
                debug!(param = %param, replaced = n, "non-finite gradient values zeroed");
            }
            replaced += n;
        }
        Ok(replaced)
    }

    /// Global L2 norm over every gradient tensor.
    pub fn l2_norm(&self, engine: &dyn MathEngine) -> Result<f64> {
        let mut sum = 0.0;
        for (_, grad) in self.grads.iter() {
            sum += engine.sum_squares(grad)?;
        }
        Ok(sum.sqrt())
    }

    /// Rescales every gradient by `max_norm / (norm + eps)` when the global
    /// norm exceeds `max_norm`. Returns the norm measured before clipping.
    pub fn clip_global_norm(&self, engine: &dyn MathEngine, max_norm: f32) -> Result<f64> {
        let norm = self.l2_norm(engine)?;
        if norm > max_norm as f64 {
            let factor = (max_norm as f64 / (norm + CLIP_EPSILON)) as f32;
            self.scale(engine, factor)?;
            debug!(norm, max_norm, "gradients clipped");
        }
        Ok(norm)
    }
}
