//! LSTM forward pass, backpropagation through time, and generation.
//!
//! Row-vector convention throughout: states and activations are `[1, n]`,
//! and a gate pre-activation is `x·W + h·U + b`. Every intermediate tensor is
//! owned by a [`Scope`]; single gate computations and backward timesteps run
//! in nested scopes so their temporaries are released as soon as they are
//! consumed.

use std::sync::Arc;

use rand::Rng;
use tracing::trace;

use crate::config::ModelConfig;
use crate::engine::{Location, MathEngine, Tensor, Transpose};
use crate::error::{Result, TensorError};
use crate::gradients::GradientMap;
use crate::memory::Scope;
use crate::params::{Gate, ParamId, ParamTable};
use crate::vocab::sample_with_temperature;

/// Lower bound applied to the target probability before taking the log.
pub const MIN_PROBABILITY: f32 = 1e-9;

/// Activations of one timestep, kept for the backward pass.
pub struct StepCache {
    pub token: usize,
    pub x: Tensor,
    pub h_prev: Tensor,
    pub c_prev: Tensor,
    pub forget: Tensor,
    pub input: Tensor,
    pub candidate: Tensor,
    pub output: Tensor,
    pub c_next: Tensor,
    pub h_next: Tensor,
    pub tanh_c: Tensor,
    pub probs: Tensor,
}

/// Result of running the forward pass over a sequence.
pub struct SequenceForward {
    pub steps: Vec<StepCache>,
    pub targets: Vec<usize>,
    /// Sum of `-ln p(target)` over all timesteps.
    pub loss_sum: f64,
}

impl SequenceForward {
    pub fn mean_loss(&self) -> f64 {
        if self.steps.is_empty() {
            0.0
        } else {
            self.loss_sum / self.steps.len() as f64
        }
    }
}

/// Loss and final state of one trained sequence. The state tensors belong
/// to the scope the sequence ran in.
pub struct SequenceOutcome {
    /// Per-token mean loss.
    pub loss: f64,
    pub loss_sum: f64,
    pub tokens: usize,
    pub final_hidden: Tensor,
    pub final_cell: Tensor,
}

pub struct Pipeline {
    engine: Arc<dyn MathEngine>,
    config: ModelConfig,
}

impl Pipeline {
    pub fn new(engine: Arc<dyn MathEngine>, config: ModelConfig) -> Self {
        Pipeline { engine, config }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn check_token(&self, token: usize) -> Result<()> {
        if token >= self.config.vocab_size {
            return Err(TensorError::InvalidState(format!(
                "token {} outside vocabulary of {}",
                token, self.config.vocab_size
            )));
        }
        Ok(())
    }

    /// Reads a device tensor back to the host after the device has caught up.
    fn read_host(&self, tensor: &Tensor) -> Result<Vec<f32>> {
        if self.engine.is_gpu() {
            self.engine.synchronize()?;
        }
        self.engine.read(tensor)
    }

    /// `activation(x·W_g + h·U_g + b_g)`; temporaries live in a nested scope.
    fn gate(&self, scope: &mut Scope, weights: &ParamTable<Tensor>, gate: Gate, x: &Tensor, h: &Tensor) -> Result<Tensor> {
        let e = self.engine.as_ref();
        let mut inner = scope.create_sub_scope("gate");
        let xw = inner.hold(e.matmul(x, &weights[ParamId::GateInput(gate)], Transpose::None))?;
        let hu = inner.hold(e.matmul(h, &weights[ParamId::GateHidden(gate)], Transpose::None))?;
        let sum = inner.hold(e.add(&xw, &hu))?;
        let pre = inner.hold(e.add(&sum, &weights[ParamId::GateBias(gate)]))?;
        let activated = match gate {
            Gate::Candidate => e.tanh(&pre),
            Gate::Forget | Gate::Input | Gate::Output => e.sigmoid(&pre),
        };
        scope.hold(activated)
    }

    /// One LSTM timestep. Everything in the returned cache is tracked by `scope`.
    pub fn step(
        &self,
        scope: &mut Scope,
        weights: &ParamTable<Tensor>,
        token: usize,
        h_prev: &Tensor,
        c_prev: &Tensor,
    ) -> Result<StepCache> {
        self.check_token(token)?;
        let e = self.engine.as_ref();

        let x = scope.hold(e.gather_row(&weights[ParamId::Embedding], token))?;
        let forget = self.gate(scope, weights, Gate::Forget, &x, h_prev)?;
        let input = self.gate(scope, weights, Gate::Input, &x, h_prev)?;
        let candidate = self.gate(scope, weights, Gate::Candidate, &x, h_prev)?;
        let output = self.gate(scope, weights, Gate::Output, &x, h_prev)?;

        let (c_next, tanh_c, h_next, probs) = {
            let mut inner = scope.create_sub_scope("cell");
            let kept = inner.hold(e.mul(&forget, c_prev))?;
            let written = inner.hold(e.mul(&input, &candidate))?;
            let c_next = scope.hold(e.add(&kept, &written))?;
            let tanh_c = scope.hold(e.tanh(&c_next))?;
            let h_next = scope.hold(e.mul(&output, &tanh_c))?;
            let projected = inner.hold(e.matmul(&h_next, &weights[ParamId::OutputWeight], Transpose::None))?;
            let logits = inner.hold(e.add(&projected, &weights[ParamId::OutputBias]))?;
            let probs = scope.hold(e.softmax(&logits))?;
            (c_next, tanh_c, h_next, probs)
        };

        Ok(StepCache {
            token,
            x,
            h_prev: h_prev.clone(),
            c_prev: c_prev.clone(),
            forget,
            input,
            candidate,
            output,
            c_next,
            h_next,
            tanh_c,
            probs,
        })
    }

    /// Runs the sequence from `(h0, c0)` and scores each step against its target.
    pub fn forward(
        &self,
        scope: &mut Scope,
        weights: &ParamTable<Tensor>,
        inputs: &[usize],
        targets: &[usize],
        h0: &Tensor,
        c0: &Tensor,
    ) -> Result<SequenceForward> {
        if inputs.is_empty() || inputs.len() != targets.len() {
            return Err(TensorError::InvalidState(format!(
                "need matching non-empty inputs and targets, got {} and {}",
                inputs.len(),
                targets.len()
            )));
        }
        for &t in targets {
            self.check_token(t)?;
        }

        let mut steps: Vec<StepCache> = Vec::with_capacity(inputs.len());
        let mut loss_sum = 0.0f64;
        for (&token, &target) in inputs.iter().zip(targets) {
            let (h, c) = match steps.last() {
                Some(prev) => (prev.h_next.clone(), prev.c_next.clone()),
                None => (h0.clone(), c0.clone()),
            };
            let cache = self.step(scope, weights, token, &h, &c)?;
            let probs = self.read_host(&cache.probs)?;
            // f32::max would hide a NaN here.
            let p = probs[target];
            let p = if p.is_nan() { p } else { p.max(MIN_PROBABILITY) };
            loss_sum -= (p as f64).ln();
            steps.push(cache);
        }
        Ok(SequenceForward {
            steps,
            targets: targets.to_vec(),
            loss_sum,
        })
    }

    /// Backpropagation through time; adds the gradients of the summed
    /// sequence loss into `grads`.
    pub fn backward(
        &self,
        scope: &mut Scope,
        weights: &ParamTable<Tensor>,
        forward: &SequenceForward,
        grads: &GradientMap,
    ) -> Result<()> {
        let e = self.engine.as_ref();
        let hidden = self.config.hidden_size;
        let vocab = self.config.vocab_size;
        let grad = |param: ParamId| {
            grads
                .get(param)
                .ok_or_else(|| TensorError::InvalidState(format!("no gradient accumulator for {}", param)))
        };

        // Carried state gradients are owned by the scope of the step that consumes them.
        let mut dh_next = e.create(&[1, hidden], Location::Device)?;
        let mut dc_next = match e.create(&[1, hidden], Location::Device) {
            Ok(t) => t,
            Err(err) => {
                scope.track(dh_next);
                return Err(err);
            }
        };

        for (step, &target) in forward.steps.iter().zip(&forward.targets).rev() {
            let mut s = scope.create_sub_scope("bptt_step");
            s.track(dh_next.clone());
            s.track(dc_next.clone());

            // d_y = softmax - one_hot(target)
            let mut one_hot = vec![0.0f32; vocab];
            one_hot[target] = 1.0;
            let one_hot = s.create_tensor_from(&one_hot, &[1, vocab])?;
            let dy = s.hold(e.sub(&step.probs, &one_hot))?;

            let d_wy = s.hold(e.matmul(&step.h_next, &dy, Transpose::Left))?;
            e.add_assign(grad(ParamId::OutputWeight)?, &d_wy)?;
            e.add_assign(grad(ParamId::OutputBias)?, &dy)?;

            let dh_out = s.hold(e.matmul(&dy, &weights[ParamId::OutputWeight], Transpose::Right))?;
            let dh = s.hold(e.add(&dh_out, &dh_next))?;

            // h = o * tanh(c)
            let dh_tanh = s.hold(e.mul(&dh, &step.tanh_c))?;
            let sig_o = s.hold(e.sigmoid_derivative(&step.output))?;
            let d_output = s.hold(e.mul(&dh_tanh, &sig_o))?;

            let dh_o = s.hold(e.mul(&dh, &step.output))?;
            let tanh_prime = s.hold(e.tanh_derivative(&step.tanh_c))?;
            let d_tanh_c = s.hold(e.mul(&dh_o, &tanh_prime))?;
            let dc = s.hold(e.add(&dc_next, &d_tanh_c))?;

            // c = f * c_prev + i * g
            let dc_cprev = s.hold(e.mul(&dc, &step.c_prev))?;
            let sig_f = s.hold(e.sigmoid_derivative(&step.forget))?;
            let d_forget = s.hold(e.mul(&dc_cprev, &sig_f))?;

            let dc_cand = s.hold(e.mul(&dc, &step.candidate))?;
            let sig_i = s.hold(e.sigmoid_derivative(&step.input))?;
            let d_input = s.hold(e.mul(&dc_cand, &sig_i))?;

            let dc_in = s.hold(e.mul(&dc, &step.input))?;
            let tanh_g = s.hold(e.tanh_derivative(&step.candidate))?;
            let d_candidate = s.hold(e.mul(&dc_in, &tanh_g))?;

            let dc_prev = s.hold(e.mul(&dc, &step.forget))?;
            let dh_prev = s.create_tensor(&[1, hidden])?;
            let dx = s.create_tensor(&[1, self.config.embedding_size])?;

            for (gate, d_gate) in [
                (Gate::Forget, &d_forget),
                (Gate::Input, &d_input),
                (Gate::Candidate, &d_candidate),
                (Gate::Output, &d_output),
            ] {
                let d_w = s.hold(e.matmul(&step.x, d_gate, Transpose::Left))?;
                e.add_assign(grad(ParamId::GateInput(gate))?, &d_w)?;
                let d_u = s.hold(e.matmul(&step.h_prev, d_gate, Transpose::Left))?;
                e.add_assign(grad(ParamId::GateHidden(gate))?, &d_u)?;
                e.add_assign(grad(ParamId::GateBias(gate))?, d_gate)?;

                let dx_gate = s.hold(e.matmul(d_gate, &weights[ParamId::GateInput(gate)], Transpose::Right))?;
                e.add_assign(&dx, &dx_gate)?;
                let dh_gate = s.hold(e.matmul(d_gate, &weights[ParamId::GateHidden(gate)], Transpose::Right))?;
                e.add_assign(&dh_prev, &dh_gate)?;
            }
            e.scatter_add_row(grad(ParamId::Embedding)?, step.token, &dx)?;

            s.untrack(&dh_prev);
            s.untrack(&dc_prev);
            dh_next = dh_prev;
            dc_next = dc_prev;
        }

        scope.track(dh_next);
        scope.track(dc_next);
        Ok(())
    }

    /// Forward and backward over `tokens` from a zero state, accumulating
    /// into `grads`. Inputs are `tokens[..n-1]`, targets `tokens[1..]`.
    pub fn train_sequence(
        &self,
        scope: &mut Scope,
        weights: &ParamTable<Tensor>,
        tokens: &[usize],
        grads: &GradientMap,
    ) -> Result<SequenceOutcome> {
        if tokens.len() < 2 {
            return Err(TensorError::InvalidState(format!(
                "a training sequence needs at least 2 tokens, got {}",
                tokens.len()
            )));
        }
        let hidden = self.config.hidden_size;
        let h0 = scope.create_tensor(&[1, hidden])?;
        let c0 = scope.create_tensor(&[1, hidden])?;
        let n = tokens.len();

        let forward = self.forward(scope, weights, &tokens[..n - 1], &tokens[1..], &h0, &c0)?;
        self.backward(scope, weights, &forward, grads)?;

        let (final_hidden, final_cell) = match forward.steps.last() {
            Some(last) => (last.h_next.clone(), last.c_next.clone()),
            None => (h0, c0),
        };
        trace!(tokens = n, loss = forward.mean_loss(), "sequence processed");
        Ok(SequenceOutcome {
            loss: forward.mean_loss(),
            loss_sum: forward.loss_sum,
            tokens: forward.steps.len(),
            final_hidden,
            final_cell,
        })
    }

    /// Gradients of one sequence in a fresh map owned by `scope`.
    pub fn compute_gradients(
        &self,
        scope: &mut Scope,
        weights: &ParamTable<Tensor>,
        tokens: &[usize],
    ) -> Result<(SequenceOutcome, GradientMap)> {
        let grads = GradientMap::zeros(scope, &self.config)?;
        let outcome = self.train_sequence(scope, weights, tokens, &grads)?;
        Ok((outcome, grads))
    }

    /// Summed loss of `tokens` from a zero state, without gradients.
    pub fn sequence_loss(&self, scope: &mut Scope, weights: &ParamTable<Tensor>, tokens: &[usize]) -> Result<f64> {
        if tokens.len() < 2 {
            return Err(TensorError::InvalidState("a scored sequence needs at least 2 tokens".into()));
        }
        let mut inner = scope.create_sub_scope("loss");
        let h0 = inner.create_tensor(&[1, self.config.hidden_size])?;
        let c0 = inner.create_tensor(&[1, self.config.hidden_size])?;
        let n = tokens.len();
        let forward = self.forward(&mut inner, weights, &tokens[..n - 1], &tokens[1..], &h0, &c0)?;
        Ok(forward.loss_sum)
    }

    /// Feeds one token, moving the carried state forward. Returns the next-token
    /// distribution on the host.
    fn advance(
        &self,
        scope: &mut Scope,
        weights: &ParamTable<Tensor>,
        token: usize,
        carry: &mut (Tensor, Tensor),
    ) -> Result<Vec<f32>> {
        let mut s = scope.create_sub_scope("generate_step");
        s.track(carry.0.clone());
        s.track(carry.1.clone());
        let cache = self.step(&mut s, weights, token, &carry.0, &carry.1)?;
        let probs = self.read_host(&cache.probs)?;
        s.untrack(&cache.h_next);
        s.untrack(&cache.c_next);
        *carry = (cache.h_next, cache.c_next);
        Ok(probs)
    }

    /// Continues `prompt` by `max_tokens` sampled tokens, starting from the
    /// model's running hidden and cell state. `temperature == 0` is greedy.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        scope: &mut Scope,
        weights: &ParamTable<Tensor>,
        prompt: &[usize],
        max_tokens: usize,
        temperature: f32,
        rng: &mut R,
    ) -> Result<Vec<usize>> {
        if prompt.is_empty() {
            return Err(TensorError::InvalidState("generation needs a non-empty prompt".into()));
        }
        for &t in prompt {
            self.check_token(t)?;
        }
        let e = self.engine.as_ref();
        let h = e.clone_tensor(&weights[ParamId::HiddenState], Location::Device)?;
        let c = match e.clone_tensor(&weights[ParamId::CellState], Location::Device) {
            Ok(c) => c,
            Err(err) => {
                scope.track(h);
                return Err(err);
            }
        };
        let mut carry = (h, c);

        let mut probs = Vec::new();
        for &token in prompt {
            probs = self.advance(scope, weights, token, &mut carry)?;
        }
        let mut generated = Vec::with_capacity(max_tokens);
        while generated.len() < max_tokens {
            let next = sample_with_temperature(&probs, temperature, rng);
            generated.push(next);
            if generated.len() < max_tokens {
                probs = self.advance(scope, weights, next, &mut carry)?;
            }
        }
        scope.track(carry.0);
        scope.track(carry.1);
        Ok(generated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CpuEngine;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const V: usize = 4;
    const E: usize = 3;
    const H: usize = 3;

    fn config() -> ModelConfig {
        ModelConfig {
            vocab_size: V,
            embedding_size: E,
            hidden_size: H,
        }
    }

    /// Deterministic small weights without touching the store.
    fn weights(engine: &dyn MathEngine, scope: &mut Scope, seed: u64) -> ParamTable<Tensor> {
        let mut rng = StdRng::seed_from_u64(seed);
        let cfg = config();
        ParamTable::try_build::<TensorError>(&ParamId::ALL, |param| {
            let shape = param.shape(&cfg);
            let n: usize = shape.iter().product();
            let data: Vec<f32> = (0..n).map(|_| rng.gen_range(-0.5..0.5)).collect();
            Ok(scope.track(engine.from_slice(&data, &shape, Location::Device)?))
        })
        .unwrap()
    }

    fn setup() -> (Arc<dyn MathEngine>, Scope, Pipeline) {
        let engine: Arc<dyn MathEngine> = Arc::new(CpuEngine::new());
        let scope = Scope::new("pipeline", Arc::clone(&engine));
        let pipeline = Pipeline::new(Arc::clone(&engine), config());
        (engine, scope, pipeline)
    }

    #[test]
    fn test_forward_caches_every_step() {
        let (engine, mut scope, pipeline) = setup();
        let w = weights(engine.as_ref(), &mut scope, 1);
        let h0 = scope.create_tensor(&[1, H]).unwrap();
        let c0 = scope.create_tensor(&[1, H]).unwrap();

        let fwd = pipeline.forward(&mut scope, &w, &[0, 1, 2], &[1, 2, 3], &h0, &c0).unwrap();
        assert_eq!(fwd.steps.len(), 3);
        assert!(fwd.loss_sum > 0.0);
        let step = &fwd.steps[1];
        assert_eq!(step.h_prev, fwd.steps[0].h_next);
        assert_eq!(step.probs.shape(), &[1, V]);
        let probs = engine.read(&step.probs).unwrap();
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);

        // h = o * tanh(c)
        let o = engine.read(&step.output).unwrap();
        let tc = engine.read(&step.tanh_c).unwrap();
        let h = engine.read(&step.h_next).unwrap();
        for k in 0..H {
            assert!((h[k] - o[k] * tc[k]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_out_of_vocabulary_token_rejected() {
        let (engine, mut scope, pipeline) = setup();
        let w = weights(engine.as_ref(), &mut scope, 1);
        let grads = GradientMap::zeros(&mut scope, &config()).unwrap();
        let err = pipeline.train_sequence(&mut scope, &w, &[0, 7], &grads).err().unwrap();
        assert!(matches!(err, TensorError::InvalidState(_)));
        assert!(pipeline.train_sequence(&mut scope, &w, &[0], &grads).is_err());
    }

    #[test]
    fn test_backward_matches_numerical_gradient() {
        let (engine, mut scope, pipeline) = setup();
        let w = weights(engine.as_ref(), &mut scope, 3);
        let tokens = [0, 2, 1, 3, 3, 0];
        let (_, grads) = pipeline.compute_gradients(&mut scope, &w, &tokens).unwrap();

        let eps = 1e-2f32;
        let mut checked = 0;
        for param in ParamId::TRAINABLE {
            let tensor = &w[param];
            let analytic = engine.read(grads.get(param).unwrap()).unwrap();
            let original = engine.read(tensor).unwrap();
            // A few elements per tensor keep the check fast.
            for idx in (0..original.len()).step_by(((original.len() + 2) / 3).max(1)) {
                let mut plus = original.clone();
                plus[idx] += eps;
                engine.write(tensor, &plus).unwrap();
                let l_plus = pipeline.sequence_loss(&mut scope, &w, &tokens).unwrap();

                let mut minus = original.clone();
                minus[idx] -= eps;
                engine.write(tensor, &minus).unwrap();
                let l_minus = pipeline.sequence_loss(&mut scope, &w, &tokens).unwrap();
                engine.write(tensor, &original).unwrap();

                let numeric = (l_plus - l_minus) / (2.0 * eps as f64);
                let a = analytic[idx] as f64;
                let tolerance = 2e-3 + 2e-2 * a.abs().max(numeric.abs());
                assert!(
                    (a - numeric).abs() < tolerance,
                    "{}[{}]: analytic {} vs numeric {}",
                    param,
                    idx,
                    a,
                    numeric
                );
                checked += 1;
            }
        }
        assert!(checked >= ParamId::TRAINABLE.len());
    }

    #[test]
    fn test_intermediates_are_released_per_sequence() {
        let (engine, mut scope, pipeline) = setup();
        let w = weights(engine.as_ref(), &mut scope, 2);
        let baseline = engine.stats().live_tensors;
        {
            let mut seq = scope.create_sub_scope("sequence");
            pipeline.compute_gradients(&mut seq, &w, &[0, 1, 2, 3]).unwrap();
        }
        assert_eq!(engine.stats().live_tensors, baseline);
    }

    #[test]
    fn test_generate_is_deterministic_for_a_seed() {
        let (engine, mut scope, pipeline) = setup();
        let w = weights(engine.as_ref(), &mut scope, 4);
        let a = pipeline
            .generate(&mut scope, &w, &[1, 2], 6, 1.0, &mut StdRng::seed_from_u64(8))
            .unwrap();
        let b = pipeline
            .generate(&mut scope, &w, &[1, 2], 6, 1.0, &mut StdRng::seed_from_u64(8))
            .unwrap();
        assert_eq!(a.len(), 6);
        assert_eq!(a, b);
        assert!(a.iter().all(|&t| t < V));

        let greedy = pipeline
            .generate(&mut scope, &w, &[1], 3, 0.0, &mut StdRng::seed_from_u64(0))
            .unwrap();
        assert_eq!(greedy.len(), 3);
        assert!(pipeline.generate(&mut scope, &w, &[], 3, 0.0, &mut StdRng::seed_from_u64(0)).is_err());
    }
}
