//! Math engine interface.
//!
//! The numeric backend is consumed through the [`MathEngine`] trait. It owns
//! every buffer; callers only hold [`Tensor`] handles and must release each
//! one explicitly (or hand it to a [`crate::memory::scope::Scope`]). A handle
//! that has been released is rejected by every engine call with
//! [`crate::error::TensorError::Released`].

pub mod cpu;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use cpu::CpuEngine;

/// Where a tensor's buffer lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Location {
    Device,
    Host,
}

/// Opaque handle to an engine-owned buffer.
///
/// Cloning the handle does not copy the buffer; use
/// [`MathEngine::clone_tensor`] for an independent copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tensor {
    id: u64,
    shape: Vec<usize>,
    location: Location,
}

impl Tensor {
    pub(crate) fn new(id: u64, shape: Vec<usize>, location: Location) -> Self {
        Tensor { id, shape, location }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Total element count.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn is_device(&self) -> bool {
        self.location == Location::Device
    }

    /// Byte size of the float32 payload.
    pub fn byte_size(&self) -> usize {
        self.len() * std::mem::size_of::<f32>()
    }
}

/// Canonical string form of a shape, e.g. `"4x16"`.
pub fn shape_key(shape: &[usize]) -> String {
    shape
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("x")
}

/// Which operand of a matrix product is transposed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transpose {
    None,
    Left,
    Right,
}

/// Hyperparameters for one fused Adam step.
#[derive(Clone, Copy, Debug)]
pub struct AdamStep {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    /// 1-based timestep used for bias correction.
    pub t: u64,
}

/// Allocation accounting reported by an engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub live_tensors: usize,
    pub live_bytes: usize,
    pub peak_bytes: usize,
    pub total_allocations: u64,
    pub collections: u64,
    pub synchronizations: u64,
}

/// Elementwise and matrix primitives over engine-owned buffers.
///
/// Every operation that returns a [`Tensor`] allocates a new buffer in the
/// location of its first operand; the caller owns it.
pub trait MathEngine: Send + Sync {
    /// True when buffers live on an asynchronous device and reads or
    /// recycling require [`MathEngine::synchronize`] first.
    fn is_gpu(&self) -> bool;

    fn create(&self, shape: &[usize], location: Location) -> Result<Tensor>;
    fn from_slice(&self, data: &[f32], shape: &[usize], location: Location) -> Result<Tensor>;
    fn clone_tensor(&self, tensor: &Tensor, location: Location) -> Result<Tensor>;
    fn dispose(&self, tensor: &Tensor) -> Result<()>;
    fn is_live(&self, tensor: &Tensor) -> bool;
    /// Moves the buffer behind `tensor` to a fresh handle without copying.
    /// The old handle is invalid afterwards.
    fn rehandle(&self, tensor: &Tensor) -> Result<Tensor>;

    fn read(&self, tensor: &Tensor) -> Result<Vec<f32>>;
    fn write(&self, tensor: &Tensor, data: &[f32]) -> Result<()>;
    fn fill(&self, tensor: &Tensor, value: f32) -> Result<()>;

    fn matmul(&self, a: &Tensor, b: &Tensor, transpose: Transpose) -> Result<Tensor>;
    fn add(&self, a: &Tensor, b: &Tensor) -> Result<Tensor>;
    fn sub(&self, a: &Tensor, b: &Tensor) -> Result<Tensor>;
    fn mul(&self, a: &Tensor, b: &Tensor) -> Result<Tensor>;
    fn scale(&self, a: &Tensor, factor: f32) -> Result<Tensor>;
    fn add_assign(&self, dst: &Tensor, src: &Tensor) -> Result<()>;
    fn scale_assign(&self, dst: &Tensor, factor: f32) -> Result<()>;

    fn sigmoid(&self, a: &Tensor) -> Result<Tensor>;
    fn tanh(&self, a: &Tensor) -> Result<Tensor>;
    /// `y * (1 - y)` for a sigmoid output `y`.
    fn sigmoid_derivative(&self, y: &Tensor) -> Result<Tensor>;
    /// `1 - y^2` for a tanh output `y`.
    fn tanh_derivative(&self, y: &Tensor) -> Result<Tensor>;
    /// Softmax along the last axis.
    fn softmax(&self, a: &Tensor) -> Result<Tensor>;

    /// Copies one row of a matrix into a new `[1, cols]` tensor.
    fn gather_row(&self, matrix: &Tensor, row: usize) -> Result<Tensor>;
    /// Adds `src` (any shape with `cols` elements) into one row of `matrix`.
    fn scatter_add_row(&self, matrix: &Tensor, row: usize, src: &Tensor) -> Result<()>;

    fn sum_squares(&self, a: &Tensor) -> Result<f64>;
    /// Replaces NaN/Inf with zero and clamps every element to `[-max_abs, max_abs]`.
    /// Returns how many non-finite values were replaced.
    fn sanitize(&self, a: &Tensor, max_abs: f32) -> Result<usize>;

    /// Bias-corrected Adam update of `params`, `m` and `v` in place.
    fn adam_step(&self, params: &Tensor, grads: &Tensor, m: &Tensor, v: &Tensor, step: &AdamStep) -> Result<()>;

    /// Waits for all issued kernels to finish.
    fn synchronize(&self) -> Result<()>;
    /// Returns cached allocator memory to the system.
    fn collect_garbage(&self);
    fn stats(&self) -> EngineStats;

    fn zeros_like(&self, tensor: &Tensor) -> Result<Tensor> {
        self.create(tensor.shape(), tensor.location())
    }

    /// Reads a single-element tensor, synchronizing first.
    fn read_scalar(&self, tensor: &Tensor) -> Result<f32> {
        self.synchronize()?;
        let data = self.read(tensor)?;
        data.first().copied().ok_or_else(|| {
            crate::error::TensorError::InvalidState(format!("tensor {} is empty", tensor.id()))
        })
    }
}
