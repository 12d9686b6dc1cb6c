use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use ndarray::{ArrayD, Axis, Ix2, IxDyn, Zip};
use parking_lot::Mutex;

use super::{AdamStep, EngineStats, Location, MathEngine, Tensor, Transpose};
use crate::error::{Result, TensorError};

struct Slot {
    data: ArrayD<f32>,
    location: Location,
}

#[derive(Default)]
struct Table {
    slots: HashMap<u64, Slot>,
    live_bytes: usize,
    peak_bytes: usize,
    total_allocations: u64,
    collections: u64,
}

impl Table {
    fn get(&self, tensor: &Tensor) -> Result<&Slot> {
        self.slots.get(&tensor.id()).ok_or(TensorError::Released(tensor.id()))
    }

    fn get_mut(&mut self, tensor: &Tensor) -> Result<&mut Slot> {
        self.slots.get_mut(&tensor.id()).ok_or(TensorError::Released(tensor.id()))
    }

    fn insert(&mut self, id: u64, data: ArrayD<f32>, location: Location) -> Tensor {
        let shape = data.shape().to_vec();
        self.live_bytes += data.len() * std::mem::size_of::<f32>();
        self.peak_bytes = self.peak_bytes.max(self.live_bytes);
        self.total_allocations += 1;
        self.slots.insert(id, Slot { data, location });
        Tensor::new(id, shape, location)
    }
}

fn check_same_shape(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(TensorError::ShapeMismatch {
            expected: a.shape().to_vec(),
            got: b.shape().to_vec(),
        });
    }
    Ok(())
}

fn not_a_matrix(data: &ArrayD<f32>) -> TensorError {
    TensorError::InvalidState(format!("expected a matrix, got shape {:?}", data.shape()))
}

/// Reference [`MathEngine`] backed by `ndarray` buffers in host memory.
///
/// Buffers live in a handle table; a released handle stays invalid forever
/// because ids are never reused. `simulating_gpu` makes the engine report
/// itself as device-backed so callers take their synchronization paths.
pub struct CpuEngine {
    table: Mutex<Table>,
    next_id: AtomicU64,
    simulate_gpu: bool,
    synchronizations: AtomicU64,
}

impl CpuEngine {
    pub fn new() -> Self {
        CpuEngine {
            table: Mutex::new(Table::default()),
            next_id: AtomicU64::new(1),
            simulate_gpu: false,
            synchronizations: AtomicU64::new(0),
        }
    }

    pub fn simulating_gpu() -> Self {
        CpuEngine {
            simulate_gpu: true,
            ..CpuEngine::new()
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn unary(&self, a: &Tensor, f: impl Fn(f32) -> f32) -> Result<Tensor> {
        let mut table = self.table.lock();
        let slot = table.get(a)?;
        let data = slot.data.mapv(f);
        let location = slot.location;
        Ok(table.insert(self.next_id(), data, location))
    }

    fn binary(&self, a: &Tensor, b: &Tensor, f: impl Fn(f32, f32) -> f32) -> Result<Tensor> {
        let mut table = self.table.lock();
        let sa = table.get(a)?;
        let sb = table.get(b)?;
        check_same_shape(&sa.data, &sb.data)?;
        let data = Zip::from(&sa.data).and(&sb.data).map_collect(|&x, &y| f(x, y));
        let location = sa.location;
        Ok(table.insert(self.next_id(), data, location))
    }
}

impl Default for CpuEngine {
    fn default() -> Self {
        CpuEngine::new()
    }
}

impl MathEngine for CpuEngine {
    fn is_gpu(&self) -> bool {
        self.simulate_gpu
    }

    fn create(&self, shape: &[usize], location: Location) -> Result<Tensor> {
        let data = ArrayD::zeros(IxDyn(shape));
        Ok(self.table.lock().insert(self.next_id(), data, location))
    }

    fn from_slice(&self, data: &[f32], shape: &[usize], location: Location) -> Result<Tensor> {
        let array = ArrayD::from_shape_vec(IxDyn(shape), data.to_vec()).map_err(|_| {
            TensorError::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![data.len()],
            }
        })?;
        Ok(self.table.lock().insert(self.next_id(), array, location))
    }

    fn clone_tensor(&self, tensor: &Tensor, location: Location) -> Result<Tensor> {
        let mut table = self.table.lock();
        let data = table.get(tensor)?.data.clone();
        Ok(table.insert(self.next_id(), data, location))
    }

    fn dispose(&self, tensor: &Tensor) -> Result<()> {
        let mut table = self.table.lock();
        let slot = table
            .slots
            .remove(&tensor.id())
            .ok_or(TensorError::Released(tensor.id()))?;
        table.live_bytes -= slot.data.len() * std::mem::size_of::<f32>();
        Ok(())
    }

    fn is_live(&self, tensor: &Tensor) -> bool {
        self.table.lock().slots.contains_key(&tensor.id())
    }

    fn rehandle(&self, tensor: &Tensor) -> Result<Tensor> {
        let mut table = self.table.lock();
        let slot = table
            .slots
            .remove(&tensor.id())
            .ok_or(TensorError::Released(tensor.id()))?;
        let id = self.next_id();
        let handle = Tensor::new(id, slot.data.shape().to_vec(), slot.location);
        table.slots.insert(id, slot);
        Ok(handle)
    }

    fn read(&self, tensor: &Tensor) -> Result<Vec<f32>> {
        let table = self.table.lock();
        Ok(table.get(tensor)?.data.iter().copied().collect())
    }

    fn write(&self, tensor: &Tensor, data: &[f32]) -> Result<()> {
        let mut table = self.table.lock();
        let slot = table.get_mut(tensor)?;
        if slot.data.len() != data.len() {
            return Err(TensorError::ShapeMismatch {
                expected: slot.data.shape().to_vec(),
                got: vec![data.len()],
            });
        }
        for (dst, src) in slot.data.iter_mut().zip(data) {
            *dst = *src;
        }
        Ok(())
    }

    fn fill(&self, tensor: &Tensor, value: f32) -> Result<()> {
        let mut table = self.table.lock();
        table.get_mut(tensor)?.data.fill(value);
        Ok(())
    }

    fn matmul(&self, a: &Tensor, b: &Tensor, transpose: Transpose) -> Result<Tensor> {
        let mut table = self.table.lock();
        let sa = table.get(a)?;
        let sb = table.get(b)?;
        let a2 = sa
            .data
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| not_a_matrix(&sa.data))?;
        let b2 = sb
            .data
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| not_a_matrix(&sb.data))?;
        let (a2, b2) = match transpose {
            Transpose::None => (a2, b2),
            Transpose::Left => (a2.reversed_axes(), b2),
            Transpose::Right => (a2, b2.reversed_axes()),
        };
        if a2.ncols() != b2.nrows() {
            return Err(TensorError::IncompatibleOperands {
                left: a2.shape().to_vec(),
                right: b2.shape().to_vec(),
            });
        }
        let data = a2.dot(&b2).into_dyn();
        let location = sa.location;
        Ok(table.insert(self.next_id(), data, location))
    }

    fn add(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.binary(a, b, |x, y| x + y)
    }

    fn sub(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.binary(a, b, |x, y| x - y)
    }

    fn mul(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.binary(a, b, |x, y| x * y)
    }

    fn scale(&self, a: &Tensor, factor: f32) -> Result<Tensor> {
        self.unary(a, |x| x * factor)
    }

    fn add_assign(&self, dst: &Tensor, src: &Tensor) -> Result<()> {
        let mut table = self.table.lock();
        let src = table.get(src)?.data.clone();
        let slot = table.get_mut(dst)?;
        check_same_shape(&slot.data, &src)?;
        slot.data += &src;
        Ok(())
    }

    fn scale_assign(&self, dst: &Tensor, factor: f32) -> Result<()> {
        let mut table = self.table.lock();
        table.get_mut(dst)?.data.mapv_inplace(|x| x * factor);
        Ok(())
    }

    fn sigmoid(&self, a: &Tensor) -> Result<Tensor> {
        self.unary(a, |x| 1.0 / (1.0 + (-x).exp()))
    }

    fn tanh(&self, a: &Tensor) -> Result<Tensor> {
        self.unary(a, f32::tanh)
    }

    fn sigmoid_derivative(&self, y: &Tensor) -> Result<Tensor> {
        self.unary(y, |s| s * (1.0 - s))
    }

    fn tanh_derivative(&self, y: &Tensor) -> Result<Tensor> {
        self.unary(y, |t| 1.0 - t * t)
    }

    fn softmax(&self, a: &Tensor) -> Result<Tensor> {
        let mut table = self.table.lock();
        let slot = table.get(a)?;
        if slot.data.ndim() == 0 {
            return Err(TensorError::InvalidState("softmax of a scalar".into()));
        }
        let mut data = slot.data.clone();
        let location = slot.location;
        let last = Axis(data.ndim() - 1);
        for mut lane in data.lanes_mut(last) {
            let max = lane.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
            lane.mapv_inplace(|x| (x - max).exp());
            let sum = lane.sum();
            lane.mapv_inplace(|x| x / sum);
        }
        Ok(table.insert(self.next_id(), data, location))
    }

    fn gather_row(&self, matrix: &Tensor, row: usize) -> Result<Tensor> {
        let mut table = self.table.lock();
        let slot = table.get(matrix)?;
        let m = slot
            .data
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| not_a_matrix(&slot.data))?;
        if row >= m.nrows() {
            return Err(TensorError::InvalidState(format!(
                "row {} out of range for {} rows",
                row,
                m.nrows()
            )));
        }
        let data = m.row(row).to_owned().insert_axis(Axis(0)).into_dyn();
        let location = slot.location;
        Ok(table.insert(self.next_id(), data, location))
    }

    fn scatter_add_row(&self, matrix: &Tensor, row: usize, src: &Tensor) -> Result<()> {
        let mut table = self.table.lock();
        let values: Vec<f32> = table.get(src)?.data.iter().copied().collect();
        let slot = table.get_mut(matrix)?;
        let shape = slot.data.shape().to_vec();
        let mut m = slot
            .data
            .view_mut()
            .into_dimensionality::<Ix2>()
            .map_err(|_| TensorError::InvalidState(format!("expected a matrix, got shape {:?}", shape)))?;
        if row >= m.nrows() || values.len() != m.ncols() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![1, m.ncols()],
                got: vec![1, values.len()],
            });
        }
        for (dst, v) in m.row_mut(row).iter_mut().zip(values) {
            *dst += v;
        }
        Ok(())
    }

    fn sum_squares(&self, a: &Tensor) -> Result<f64> {
        let table = self.table.lock();
        Ok(table
            .get(a)?
            .data
            .iter()
            .map(|&x| (x as f64) * (x as f64))
            .sum())
    }

    fn sanitize(&self, a: &Tensor, max_abs: f32) -> Result<usize> {
        let mut table = self.table.lock();
        let slot = table.get_mut(a)?;
        let mut replaced = 0;
        slot.data.mapv_inplace(|x| {
            if x.is_finite() {
                x.clamp(-max_abs, max_abs)
            } else {
                replaced += 1;
                0.0
            }
        });
        Ok(replaced)
    }

    fn adam_step(&self, params: &Tensor, grads: &Tensor, m: &Tensor, v: &Tensor, step: &AdamStep) -> Result<()> {
        let mut table = self.table.lock();
        let g = table.get(grads)?.data.clone();
        check_same_shape(&table.get(params)?.data, &g)?;
        check_same_shape(&table.get(m)?.data, &g)?;
        check_same_shape(&table.get(v)?.data, &g)?;

        let (b1, b2) = (step.beta1, step.beta2);
        let t = step.t.max(1) as i32;
        let bias1 = 1.0 - (b1 as f64).powi(t);
        let bias2 = 1.0 - (b2 as f64).powi(t);

        let m_slot = table.get_mut(m)?;
        Zip::from(&mut m_slot.data).and(&g).for_each(|m, &g| *m = b1 * *m + (1.0 - b1) * g);
        let m_now = m_slot.data.clone();

        let v_slot = table.get_mut(v)?;
        Zip::from(&mut v_slot.data).and(&g).for_each(|v, &g| *v = b2 * *v + (1.0 - b2) * g * g);
        let v_now = v_slot.data.clone();

        let lr = step.learning_rate as f64;
        let eps = step.epsilon as f64;
        let p_slot = table.get_mut(params)?;
        Zip::from(&mut p_slot.data)
            .and(&m_now)
            .and(&v_now)
            .for_each(|p, &m, &v| {
                let m_hat = m as f64 / bias1;
                let v_hat = v as f64 / bias2;
                *p -= (lr * m_hat / (v_hat.sqrt() + eps)) as f32;
            });
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        if self.simulate_gpu {
            self.synchronizations.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn collect_garbage(&self) {
        let mut table = self.table.lock();
        table.slots.shrink_to_fit();
        table.collections += 1;
    }

    fn stats(&self) -> EngineStats {
        let table = self.table.lock();
        EngineStats {
            live_tensors: table.slots.len(),
            live_bytes: table.live_bytes,
            peak_bytes: table.peak_bytes,
            total_allocations: table.total_allocations,
            collections: table.collections,
            synchronizations: self.synchronizations.load(Ordering::Relaxed),
        }
    }
}
