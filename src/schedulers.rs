use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// Per-epoch learning-rate policy. Epochs are 0-based here; the trainer
/// asks for epoch `n - 1` before running its epoch `n`.
pub trait LearningRateScheduler: Send {
    /// Multiplier applied to the base rate at `epoch`.
    fn factor(&self, epoch: usize) -> f64;

    fn name(&self) -> &'static str;

    fn get_lr(&self, epoch: usize, base_lr: f64) -> f64 {
        base_lr * self.factor(epoch)
    }
}

/// Keeps the configured rate for the whole run.
#[derive(Clone, Debug)]
pub struct ConstantLR;

impl LearningRateScheduler for ConstantLR {
    fn factor(&self, _epoch: usize) -> f64 {
        1.0
    }

    fn name(&self) -> &'static str {
        "ConstantLR"
    }
}

/// Multiplies the rate by `gamma` once per `step_size` epochs.
#[derive(Clone, Debug)]
pub struct StepLR {
    step_size: usize,
    gamma: f64,
}

impl StepLR {
    pub fn new(step_size: usize, gamma: f64) -> Self {
        StepLR {
            step_size: step_size.max(1),
            gamma,
        }
    }
}

impl LearningRateScheduler for StepLR {
    fn factor(&self, epoch: usize) -> f64 {
        self.gamma.powi((epoch / self.step_size) as i32)
    }

    fn name(&self) -> &'static str {
        "StepLR"
    }
}

#[derive(Clone, Debug)]
pub struct ExponentialLR {
    gamma: f64,
}

impl ExponentialLR {
    pub fn new(gamma: f64) -> Self {
        ExponentialLR { gamma }
    }
}

impl LearningRateScheduler for ExponentialLR {
    fn factor(&self, epoch: usize) -> f64 {
        self.gamma.powi(epoch as i32)
    }

    fn name(&self) -> &'static str {
        "ExponentialLR"
    }
}

/// Cosine annealing from the base rate down to `eta_min` over `t_max`
/// epochs, restarting every period.
#[derive(Clone, Debug)]
pub struct CosineAnnealingLR {
    t_max: usize,
    eta_min: f64,
}

impl CosineAnnealingLR {
    pub fn new(t_max: usize, eta_min: f64) -> Self {
        CosineAnnealingLR {
            t_max: t_max.max(1),
            eta_min,
        }
    }

    fn phase(&self, epoch: usize) -> f64 {
        let t = (epoch % self.t_max) as f64 / self.t_max as f64;
        (1.0 + (PI * t).cos()) / 2.0
    }
}

impl LearningRateScheduler for CosineAnnealingLR {
    // Ignores `eta_min`; `get_lr` applies the absolute floor.
    fn factor(&self, epoch: usize) -> f64 {
        self.phase(epoch)
    }

    fn name(&self) -> &'static str {
        "CosineAnnealingLR"
    }

    fn get_lr(&self, epoch: usize, base_lr: f64) -> f64 {
        self.eta_min + (base_lr - self.eta_min) * self.phase(epoch)
    }
}

/// Ramps linearly from `start_lr` to the base rate over `warmup_epochs`,
/// then hands the remaining epochs (renumbered from 0) to `after`.
pub struct WarmupScheduler {
    warmup_epochs: usize,
    start_lr: f64,
    after: Box<dyn LearningRateScheduler>,
}

impl WarmupScheduler {
    pub fn new(warmup_epochs: usize, after: Box<dyn LearningRateScheduler>, start_lr: f64) -> Self {
        WarmupScheduler {
            warmup_epochs,
            start_lr,
            after,
        }
    }
}

impl LearningRateScheduler for WarmupScheduler {
    fn factor(&self, epoch: usize) -> f64 {
        if epoch < self.warmup_epochs {
            epoch as f64 / self.warmup_epochs as f64
        } else {
            self.after.factor(epoch - self.warmup_epochs)
        }
    }

    fn name(&self) -> &'static str {
        "WarmupScheduler"
    }

    fn get_lr(&self, epoch: usize, base_lr: f64) -> f64 {
        if epoch < self.warmup_epochs {
            self.start_lr + (base_lr - self.start_lr) * self.factor(epoch)
        } else {
            self.after.get_lr(epoch - self.warmup_epochs, base_lr)
        }
    }
}

/// Serializable choice of schedule, as it appears in the training config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleConfig {
    Constant,
    Step { step_size: usize, gamma: f64 },
    Exponential { gamma: f64 },
    Cosine { t_max: usize, eta_min: f64 },
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig::Constant
    }
}

impl ScheduleConfig {
    /// Builds the scheduler, wrapped in a linear warmup when `warmup_epochs > 0`.
    pub fn build(&self, warmup_epochs: usize, warmup_start_lr: f64) -> Box<dyn LearningRateScheduler> {
        let base: Box<dyn LearningRateScheduler> = match *self {
            ScheduleConfig::Constant => Box::new(ConstantLR),
            ScheduleConfig::Step { step_size, gamma } => Box::new(StepLR::new(step_size, gamma)),
            ScheduleConfig::Exponential { gamma } => Box::new(ExponentialLR::new(gamma)),
            ScheduleConfig::Cosine { t_max, eta_min } => Box::new(CosineAnnealingLR::new(t_max, eta_min)),
        };
        if warmup_epochs > 0 {
            Box::new(WarmupScheduler::new(warmup_epochs, base, warmup_start_lr))
        } else {
            base
        }
    }
}
