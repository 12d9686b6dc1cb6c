use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TensorError};
use crate::schedulers::ScheduleConfig;

/// Model dimensions. The output projection always spans the vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub embedding_size: usize,
    pub hidden_size: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            vocab_size: 0,
            embedding_size: 32,
            hidden_size: 64,
        }
    }
}

impl ModelConfig {
    pub fn output_size(&self) -> usize {
        self.vocab_size
    }
}

/// Configuration for training hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// Tokens per training sequence when the corpus is split.
    pub sequence_length: usize,
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    /// Per-epoch learning-rate schedule.
    pub schedule: ScheduleConfig,
    /// Epochs of linear warmup from zero before the schedule applies.
    pub warmup_epochs: usize,
    /// Global L2 norm bound applied after batch averaging.
    pub max_grad_norm: f32,
    /// Per-element magnitude bound applied during sanitization.
    pub element_clip: f32,
    /// Pool trim, device flush and watchdog run every this many batches.
    pub maintenance_interval: usize,
    /// The epoch aborts once more than this many batches have failed.
    pub max_failed_batches: usize,
    pub seed: u64,
    /// Defaults to `<work_dir>/checkpoints`.
    pub checkpoint_dir: Option<PathBuf>,
    pub log_every: usize,
    /// Write the lowest-loss epoch's weights back before `model_final.json`.
    pub restore_best: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            epochs: 10,
            batch_size: 8,
            sequence_length: 32,
            learning_rate: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            schedule: ScheduleConfig::Constant,
            warmup_epochs: 0,
            max_grad_norm: 5.0,
            element_clip: 5.0,
            maintenance_interval: 10,
            max_failed_batches: 10,
            seed: 42,
            checkpoint_dir: None,
            log_every: 1,
            restore_best: false,
        }
    }
}

/// Caps and thresholds for the tensor memory hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub pool_max_per_shape: usize,
    pub pool_max_bytes: usize,
    /// Operations between periodic pool trims.
    pub pool_trim_interval: u64,
    pub swap_ram_limit_bytes: usize,
    pub watchdog_threshold_bytes: usize,
    /// Required growth since the last trim before the watchdog fires again.
    pub watchdog_growth_ratio: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            pool_max_per_shape: 32,
            pool_max_bytes: 256 << 20,
            pool_trim_interval: 1000,
            swap_ram_limit_bytes: 64 << 20,
            watchdog_threshold_bytes: 512 << 20,
            watchdog_growth_ratio: 1.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub work_dir: PathBuf,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub memory: MemoryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            work_dir: PathBuf::from("work"),
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

impl Config {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.training
            .checkpoint_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join("checkpoints"))
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.training;
        if t.batch_size == 0 || t.sequence_length < 2 {
            return Err(TensorError::InvalidState(
                "batch_size must be positive and sequence_length at least 2".into(),
            ));
        }
        if self.model.embedding_size == 0 || self.model.hidden_size == 0 {
            return Err(TensorError::InvalidState("model dimensions must be positive".into()));
        }
        if !(t.learning_rate > 0.0) || !(t.max_grad_norm > 0.0) || !(t.element_clip > 0.0) {
            return Err(TensorError::InvalidState(
                "learning_rate, max_grad_norm and element_clip must be positive".into(),
            ));
        }
        Ok(())
    }
}
