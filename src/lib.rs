//! # Tiered LSTM
//!
//! A character-level LSTM language model trained by hand-written
//! backpropagation through time, on top of a memory hierarchy that keeps
//! tensor usage bounded.
//!
//! ## Core Components
//!
//! - **Math engine**: the [`engine::MathEngine`] trait over opaque tensor handles, with a
//!   reference [`engine::CpuEngine`] built on `ndarray`
//! - **Memory hierarchy**: a shape-keyed buffer pool, a RAM/disk swap tier, a persistent
//!   weight store with a host cache, and scopes that release what they own in reverse order
//! - **Pipeline**: forward pass with per-step caches, BPTT, temperature sampling
//! - **Training**: batch accumulation, sanitization, global-norm clipping, Adam with
//!   resumable moments, learning-rate schedules, per-epoch checkpoints
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tiered_lstm::{BatchIndex, Config, CpuEngine, LstmModel, MathEngine, PersistentStore};
//! use tiered_lstm::{TextVocabulary, Vocabulary};
//! use tiered_lstm::training::create_adam_trainer;
//!
//! # fn main() -> tiered_lstm::Result<()> {
//! let text = "hello world, hello lstm";
//! let vocab = TextVocabulary::from_text(text);
//! let mut config = Config::default();
//! config.model.vocab_size = vocab.size();
//!
//! let engine: Arc<dyn MathEngine> = Arc::new(CpuEngine::new());
//! let session = tiered_lstm::memory::new_session_id();
//! let store = Arc::new(PersistentStore::open(engine, &config.work_dir, &session)?);
//! let model = LstmModel::initialize(config.model.clone(), store, config.training.seed)?;
//!
//! let sequences = BatchIndex::split_tokens(&vocab.encode(text), config.training.sequence_length);
//! let batches = BatchIndex::from_sequences(&config.work_dir, &session, &sequences, config.training.batch_size)?;
//! let mut trainer = create_adam_trainer(config, model);
//! trainer.train(&batches)?;
//! # Ok(())
//! # }
//! ```

pub mod batches;
pub mod config;
pub mod engine;
pub mod error;
pub mod gradients;
pub mod manifest;
pub mod memory;
pub mod model;
pub mod optimizers;
pub mod params;
pub mod pipeline;
pub mod schedulers;
pub mod training;
pub mod training_log;
pub mod vocab;

// Re-export commonly used items
pub use batches::BatchIndex;
pub use config::{Config, MemoryConfig, ModelConfig, TrainingConfig};
pub use engine::{CpuEngine, Location, MathEngine, Tensor};
pub use error::{Result, TensorError};
pub use gradients::GradientMap;
pub use manifest::ModelManifest;
pub use memory::{PersistentStore, Scope, SwapStore, TensorPool};
pub use model::LstmModel;
pub use optimizers::{Adam, Optimizer, Sgd};
pub use params::{Gate, ParamId, ParamTable};
pub use pipeline::Pipeline;
pub use training::{Trainer, TrainingMetrics};
pub use training_log::TrainingLog;
pub use vocab::{TextVocabulary, Vocabulary};
