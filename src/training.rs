use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::batches::{BatchIndex, Sequence};
use crate::config::Config;
use crate::engine::{Location, MathEngine, Tensor};
use crate::error::{Result, TensorError};
use crate::gradients::GradientMap;
use crate::memory::{MemoryWatchdog, Scope, SwapStore, TensorPool};
use crate::model::LstmModel;
use crate::optimizers::{Adam, Optimizer};
use crate::params::{ParamId, ParamTable};
use crate::pipeline::Pipeline;
use crate::schedulers::LearningRateScheduler;
use crate::training_log::TrainingLog;

/// Training metrics tracked during training
#[derive(Debug, Clone)]
pub struct TrainingMetrics {
    pub epoch: usize,
    /// Mean of the per-batch mean losses.
    pub train_loss: f64,
    /// Mean gradient norm before clipping.
    pub grad_norm: f64,
    pub learning_rate: f32,
    pub batches: usize,
    pub failed_batches: usize,
    pub time_elapsed: f64,
}

/// Outcome of one optimizer step.
#[derive(Debug, Clone, Copy)]
pub struct BatchResult {
    pub loss: f64,
    pub grad_norm: f64,
    /// Non-finite gradient values replaced during sanitization.
    pub sanitized: usize,
}

/// Swap ids of the trainable weights at the lowest-loss epoch so far.
struct BestSnapshot {
    epoch: usize,
    loss: f64,
    ids: ParamTable<String>,
}

/// Drives epochs of batched BPTT over a model whose weights live in a
/// persistent store.
///
/// Each epoch loads the weights once into an epoch scope backed by the
/// trainer's pool. Every batch runs in a sub-scope and every sequence in a
/// sub-scope of that, so per-sequence tensors go back to the pool as soon as
/// the sequence's gradients have been accumulated.
///
/// Whenever an epoch improves on the best loss, the trainable weights are
/// copied into a swap store (RAM up to `swap_ram_limit_bytes`, then disk) so
/// they can be restored after later epochs have overwritten the store.
pub struct Trainer<O: Optimizer> {
    config: Config,
    engine: Arc<dyn MathEngine>,
    pool: Arc<TensorPool>,
    model: LstmModel,
    pipeline: Pipeline,
    optimizer: O,
    scheduler: Box<dyn LearningRateScheduler>,
    watchdog: MemoryWatchdog,
    log: Option<TrainingLog>,
    metrics_history: Vec<TrainingMetrics>,
    swap: Option<SwapStore>,
    best: Option<BestSnapshot>,
}

impl<O: Optimizer> Trainer<O> {
    pub fn new(config: Config, model: LstmModel, optimizer: O) -> Self {
        let engine = Arc::clone(model.engine());
        let pool = Arc::new(TensorPool::new(Arc::clone(&engine), &config.memory));
        let pipeline = Pipeline::new(Arc::clone(&engine), model.config().clone());
        let scheduler = config.training.schedule.build(config.training.warmup_epochs, 0.0);
        let watchdog = MemoryWatchdog::new(&config.memory);
        Trainer {
            config,
            engine,
            pool,
            model,
            pipeline,
            optimizer,
            scheduler,
            watchdog,
            log: None,
            metrics_history: Vec::new(),
            swap: None,
            best: None,
        }
    }

    pub fn with_log(mut self, log: TrainingLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn model(&self) -> &LstmModel {
        &self.model
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn pool(&self) -> &Arc<TensorPool> {
        &self.pool
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn watchdog(&self) -> &MemoryWatchdog {
        &self.watchdog
    }

    pub fn swap(&self) -> Option<&SwapStore> {
        self.swap.as_ref()
    }

    /// Epoch of the current best-weights snapshot.
    pub fn best_epoch(&self) -> Option<usize> {
        self.best.as_ref().map(|best| best.epoch)
    }

    pub fn get_latest_metrics(&self) -> Option<&TrainingMetrics> {
        self.metrics_history.last()
    }

    pub fn get_metrics_history(&self) -> &[TrainingMetrics] {
        &self.metrics_history
    }

    /// A root scope backed by the trainer's pool and the model's store.
    pub fn open_scope(&self, name: &str) -> Scope {
        Scope::new(name, Arc::clone(&self.engine))
            .with_pool(Arc::clone(&self.pool))
            .with_store(Arc::clone(self.model.store()))
    }

    fn note(&self, message: &str) {
        if let Some(log) = &self.log {
            log.log(message);
        }
    }

    /// One forward and backward pass over `sequence` without updating
    /// anything. Fails with [`TensorError::Numeric`] unless the loss is
    /// finite and the gradient norm is finite and non-zero.
    pub fn sanity_check(&self, sequence: &[usize]) -> Result<(f64, f64)> {
        let mut scope = self.open_scope("sanity_check");
        let weights = self.model.load_weights(&mut scope)?;
        let (outcome, grads) = self.pipeline.compute_gradients(&mut scope, &weights, sequence)?;
        self.engine.synchronize()?;
        let norm = grads.l2_norm(self.engine.as_ref())?;

        if !outcome.loss.is_finite() {
            self.note(&format!("sanity check failed: loss {}", outcome.loss));
            return Err(TensorError::Numeric(format!("sanity check loss is {}", outcome.loss)));
        }
        if !norm.is_finite() || norm == 0.0 {
            self.note(&format!("sanity check failed: gradient norm {}", norm));
            return Err(TensorError::Numeric(format!("sanity check gradient norm is {}", norm)));
        }
        info!(loss = outcome.loss, grad_norm = norm, "sanity check passed");
        self.note(&format!("sanity check passed: loss {:.6} grad_norm {:.6}", outcome.loss, norm));
        Ok((outcome.loss, norm))
    }

    /// Accumulates gradients over `batch`, averages, sanitizes and clips them,
    /// applies the optimizer to every trainable weight and persists it. The
    /// final state of the last sequence becomes the running state in `weights`.
    pub fn train_batch(
        &mut self,
        epoch_scope: &Scope,
        weights: &ParamTable<Tensor>,
        batch: &[Sequence],
    ) -> Result<BatchResult> {
        if batch.is_empty() {
            return Err(TensorError::InvalidState("empty batch".into()));
        }
        let engine = Arc::clone(&self.engine);
        let e = engine.as_ref();
        let training = &self.config.training;
        let mut scope = epoch_scope.create_sub_scope("batch");
        let totals = GradientMap::zeros(&mut scope, self.model.config())?;

        let mut loss = 0.0;
        let mut final_state = None;
        for (i, sequence) in batch.iter().enumerate() {
            let mut seq_scope = scope.create_sub_scope("sequence");
            let (outcome, grads) = self.pipeline.compute_gradients(&mut seq_scope, weights, sequence)?;
            totals.accumulate(e, &grads)?;
            loss += outcome.loss;
            if i + 1 == batch.len() {
                let h = scope.hold(e.clone_tensor(&outcome.final_hidden, Location::Device))?;
                let c = scope.hold(e.clone_tensor(&outcome.final_cell, Location::Device))?;
                final_state = Some((h, c));
            }
        }

        totals.scale(e, 1.0 / batch.len() as f32)?;
        let sanitized = totals.sanitize(e, training.element_clip)?;
        if sanitized > 0 {
            warn!(replaced = sanitized, "non-finite gradients zeroed");
        }
        let grad_norm = totals.clip_global_norm(e, training.max_grad_norm)?;

        for param in ParamId::TRAINABLE {
            let grad = totals
                .get(param)
                .ok_or_else(|| TensorError::InvalidState(format!("no gradient for {}", param)))?;
            self.optimizer.update(self.model.id(param), &weights[param], grad)?;
            self.model.persist(param, &weights[param])?;
        }

        if let Some((h, c)) = final_state {
            for (param, value) in [(ParamId::HiddenState, &h), (ParamId::CellState, &c)] {
                e.fill(&weights[param], 0.0)?;
                e.add_assign(&weights[param], value)?;
            }
        }

        Ok(BatchResult {
            loss: loss / batch.len() as f64,
            grad_norm,
            sanitized,
        })
    }

    /// Pool trim, device flush, and a watchdog check that clears the pool and
    /// collects when memory has grown past its threshold.
    fn maintenance(&mut self) -> Result<()> {
        self.pool.trim();
        self.engine.synchronize()?;
        let stats = self.engine.stats();
        if self.watchdog.check(&stats) {
            self.pool.clear();
            self.engine.collect_garbage();
            let after = self.engine.stats();
            self.watchdog.record_trim(&after);
            info!(
                before = stats.live_bytes,
                after = after.live_bytes,
                high_water = self.watchdog.high_water(),
                "memory trimmed"
            );
        }
        Ok(())
    }

    /// Persists the running state, writes `model_<epoch>.json` and asks the
    /// optimizer to save its state.
    pub fn checkpoint(&mut self, epoch: usize, weights: &ParamTable<Tensor>) -> Result<PathBuf> {
        self.model.persist(ParamId::HiddenState, &weights[ParamId::HiddenState])?;
        self.model.persist(ParamId::CellState, &weights[ParamId::CellState])?;
        let path = self.model.save_manifest(self.config.checkpoint_dir(), Some(epoch))?;
        self.optimizer.checkpoint()?;
        self.note(&format!("checkpoint {}", path.display()));
        Ok(path)
    }

    fn swap_store(&mut self) -> Result<&SwapStore> {
        if self.swap.is_none() {
            let swap = SwapStore::from_config(
                Arc::clone(&self.engine),
                &self.config.work_dir,
                self.model.store().session_id(),
                &self.config.memory,
            )?;
            self.swap = Some(swap);
        }
        self.swap
            .as_ref()
            .ok_or_else(|| TensorError::InvalidState("swap store unavailable".into()))
    }

    /// Swaps out the trainable weights when `loss` beats the best snapshot
    /// and drops the previous snapshot.
    fn snapshot_if_best(&mut self, epoch: usize, loss: f64, weights: &ParamTable<Tensor>) -> Result<()> {
        if !loss.is_finite() || self.best.as_ref().map_or(false, |best| loss >= best.loss) {
            return Ok(());
        }
        let swap = self.swap_store()?;
        let ids = ParamTable::try_build(&ParamId::TRAINABLE, |param| swap.swap_out(&weights[param], &param.name()))?;
        let previous = self.best.replace(BestSnapshot { epoch, loss, ids });

        if let (Some(old), Some(swap)) = (previous, self.swap.as_ref()) {
            for (_, id) in old.ids.iter() {
                if let Err(e) = swap.delete(id) {
                    warn!(id = %id, error = %e, "failed to drop stale snapshot entry");
                }
            }
        }
        debug!(epoch, loss, stats = ?self.swap.as_ref().map(SwapStore::stats), "best weights snapshot updated");
        Ok(())
    }

    /// Persists the best snapshot's weights into the model's store and
    /// returns its epoch, or `None` when no epoch has completed.
    pub fn restore_best(&self) -> Result<Option<usize>> {
        let (Some(best), Some(swap)) = (self.best.as_ref(), self.swap.as_ref()) else {
            return Ok(None);
        };
        for (param, id) in best.ids.iter() {
            let tensor = swap.load_from_swap(id)?;
            let persisted = self.model.persist(param, &tensor);
            if let Err(e) = self.engine.dispose(&tensor) {
                warn!(param = %param, error = %e, "failed to release restored weight");
            }
            persisted?;
        }
        info!(epoch = best.epoch, loss = best.loss, "restored best weights");
        self.note(&format!("restored weights from epoch {} (loss {:.6})", best.epoch, best.loss));
        Ok(Some(best.epoch))
    }

    /// Trains on every batch of `batches` once, then checkpoints.
    ///
    /// A failing batch is logged and skipped; once more than
    /// `max_failed_batches` have failed the epoch aborts with
    /// [`TensorError::TooManyFailures`].
    pub fn train_epoch(&mut self, epoch: usize, batches: &BatchIndex) -> Result<TrainingMetrics> {
        let start_time = Instant::now();
        let limit = self.config.training.max_failed_batches;
        let interval = self.config.training.maintenance_interval;
        let log_every = self.config.training.log_every;

        let mut scope = self.open_scope(&format!("epoch_{}", epoch));
        let weights = self.model.load_weights(&mut scope)?;

        let (mut completed, mut failed) = (0usize, 0usize);
        let (mut loss_sum, mut norm_sum) = (0.0, 0.0);
        for n in 0..batches.len() {
            match batches.load(n).and_then(|batch| self.train_batch(&scope, &weights, &batch)) {
                Ok(result) => {
                    completed += 1;
                    loss_sum += result.loss;
                    norm_sum += result.grad_norm;
                    if log_every > 0 && completed % log_every == 0 {
                        debug!(epoch, batch = n, loss = result.loss, grad_norm = result.grad_norm, "batch done");
                    }
                }
                Err(e) => {
                    failed += 1;
                    warn!(epoch, batch = n, error = %e, "batch failed, skipping");
                    self.note(&format!("epoch {} batch {} failed: {}", epoch, n, e));
                    if failed > limit {
                        self.note(&format!("epoch {} aborted after {} failed batches", epoch, failed));
                        return Err(TensorError::TooManyFailures { failed, limit });
                    }
                }
            }
            if interval > 0 && (n + 1) % interval == 0 {
                self.maintenance()?;
            }
        }

        let train_loss = if completed > 0 { loss_sum / completed as f64 } else { f64::NAN };
        self.checkpoint(epoch, &weights)?;
        self.snapshot_if_best(epoch, train_loss, &weights)?;
        let failures = scope.dispose();
        if failures > 0 {
            warn!(epoch, failures, "epoch scope released with failures");
        }

        let metrics = TrainingMetrics {
            epoch,
            train_loss,
            grad_norm: if completed > 0 { norm_sum / completed as f64 } else { 0.0 },
            learning_rate: self.optimizer.learning_rate(),
            batches: completed,
            failed_batches: failed,
            time_elapsed: start_time.elapsed().as_secs_f64(),
        };
        self.note(&format!(
            "epoch {} loss {:.6} grad_norm {:.6} lr {} batches {} failed {} time {:.2}s",
            epoch,
            metrics.train_loss,
            metrics.grad_norm,
            metrics.learning_rate,
            metrics.batches,
            metrics.failed_batches,
            metrics.time_elapsed
        ));
        self.metrics_history.push(metrics.clone());
        Ok(metrics)
    }

    /// Sanity check on the first sequence, then `epochs` epochs (numbered from
    /// 1) with the scheduled learning rate, then `model_final.json`.
    pub fn train(&mut self, batches: &BatchIndex) -> Result<&[TrainingMetrics]> {
        let first = batches
            .load(0)
            .map_err(|_| TensorError::InvalidState("no training batches".into()))?;
        let sequence = first
            .first()
            .ok_or_else(|| TensorError::InvalidState("first batch is empty".into()))?;
        self.sanity_check(sequence)?;

        let base_lr = self.config.training.learning_rate as f64;
        info!(
            epochs = self.config.training.epochs,
            batches = batches.len(),
            scheduler = self.scheduler.name(),
            "starting training"
        );
        for epoch in 1..=self.config.training.epochs {
            let lr = self.scheduler.get_lr(epoch - 1, base_lr) as f32;
            self.optimizer.set_learning_rate(lr);
            let metrics = self.train_epoch(epoch, batches)?;
            info!(
                epoch,
                loss = metrics.train_loss,
                grad_norm = metrics.grad_norm,
                lr,
                failed = metrics.failed_batches,
                "epoch complete"
            );
        }

        if self.config.training.restore_best {
            self.restore_best()?;
        }
        let path = self.model.save_manifest(self.config.checkpoint_dir(), None)?;
        self.note(&format!("training complete, final model {}", path.display()));
        Ok(&self.metrics_history)
    }
}

/// Trainer with an Adam optimizer that checkpoints into the model's store.
pub fn create_adam_trainer(config: Config, model: LstmModel) -> Trainer<Adam> {
    let optimizer = Adam::from_config(Arc::clone(model.engine()), &config.training).with_store(Arc::clone(model.store()));
    Trainer::new(config, model, optimizer)
}
