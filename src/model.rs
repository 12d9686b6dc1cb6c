use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::Array2;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::Uniform;
use tracing::{debug, info};

use crate::config::ModelConfig;
use crate::engine::{Location, MathEngine, Tensor};
use crate::error::{Result, TensorError};
use crate::manifest::ModelManifest;
use crate::memory::{PersistentStore, Scope};
use crate::params::{Gate, ParamId, ParamTable};

/// Half-width of the uniform distribution used for weight matrices.
const INIT_SCALE: f32 = 0.1;

/// A single-layer LSTM language model whose weights live in a
/// [`PersistentStore`]. The model itself only holds the weight ids; tensors
/// are loaded into a [`Scope`] for each unit of work.
pub struct LstmModel {
    config: ModelConfig,
    store: Arc<PersistentStore>,
    ids: ParamTable<String>,
}

impl LstmModel {
    /// Creates fresh weights from a seeded generator and persists them.
    ///
    /// Weight matrices and the embedding are drawn from
    /// `U(-0.1, 0.1)`, the forget-gate bias starts at 1.0, other biases and
    /// the running state at zero, layer-norm gamma at one and beta at zero.
    pub fn initialize(config: ModelConfig, store: Arc<PersistentStore>, seed: u64) -> Result<Self> {
        if config.vocab_size == 0 {
            return Err(TensorError::InvalidState("cannot build a model over an empty vocabulary".into()));
        }
        let engine = Arc::clone(store.engine());
        let mut rng = StdRng::seed_from_u64(seed);
        let dist = Uniform::new(-INIT_SCALE, INIT_SCALE);

        let ids = ParamTable::try_build(&ParamId::ALL, |param| {
            let shape = param.shape(&config);
            let data: Vec<f32> = match param {
                ParamId::Embedding | ParamId::GateInput(_) | ParamId::GateHidden(_) | ParamId::OutputWeight => {
                    Array2::random_using((shape[0], shape[1]), dist, &mut rng).into_raw_vec()
                }
                ParamId::GateBias(Gate::Forget) | ParamId::LayerNormGamma(_) => vec![1.0; shape[0] * shape[1]],
                _ => vec![0.0; shape[0] * shape[1]],
            };
            let tensor = engine.from_slice(&data, &shape, Location::Device)?;
            let stored = store.store(&tensor, &param.name());
            engine.dispose(&tensor)?;
            stored
        })?;

        info!(
            vocab = config.vocab_size,
            embedding = config.embedding_size,
            hidden = config.hidden_size,
            session = store.session_id(),
            "initialized model weights"
        );
        Ok(LstmModel { config, store, ids })
    }

    /// Rebuilds a model from a manifest whose weights are already in `store`.
    pub fn from_manifest(manifest: &ModelManifest, store: Arc<PersistentStore>) -> Result<Self> {
        let ids = manifest.resolve()?;
        let config = manifest.model_config();
        for (param, id) in ids.iter() {
            let shape = store.get_shape(id)?;
            let expected = param.shape(&config);
            if shape != expected {
                let what = if param == ParamId::Embedding {
                    "inconsistent embedding shape".to_string()
                } else {
                    format!("inconsistent shape for {}", param)
                };
                return Err(TensorError::InvalidState(format!(
                    "{}: expected {:?}, stored {:?}",
                    what, expected, shape
                )));
            }
        }
        Ok(LstmModel { config, store, ids })
    }

    /// Opens the manifest's store session under `work_dir` and rebuilds the
    /// model from it. Fails without a partially usable model when anything
    /// is missing or inconsistent.
    pub fn load_manifest<P: AsRef<Path>, W: AsRef<Path>>(
        path: P,
        engine: Arc<dyn MathEngine>,
        work_dir: W,
    ) -> Result<Self> {
        let manifest = ModelManifest::load(path.as_ref())?;
        let store = Arc::new(PersistentStore::open(engine, work_dir, &manifest.session_id)?);
        let model = LstmModel::from_manifest(&manifest, store)?;
        info!(path = %path.as_ref().display(), session = %manifest.session_id, "loaded model manifest");
        Ok(model)
    }

    pub fn manifest(&self) -> ModelManifest {
        ModelManifest::new(&self.config, self.store.session_id(), &self.ids)
    }

    /// Writes `model_<epoch>.json`, or `model_final.json` when `epoch` is
    /// `None`, into `dir`.
    pub fn save_manifest<P: AsRef<Path>>(&self, dir: P, epoch: Option<usize>) -> Result<PathBuf> {
        let name = match epoch {
            Some(epoch) => format!("model_{}.json", epoch),
            None => "model_final.json".to_string(),
        };
        let path = dir.as_ref().join(name);
        self.manifest().save(&path)?;
        debug!(path = %path.display(), "saved model manifest");
        Ok(path)
    }

    /// Loads a device copy of every parameter into `scope`.
    pub fn load_weights(&self, scope: &mut Scope) -> Result<ParamTable<Tensor>> {
        let weights = ParamTable::try_build(&ParamId::ALL, |param| scope.load_tensor(self.id(param)))?;
        let embedding = &weights[ParamId::Embedding];
        if embedding.shape() != [self.config.vocab_size, self.config.embedding_size] {
            return Err(TensorError::InvalidState(format!(
                "inconsistent embedding shape {:?}",
                embedding.shape()
            )));
        }
        Ok(weights)
    }

    /// Writes the current value of `tensor` back as parameter `param`.
    pub fn persist(&self, param: ParamId, tensor: &Tensor) -> Result<()> {
        self.store.overwrite(self.id(param), tensor)
    }

    pub fn id(&self, param: ParamId) -> &str {
        &self.ids[param]
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<PersistentStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<dyn MathEngine> {
        self.store.engine()
    }
}
