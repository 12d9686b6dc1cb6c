use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::error::{Result, TensorError};
use crate::params::{ParamId, ParamTable};

/// JSON checkpoint describing a model: its dimensions, the tensor store
/// session holding the weights, and the id of every named tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModelManifest {
    pub vocab_size: usize,
    pub embedding_size: usize,
    pub hidden_size: usize,
    pub output_size: usize,
    pub session_id: String,
    pub tensor_ids: BTreeMap<String, String>,
}

impl ModelManifest {
    pub fn new(config: &ModelConfig, session_id: &str, ids: &ParamTable<String>) -> Self {
        ModelManifest {
            vocab_size: config.vocab_size,
            embedding_size: config.embedding_size,
            hidden_size: config.hidden_size,
            output_size: config.output_size(),
            session_id: session_id.to_string(),
            tensor_ids: ids.iter().map(|(param, id)| (param.name(), id.clone())).collect(),
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            vocab_size: self.vocab_size,
            embedding_size: self.embedding_size,
            hidden_size: self.hidden_size,
        }
    }

    /// Resolves every tensor name to its [`ParamId`]. Unknown or missing
    /// names and inconsistent dimensions are rejected.
    pub fn resolve(&self) -> Result<ParamTable<String>> {
        if self.vocab_size == 0 {
            return Err(TensorError::InvalidState("manifest has an empty vocabulary".into()));
        }
        if self.embedding_size == 0 || self.hidden_size == 0 {
            return Err(TensorError::InvalidState("manifest has a zero model dimension".into()));
        }
        if self.output_size != self.vocab_size {
            return Err(TensorError::InvalidState(format!(
                "output size {} does not match vocabulary size {}",
                self.output_size, self.vocab_size
            )));
        }

        let mut table = ParamTable::new();
        for (name, id) in &self.tensor_ids {
            let param = ParamId::from_name(name)
                .ok_or_else(|| TensorError::InvalidState(format!("unknown tensor name '{}' in manifest", name)))?;
            table.insert(param, id.clone());
        }
        let missing: Vec<String> = ParamId::ALL
            .iter()
            .filter(|p| !table.contains(**p))
            .map(|p| p.name())
            .collect();
        if !missing.is_empty() {
            return Err(TensorError::InvalidState(format!(
                "manifest is missing tensors: {}",
                missing.join(", ")
            )));
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn full_manifest() -> ModelManifest {
        let config = ModelConfig {
            vocab_size: 4,
            embedding_size: 3,
            hidden_size: 5,
        };
        let ids = ParamTable::try_build::<()>(&ParamId::ALL, |p| Ok(format!("000001_{}_deadbeef", p))).unwrap();
        ModelManifest::new(&config, "session", &ids)
    }

    #[test]
    fn test_json_uses_pascal_case_keys() {
        let json = serde_json::to_value(full_manifest()).unwrap();
        for key in ["VocabSize", "EmbeddingSize", "HiddenSize", "OutputSize", "SessionId", "TensorIds"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(json["TensorIds"].as_object().unwrap().len(), ParamId::COUNT);
        assert_eq!(json["TensorIds"]["W_f"], "000001_W_f_deadbeef");
    }

    #[test]
    fn test_save_load_resolve() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("model_1.json");
        let manifest = full_manifest();
        manifest.save(&path).unwrap();

        let loaded = ModelManifest::load(&path).unwrap();
        assert_eq!(loaded, manifest);
        let table = loaded.resolve().unwrap();
        assert_eq!(table.len(), ParamId::COUNT);
        assert_eq!(loaded.model_config().output_size(), 4);
    }

    #[test]
    fn test_resolve_rejects_bad_manifests() {
        let mut unknown = full_manifest();
        unknown.tensor_ids.insert("W_z".into(), "x".into());
        assert!(matches!(unknown.resolve(), Err(TensorError::InvalidState(_))));

        let mut missing = full_manifest();
        missing.tensor_ids.remove("b_y");
        let err = missing.resolve().unwrap_err();
        assert!(err.to_string().contains("b_y"));

        let mut empty_vocab = full_manifest();
        empty_vocab.vocab_size = 0;
        assert!(empty_vocab.resolve().is_err());

        let mut wrong_output = full_manifest();
        wrong_output.output_size = 9;
        assert!(wrong_output.resolve().is_err());
    }
}
