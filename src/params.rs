//! Typed parameter registry.
//!
//! Every persisted model tensor is named by a [`ParamId`]; the manifest name
//! is derived from it, so lookups never go through free-form strings.

use std::fmt;
use std::ops::{Index, IndexMut};

use crate::config::ModelConfig;

/// One of the four LSTM gate computations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Gate {
    Forget,
    Input,
    Candidate,
    Output,
}

impl Gate {
    pub const ALL: [Gate; 4] = [Gate::Forget, Gate::Input, Gate::Candidate, Gate::Output];

    fn suffix(self) -> &'static str {
        match self {
            Gate::Forget => "f",
            Gate::Input => "i",
            Gate::Candidate => "c",
            Gate::Output => "o",
        }
    }

    fn from_suffix(s: &str) -> Option<Gate> {
        Gate::ALL.iter().copied().find(|g| g.suffix() == s)
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamId {
    Embedding,
    /// Input-to-gate weights, `[embedding, hidden]`.
    GateInput(Gate),
    /// Hidden-to-gate weights, `[hidden, hidden]`.
    GateHidden(Gate),
    GateBias(Gate),
    /// Hidden-to-vocabulary projection, `[hidden, vocab]`.
    OutputWeight,
    OutputBias,
    LayerNormGamma(Gate),
    LayerNormBeta(Gate),
    /// Running hidden state carried between training runs and used by generation.
    HiddenState,
    CellState,
}

impl ParamId {
    pub const COUNT: usize = 25;

    /// Every parameter, in table order.
    pub const ALL: [ParamId; ParamId::COUNT] = [
        ParamId::Embedding,
        ParamId::GateInput(Gate::Forget),
        ParamId::GateInput(Gate::Input),
        ParamId::GateInput(Gate::Candidate),
        ParamId::GateInput(Gate::Output),
        ParamId::GateHidden(Gate::Forget),
        ParamId::GateHidden(Gate::Input),
        ParamId::GateHidden(Gate::Candidate),
        ParamId::GateHidden(Gate::Output),
        ParamId::GateBias(Gate::Forget),
        ParamId::GateBias(Gate::Input),
        ParamId::GateBias(Gate::Candidate),
        ParamId::GateBias(Gate::Output),
        ParamId::OutputWeight,
        ParamId::OutputBias,
        ParamId::LayerNormGamma(Gate::Forget),
        ParamId::LayerNormGamma(Gate::Input),
        ParamId::LayerNormGamma(Gate::Candidate),
        ParamId::LayerNormGamma(Gate::Output),
        ParamId::LayerNormBeta(Gate::Forget),
        ParamId::LayerNormBeta(Gate::Input),
        ParamId::LayerNormBeta(Gate::Candidate),
        ParamId::LayerNormBeta(Gate::Output),
        ParamId::HiddenState,
        ParamId::CellState,
    ];

    /// Parameters that receive gradients and optimizer updates; a prefix of [`ParamId::ALL`].
    pub const TRAINABLE: [ParamId; 15] = [
        ParamId::Embedding,
        ParamId::GateInput(Gate::Forget),
        ParamId::GateInput(Gate::Input),
        ParamId::GateInput(Gate::Candidate),
        ParamId::GateInput(Gate::Output),
        ParamId::GateHidden(Gate::Forget),
        ParamId::GateHidden(Gate::Input),
        ParamId::GateHidden(Gate::Candidate),
        ParamId::GateHidden(Gate::Output),
        ParamId::GateBias(Gate::Forget),
        ParamId::GateBias(Gate::Input),
        ParamId::GateBias(Gate::Candidate),
        ParamId::GateBias(Gate::Output),
        ParamId::OutputWeight,
        ParamId::OutputBias,
    ];

    pub fn index(self) -> usize {
        match self {
            ParamId::Embedding => 0,
            ParamId::GateInput(g) => 1 + g.index(),
            ParamId::GateHidden(g) => 5 + g.index(),
            ParamId::GateBias(g) => 9 + g.index(),
            ParamId::OutputWeight => 13,
            ParamId::OutputBias => 14,
            ParamId::LayerNormGamma(g) => 15 + g.index(),
            ParamId::LayerNormBeta(g) => 19 + g.index(),
            ParamId::HiddenState => 23,
            ParamId::CellState => 24,
        }
    }

    pub fn is_trainable(self) -> bool {
        self.index() < ParamId::TRAINABLE.len()
    }

    /// Stable name used in manifests and tensor file names.
    pub fn name(self) -> String {
        match self {
            ParamId::Embedding => "embedding".to_string(),
            ParamId::GateInput(g) => format!("W_{}", g.suffix()),
            ParamId::GateHidden(g) => format!("U_{}", g.suffix()),
            ParamId::GateBias(g) => format!("b_{}", g.suffix()),
            ParamId::OutputWeight => "W_y".to_string(),
            ParamId::OutputBias => "b_y".to_string(),
            ParamId::LayerNormGamma(g) => format!("ln_gamma_{}", g.suffix()),
            ParamId::LayerNormBeta(g) => format!("ln_beta_{}", g.suffix()),
            ParamId::HiddenState => "h_state".to_string(),
            ParamId::CellState => "c_state".to_string(),
        }
    }

    pub fn from_name(name: &str) -> Option<ParamId> {
        match name {
            "embedding" => return Some(ParamId::Embedding),
            "W_y" => return Some(ParamId::OutputWeight),
            "b_y" => return Some(ParamId::OutputBias),
            "h_state" => return Some(ParamId::HiddenState),
            "c_state" => return Some(ParamId::CellState),
            _ => {}
        }
        let (prefix, suffix) = name.rsplit_once('_')?;
        let gate = Gate::from_suffix(suffix)?;
        match prefix {
            "W" => Some(ParamId::GateInput(gate)),
            "U" => Some(ParamId::GateHidden(gate)),
            "b" => Some(ParamId::GateBias(gate)),
            "ln_gamma" => Some(ParamId::LayerNormGamma(gate)),
            "ln_beta" => Some(ParamId::LayerNormBeta(gate)),
            _ => None,
        }
    }

    pub fn shape(self, config: &ModelConfig) -> Vec<usize> {
        let (v, e, h) = (config.vocab_size, config.embedding_size, config.hidden_size);
        match self {
            ParamId::Embedding => vec![v, e],
            ParamId::GateInput(_) => vec![e, h],
            ParamId::GateHidden(_) => vec![h, h],
            ParamId::OutputWeight => vec![h, v],
            ParamId::OutputBias => vec![1, v],
            ParamId::GateBias(_)
            | ParamId::LayerNormGamma(_)
            | ParamId::LayerNormBeta(_)
            | ParamId::HiddenState
            | ParamId::CellState => vec![1, h],
        }
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// A value per parameter, indexed by [`ParamId`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParamTable<T> {
    slots: Vec<Option<T>>,
}

impl<T> Default for ParamTable<T> {
    fn default() -> Self {
        ParamTable::new()
    }
}

impl<T> ParamTable<T> {
    pub fn new() -> Self {
        ParamTable {
            slots: (0..ParamId::COUNT).map(|_| None).collect(),
        }
    }

    /// Builds a table with an entry for every id in `ids`.
    pub fn try_build<E>(ids: &[ParamId], mut f: impl FnMut(ParamId) -> Result<T, E>) -> Result<Self, E> {
        let mut table = ParamTable::new();
        for &id in ids {
            table.insert(id, f(id)?);
        }
        Ok(table)
    }

    pub fn insert(&mut self, id: ParamId, value: T) -> Option<T> {
        self.slots[id.index()].replace(value)
    }

    pub fn get(&self, id: ParamId) -> Option<&T> {
        self.slots[id.index()].as_ref()
    }

    pub fn get_mut(&mut self, id: ParamId) -> Option<&mut T> {
        self.slots[id.index()].as_mut()
    }

    pub fn remove(&mut self, id: ParamId) -> Option<T> {
        self.slots[id.index()].take()
    }

    pub fn contains(&self, id: ParamId) -> bool {
        self.slots[id.index()].is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Present entries in table order.
    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &T)> {
        ParamId::ALL
            .iter()
            .zip(self.slots.iter())
            .filter_map(|(&id, slot)| slot.as_ref().map(|v| (id, v)))
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (ParamId, T)> + '_ {
        ParamId::ALL
            .iter()
            .zip(self.slots.iter_mut())
            .filter_map(|(&id, slot)| slot.take().map(|v| (id, v)))
    }
}

/// Panics when the entry is missing; tables built by this crate are
/// always complete for the ids they were built from.
impl<T> Index<ParamId> for ParamTable<T> {
    type Output = T;

    fn index(&self, id: ParamId) -> &T {
        match self.get(id) {
            Some(v) => v,
            None => panic!("parameter table has no entry for {}", id),
        }
    }
}

impl<T> IndexMut<ParamId> for ParamTable<T> {
    fn index_mut(&mut self, id: ParamId) -> &mut T {
        match self.get_mut(id) {
            Some(v) => v,
            None => panic!("parameter table has no entry for {}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices_match_table_order() {
        for (i, id) in ParamId::ALL.iter().enumerate() {
            assert_eq!(id.index(), i, "{}", id);
        }
        assert!(ParamId::TRAINABLE.iter().all(|id| id.is_trainable()));
        assert!(!ParamId::LayerNormGamma(Gate::Forget).is_trainable());
        assert!(!ParamId::HiddenState.is_trainable());
    }

    #[test]
    fn test_names_round_trip() {
        for id in ParamId::ALL {
            assert_eq!(ParamId::from_name(&id.name()), Some(id));
        }
        assert_eq!(ParamId::GateHidden(Gate::Candidate).name(), "U_c");
        assert_eq!(ParamId::from_name("W_x"), None);
        assert_eq!(ParamId::from_name("bogus"), None);
    }

    #[test]
    fn test_shapes() {
        let config = ModelConfig {
            vocab_size: 4,
            embedding_size: 3,
            hidden_size: 5,
        };
        assert_eq!(ParamId::Embedding.shape(&config), vec![4, 3]);
        assert_eq!(ParamId::GateInput(Gate::Input).shape(&config), vec![3, 5]);
        assert_eq!(ParamId::GateHidden(Gate::Output).shape(&config), vec![5, 5]);
        assert_eq!(ParamId::OutputWeight.shape(&config), vec![5, 4]);
        assert_eq!(ParamId::OutputBias.shape(&config), vec![1, 4]);
        assert_eq!(ParamId::CellState.shape(&config), vec![1, 5]);
    }

    #[test]
    fn test_param_table() {
        let mut table: ParamTable<usize> =
            ParamTable::try_build::<()>(&ParamId::TRAINABLE, |id| Ok(id.index())).unwrap();
        assert_eq!(table.len(), 15);
        assert_eq!(table[ParamId::OutputBias], 14);
        assert!(!table.contains(ParamId::HiddenState));

        table[ParamId::Embedding] = 100;
        assert_eq!(table.get(ParamId::Embedding), Some(&100));
        let drained: Vec<_> = table.drain().collect();
        assert_eq!(drained.len(), 15);
        assert!(table.is_empty());
    }
}
