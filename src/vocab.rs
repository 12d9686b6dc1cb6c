//! Token vocabularies and sampling helpers for generation.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TensorError};

/// Token ↔ index mapping consumed by the pipeline.
pub trait Vocabulary {
    fn size(&self) -> usize;
    fn token_to_index(&self, token: &str) -> Option<usize>;
    fn index_to_token(&self, index: usize) -> Option<String>;

    /// Splits `text` into token indices, skipping unknown tokens.
    fn encode(&self, text: &str) -> Vec<usize>;

    fn decode(&self, indices: &[usize]) -> String {
        indices.iter().filter_map(|&i| self.index_to_token(i)).collect()
    }
}

/// Character vocabulary for text generation tasks.
///
/// Characters are indexed in sorted order so the same text always produces
/// the same vocabulary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextVocabulary {
    chars: Vec<char>,
    #[serde(skip)]
    char_to_idx: HashMap<char, usize>,
}

impl TextVocabulary {
    /// Create vocabulary from text, extracting unique characters.
    pub fn from_text(text: &str) -> Self {
        let chars: Vec<char> = text.chars().collect::<BTreeSet<_>>().into_iter().collect();
        Self::from_chars(&chars)
    }

    /// Create vocabulary from explicit character list.
    pub fn from_chars(chars: &[char]) -> Self {
        let char_to_idx = chars.iter().enumerate().map(|(i, &c)| (c, i)).collect();
        TextVocabulary {
            chars: chars.to_vec(),
            char_to_idx,
        }
    }

    pub fn char_to_index(&self, ch: char) -> Option<usize> {
        self.char_to_idx.get(&ch).copied()
    }

    pub fn index_to_char(&self, idx: usize) -> Option<char> {
        self.chars.get(idx).copied()
    }

    pub fn chars(&self) -> &[char] {
        &self.chars
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let stored: TextVocabulary = serde_json::from_str(&fs::read_to_string(path)?)?;
        if stored.chars.is_empty() {
            return Err(TensorError::InvalidState("vocabulary file is empty".into()));
        }
        Ok(TextVocabulary::from_chars(&stored.chars))
    }
}

impl Vocabulary for TextVocabulary {
    fn size(&self) -> usize {
        self.chars.len()
    }

    fn token_to_index(&self, token: &str) -> Option<usize> {
        let mut it = token.chars();
        match (it.next(), it.next()) {
            (Some(ch), None) => self.char_to_index(ch),
            _ => None,
        }
    }

    fn index_to_token(&self, index: usize) -> Option<String> {
        self.index_to_char(index).map(String::from)
    }

    fn encode(&self, text: &str) -> Vec<usize> {
        text.chars().filter_map(|ch| self.char_to_index(ch)).collect()
    }
}

/// Get argmax (greedy decoding).
pub fn argmax(probs: &[f32]) -> usize {
    probs
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &p)| if p > best.1 { (i, p) } else { best })
        .0
}

/// Samples an index from a probability vector sharpened or flattened by
/// `temperature`. A temperature of zero (or below) is greedy.
pub fn sample_with_temperature<R: Rng + ?Sized>(probs: &[f32], temperature: f32, rng: &mut R) -> usize {
    if temperature <= 0.0 || probs.is_empty() {
        return argmax(probs);
    }
    // p^(1/T) renormalised equals softmax(logits / T).
    let inv_t = 1.0 / temperature as f64;
    let weights: Vec<f64> = probs
        .iter()
        .map(|&p| if p.is_finite() && p > 0.0 { (p as f64).powf(inv_t) } else { 0.0 })
        .collect();
    let total: f64 = weights.iter().sum();
    if !(total > 0.0) || !total.is_finite() {
        return argmax(probs);
    }

    let mut remaining = rng.gen::<f64>() * total;
    for (i, &w) in weights.iter().enumerate() {
        remaining -= w;
        if remaining <= 0.0 && w > 0.0 {
            return i;
        }
    }
    weights.iter().rposition(|&w| w > 0.0).unwrap_or(0)
}
