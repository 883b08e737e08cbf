//! Deterministic model and tokenizer doubles for unit tests

use anyhow::Result;
use candle_core::{Device, IndexOp, Tensor};
use std::collections::HashMap;

use crate::kv_cache::KVCache;
use crate::model::{ScoringBackend, TokenSource};

pub const UNK: u32 = 0;

/// Word-level vocabulary; "running" splits into two pieces, anything
/// unlisted maps to `UNK`.
pub struct MockTokenizer {
    pieces: HashMap<&'static str, Vec<u32>>,
}

impl MockTokenizer {
    pub fn new() -> Self {
        let pieces = HashMap::from([
            ("the", vec![1]),
            ("keys", vec![2]),
            ("to", vec![3]),
            ("cabinet", vec![4]),
            (".", vec![5]),
            ("are", vec![6]),
            ("is", vec![7]),
            ("running", vec![8, 9]),
            ("runs", vec![10]),
            ("author", vec![11]),
        ]);
        Self { pieces }
    }
}

impl TokenSource for MockTokenizer {
    fn encode_ids(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text
            .split_whitespace()
            .flat_map(|w| {
                self.pieces
                    .get(w.to_lowercase().as_str())
                    .cloned()
                    .unwrap_or_else(|| vec![UNK])
            })
            .collect())
    }

    fn unk_id(&self) -> Option<u32> {
        Some(UNK)
    }
}

/// Language model whose logits are a fixed function of the whole history
pub struct MockLm {
    vocab_size: usize,
    max_positions: usize,
    kv_cache: bool,
}

impl MockLm {
    pub fn new() -> Self {
        Self {
            vocab_size: 12,
            max_positions: 64,
            kv_cache: true,
        }
    }

    pub fn with_max_positions(max_positions: usize) -> Self {
        Self {
            max_positions,
            ..Self::new()
        }
    }

    pub fn without_kv_cache() -> Self {
        Self {
            kv_cache: false,
            ..Self::new()
        }
    }

    fn logits_for(&self, history: &[u32]) -> Vec<f32> {
        let h: u32 = history
            .iter()
            .enumerate()
            .map(|(i, &t)| (i as u32 + 1) * (t + 3))
            .sum();
        (0..self.vocab_size as u32)
            .map(|v| ((h * 31 + v * 17 + history.len() as u32 * 7) % 13) as f32 * 0.37)
            .collect()
    }

    /// Softmax of the next-token logits, computed the way the scorer does
    pub fn next_token_probs(&self, history: &[u32]) -> Vec<f32> {
        let logits = Tensor::new(self.logits_for(history).as_slice(), &Device::Cpu)
            .and_then(|t| t.unsqueeze(0))
            .unwrap();
        candle_nn::ops::softmax_last_dim(&logits)
            .and_then(|p| p.i(0))
            .and_then(|p| p.to_vec1())
            .unwrap()
    }
}

impl ScoringBackend for MockLm {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn max_positions(&self) -> usize {
        self.max_positions
    }

    fn n_layers(&self) -> usize {
        1
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let ids: Vec<u32> = input_ids.i(0)?.to_vec1()?;
        let data: Vec<f32> = (1..=ids.len())
            .flat_map(|end| self.logits_for(&ids[..end]))
            .collect();
        Ok(Tensor::from_vec(
            data,
            (1, ids.len(), self.vocab_size),
            input_ids.device(),
        )?)
    }

    fn new_kv_cache(&self) -> Option<KVCache> {
        self.kv_cache.then(|| KVCache::new(1))
    }

    /// The "cache" holds the raw token history as a `[1, 1, len, 1]` tensor
    fn forward_with_kv_cache(&self, input_ids: &Tensor, kv_cache: &mut KVCache) -> Result<Tensor> {
        let new = input_ids.reshape((1, 1, (), 1))?;
        let (keys, _) = kv_cache.layer_mut(0);
        let history = match keys.as_ref() {
            Some(prev) => Tensor::cat(&[prev, &new], 2)?,
            None => new,
        };
        *keys = Some(history.clone());

        let ids: Vec<u32> = history.flatten_all()?.to_vec1()?;
        let logits = self.logits_for(&ids);
        Ok(Tensor::new(logits.as_slice(), input_ids.device())?.unsqueeze(0)?)
    }
}
