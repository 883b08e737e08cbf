//! Per-layer key/value cache for incremental scoring
//!
//! Scoring a multi-token candidate re-runs the model on the shared sentence
//! prefix followed by the candidate tokens seen so far. With prefix reuse
//! enabled the prefix is run once, its keys and values are kept here, and
//! every candidate starts from a clone of that cache. Cloning is cheap:
//! candle tensors are reference counted and never mutated in place.
//!
//! Each layer stores keys and values as `[batch, n_head, seq_len, head_dim]`.

use candle_core::Tensor;

/// Key/value tensors for every layer of a decoder.
#[derive(Debug, Clone)]
pub struct KVCache {
    /// Cached key tensors per layer: [batch, n_head, seq_len, head_dim]
    pub keys: Vec<Option<Tensor>>,
    /// Cached value tensors per layer: [batch, n_head, seq_len, head_dim]
    pub values: Vec<Option<Tensor>>,
}

impl KVCache {
    /// Create a new empty cache for the given number of layers
    pub fn new(n_layers: usize) -> Self {
        Self {
            keys: vec![None; n_layers],
            values: vec![None; n_layers],
        }
    }

    /// Number of positions already cached (0 if empty)
    pub fn seq_len(&self) -> usize {
        self.keys
            .iter()
            .find_map(|k| k.as_ref())
            .map_or(0, |k| k.dim(2).unwrap_or(0))
    }

    pub fn is_empty(&self) -> bool {
        self.keys.iter().all(Option::is_none)
    }

    pub fn n_layers(&self) -> usize {
        self.keys.len()
    }

    /// Mutable (key, value) slots for one layer
    pub fn layer_mut(&mut self, layer: usize) -> (&mut Option<Tensor>, &mut Option<Tensor>) {
        (&mut self.keys[layer], &mut self.values[layer])
    }
}

impl Default for KVCache {
    fn default() -> Self {
        Self::new(0)
    }
}
