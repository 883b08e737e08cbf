//! Causal attention masks for the GPT forward pass
//!
//! A single rectangular mask covers both the full-sequence pass and the
//! incremental pass over a KV-cache: query row `i` (absolute position
//! `start_pos + i`) may attend to every key position `j <= start_pos + i`.
//!
//! Scoring re-runs the model on prefixes that grow one token at a time, so
//! the same handful of shapes comes back for every example. Masks are
//! cached by `(new_len, total_len, device, dtype)`; cached tensors are
//! returned as shallow clones.

use anyhow::{anyhow, Result};
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

type MaskKey = (usize, usize, u8, DType);

static MASK_CACHE: LazyLock<Mutex<HashMap<MaskKey, Tensor>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn device_tag(device: &Device) -> u8 {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

/// Additive causal mask of shape `[1, 1, new_len, total_len]`.
///
/// The `new_len` query rows are the last `new_len` positions of a sequence
/// of `total_len` keys. Visible entries are `0.0`, hidden ones `-inf`.
/// With `new_len == total_len` this is the usual lower-triangular mask; with
/// `new_len == 1` every key is visible.
///
/// ```text
/// new_len = 2, total_len = 4  (two cached positions)
/// [[[[0, 0, 0, -inf],
///    [0, 0, 0,    0]]]]
/// ```
pub fn causal_mask(
    new_len: usize,
    total_len: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    if new_len > total_len {
        anyhow::bail!("mask has {new_len} query rows but only {total_len} key positions");
    }
    let key = (new_len, total_len, device_tag(device), dtype);

    if let Some(mask) = lock_cache()?.get(&key) {
        return Ok(mask.clone());
    }

    let start_pos = total_len - new_len;
    let data: Vec<f32> = (0..new_len)
        .flat_map(|i| {
            (0..total_len).map(move |j| {
                if j <= start_pos + i {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            })
        })
        .collect();
    let mask = Tensor::from_vec(data, (1, 1, new_len, total_len), device)?.to_dtype(dtype)?;

    lock_cache()?.insert(key, mask.clone());
    Ok(mask)
}

/// Drop every cached mask.
pub fn clear_mask_cache() -> Result<()> {
    lock_cache()?.clear();
    Ok(())
}

/// Number of masks currently cached.
pub fn mask_cache_len() -> Result<usize> {
    Ok(lock_cache()?.len())
}

fn lock_cache() -> Result<std::sync::MutexGuard<'static, HashMap<MaskKey, Tensor>>> {
    MASK_CACHE
        .lock()
        .map_err(|_| anyhow!("causal mask cache lock poisoned"))
}
