//! OpenAI GPT (GPT-1) forward pass
//!
//! Hand-written candle implementation of the `OpenAIGPTLMHeadModel`
//! architecture:
//! - Learned token and position embeddings (no RoPE)
//! - Post-LayerNorm blocks: `n = ln_1(x + attn(x))`, `h = ln_2(n + mlp(n))`
//! - Conv1D projections with weights stored as `[in, out]` (transposed
//!   relative to `nn.Linear`)
//! - LM head tied to the token embedding matrix
//!
//! Two entry points: a full pass returning logits for every position, and
//! an incremental pass that extends a [`KVCache`] and returns logits for the
//! last position only.

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{embedding, layer_norm, Embedding, LayerNorm, Linear, VarBuilder};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::info;

use crate::kv_cache::KVCache;
use crate::masks::causal_mask;
use crate::model::ScoringBackend;

/// Model configuration (matches HuggingFace config.json for openai-gpt)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct GptConfig {
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_n_positions")]
    pub n_positions: usize,
    #[serde(default = "default_n_embd")]
    pub n_embd: usize,
    #[serde(default = "default_n_layer")]
    pub n_layer: usize,
    #[serde(default = "default_n_head")]
    pub n_head: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    #[serde(default = "default_afn")]
    pub afn: String,
}

fn default_vocab_size() -> usize {
    40478
}

fn default_n_positions() -> usize {
    512
}

fn default_n_embd() -> usize {
    768
}

fn default_n_layer() -> usize {
    12
}

fn default_n_head() -> usize {
    12
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

fn default_afn() -> String {
    "gelu".to_string()
}

impl Default for GptConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            n_positions: default_n_positions(),
            n_embd: default_n_embd(),
            n_layer: default_n_layer(),
            n_head: default_n_head(),
            layer_norm_epsilon: default_layer_norm_epsilon(),
            afn: default_afn(),
        }
    }
}

impl GptConfig {
    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }
}

/// GPT-style Conv1D: `y = x @ W + b` with `W: [nx, nf]`
struct Conv1D {
    weight: Tensor,
    bias: Tensor,
}

impl Conv1D {
    fn load(nx: usize, nf: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get((nx, nf), "weight")?;
        let bias = vb.get(nf, "bias")?;
        Ok(Self { weight, bias })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.broadcast_matmul(&self.weight)?.broadcast_add(&self.bias)?)
    }
}

/// Masked multi-head self-attention with a fused QKV projection
struct Attention {
    c_attn: Conv1D,
    c_proj: Conv1D,
    n_head: usize,
    head_dim: usize,
    n_embd: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &GptConfig) -> Result<Self> {
        let c_attn = Conv1D::load(config.n_embd, 3 * config.n_embd, vb.pp("c_attn"))?;
        let c_proj = Conv1D::load(config.n_embd, config.n_embd, vb.pp("c_proj"))?;
        Ok(Self {
            c_attn,
            c_proj,
            n_head: config.n_head,
            head_dim: config.head_dim(),
            n_embd: config.n_embd,
        })
    }

    /// [b, seq, n_embd] -> [b, n_head, seq, head_dim]
    fn split_heads(&self, x: &Tensor, b: usize, seq_len: usize) -> Result<Tensor> {
        Ok(x
            .reshape((b, seq_len, self.n_head, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Self-attention over `x`, optionally prepending cached keys/values.
    ///
    /// When both cache slots are given they are updated with the keys and
    /// values of the new positions.
    fn forward(
        &self,
        x: &Tensor,
        cache: Option<(&mut Option<Tensor>, &mut Option<Tensor>)>,
    ) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let qkv = self.c_attn.forward(x)?;
        let q = qkv.narrow(D::Minus1, 0, self.n_embd)?;
        let k = qkv.narrow(D::Minus1, self.n_embd, self.n_embd)?;
        let v = qkv.narrow(D::Minus1, 2 * self.n_embd, self.n_embd)?;

        let q = self.split_heads(&q, b, seq_len)?;
        let mut k = self.split_heads(&k, b, seq_len)?;
        let mut v = self.split_heads(&v, b, seq_len)?;

        if let Some((cache_k, cache_v)) = cache {
            if let (Some(prev_k), Some(prev_v)) = (cache_k.as_ref(), cache_v.as_ref()) {
                k = Tensor::cat(&[prev_k, &k], 2)?;
                v = Tensor::cat(&[prev_v, &v], 2)?;
            }
            *cache_k = Some(k.clone());
            *cache_v = Some(v.clone());
        }

        let total_len = k.dim(2)?;
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;

        let mask = causal_mask(seq_len, total_len, x.device(), x.dtype())?;
        let weights = weights.broadcast_add(&mask)?;
        let weights = candle_nn::ops::softmax_last_dim(&weights)?;

        let out = weights.matmul(&v)?;
        let out = out.transpose(1, 2)?.reshape((b, seq_len, self.n_embd))?;
        self.c_proj.forward(&out)
    }
}

/// Feed-forward block with the tanh-approximated GELU of the original release
struct Mlp {
    c_fc: Conv1D,
    c_proj: Conv1D,
}

impl Mlp {
    fn load(vb: VarBuilder, config: &GptConfig) -> Result<Self> {
        if !matches!(config.afn.as_str(), "gelu" | "gelu_new") {
            anyhow::bail!("Unsupported activation function: {}", config.afn);
        }
        let n_state = 4 * config.n_embd;
        Ok(Self {
            c_fc: Conv1D::load(config.n_embd, n_state, vb.pp("c_fc"))?,
            c_proj: Conv1D::load(n_state, config.n_embd, vb.pp("c_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.c_fc.forward(x)?.gelu()?;
        self.c_proj.forward(&h)
    }
}

/// Post-LayerNorm transformer block
struct Block {
    attn: Attention,
    ln_1: LayerNorm,
    mlp: Mlp,
    ln_2: LayerNorm,
}

impl Block {
    fn load(vb: VarBuilder, config: &GptConfig) -> Result<Self> {
        let eps = config.layer_norm_epsilon;
        Ok(Self {
            attn: Attention::load(vb.pp("attn"), config)?,
            ln_1: layer_norm(config.n_embd, eps, vb.pp("ln_1"))?,
            mlp: Mlp::load(vb.pp("mlp"), config)?,
            ln_2: layer_norm(config.n_embd, eps, vb.pp("ln_2"))?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        cache: Option<(&mut Option<Tensor>, &mut Option<Tensor>)>,
    ) -> Result<Tensor> {
        let a = self.attn.forward(x, cache)?;
        let n = self.ln_1.forward(&(x + a)?)?;
        let m = self.mlp.forward(&n)?;
        Ok(self.ln_2.forward(&(n + m)?)?)
    }
}

/// OpenAI GPT with its tied language-modelling head
pub struct GptLmHead {
    tokens_embed: Embedding,
    positions_embed: Embedding,
    blocks: Vec<Block>,
    lm_head: Linear,
    config: GptConfig,
}

impl GptLmHead {
    /// Load model from HuggingFace
    pub fn load(model_id: &str, device: &Device, dtype: DType) -> Result<Self> {
        info!("Loading OpenAI GPT from: {}", model_id);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config_path = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let config: GptConfig = serde_json::from_str(&config_str)?;

        info!(
            "Model config: {} layers, {} hidden, {} heads, {} vocab, {} positions",
            config.n_layer, config.n_embd, config.n_head, config.vocab_size, config.n_positions
        );

        let vb = if let Ok(path) = repo.get("model.safetensors") {
            info!("Loading weights from {}", path.display());
            unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, device)? }
        } else {
            // Older snapshots only ship the pickled checkpoint
            let path = repo
                .get("pytorch_model.bin")
                .context("Failed to download model.safetensors or pytorch_model.bin")?;
            info!("Loading weights from {}", path.display());
            VarBuilder::from_pth(&path, dtype, device)?
        };

        let model = Self::from_var_builder(vb, config)?;
        info!("Model loaded successfully with {} layers", model.config.n_layer);
        Ok(model)
    }

    /// Build the model from an already opened weight source.
    ///
    /// Accepts checkpoints saved from either the bare transformer or the
    /// LM-head wrapper (`transformer.` prefix).
    pub fn from_var_builder(vb: VarBuilder, config: GptConfig) -> Result<Self> {
        let vb = if vb.contains_tensor("transformer.tokens_embed.weight") {
            vb.pp("transformer")
        } else {
            vb
        };

        let tokens_embed = embedding(config.vocab_size, config.n_embd, vb.pp("tokens_embed"))?;
        let positions_embed =
            embedding(config.n_positions, config.n_embd, vb.pp("positions_embed"))?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            blocks.push(Block::load(vb.pp(format!("h.{i}")), &config)?);
        }

        let lm_head = Linear::new(tokens_embed.embeddings().clone(), None);

        Ok(Self {
            tokens_embed,
            positions_embed,
            blocks,
            lm_head,
            config,
        })
    }

    pub fn config(&self) -> &GptConfig {
        &self.config
    }

    /// Token plus position embeddings for positions `start_pos..start_pos + seq_len`
    fn embed(&self, input_ids: &Tensor, start_pos: usize) -> Result<Tensor> {
        let seq_len = input_ids.dim(1)?;
        if start_pos + seq_len > self.config.n_positions {
            anyhow::bail!(
                "Sequence of {} positions exceeds the model limit of {}",
                start_pos + seq_len,
                self.config.n_positions
            );
        }
        let positions = Tensor::arange(
            start_pos as u32,
            (start_pos + seq_len) as u32,
            input_ids.device(),
        )?
        .unsqueeze(0)?;

        let tokens = self.tokens_embed.forward(input_ids)?;
        let positions = self.positions_embed.forward(&positions)?;
        Ok(tokens.broadcast_add(&positions)?)
    }

    /// Full forward pass: `[batch, seq]` ids -> `[batch, seq, vocab]` logits
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let mut hidden = self.embed(input_ids, 0)?;
        for block in &self.blocks {
            hidden = block.forward(&hidden, None)?;
        }
        Ok(self.lm_head.forward(&hidden)?)
    }

    pub fn new_kv_cache(&self) -> KVCache {
        KVCache::new(self.config.n_layer)
    }

    /// Incremental pass over new positions; returns `[batch, vocab]` logits
    /// for the last one.
    pub fn forward_with_kv_cache(&self, input_ids: &Tensor, kv_cache: &mut KVCache) -> Result<Tensor> {
        let start_pos = kv_cache.seq_len();
        let mut hidden = self.embed(input_ids, start_pos)?;

        for (i, block) in self.blocks.iter().enumerate() {
            hidden = block.forward(&hidden, Some(kv_cache.layer_mut(i)))?;
        }

        let seq_len = hidden.dim(1)?;
        let last_hidden = hidden.i((.., seq_len - 1, ..))?;
        Ok(self.lm_head.forward(&last_hidden)?)
    }
}

impl ScoringBackend for GptLmHead {
    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn max_positions(&self) -> usize {
        self.config.n_positions
    }

    fn n_layers(&self) -> usize {
        self.config.n_layer
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        GptLmHead::forward(self, input_ids)
    }

    fn new_kv_cache(&self) -> Option<KVCache> {
        Some(GptLmHead::new_kv_cache(self))
    }

    fn forward_with_kv_cache(&self, input_ids: &Tensor, kv_cache: &mut KVCache) -> Result<Tensor> {
        GptLmHead::forward_with_kv_cache(self, input_ids, kv_cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scorer::{CandidateScorer, ScorerConfig};
    use crate::testing::MockTokenizer;
    use serial_test::serial;
    use std::collections::HashMap;

    fn tiny_config() -> GptConfig {
        GptConfig {
            vocab_size: 12,
            n_positions: 8,
            n_embd: 8,
            n_layer: 2,
            n_head: 2,
            layer_norm_epsilon: 1e-5,
            afn: "gelu".to_string(),
        }
    }

    fn tiny_model() -> GptLmHead {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        GptLmHead::from_var_builder(vb, tiny_config()).unwrap()
    }

    fn randn(shape: &[usize]) -> Tensor {
        Tensor::randn(0f32, 0.5, shape, &Device::Cpu).unwrap()
    }

    /// Random weights under the checkpoint names, optionally behind `prefix`
    fn random_weights(config: &GptConfig, prefix: &str) -> HashMap<String, Tensor> {
        let (e, v, p) = (config.n_embd, config.vocab_size, config.n_positions);

        let mut weights = HashMap::new();
        weights.insert(format!("{prefix}tokens_embed.weight"), randn(&[v, e]));
        weights.insert(format!("{prefix}positions_embed.weight"), randn(&[p, e]));
        for i in 0..config.n_layer {
            let layer = format!("{prefix}h.{i}");
            for (name, nx, nf) in [
                ("attn.c_attn", e, 3 * e),
                ("attn.c_proj", e, e),
                ("mlp.c_fc", e, 4 * e),
                ("mlp.c_proj", 4 * e, e),
            ] {
                weights.insert(format!("{layer}.{name}.weight"), randn(&[nx, nf]));
                weights.insert(format!("{layer}.{name}.bias"), randn(&[nf]));
            }
            for ln in ["ln_1", "ln_2"] {
                weights.insert(format!("{layer}.{ln}.weight"), randn(&[e]).affine(0.2, 1.0).unwrap());
                weights.insert(format!("{layer}.{ln}.bias"), randn(&[e]));
            }
        }
        weights
    }

    fn random_model() -> GptLmHead {
        let config = tiny_config();
        let vb = VarBuilder::from_tensors(random_weights(&config, ""), DType::F32, &Device::Cpu);
        GptLmHead::from_var_builder(vb, config).unwrap()
    }

    fn ids(tokens: &[u32]) -> Tensor {
        Tensor::new(tokens, &Device::Cpu).unwrap().unsqueeze(0).unwrap()
    }

    /// Logits of one position of a `[1, seq, vocab]` output
    fn row(logits: &Tensor, pos: usize) -> Vec<f32> {
        logits.i((0, pos)).unwrap().to_vec1().unwrap()
    }

    fn max_diff(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
    }

    #[test]
    fn test_config_defaults_match_openai_gpt() {
        let config: GptConfig = serde_json::from_str(r#"{"n_layer": 12}"#).unwrap();
        assert_eq!(config.vocab_size, 40478);
        assert_eq!(config.n_positions, 512);
        assert_eq!(config.head_dim(), 64);
        assert_eq!(config.afn, "gelu");
    }

    #[test]
    fn test_unknown_activation_is_rejected() {
        let config = GptConfig {
            afn: "relu".to_string(),
            ..tiny_config()
        };
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(GptLmHead::from_var_builder(vb, config).is_err());
    }

    #[test]
    #[serial]
    fn test_forward_shapes() {
        let model = tiny_model();
        let logits = model.forward(&ids(&[1, 4, 7])).unwrap();
        assert_eq!(logits.dims(), &[1, 3, 12]);
    }

    #[test]
    #[serial]
    fn test_zero_weights_give_uniform_distribution() {
        let model = tiny_model();
        let logits = model.forward(&ids(&[2, 3])).unwrap();
        let last = logits.i((0, 1)).unwrap();
        let probs: Vec<f32> = candle_nn::ops::softmax_last_dim(&last)
            .unwrap()
            .to_vec1()
            .unwrap();
        for p in probs {
            assert!((p - 1.0 / 12.0).abs() < 1e-6);
        }
    }

    #[test]
    #[serial]
    fn test_kv_cache_matches_full_pass() {
        let model = random_model();
        let tokens = [1u32, 4, 7, 2, 9];
        let full = model.forward(&ids(&tokens)).unwrap();

        let mut cache = GptLmHead::new_kv_cache(&model);
        let step = model.forward_with_kv_cache(&ids(&tokens[..3]), &mut cache).unwrap();
        assert_eq!(step.dims(), &[1, 12]);
        assert_eq!(cache.seq_len(), 3);
        let step: Vec<f32> = step.i(0).unwrap().to_vec1().unwrap();
        assert!(max_diff(&step, &row(&full, 2)) < 1e-5);

        for pos in 3..tokens.len() {
            let step = model
                .forward_with_kv_cache(&ids(&tokens[pos..=pos]), &mut cache)
                .unwrap();
            let step: Vec<f32> = step.i(0).unwrap().to_vec1().unwrap();
            assert!(max_diff(&step, &row(&full, pos)) < 1e-5, "position {pos}");
        }
        assert_eq!(cache.seq_len(), 5);
    }

    #[test]
    #[serial]
    fn test_future_tokens_do_not_change_earlier_logits() {
        let model = random_model();
        let a = model.forward(&ids(&[1, 4, 7, 2, 9])).unwrap();
        let b = model.forward(&ids(&[1, 4, 7, 2, 3])).unwrap();

        for pos in 0..4 {
            assert!(max_diff(&row(&a, pos), &row(&b, pos)) < 1e-6, "position {pos}");
        }
        assert!(max_diff(&row(&a, 4), &row(&b, 4)) > 1e-3);
    }

    #[test]
    #[serial]
    fn test_attention_reads_earlier_tokens() {
        let model = random_model();
        let a = model.forward(&ids(&[1, 4, 7])).unwrap();
        let b = model.forward(&ids(&[5, 4, 7])).unwrap();
        assert!(max_diff(&row(&a, 2), &row(&b, 2)) > 1e-3);
    }

    #[test]
    #[serial]
    fn test_positions_are_embedded() {
        let model = random_model();
        let logits = model.forward(&ids(&[3, 3, 3])).unwrap();
        assert!(max_diff(&row(&logits, 0), &row(&logits, 1)) > 1e-3);
    }

    #[test]
    #[serial]
    fn test_transformer_prefix_is_accepted() {
        let config = tiny_config();
        let weights = random_weights(&config, "");
        let prefixed: HashMap<String, Tensor> = weights
            .iter()
            .map(|(k, t)| (format!("transformer.{k}"), t.clone()))
            .collect();

        let bare = GptLmHead::from_var_builder(
            VarBuilder::from_tensors(weights, DType::F32, &Device::Cpu),
            config.clone(),
        )
        .unwrap();
        let wrapped = GptLmHead::from_var_builder(
            VarBuilder::from_tensors(prefixed, DType::F32, &Device::Cpu),
            config,
        )
        .unwrap();

        let a = bare.forward(&ids(&[1, 2, 3])).unwrap();
        let b = wrapped.forward(&ids(&[1, 2, 3])).unwrap();
        assert!(max_diff(&row(&a, 2), &row(&b, 2)) < 1e-6);
    }

    #[test]
    #[serial]
    fn test_prefix_cache_scoring_matches_full_passes() {
        let model = random_model();
        let tokenizer = MockTokenizer::new();
        let sentence = "the keys to the ***mask*** .";
        let full = CandidateScorer::new(&model, &tokenizer, Device::Cpu, ScorerConfig::default());
        let cached = CandidateScorer::new(
            &model,
            &tokenizer,
            Device::Cpu,
            ScorerConfig {
                reuse_prefix_cache: true,
                ..Default::default()
            },
        );

        let a = full.score_words(sentence, "running", "runs").unwrap().unwrap();
        let b = cached.score_words(sentence, "running", "runs").unwrap().unwrap();
        assert_eq!(a.first.n_tokens(), 2);
        for (x, y) in a.as_array().into_iter().zip(b.as_array()) {
            assert!((x - y).abs() <= 1e-5 * x.max(y), "{x} vs {y}");
        }
        assert_eq!(a.prefers_first(), b.prefers_first());
    }

    #[test]
    #[serial]
    fn test_sequence_longer_than_positions_fails() {
        let model = tiny_model();
        assert!(model.forward(&ids(&[1u32; 9])).is_err());
    }
}
