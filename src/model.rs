//! SynevalModel: the pretrained language model and its tokenizer
//!
//! The scorer only sees two small capabilities, [`ScoringBackend`] (ids to
//! logits) and [`TokenSource`] (text to ids), so tests can substitute
//! doubles for the real network and vocabulary.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::info;

use crate::forward_gpt::GptLmHead;
use crate::kv_cache::KVCache;
use crate::scorer::{CandidateScorer, ScorerConfig};

/// HuggingFace repository of the pretrained OpenAI GPT checkpoint
pub const DEFAULT_MODEL_ID: &str = "openai-community/openai-gpt";

/// Causal language model as seen by the scorer.
///
/// Only the full forward pass is required. Incremental decoding over a
/// [`KVCache`] is optional and reported as unsupported by default.
pub trait ScoringBackend {
    fn vocab_size(&self) -> usize;
    /// Longest sequence the model accepts
    fn max_positions(&self) -> usize;
    fn n_layers(&self) -> usize;

    /// `[batch, seq]` token ids -> `[batch, seq, vocab]` logits
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor>;

    fn new_kv_cache(&self) -> Option<KVCache> {
        None
    }

    /// Run new positions against `kv_cache`, returning `[batch, vocab]`
    /// logits for the last one.
    fn forward_with_kv_cache(&self, _input_ids: &Tensor, _kv_cache: &mut KVCache) -> Result<Tensor> {
        anyhow::bail!("KV-cache decoding not supported by this backend")
    }
}

/// Text to vocabulary ids.
pub trait TokenSource {
    /// Encode without special tokens
    fn encode_ids(&self, text: &str) -> Result<Vec<u32>>;

    /// Id that out-of-vocabulary pieces map to, if the vocabulary has one
    fn unk_id(&self) -> Option<u32> {
        None
    }
}

impl TokenSource for Tokenizer {
    fn encode_ids(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn unk_id(&self) -> Option<u32> {
        self.token_to_id("<unk>")
    }
}

/// Pick the compute device once for the whole run.
///
/// CUDA when available unless CPU is forced. GPT-1 is small enough that
/// F32 is used everywhere.
pub fn select_device(force_cpu: bool) -> (Device, DType) {
    if force_cpu {
        info!("Forcing CPU mode");
        return (Device::Cpu, DType::F32);
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            (dev, DType::F32)
        }
        _ => {
            info!("CUDA not available, using CPU");
            (Device::Cpu, DType::F32)
        }
    }
}

/// Loaded model, tokenizer and device, shared read-only for a whole run
pub struct SynevalModel {
    backend: Box<dyn ScoringBackend>,
    tokenizer: Tokenizer,
    device: Device,
}

impl SynevalModel {
    /// Load model and tokenizer from the hub (CUDA when available unless
    /// `force_cpu`)
    pub fn from_pretrained_with_device(model_id: &str, force_cpu: bool) -> Result<Self> {
        let (device, dtype) = select_device(force_cpu);

        info!("Loading model: {}", model_id);
        info!("Device: {:?}", device);
        info!("Dtype: {:?}", dtype);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let tokenizer_path = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;

        let backend = GptLmHead::load(model_id, &device, dtype)?;

        Ok(Self {
            backend: Box::new(backend),
            tokenizer,
            device,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.backend.vocab_size()
    }

    pub fn n_layers(&self) -> usize {
        self.backend.n_layers()
    }

    /// Scorer borrowing this model's backend, tokenizer and device
    pub fn scorer(&self, config: ScorerConfig) -> CandidateScorer<'_> {
        CandidateScorer::new(
            self.backend.as_ref(),
            &self.tokenizer,
            self.device.clone(),
            config,
        )
    }

    /// Token strings for `text`, for inspecting how a candidate splits
    pub fn tokenize(&self, text: &str) -> Result<Vec<String>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_tokens().to_vec())
    }
}
