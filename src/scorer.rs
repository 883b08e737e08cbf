//! Incremental candidate scoring
//!
//! Given a sentence with one `***`-delimited target and two candidate
//! fillers, scores each candidate by teacher forcing: the sentence prefix is
//! the context, and every candidate sub-token is scored by one forward pass
//! over `prefix ++ candidate sub-tokens so far`, multiplying the softmax
//! probability the model assigns to it.
//!
//! Scores are only meaningful relative to the other candidate for the same
//! sentence. A candidate that splits into more sub-tokens collects more
//! factors and is penalized accordingly.

use candle_core::{DType, Device, IndexOp, Tensor};
use thiserror::Error;
use tracing::debug;

use crate::kv_cache::KVCache;
use crate::model::{ScoringBackend, TokenSource};

/// Separator around the target span of a masked sentence
pub const TARGET_DELIMITER: &str = "***";

/// Errors raised while scoring a single sentence
#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("expected exactly two `***` delimiters, found {found} in {sentence:?}")]
    Format { found: usize, sentence: String },

    #[error("candidate {word:?} produced no tokens")]
    EmptyCandidate { word: String },

    #[error("sentence prefix produced no tokens: {sentence:?}")]
    EmptyContext { sentence: String },

    #[error("scoring needs {needed} positions but the model accepts at most {limit}")]
    ContextTooLong { needed: usize, limit: usize },

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Model(#[from] anyhow::Error),
}

impl ScoreError {
    /// True when the failure is confined to the input record, as opposed to
    /// the model or the device.
    pub fn is_record_error(&self) -> bool {
        matches!(
            self,
            Self::Format { .. }
                | Self::EmptyCandidate { .. }
                | Self::EmptyContext { .. }
                | Self::ContextTooLong { .. }
        )
    }
}

/// What sat between the two delimiters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    /// A mask placeholder (any text containing "mask", case-insensitive)
    Mask,
    /// Literal target text. Kept for inspection, never scored.
    Text(&'a str),
}

/// A sentence split around its target span
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskedSentence<'a> {
    pub prefix: &'a str,
    pub target: Target<'a>,
    pub suffix: &'a str,
}

impl<'a> MaskedSentence<'a> {
    pub fn parse(sentence: &'a str) -> Result<Self, ScoreError> {
        let parts: Vec<&str> = sentence.split(TARGET_DELIMITER).collect();
        let [prefix, target, suffix] = parts[..] else {
            return Err(ScoreError::Format {
                found: parts.len() - 1,
                sentence: sentence.to_string(),
            });
        };

        let target = if target.to_lowercase().contains("mask") {
            Target::Mask
        } else {
            Target::Text(target)
        };

        Ok(Self {
            prefix,
            target,
            suffix,
        })
    }
}

/// Likelihood of one candidate given the context.
///
/// `probability` is the running product of per-token probabilities, kept
/// in f32 like the softmax output it multiplies and widened only when read.
/// `log_prob` is the matching sum of natural logs in f64, kept so that long
/// candidates stay comparable after the product underflows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    probability: f32,
    log_prob: f64,
    n_tokens: usize,
}

impl Score {
    /// Fold in the probability of the next candidate token
    pub fn push(&mut self, p: f32) {
        self.probability *= p;
        self.log_prob += f64::from(p).ln();
        self.n_tokens += 1;
    }

    pub fn probability(&self) -> f64 {
        f64::from(self.probability)
    }

    pub fn log_prob(&self) -> f64 {
        self.log_prob
    }

    pub fn n_tokens(&self) -> usize {
        self.n_tokens
    }

    /// Strictly more likely than `other`.
    ///
    /// Compares products while both are normal floats and log-probabilities
    /// otherwise.
    pub fn beats(&self, other: &Score) -> bool {
        if self.probability.is_normal() && other.probability.is_normal() {
            self.probability > other.probability
        } else {
            self.log_prob > other.log_prob
        }
    }
}

impl Default for Score {
    fn default() -> Self {
        Self {
            probability: 1.0,
            log_prob: 0.0,
            n_tokens: 0,
        }
    }
}

/// Scores of the two candidates, in argument order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScorePair {
    pub first: Score,
    pub second: Score,
}

impl ScorePair {
    /// `[score_w1, score_w2]`
    pub fn as_array(&self) -> [f64; 2] {
        [self.first.probability(), self.second.probability()]
    }

    /// Whether the model prefers the first candidate.
    ///
    /// Once a product has underflowed this follows the log-probabilities,
    /// so it can be true while both printed probabilities read `0`.
    pub fn prefers_first(&self) -> bool {
        self.first.beats(&self.second)
    }

    pub fn swapped(self) -> Self {
        Self {
            first: self.second,
            second: self.first,
        }
    }
}

/// Scoring options
#[derive(Debug, Clone, Default)]
pub struct ScorerConfig {
    /// Report "no comparable score" when a candidate contains the
    /// tokenizer's unknown-token id
    pub skip_unknown: bool,
    /// Run the shared prefix once and extend a cloned KV-cache per candidate
    pub reuse_prefix_cache: bool,
}

/// Teacher-forced scorer over an injected model and tokenizer
pub struct CandidateScorer<'a> {
    model: &'a dyn ScoringBackend,
    tokenizer: &'a dyn TokenSource,
    device: Device,
    config: ScorerConfig,
}

impl<'a> CandidateScorer<'a> {
    pub fn new(
        model: &'a dyn ScoringBackend,
        tokenizer: &'a dyn TokenSource,
        device: Device,
        config: ScorerConfig,
    ) -> Self {
        Self {
            model,
            tokenizer,
            device,
            config,
        }
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// Score `w1` and `w2` as fillers of the target in `sentence`.
    ///
    /// Only the text before the target is used as context. Returns
    /// `Ok(None)` when the pair is filtered out by
    /// [`ScorerConfig::skip_unknown`].
    pub fn score_words(
        &self,
        sentence: &str,
        w1: &str,
        w2: &str,
    ) -> Result<Option<ScorePair>, ScoreError> {
        let masked = MaskedSentence::parse(sentence)?;
        if let Target::Text(text) = masked.target {
            debug!("Target {:?} is not part of the scoring context", text);
        }

        let context = self.tokenizer.encode_ids(masked.prefix)?;
        if context.is_empty() {
            return Err(ScoreError::EmptyContext {
                sentence: sentence.to_string(),
            });
        }

        let w1_ids = self.candidate_ids(w1)?;
        let w2_ids = self.candidate_ids(w2)?;

        if self.config.skip_unknown && (self.has_unknown(&w1_ids) || self.has_unknown(&w2_ids)) {
            debug!("Skipping {:?}/{:?}: out-of-vocabulary pieces", w1, w2);
            return Ok(None);
        }

        self.check_length(&context, &w1_ids)?;
        self.check_length(&context, &w2_ids)?;

        let pair = match self.prefix_cache(&context)? {
            Some((cache, logits)) => ScorePair {
                first: self.score_from_cache(&cache, &logits, &w1_ids)?,
                second: self.score_from_cache(&cache, &logits, &w2_ids)?,
            },
            None => ScorePair {
                first: self.score_candidate(&context, &w1_ids)?,
                second: self.score_candidate(&context, &w2_ids)?,
            },
        };

        debug!(
            "{:?}: {:.3e} ({} tok), {:?}: {:.3e} ({} tok)",
            w1,
            pair.first.probability(),
            pair.first.n_tokens(),
            w2,
            pair.second.probability(),
            pair.second.n_tokens()
        );

        Ok(Some(pair))
    }

    fn candidate_ids(&self, word: &str) -> Result<Vec<u32>, ScoreError> {
        let ids = self.tokenizer.encode_ids(word)?;
        if ids.is_empty() {
            return Err(ScoreError::EmptyCandidate {
                word: word.to_string(),
            });
        }
        Ok(ids)
    }

    fn has_unknown(&self, ids: &[u32]) -> bool {
        self.tokenizer
            .unk_id()
            .is_some_and(|unk| ids.contains(&unk))
    }

    /// The last candidate token is never fed back, so the longest input is
    /// `context + candidate - 1` positions.
    fn check_length(&self, context: &[u32], ids: &[u32]) -> Result<(), ScoreError> {
        let needed = context.len() + ids.len() - 1;
        let limit = self.model.max_positions();
        if needed > limit {
            return Err(ScoreError::ContextTooLong { needed, limit });
        }
        Ok(())
    }

    /// Probability of `id` under `[1, vocab]` logits
    fn probability_of(&self, logits: &Tensor, id: u32) -> Result<f32, ScoreError> {
        let logits = logits.to_dtype(DType::F32)?.contiguous()?;
        let probs = candle_nn::ops::softmax_last_dim(&logits)?;
        Ok(probs.i((0, id as usize))?.to_scalar::<f32>()?)
    }

    /// One full forward pass per candidate token over the growing input
    fn score_candidate(&self, context: &[u32], ids: &[u32]) -> Result<Score, ScoreError> {
        let mut input = context.to_vec();
        let mut score = Score::default();

        for &id in ids {
            let input_tensor = Tensor::new(input.as_slice(), &self.device)?.unsqueeze(0)?;
            let logits = self.model.forward(&input_tensor)?;
            let seq_len = logits.dim(1)?;
            let last = logits.i((.., seq_len - 1, ..))?;

            let p = self.probability_of(&last, id)?;
            debug!("step {}: token {} p={:.6e}", input.len(), id, p);
            score.push(p);
            input.push(id);
        }

        Ok(score)
    }

    /// Prefix keys/values and next-token logits, when reuse is enabled and
    /// the backend supports it
    fn prefix_cache(&self, context: &[u32]) -> Result<Option<(KVCache, Tensor)>, ScoreError> {
        if !self.config.reuse_prefix_cache {
            return Ok(None);
        }
        let Some(mut cache) = self.model.new_kv_cache() else {
            debug!("Backend has no KV-cache, scoring without prefix reuse");
            return Ok(None);
        };

        let input_tensor = Tensor::new(context, &self.device)?.unsqueeze(0)?;
        let logits = self.model.forward_with_kv_cache(&input_tensor, &mut cache)?;
        Ok(Some((cache, logits)))
    }

    fn score_from_cache(
        &self,
        prefix: &KVCache,
        prefix_logits: &Tensor,
        ids: &[u32],
    ) -> Result<Score, ScoreError> {
        let mut cache = prefix.clone();
        let mut logits = prefix_logits.clone();
        let mut score = Score::default();

        for (i, &id) in ids.iter().enumerate() {
            score.push(self.probability_of(&logits, id)?);
            if i + 1 < ids.len() {
                let input_tensor = Tensor::new(&[id], &self.device)?.unsqueeze(0)?;
                logits = self.model.forward_with_kv_cache(&input_tensor, &mut cache)?;
            }
        }

        Ok(score)
    }
}
