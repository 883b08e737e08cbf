// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::many_single_char_names)] // x, q, k, v standard in attention
#![allow(clippy::similar_names)] // related variables like `w1_ids`/`w2_ids`
#![allow(clippy::module_name_repetitions)] // ScoreError in scorer.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::unused_self)] // &self for API consistency

//! syneval-rs: targeted syntactic evaluation of GPT
//!
//! Scores the grammatical and ungrammatical filler of a masked sentence
//! with a pretrained OpenAI GPT and reports which one the model prefers,
//! over three agreement benchmarks.
//!
//! ## Architecture
//!
//! - `model`: SynevalModel wrapper plus the backend and tokenizer seams
//! - `forward_gpt`: GPT-1 forward pass (post-LN blocks, tied LM head)
//! - `kv_cache`: KV-cache for reusing the shared sentence prefix
//! - `masks`: Cached causal attention masks
//! - `scorer`: Teacher-forced candidate scoring
//! - `dataset`: Readers for the Marvin, Gulordava and LGD files
//! - `experiment`: Evaluation drivers and run summary

pub mod dataset;
pub mod experiment;
pub mod forward_gpt;
pub mod kv_cache;
pub mod masks;
pub mod model;
pub mod scorer;

#[cfg(test)]
mod testing;

pub use dataset::{
    DatasetError, DatasetResult, Example, GulordavaReader, LgdReader, MarvinReader, MASK_MARKER,
};
pub use experiment::{Benchmark, EvalConfig, EvalSummary, Evaluation, TagCounts, EXCLUDED_NOTICE};
pub use forward_gpt::{GptConfig, GptLmHead};
pub use kv_cache::KVCache;
pub use masks::{causal_mask, clear_mask_cache};
pub use model::{select_device, ScoringBackend, SynevalModel, TokenSource, DEFAULT_MODEL_ID};
pub use scorer::{
    CandidateScorer, MaskedSentence, Score, ScoreError, ScorePair, ScorerConfig, Target,
    TARGET_DELIMITER,
};
