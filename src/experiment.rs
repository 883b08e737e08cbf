//! Evaluation drivers
//!
//! Streams a benchmark through the scorer, writing one verdict per example
//! to the result sink and progress to the log.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::dataset::{DatasetResult, Example, GulordavaReader, LgdReader, MarvinReader};
use crate::scorer::CandidateScorer;

/// The three supported benchmarks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Benchmark {
    /// Marvin & Linzen (2018) template-generated minimal pairs
    Marvin,
    /// Gulordava et al. (2018) generated sentences
    Gulordava,
    /// Linzen, Goldberg & Dupoux (2016) agreement dataset
    Lgd,
}

/// Good forms the Gulordava driver leaves out
const GULORDAVA_EXCLUDED: [&str; 2] = ["is", "are"];

/// Line written to the result stream in place of an excluded example
pub const EXCLUDED_NOTICE: &str = "skipping is/are";

impl Benchmark {
    /// File name the benchmark is read from unless overridden
    pub fn default_dataset(self) -> &'static str {
        match self {
            Self::Marvin => "marvin_linzen_dataset.tsv",
            Self::Gulordava => "generated.tab",
            Self::Lgd => "lgd_dataset.tsv",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Marvin => "marvin",
            Self::Gulordava => "gulordava",
            Self::Lgd => "lgd",
        }
    }

    /// Lazily read examples from `path` in this benchmark's format
    pub fn open(self, path: &Path) -> DatasetResult<Box<dyn Iterator<Item = DatasetResult<Example>>>> {
        Ok(match self {
            Self::Marvin => Box::new(MarvinReader::open(path)?),
            Self::Gulordava => Box::new(GulordavaReader::open(path)?),
            Self::Lgd => Box::new(LgdReader::open(path)?),
        })
    }

    /// Whether the example is left out before scoring
    fn excludes(self, example: &Example) -> bool {
        self == Self::Gulordava && GULORDAVA_EXCLUDED.contains(&example.good.as_str())
    }

    /// Scores reported when the scorer has no comparable score: Marvin
    /// lets the bad candidate win, the others drop the example.
    fn fallback_scores(self) -> Option<[f64; 2]> {
        match self {
            Self::Marvin => Some([0.0, 1.0]),
            Self::Gulordava | Self::Lgd => None,
        }
    }

    /// One result line (without newline). `verdict` is whether the good
    /// form won; probabilities are printed as given.
    ///
    /// The verdict comes from [`ScorePair::prefers_first`], which compares
    /// log-probabilities once a product underflows, so a record may read
    /// `True` over two printed `0` scores.
    ///
    /// [`ScorePair::prefers_first`]: crate::scorer::ScorePair::prefers_first
    pub fn format_record(self, verdict: bool, example: &Example, [good, bad]: [f64; 2]) -> String {
        let verdict = if verdict { "True" } else { "False" };
        match self {
            Self::Marvin => format!(
                "{} {} {} {} {} {}",
                verdict, example.id, example.tag, example.good, example.bad, example.masked
            ),
            Self::Lgd => format!(
                "{}\t{}\t{}\t{}\t{}\t{}\t{}",
                verdict, example.id, example.good, good, example.bad, bad, example.masked
            ),
            Self::Gulordava => format!(
                "{}\t{}\t{}\t{}\t{}\t{}\t{}",
                verdict, example.tag, example.good, good, example.bad, bad, example.masked
            ),
        }
    }
}

impl std::fmt::Display for Benchmark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Configuration for one evaluation run
#[derive(Debug, Clone)]
pub struct EvalConfig {
    pub benchmark: Benchmark,
    pub dataset_path: PathBuf,
    /// Log progress every this many examples
    pub progress_every: usize,
    /// Continue past examples that fail to score instead of aborting
    pub keep_going: bool,
}

impl EvalConfig {
    pub fn for_benchmark(benchmark: Benchmark) -> Self {
        Self {
            benchmark,
            dataset_path: PathBuf::from(benchmark.default_dataset()),
            ..Default::default()
        }
    }
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            benchmark: Benchmark::Lgd,
            dataset_path: PathBuf::from(Benchmark::Lgd.default_dataset()),
            progress_every: 100,
            keep_going: false,
        }
    }
}

/// Per-tag tally
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagCounts {
    pub total: usize,
    pub correct: usize,
}

/// Outcome of a whole run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalSummary {
    pub benchmark: Benchmark,
    /// Examples with a reported verdict
    pub total: usize,
    /// Verdicts where the good form won
    pub correct: usize,
    /// Examples excluded or without a comparable score
    pub skipped: usize,
    /// Examples that failed to score (only with `keep_going`)
    pub failed: usize,
    pub by_tag: BTreeMap<String, TagCounts>,
}

impl EvalSummary {
    fn new(benchmark: Benchmark) -> Self {
        Self {
            benchmark,
            total: 0,
            correct: 0,
            skipped: 0,
            failed: 0,
            by_tag: BTreeMap::new(),
        }
    }

    fn record(&mut self, tag: &str, correct: bool) {
        self.total += 1;
        let counts = self.by_tag.entry(tag.to_string()).or_default();
        counts.total += 1;
        if correct {
            self.correct += 1;
            counts.correct += 1;
        }
    }

    /// Fraction of reported verdicts where the good form won
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write summary to {}", path.display()))
    }
}

/// Evaluation driver
pub struct Evaluation<'a> {
    scorer: &'a CandidateScorer<'a>,
    config: EvalConfig,
}

impl<'a> Evaluation<'a> {
    pub fn new(scorer: &'a CandidateScorer<'a>, config: EvalConfig) -> Self {
        Self { scorer, config }
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    /// Read the configured dataset and evaluate it, writing records to `out`
    pub fn run<W: Write>(&self, out: &mut W) -> Result<EvalSummary> {
        let benchmark = self.config.benchmark;
        let path = &self.config.dataset_path;
        info!("Evaluating {} from {}", benchmark, path.display());

        let examples = benchmark
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        if benchmark == Benchmark::Marvin {
            // Template files are small; load them up front to report the size
            let examples = examples.collect::<DatasetResult<Vec<_>>>()?;
            info!("{} examples", examples.len());
            self.run_examples(examples.into_iter().map(Ok), out)
        } else {
            self.run_examples(examples, out)
        }
    }

    /// Evaluate an already opened example stream
    pub fn run_examples<I, W>(&self, examples: I, out: &mut W) -> Result<EvalSummary>
    where
        I: IntoIterator<Item = DatasetResult<Example>>,
        W: Write,
    {
        let benchmark = self.config.benchmark;
        let progress_every = self.config.progress_every.max(1);
        let mut summary = EvalSummary::new(benchmark);
        let mut batch_start = Instant::now();

        for (i, example) in examples.into_iter().enumerate() {
            let example = example?;

            if benchmark.excludes(&example) {
                debug!("Skipping is/are example: {}", example.masked);
                writeln!(out, "{EXCLUDED_NOTICE}")?;
                summary.skipped += 1;
                continue;
            }

            let (verdict, scores) = match self
                .scorer
                .score_words(&example.masked, &example.good, &example.bad)
            {
                Ok(Some(pair)) => (pair.prefers_first(), pair.as_array()),
                Ok(None) => match benchmark.fallback_scores() {
                    Some(fallback) => {
                        debug!("No comparable score for {}/{}, bad wins", example.good, example.bad);
                        (false, fallback)
                    }
                    None => {
                        debug!("No comparable score for {}/{}, skipping", example.good, example.bad);
                        summary.skipped += 1;
                        continue;
                    }
                },
                Err(e) if e.is_record_error() && self.config.keep_going => {
                    warn!("Example {} failed: {}", i, e);
                    summary.failed += 1;
                    continue;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to score example {i}"));
                }
            };

            summary.record(&example.tag, verdict);
            writeln!(out, "{}", benchmark.format_record(verdict, &example, scores))?;

            if i % progress_every == 0 {
                info!("{} {:.2}s", i, batch_start.elapsed().as_secs_f64());
                batch_start = Instant::now();
                out.flush()?;
            }
        }
        out.flush()?;

        info!(
            "{}: {}/{} correct ({:.2}%), {} skipped, {} failed",
            benchmark,
            summary.correct,
            summary.total,
            summary.accuracy() * 100.0,
            summary.skipped,
            summary.failed
        );
        Ok(summary)
    }
}
