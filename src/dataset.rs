//! Benchmark readers
//!
//! Each reader turns one benchmark file format into a lazy stream of
//! [`Example`]s: a sentence with the target position replaced by
//! `***mask***`, plus the grammatical and ungrammatical fillers.
//!
//! - Marvin & Linzen templates: full good/bad sentence pairs, reduced to
//!   the one position where they differ
//! - LGD: already masked rows
//! - Gulordava: header-addressed rows, consumed as correct/wrong pairs

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

use thiserror::Error;
use tracing::debug;

/// Replacement for the target word in a masked sentence
pub const MASK_MARKER: &str = "***mask***";

/// A single minimal pair, ready for scoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    /// Case identifier (Marvin, LGD) or the full sentence (Gulordava)
    pub id: String,
    /// Construction type (Marvin), unused column (LGD), number of
    /// attractors (Gulordava)
    pub tag: String,
    pub masked: String,
    pub good: String,
    pub bad: String,
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("line {line}: good and bad sentences differ in length ({good} vs {bad} tokens)")]
    LengthMismatch { line: usize, good: usize, bad: usize },

    #[error("line {line}: inconsistent correct/wrong pair: {reason}")]
    Consistency { line: usize, reason: String },
}

pub type DatasetResult<T> = std::result::Result<T, DatasetError>;

fn open(path: &Path) -> DatasetResult<BufReader<File>> {
    Ok(BufReader::new(File::open(path)?))
}

/// Numbered lines, 1-based
struct NumberedLines<R> {
    lines: Lines<R>,
    line: usize,
}

impl<R: BufRead> NumberedLines<R> {
    fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line: 0,
        }
    }

    fn next_line(&mut self) -> Option<DatasetResult<(usize, String)>> {
        let next = self.lines.next()?;
        self.line += 1;
        Some(next.map(|l| (self.line, l)).map_err(DatasetError::from))
    }
}

/// Marvin & Linzen template rows: `case \t type \t ... \t good \t bad`
pub struct MarvinReader<R> {
    lines: NumberedLines<R>,
}

impl MarvinReader<BufReader<File>> {
    pub fn open(path: &Path) -> DatasetResult<Self> {
        Ok(Self::new(open(path)?))
    }
}

impl<R: BufRead> MarvinReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: NumberedLines::new(reader),
        }
    }

    /// `Ok(None)` when the pair differs in other than exactly one position
    fn parse(line: usize, row: &str) -> DatasetResult<Option<Example>> {
        let fields: Vec<&str> = row.trim().split('\t').collect();
        if fields.len() < 4 {
            return Err(DatasetError::Malformed {
                line,
                reason: format!("expected at least 4 fields, found {}", fields.len()),
            });
        }
        let (good_sentence, bad_sentence) = (fields[fields.len() - 2], fields[fields.len() - 1]);

        let mut good: Vec<&str> = good_sentence.split_whitespace().collect();
        let bad: Vec<&str> = bad_sentence.split_whitespace().collect();
        if good.len() != bad.len() {
            return Err(DatasetError::LengthMismatch {
                line,
                good: good.len(),
                bad: bad.len(),
            });
        }

        let diffs: Vec<usize> = good
            .iter()
            .zip(&bad)
            .enumerate()
            .filter(|(_, (g, b))| g != b)
            .map(|(i, _)| i)
            .collect();
        let [pos] = diffs[..] else {
            debug!("line {}: {} differing positions, skipping", line, diffs.len());
            return Ok(None);
        };

        let (good_word, bad_word) = (good[pos].to_string(), bad[pos].to_string());
        good[pos] = MASK_MARKER;
        good.push(".");

        Ok(Some(Example {
            id: fields[0].to_string(),
            tag: fields[1].to_string(),
            masked: good.join(" "),
            good: good_word,
            bad: bad_word,
        }))
    }
}

impl<R: BufRead> Iterator for MarvinReader<R> {
    type Item = DatasetResult<Example>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (line, row) = match self.lines.next_line()? {
                Ok(numbered) => numbered,
                Err(e) => return Some(Err(e)),
            };
            match Self::parse(line, &row) {
                Ok(Some(example)) => return Some(Ok(example)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Pre-masked LGD rows: `id \t _ \t masked \t good \t bad`
pub struct LgdReader<R> {
    lines: NumberedLines<R>,
}

impl LgdReader<BufReader<File>> {
    pub fn open(path: &Path) -> DatasetResult<Self> {
        Ok(Self::new(open(path)?))
    }
}

impl<R: BufRead> LgdReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: NumberedLines::new(reader),
        }
    }

    fn parse(line: usize, row: &str) -> DatasetResult<Example> {
        let fields: Vec<&str> = row.trim().split('\t').collect();
        let [id, tag, masked, good, bad] = fields[..] else {
            return Err(DatasetError::Malformed {
                line,
                reason: format!("expected 5 fields, found {}", fields.len()),
            });
        };
        Ok(Example {
            id: id.to_string(),
            tag: tag.to_string(),
            masked: masked.to_string(),
            good: good.to_string(),
            bad: bad.to_string(),
        })
    }
}

impl<R: BufRead> Iterator for LgdReader<R> {
    type Item = DatasetResult<Example>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.lines.next_line()?;
        Some(next.and_then(|(line, row)| Self::parse(line, &row)))
    }
}

/// One header-addressed row of `generated.tab`
#[derive(Debug, Clone)]
struct GulordavaRow {
    line: usize,
    sent: String,
    class: String,
    form: String,
    n_attr: String,
    len_prefix: String,
}

/// Gulordava et al. generated sentences.
///
/// Tab-separated with a header. Rows come in pairs: a `correct` row
/// followed by the `wrong` row for the same sentence.
pub struct GulordavaReader<R> {
    lines: NumberedLines<R>,
    columns: Option<HashMap<String, usize>>,
}

impl GulordavaReader<BufReader<File>> {
    pub fn open(path: &Path) -> DatasetResult<Self> {
        Ok(Self::new(open(path)?))
    }
}

impl<R: BufRead> GulordavaReader<R> {
    const FIELDS: [&'static str; 5] = ["sent", "class", "form", "n_attr", "len_prefix"];

    pub fn new(reader: R) -> Self {
        Self {
            lines: NumberedLines::new(reader),
            columns: None,
        }
    }

    /// Read the header row. An empty file yields no examples.
    fn read_header(&mut self) -> DatasetResult<()> {
        let Some(next) = self.lines.next_line() else {
            self.columns = Some(HashMap::new());
            return Ok(());
        };
        let (line, header) = next?;
        let columns: HashMap<String, usize> = header
            .split('\t')
            .enumerate()
            .map(|(i, name)| (name.to_string(), i))
            .collect();

        if let Some(missing) = Self::FIELDS.iter().find(|f| !columns.contains_key(**f)) {
            return Err(DatasetError::Malformed {
                line,
                reason: format!("header has no `{missing}` column"),
            });
        }
        self.columns = Some(columns);
        Ok(())
    }

    /// Next non-blank row
    fn next_row(&mut self) -> Option<DatasetResult<GulordavaRow>> {
        loop {
            let (line, row) = match self.lines.next_line()? {
                Ok(numbered) => numbered,
                Err(e) => return Some(Err(e)),
            };
            if row.trim().is_empty() {
                continue;
            }
            let columns = self.columns.as_ref()?;
            return Some(Self::parse_row(columns, line, &row));
        }
    }

    fn parse_row(
        columns: &HashMap<String, usize>,
        line: usize,
        row: &str,
    ) -> DatasetResult<GulordavaRow> {
        let fields: Vec<&str> = row.split('\t').collect();
        let field = |name: &str| -> DatasetResult<String> {
            columns
                .get(name)
                .and_then(|&i| fields.get(i))
                .map(|s| (*s).to_string())
                .ok_or_else(|| DatasetError::Malformed {
                    line,
                    reason: format!("row has no value for `{name}`"),
                })
        };

        Ok(GulordavaRow {
            line,
            sent: field("sent")?,
            class: field("class")?,
            form: field("form")?,
            n_attr: field("n_attr")?,
            len_prefix: field("len_prefix")?,
        })
    }

    fn combine(correct: GulordavaRow, wrong: GulordavaRow) -> DatasetResult<Example> {
        if correct.sent != wrong.sent {
            return Err(DatasetError::Consistency {
                line: wrong.line,
                reason: format!("sentence {:?} paired with {:?}", correct.sent, wrong.sent),
            });
        }
        if correct.class != "correct" {
            return Err(DatasetError::Consistency {
                line: correct.line,
                reason: format!("expected class `correct`, found `{}`", correct.class),
            });
        }
        if wrong.class != "wrong" {
            return Err(DatasetError::Consistency {
                line: wrong.line,
                reason: format!("expected class `wrong`, found `{}`", wrong.class),
            });
        }

        let target: usize = correct.len_prefix.trim().parse().map_err(|_| DatasetError::Malformed {
            line: correct.line,
            reason: format!("len_prefix {:?} is not an index", correct.len_prefix),
        })?;

        let lowered = correct.sent.to_lowercase();
        let mut words: Vec<&str> = lowered.split_whitespace().collect();
        // Drop the trailing <eos>
        words.pop();
        if target >= words.len() {
            return Err(DatasetError::Malformed {
                line: correct.line,
                reason: format!("len_prefix {target} outside a {}-word sentence", words.len()),
            });
        }
        words[target] = MASK_MARKER;

        Ok(Example {
            id: correct.sent.clone(),
            tag: correct.n_attr,
            masked: words.join(" "),
            good: correct.form,
            bad: wrong.form,
        })
    }
}

impl<R: BufRead> Iterator for GulordavaReader<R> {
    type Item = DatasetResult<Example>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.columns.is_none() {
            if let Err(e) = self.read_header() {
                // Nothing after a bad header can be addressed by name
                while self.lines.next_line().is_some() {}
                self.columns = Some(HashMap::new());
                return Some(Err(e));
            }
        }

        let correct = match self.next_row()? {
            Ok(row) => row,
            Err(e) => return Some(Err(e)),
        };
        let wrong = match self.next_row() {
            Some(Ok(row)) => row,
            Some(Err(e)) => return Some(Err(e)),
            None => {
                return Some(Err(DatasetError::Consistency {
                    line: correct.line,
                    reason: "`correct` row has no `wrong` partner".to_string(),
                }))
            }
        };
        Some(Self::combine(correct, wrong))
    }
}
