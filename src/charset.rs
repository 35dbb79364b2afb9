use std::path::Path;

use float_ord::FloatOrd;
use ndarray::ArrayView2;

use crate::error::{ExtractError, Result};

/// Symbols the recognizer can emit, indexed by class id. The CTC blank is
/// the class right after the last symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charset {
    symbols: Vec<String>,
}

impl Charset {
    pub fn new(symbols: Vec<String>) -> Self {
        Self { symbols }
    }

    /// One symbol per line. A line holding a single space is the space
    /// symbol, so lines are not trimmed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ExtractError::checkpoint(path, format!("can't read charset: {err}")))?;
        let symbols = contents
            .lines()
            .map(|line| line.trim_end_matches('\r').to_string())
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>();
        if symbols.is_empty() {
            return Err(ExtractError::checkpoint(path, "charset is empty"));
        }
        log::debug!("Loaded {} symbols from {path:?}", symbols.len());
        Ok(Self { symbols })
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Number of output classes the recognizer must produce.
    pub fn num_classes(&self) -> usize {
        self.symbols.len() + 1
    }

    pub fn blank(&self) -> usize {
        self.symbols.len()
    }

    /// Maps class ids to text. Blanks and unknown ids are skipped.
    pub fn decode(&self, indices: &[usize]) -> String {
        indices
            .iter()
            .filter_map(|&i| self.symbols.get(i))
            .map(String::as_str)
            .collect()
    }
}

/// Best-path CTC decoding of `(time, classes)` logits: argmax per step,
/// repeated classes collapsed, blanks removed.
pub fn ctc_greedy(logits: ArrayView2<f32>, blank: usize) -> Vec<usize> {
    let mut previous = None;
    let mut indices = Vec::new();
    for step in logits.outer_iter() {
        let best = step
            .indexed_iter()
            .max_by_key(|(_, value)| FloatOrd(**value))
            .map(|(i, _)| i);
        if best != previous {
            if let Some(class) = best.filter(|class| *class != blank) {
                indices.push(class);
            }
        }
        previous = best;
    }
    indices
}
