//! Text chunking strategies
//!
//! Three strategies drive ingestion: fixed-window character chunks,
//! semantic chunks split at embedding-distance breakpoints, and
//! token-budgeted chunks. Table content gets a row-window helper that
//! keeps rows intact.

use crate::config::{ChunkingConfig, ChunkingStrategy};
use crate::embedding::{cosine_similarity, EmbeddingClient};
use crate::error::{RagError, Result};
use regex::Regex;
use std::sync::OnceLock;
use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::{debug, warn};

fn sentence_boundary() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?]\s+").expect("sentence boundary regex"))
}

fn bpe() -> &'static CoreBPE {
    static BPE: OnceLock<CoreBPE> = OnceLock::new();
    BPE.get_or_init(|| cl100k_base().expect("cl100k_base tokenizer"))
}

/// Count tokens in a text with the shared tokenizer
pub fn count_tokens(text: &str) -> usize {
    bpe().encode_with_special_tokens(text).len()
}

/// Split text into sentences at `.`, `!` or `?` followed by whitespace
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut last = 0;
    for m in sentence_boundary().find_iter(text) {
        // Keep the punctuation, drop the trailing whitespace.
        let end = m.start() + 1;
        let sentence = text[last..end].trim();
        if !sentence.is_empty() {
            sentences.push(sentence.to_string());
        }
        last = m.end();
    }
    let tail = text[last..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

/// Text chunker configured with one strategy and its parameters
#[derive(Clone)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Chunk text with the configured strategy
    ///
    /// The semantic strategy needs an embedder; without one it degrades
    /// to the fixed-window strategy.
    pub async fn chunk(
        &self,
        text: &str,
        embedder: Option<&EmbeddingClient>,
    ) -> Result<Vec<String>> {
        match self.config.strategy {
            ChunkingStrategy::Fixed => self.fixed_window(text),
            ChunkingStrategy::Token => self.token_based(text),
            ChunkingStrategy::Semantic => match embedder {
                Some(embedder) => self.semantic(text, embedder).await,
                None => {
                    warn!("Semantic chunking requested without an embedder; using fixed windows");
                    self.fixed_window(text)
                }
            },
        }
    }

    /// Fixed-window chunking with overlap
    ///
    /// Walks the text in strides of `max_chunk_size - overlap`. A trailing
    /// slice shorter than `min_chunk_size` is appended onto the previous
    /// chunk rather than emitted on its own.
    pub fn fixed_window(&self, text: &str) -> Result<Vec<String>> {
        let min = self.config.min_chunk_size;
        let max = self.config.max_chunk_size;
        let overlap = self.config.overlap;

        if max < min {
            return Err(RagError::Config(
                "max_chunk_size must be greater than or equal to min_chunk_size".to_string(),
            ));
        }

        if text.is_empty() {
            return Ok(Vec::new());
        }

        let chars: Vec<char> = text.chars().collect();
        let stride = max.saturating_sub(overlap).max(1);
        let mut chunks: Vec<String> = Vec::new();
        let mut start = 0;

        while start < chars.len() {
            let end = (start + max).min(chars.len());
            let chunk: String = chars[start..end].iter().collect();

            if chunk.chars().count() >= min {
                chunks.push(chunk);
            } else if let Some(last) = chunks.last_mut() {
                last.push_str(&chunk);
            } else {
                // The only chunk is under-sized; keep it anyway.
                chunks.push(chunk);
            }

            start += stride;
        }

        Ok(chunks)
    }

    /// Semantic chunking at embedding-distance breakpoints
    ///
    /// Sentences are embedded as overlapping triplets (previous + current
    /// + next); any consecutive pair whose cosine distance exceeds the
    /// configured percentile of all distances is a breakpoint. Candidate
    /// chunks outside `[min_chunk_size, max_chunk_size]` are discarded;
    /// when that discards everything, fixed-window chunking takes over.
    pub async fn semantic(&self, text: &str, embedder: &EmbeddingClient) -> Result<Vec<String>> {
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let sentences = split_sentences(text);
        if sentences.len() < 3 {
            return self.fixed_window(text);
        }

        let combined = combine_sentences(&sentences);
        let embeddings = embedder.embed(&combined).await?;

        let distances: Vec<f64> = embeddings
            .windows(2)
            .map(|pair| 1.0 - f64::from(cosine_similarity(&pair[0], &pair[1])))
            .collect();

        let threshold = percentile(&distances, self.config.semantic_threshold_percentile);
        let breakpoints: Vec<usize> = distances
            .iter()
            .enumerate()
            .filter(|(_, d)| **d > threshold)
            .map(|(i, _)| i)
            .collect();
        debug!(
            "Semantic chunking: {} sentences, {} breakpoints above {:.4}",
            sentences.len(),
            breakpoints.len(),
            threshold
        );

        let min = self.config.min_chunk_size;
        let max = self.config.max_chunk_size;
        let mut chunks = Vec::new();
        let mut start_index = 0;

        for index in breakpoints {
            let chunk = sentences[start_index..=index].join(" ");
            let len = chunk.chars().count();
            if len >= min && len <= max {
                chunks.push(chunk);
            }
            start_index = index + 1;
        }

        if start_index < sentences.len() {
            let chunk = sentences[start_index..].join(" ");
            let len = chunk.chars().count();
            if len >= min && len <= max {
                chunks.push(chunk);
            }
        }

        if chunks.is_empty() {
            // Every candidate fell outside the size bounds.
            warn!("Semantic chunking produced no chunks; falling back to fixed windows");
            return self.fixed_window(text);
        }

        Ok(chunks)
    }

    /// Token-budgeted chunking
    ///
    /// Accumulates sentences greedily until the running token count would
    /// exceed `max_tokens`, then seeds the next chunk with the trailing
    /// `token_overlap` tokens of the emitted one.
    pub fn token_based(&self, text: &str) -> Result<Vec<String>> {
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let max_tokens = self.config.max_tokens.max(1);
        let overlap = self.config.token_overlap;
        let sentences = split_sentences(text);

        let mut chunks: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut current_tokens = 0usize;

        for sentence in &sentences {
            let sentence_tokens = count_tokens(sentence);

            if current_tokens + sentence_tokens > max_tokens && !current.is_empty() {
                let seed = token_suffix(&current, overlap);
                chunks.push(std::mem::take(&mut current));
                current_tokens = count_tokens(&seed);
                current = seed;
                if !current.is_empty() {
                    current.push(' ');
                }
            }

            if !current.is_empty() && !current.ends_with(' ') {
                current.push(' ');
            }
            current.push_str(sentence);
            current_tokens += sentence_tokens;
        }

        if !current.trim().is_empty() {
            chunks.push(current.trim().to_string());
        }

        Ok(chunks)
    }

    /// Chunk table rows, keeping rows intact
    ///
    /// Rows are rendered as ` | `-joined cells and grouped into windows
    /// that stay under `max_chunk_size` characters.
    pub fn chunk_table(&self, rows: &[Vec<String>]) -> Vec<String> {
        let max = self.config.max_chunk_size.max(1);
        let mut chunks = Vec::new();
        let mut window = String::new();

        for row in rows {
            let line = row.join(" | ");
            if line.trim().is_empty() {
                continue;
            }
            if !window.is_empty() && window.chars().count() + line.chars().count() + 1 > max {
                chunks.push(std::mem::take(&mut window));
            }
            if !window.is_empty() {
                window.push('\n');
            }
            window.push_str(&line);
        }

        if !window.trim().is_empty() {
            chunks.push(window);
        }

        chunks
    }
}

/// Build overlapping triplets: previous + current + next sentence
fn combine_sentences(sentences: &[String]) -> Vec<String> {
    let mut combined = Vec::with_capacity(sentences.len());
    for i in 0..sentences.len() {
        let mut triplet = String::new();
        if i > 0 {
            triplet.push_str(&sentences[i - 1]);
            triplet.push(' ');
        }
        triplet.push_str(&sentences[i]);
        if i + 1 < sentences.len() {
            triplet.push(' ');
            triplet.push_str(&sentences[i + 1]);
        }
        combined.push(triplet);
    }
    combined
}

/// Nearest-rank percentile of a distance list
fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((p / 100.0) * (sorted.len() as f64)).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// The trailing `count` tokens of a text, decoded back to a string
fn token_suffix(text: &str, count: usize) -> String {
    if count == 0 {
        return String::new();
    }
    let tokens = bpe().encode_with_special_tokens(text);
    let start = tokens.len().saturating_sub(count);
    bpe().decode(tokens[start..].to_vec()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkingConfig;

    fn chunker(min: usize, max: usize, overlap: usize) -> Chunker {
        Chunker::new(ChunkingConfig {
            strategy: ChunkingStrategy::Fixed,
            min_chunk_size: min,
            max_chunk_size: max,
            overlap,
            semantic_threshold_percentile: 80.0,
            max_tokens: 50,
            token_overlap: 5,
        })
    }

    #[test]
    fn test_split_sentences() {
        let sentences = split_sentences("One. Two! Three? Four");
        assert_eq!(sentences, vec!["One.", "Two!", "Three?", "Four"]);
    }

    #[test]
    fn test_split_sentences_empty() {
        assert!(split_sentences("").is_empty());
        assert!(split_sentences("   ").is_empty());
    }

    #[test]
    fn test_fixed_window_empty() {
        assert!(chunker(1, 10, 2).fixed_window("").unwrap().is_empty());
    }

    #[test]
    fn test_fixed_window_rejects_inverted_sizes() {
        let result = chunker(100, 10, 0).fixed_window("some text");
        assert!(matches!(result, Err(RagError::Config(_))));
    }

    #[test]
    fn test_fixed_window_coverage() {
        let text = "abcdefghijklmnopqrstuvwxyz";
        let chunks = chunker(2, 10, 2).fixed_window(text).unwrap();
        // Every character must appear in at least one chunk.
        for c in text.chars() {
            assert!(chunks.iter().any(|chunk| chunk.contains(c)));
        }
        assert!(chunks.iter().all(|c| !c.trim().is_empty()));
    }

    #[test]
    fn test_fixed_window_merges_short_tail() {
        // 11 chars, max 5, overlap 0: windows of 5/5/1; the 1-char tail is
        // below min 3 and folds into the previous chunk.
        let chunks = chunker(3, 5, 0).fixed_window("aaaaabbbbbc").unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1], "bbbbbc");
    }

    #[test]
    fn test_fixed_window_single_undersized_chunk_kept() {
        let chunks = chunker(10, 20, 0).fixed_window("tiny").unwrap();
        assert_eq!(chunks, vec!["tiny"]);
    }

    #[test]
    fn test_token_based_respects_budget() {
        let text = "One sentence here. Another sentence there. A third one follows. \
                    Then a fourth sentence. And finally a fifth sentence to close.";
        let mut config = chunker(1, 1000, 0).config.clone();
        config.strategy = ChunkingStrategy::Token;
        config.max_tokens = 12;
        config.token_overlap = 3;
        let chunks = Chunker::new(config).token_based(text).unwrap();

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| !c.trim().is_empty()));
        // Full coverage: every sentence appears somewhere.
        for sentence in split_sentences(text) {
            assert!(chunks.iter().any(|c| c.contains(&sentence)));
        }
    }

    #[test]
    fn test_chunk_table_keeps_rows_intact() {
        let rows = vec![
            vec!["name".to_string(), "value".to_string()],
            vec!["alpha".to_string(), "1".to_string()],
            vec!["beta".to_string(), "2".to_string()],
        ];
        let chunks = chunker(1, 25, 0).chunk_table(&rows);
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            for line in chunk.lines() {
                assert!(line.contains(" | "));
            }
        }
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let values = vec![0.1, 0.2, 0.3, 0.4, 0.5];
        assert!((percentile(&values, 80.0) - 0.4).abs() < 1e-9);
        assert!((percentile(&values, 100.0) - 0.5).abs() < 1e-9);
        assert_eq!(percentile(&[], 80.0), 0.0);
    }

    #[test]
    fn test_token_suffix() {
        let suffix = token_suffix("the quick brown fox jumps over the lazy dog", 2);
        assert!(!suffix.is_empty());
        assert!("the quick brown fox jumps over the lazy dog".ends_with(suffix.trim_start()));
    }
}
