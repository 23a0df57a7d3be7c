//! Chunker laws: coverage, size bounds, boundary behavior

use proptest::prelude::*;
use ragmill::chunking::{split_sentences, Chunker};
use ragmill::config::{ChunkingConfig, ChunkingStrategy};
use ragmill::error::RagError;

fn chunker(min: usize, max: usize, overlap: usize) -> Chunker {
    Chunker::new(ChunkingConfig {
        strategy: ChunkingStrategy::Fixed,
        min_chunk_size: min,
        max_chunk_size: max,
        overlap,
        semantic_threshold_percentile: 80.0,
        max_tokens: 64,
        token_overlap: 8,
    })
}

#[test]
fn empty_input_yields_empty_sequence() {
    assert!(chunker(1, 100, 10).fixed_window("").unwrap().is_empty());
    assert!(chunker(1, 100, 10).token_based("").unwrap().is_empty());
}

#[test]
fn inverted_sizes_are_a_config_error() {
    let result = chunker(200, 100, 0).fixed_window("text");
    assert!(matches!(result, Err(RagError::Config(_))));
}

#[test]
fn sentence_split_keeps_terminators() {
    let sentences = split_sentences("First one. Second one! Third one? Tail");
    assert_eq!(sentences.len(), 4);
    assert!(sentences[0].ends_with('.'));
    assert!(sentences[1].ends_with('!'));
    assert!(sentences[2].ends_with('?'));
    assert_eq!(sentences[3], "Tail");
}

proptest! {
    /// Every input character appears in at least one chunk
    #[test]
    fn fixed_window_covers_input(
        text in "[a-z ]{1,400}",
        max in 5usize..60,
        overlap in 0usize..4,
    ) {
        let min = 1usize;
        let chunks = chunker(min, max, overlap).fixed_window(&text).unwrap();

        prop_assert!(!chunks.is_empty());
        // Concatenated chunks cover the whole input at least once.
        let concatenated: String = chunks.concat();
        prop_assert!(concatenated.len() >= text.len());

        // The first emitted chunk is always a prefix of the input.
        prop_assert!(text.starts_with(&chunks[0]));
    }

    /// No chunk exceeds the configured maximum plus one merged tail
    #[test]
    fn fixed_window_respects_max(
        text in "[a-z ]{1,400}",
        max in 5usize..60,
    ) {
        let min = 2usize;
        let chunks = chunker(min, max, 0).fixed_window(&text).unwrap();
        for chunk in &chunks {
            // A merged under-min tail may extend one chunk past max.
            prop_assert!(chunk.chars().count() <= max + min);
        }
    }

    /// Chunks are never empty after trimming
    #[test]
    fn chunks_are_nonempty(
        text in "[a-z]{1,200}",
        max in 3usize..40,
    ) {
        let chunks = chunker(1, max, 1).fixed_window(&text).unwrap();
        for chunk in chunks {
            prop_assert!(!chunk.trim().is_empty());
        }
    }

    /// Token chunking covers all sentences
    #[test]
    fn token_chunks_cover_sentences(
        sentence_count in 1usize..12,
    ) {
        let text: String = (0..sentence_count)
            .map(|i| format!("This is sentence number {i}. "))
            .collect();
        let config = ChunkingConfig {
            strategy: ChunkingStrategy::Token,
            min_chunk_size: 1,
            max_chunk_size: 10_000,
            overlap: 0,
            semantic_threshold_percentile: 80.0,
            max_tokens: 16,
            token_overlap: 2,
        };
        let chunks = Chunker::new(config).token_based(&text).unwrap();

        for sentence in split_sentences(&text) {
            prop_assert!(
                chunks.iter().any(|c| c.contains(&sentence)),
                "sentence {:?} missing from chunks",
                sentence
            );
        }
    }
}
