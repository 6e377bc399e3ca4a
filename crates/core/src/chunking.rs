use crate::config::ChunkingConfig;
use crate::extractor::PageText;
use crate::models::{Passage, PassageMetadata};

/// Separators tried in order: paragraphs, lines, sentences, words.
const SEPARATORS: [&str; 6] = ["\n\n", "\n", ". ", "! ", "? ", " "];

/// Splits every page into passages numbered contiguously across the document.
///
/// Pure and deterministic. Empty pages contribute nothing.
pub fn split_pages(doc_id: &str, pages: &[PageText], config: ChunkingConfig) -> Vec<Passage> {
    let mut passages = Vec::new();
    let mut ordinal = 0u64;

    for page in pages {
        for text in split_text(&page.text, config) {
            passages.push(Passage {
                text,
                metadata: PassageMetadata {
                    doc_id: doc_id.to_string(),
                    page: page.number,
                    ordinal,
                },
            });
            ordinal += 1;
        }
    }

    passages
}

/// Recursive character splitting with overlap. No chunk exceeds `max_chunk_chars`
/// characters, and whitespace-only input yields no chunks.
pub fn split_text(text: &str, config: ChunkingConfig) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let max = config.max_chunk_chars.max(1);
    let overlap = config.overlap_chars.min(max - 1);

    let pieces = split_recursive(trimmed, max, &SEPARATORS);
    merge_pieces(&pieces, max, overlap)
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Breaks `text` into pieces of at most `max` chars, preferring earlier separators.
/// Separators stay attached to the preceding piece so merging restores the text.
fn split_recursive(text: &str, max: usize, separators: &[&str]) -> Vec<String> {
    if char_len(text) <= max {
        return vec![text.to_string()];
    }

    let Some((separator, rest)) = separators.split_first() else {
        return split_by_chars(text, max);
    };

    let segments = split_keeping_separator(text, separator);
    if segments.len() == 1 {
        return split_recursive(text, max, rest);
    }

    segments
        .into_iter()
        .flat_map(|segment| split_recursive(segment, max, rest))
        .collect()
}

fn split_keeping_separator<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    let mut result = Vec::new();
    let mut start = 0;

    while let Some(position) = text[start..].find(separator) {
        let end = start + position + separator.len();
        result.push(&text[start..end]);
        start = end;
    }

    if start < text.len() {
        result.push(&text[start..]);
    }

    result
}

fn split_by_chars(text: &str, max: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max)
        .map(|window| window.iter().collect::<String>())
        .collect()
}

/// Greedily packs pieces into chunks, seeding each new chunk with trailing
/// pieces of the previous one that fit inside `overlap`.
fn merge_pieces(pieces: &[String], max: usize, overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut window: Vec<&str> = Vec::new();
    let mut window_len = 0usize;

    for piece in pieces {
        let piece_len = char_len(piece);

        if window_len + piece_len > max && !window.is_empty() {
            push_chunk(&mut chunks, &window);

            while !window.is_empty()
                && (window_len > overlap || window_len + piece_len > max)
            {
                window_len -= char_len(window.remove(0));
            }
        }

        window.push(piece);
        window_len += piece_len;
    }

    if !window.is_empty() {
        push_chunk(&mut chunks, &window);
    }

    chunks
}

fn push_chunk(chunks: &mut Vec<String>, window: &[&str]) {
    let joined = window.concat();
    let text = joined.trim();
    if text.is_empty() {
        return;
    }
    if chunks.last().map(String::as_str) != Some(text) {
        chunks.push(text.to_string());
    }
}
