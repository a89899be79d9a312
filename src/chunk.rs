//! Overlapping fixed-size text chunker.
//!
//! Splits normalized document text into chunks close to a configurable
//! target length, with a configurable overlap carried between consecutive
//! chunks so that statements near a boundary stay retrievable. Cuts prefer
//! sentence ends, then word breaks, and fall back to a hard cut for
//! unbroken runs. Each chunk records its span within the normalized text
//! and a SHA-256 hash of its text for staleness detection.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

/// Split normalized text into overlapping chunks.
///
/// Returns an empty vector when the text holds no non-whitespace content
/// (the pipeline rejects such documents before anything is persisted).
/// Chunk indices are contiguous starting at 0, and each chunk's
/// `span_start..span_end` is a byte range into `text`.
pub fn chunk_text(
    document_id: &str,
    text: &str,
    chunk_chars: usize,
    overlap_chars: usize,
) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    // Byte offset of every char, plus a sentinel for the end of text.
    let mut offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    let total_chars = offsets.len();
    offsets.push(text.len());

    let chars: Vec<char> = text.chars().collect();

    let mut chunks = Vec::new();
    let mut start = 0usize; // char position
    let mut chunk_index: i64 = 0;

    while start < total_chars {
        let hard_end = (start + chunk_chars).min(total_chars);
        let end = if hard_end < total_chars {
            pick_cut(&chars, start, hard_end, chunk_chars)
        } else {
            hard_end
        };

        // Trim the slice but keep spans pointing at the untrimmed source.
        let mut ts = start;
        let mut te = end;
        while ts < te && chars[ts].is_whitespace() {
            ts += 1;
        }
        while te > ts && chars[te - 1].is_whitespace() {
            te -= 1;
        }

        if te > ts {
            let span_start = offsets[ts];
            let span_end = offsets[te];
            let body = &text[span_start..span_end];
            chunks.push(make_chunk(
                document_id,
                chunk_index,
                body,
                span_start as i64,
                span_end as i64,
            ));
            chunk_index += 1;
        }

        if end >= total_chars {
            break;
        }
        // Step back by the overlap, but always make forward progress.
        start = end.saturating_sub(overlap_chars).max(start + 1);
    }

    chunks
}

/// Choose a cut position in `(start, hard_end]`, preferring a sentence end,
/// then a word break, within the back half of the chunk. Falls back to the
/// hard cut when the window holds no usable boundary.
fn pick_cut(chars: &[char], start: usize, hard_end: usize, chunk_chars: usize) -> usize {
    let floor = start + chunk_chars / 2;

    let mut p = hard_end;
    while p > floor {
        let c = chars[p - 1];
        if c == '.' || c == '!' || c == '?' || c == '\n' {
            return p;
        }
        p -= 1;
    }

    let mut p = hard_end;
    while p > floor {
        if chars[p - 1].is_whitespace() {
            return p;
        }
        p -= 1;
    }

    hard_end
}

fn make_chunk(document_id: &str, index: i64, text: &str, span_start: i64, span_end: i64) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        span_start,
        span_end,
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_text_single_chunk() {
        let chunks = chunk_text("doc1", "Hello, world!", 500, 50);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].span_start, 0);
        assert_eq!(chunks[0].span_end, 13);
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk_text("doc1", "", 500, 50).is_empty());
        assert!(chunk_text("doc1", "   \n\n  ", 500, 50).is_empty());
    }

    #[test]
    fn spans_slice_back_into_source() {
        let text = (0..40)
            .map(|i| format!("Sentence number {} ends here.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_text("doc1", &text, 120, 20);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert_eq!(&text[c.span_start as usize..c.span_end as usize], c.text);
        }
    }

    #[test]
    fn indices_contiguous_from_zero() {
        let text = "word ".repeat(500);
        let chunks = chunk_text("doc1", &text, 100, 10);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
        }
    }

    #[test]
    fn cuts_prefer_sentence_ends() {
        let text = "First sentence here. Second sentence follows after. Third one closes it out. And a fourth for good measure.";
        let chunks = chunk_text("doc1", text, 60, 10);
        assert!(chunks.len() > 1);
        // Every chunk except possibly the last should end on a sentence mark.
        for c in &chunks[..chunks.len() - 1] {
            let last = c.text.chars().last().unwrap();
            assert!(
                last == '.' || last == '!' || last == '?',
                "chunk did not end at a sentence boundary: {:?}",
                c.text
            );
        }
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = "alpha beta gamma delta ".repeat(60);
        let chunks = chunk_text("doc1", &text, 100, 30);
        assert!(chunks.len() > 2);
        for pair in chunks.windows(2) {
            assert!(
                pair[1].span_start < pair[0].span_end,
                "expected overlap between chunk {} and {}",
                pair[0].chunk_index,
                pair[1].chunk_index
            );
        }
    }

    #[test]
    fn unbroken_run_gets_hard_cut() {
        let text = "x".repeat(1000);
        let chunks = chunk_text("doc1", &text, 100, 10);
        assert!(chunks.len() >= 10);
        assert_eq!(chunks[0].text.len(), 100);
    }

    #[test]
    fn multibyte_text_is_split_on_char_boundaries() {
        let text = "é".repeat(300);
        let chunks = chunk_text("doc1", &text, 100, 10);
        assert!(chunks.len() > 1);
        for c in &chunks {
            // Slicing must not panic and must reproduce the chunk text.
            assert_eq!(&text[c.span_start as usize..c.span_end as usize], c.text);
        }
    }

    #[test]
    fn deterministic_apart_from_ids() {
        let text = "One sentence. Another sentence. A third sentence. ".repeat(20);
        let a = chunk_text("doc1", &text, 150, 30);
        let b = chunk_text("doc1", &text, 150, 30);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.hash, y.hash);
            assert_eq!((x.span_start, x.span_end), (y.span_start, y.span_end));
        }
    }
}
