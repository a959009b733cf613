//! Deterministic token-bounded text splitting.
//!
//! Content is split at the most natural boundary that brings every piece
//! under the chunk budget:
//! 1. Paragraphs (blank lines)
//! 2. Lines
//! 3. Words
//! 4. Characters, as a last resort for unbroken runs
//!
//! Pieces are then packed greedily into chunks, each new chunk starting with
//! a tail of the previous one as overlap.

use std::sync::Arc;

use crate::tokens::TokenEstimator;

const SEPARATORS: &[&str] = &["\n\n", "\n", " "];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChunk {
    pub index: usize,
    pub text: String,
    pub estimated_tokens: usize,
}

pub struct TextSplitter {
    estimator: Arc<dyn TokenEstimator>,
    chunk_tokens: usize,
    overlap_tokens: usize,
}

impl TextSplitter {
    /// `overlap_tokens` is capped below `chunk_tokens` so every chunk makes
    /// progress.
    pub fn new(estimator: Arc<dyn TokenEstimator>, chunk_tokens: usize, overlap_tokens: usize) -> Self {
        let chunk_tokens = chunk_tokens.max(1);
        Self {
            estimator,
            chunk_tokens,
            overlap_tokens: overlap_tokens.min(chunk_tokens / 2),
        }
    }

    pub fn chunk_tokens(&self) -> usize {
        self.chunk_tokens
    }

    pub fn overlap_tokens(&self) -> usize {
        self.overlap_tokens
    }

    fn estimate(&self, text: &str) -> usize {
        self.estimator.estimate(text)
    }

    pub fn split(&self, text: &str) -> Vec<ContentChunk> {
        let mut pieces = Vec::new();
        self.atomize(text, 0, &mut pieces);

        let mut chunks: Vec<String> = Vec::new();
        let mut current = String::new();

        for piece in pieces {
            let before = current.len();
            current.push_str(piece);
            if self.estimate(&current) <= self.chunk_tokens {
                continue;
            }
            current.truncate(before);

            let overlap = self.overlap_tail(&current).to_string();
            if !current.trim().is_empty() {
                chunks.push(std::mem::take(&mut current));
            }

            let mut seeded = overlap;
            seeded.push_str(piece);
            current = if self.estimate(&seeded) <= self.chunk_tokens {
                seeded
            } else {
                piece.to_string()
            };
        }
        if !current.trim().is_empty() {
            chunks.push(current);
        }

        chunks
            .into_iter()
            .map(|c| c.trim().to_string())
            .enumerate()
            .map(|(index, text)| ContentChunk {
                index,
                estimated_tokens: self.estimate(&text),
                text,
            })
            .collect()
    }

    /// Break `text` into pieces that each fit the chunk budget. Concatenating
    /// the pieces yields `text` again.
    fn atomize<'a>(&self, text: &'a str, level: usize, out: &mut Vec<&'a str>) {
        if text.is_empty() {
            return;
        }
        if self.estimate(text) <= self.chunk_tokens {
            out.push(text);
            return;
        }
        match SEPARATORS.get(level) {
            Some(sep) => {
                for part in text.split_inclusive(sep) {
                    self.atomize(part, level + 1, out);
                }
            }
            None => self.hard_split(text, out),
        }
    }

    fn hard_split<'a>(&self, mut text: &'a str, out: &mut Vec<&'a str>) {
        while !text.is_empty() {
            let boundaries: Vec<usize> = text
                .char_indices()
                .map(|(i, _)| i)
                .skip(1)
                .chain(std::iter::once(text.len()))
                .collect();

            // Longest prefix that fits; always at least one char.
            let fits = boundaries.partition_point(|&end| self.estimate(&text[..end]) <= self.chunk_tokens);
            let end = boundaries[fits.saturating_sub(1)];
            out.push(&text[..end]);
            text = &text[end..];
        }
    }

    /// Longest suffix of `chunk` within the overlap budget, moved forward to
    /// a word boundary when one is available.
    fn overlap_tail<'a>(&self, chunk: &'a str) -> &'a str {
        if self.overlap_tokens == 0 || chunk.is_empty() {
            return "";
        }

        let starts: Vec<usize> = chunk.char_indices().map(|(i, _)| i).collect();
        let first_fitting = starts.partition_point(|&start| self.estimate(&chunk[start..]) > self.overlap_tokens);
        let Some(&start) = starts.get(first_fitting) else {
            return "";
        };

        let tail = &chunk[start..];
        match tail.find(char::is_whitespace) {
            Some(ws) if start > 0 => tail[ws..].trim_start(),
            _ => tail,
        }
    }
}
