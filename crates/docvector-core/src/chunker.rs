//! Splits documents into overlapping chunks prior to embedding.
//!
//! Offsets are character positions. Chunks are produced lazily and the
//! boundaries depend only on the inputs, so re-running yields the same spans.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::types::Chunk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    #[default]
    Fixed,
    Semantic,
}

impl fmt::Display for ChunkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChunkStrategy::Fixed => "fixed",
            ChunkStrategy::Semantic => "semantic",
        })
    }
}

impl FromStr for ChunkStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(ChunkStrategy::Fixed),
            "semantic" => Ok(ChunkStrategy::Semantic),
            other => Err(Error::InvalidConfig(format!("unknown chunking strategy '{other}'"))),
        }
    }
}

/// Validated chunking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    strategy: ChunkStrategy,
    size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(strategy: ChunkStrategy, size: usize, overlap: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidConfig("chunk size must be greater than zero".into()));
        }
        if overlap >= size {
            return Err(Error::InvalidConfig(format!(
                "chunk overlap ({overlap}) must be smaller than chunk size ({size})"
            )));
        }
        Ok(Self { strategy, size, overlap })
    }

    pub fn strategy(&self) -> ChunkStrategy { self.strategy }
    pub fn size(&self) -> usize { self.size }
    pub fn overlap(&self) -> usize { self.overlap }

    pub fn chunk<'a>(&self, text: &'a str, source_id: &'a str) -> Chunks<'a> {
        let mut bounds: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        bounds.push(text.len());
        let chars = text.chars().collect();
        Chunks { cfg: *self, text, source_id, bounds, chars, next_start: Some(0) }
    }
}

/// One-shot helper for callers that do not keep a `Chunker` around.
pub fn chunk<'a>(
    text: &'a str,
    source_id: &'a str,
    strategy: ChunkStrategy,
    size: usize,
    overlap: usize,
) -> Result<Chunks<'a>> {
    Ok(Chunker::new(strategy, size, overlap)?.chunk(text, source_id))
}

pub struct Chunks<'a> {
    cfg: Chunker,
    text: &'a str,
    source_id: &'a str,
    // byte offset of every char, plus text.len()
    bounds: Vec<usize>,
    chars: Vec<char>,
    next_start: Option<usize>,
}

impl Chunks<'_> {
    fn len(&self) -> usize {
        self.chars.len()
    }

    /// Latest paragraph break in the window, else latest sentence end, else None.
    fn boundary_in(&self, lo: usize, hi: usize) -> Option<usize> {
        let is_para = |p: usize| p >= 2 && self.chars[p - 1] == '\n' && self.chars[p - 2] == '\n';
        let is_sentence = |p: usize| {
            p >= 2 && self.chars[p - 1].is_whitespace() && matches!(self.chars[p - 2], '.' | '!' | '?')
        };
        (lo..=hi).rev().find(|&p| is_para(p)).or_else(|| (lo..=hi).rev().find(|&p| is_sentence(p)))
    }

    fn end_for(&self, start: usize) -> usize {
        let n = self.len();
        let target = start + self.cfg.size;
        if target >= n {
            return n;
        }
        match self.cfg.strategy {
            ChunkStrategy::Fixed => target,
            ChunkStrategy::Semantic => {
                let tolerance = (self.cfg.size / 5).max(1);
                let lo = target.saturating_sub(tolerance).max(start + 1);
                self.boundary_in(lo, target).unwrap_or(target)
            }
        }
    }
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let start = self.next_start?;
        let n = self.len();
        if start >= n {
            self.next_start = None;
            return None;
        }
        let end = self.end_for(start);
        self.next_start = match self.cfg.strategy {
            // fixed keeps stepping until the start passes the end of the text
            ChunkStrategy::Fixed => Some(start + self.cfg.size - self.cfg.overlap),
            ChunkStrategy::Semantic if end >= n => None,
            ChunkStrategy::Semantic => {
                let next = end.saturating_sub(self.cfg.overlap);
                Some(if next > start { next } else { end })
            }
        };
        Some(Chunk {
            text: self.text[self.bounds[start]..self.bounds[end]].to_string(),
            source_id: self.source_id.to_string(),
            start_offset: start,
            end_offset: end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_overlap_not_smaller_than_size() {
        assert!(matches!(Chunker::new(ChunkStrategy::Fixed, 100, 100), Err(Error::InvalidConfig(_))));
        assert!(matches!(Chunker::new(ChunkStrategy::Semantic, 0, 0), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn empty_text_has_no_chunks() {
        let c = Chunker::new(ChunkStrategy::Fixed, 10, 2).unwrap();
        assert_eq!(c.chunk("", "doc").count(), 0);
    }

    #[test]
    fn offsets_count_chars_not_bytes() {
        let c = Chunker::new(ChunkStrategy::Fixed, 2, 0).unwrap();
        let chunks: Vec<_> = c.chunk("äöü", "doc").collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "äö");
        assert_eq!((chunks[1].start_offset, chunks[1].end_offset), (2, 3));
    }
}
